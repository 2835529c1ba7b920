// Event bus: typed publish/subscribe between the engine and its consumers
//
// Every observable happening in the mesh is one variant of `Event`.
// Consumers subscribe once and receive every event published afterwards,
// in publication order, on an unbounded queue (nothing is dropped for slow
// subscribers).

use crate::error::MeshError;
use crate::transfer::{Direction, FileMeta};
use crate::types::{IceCandidate, LocalIdentity, MediaStream, PeerId, PeerRecord, SendId};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::trace;

/// Receiving half handed to a subscriber.
pub type EventStream = UnboundedReceiver<Event>;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    // -- relay --------------------------------------------------------------
    /// Relay socket opened and the join envelope was sent
    Connected { room: String },
    SignalingError { error: MeshError },
    SignalingClosed,
    /// Relay frame without an event name
    RawMessage { payload: serde_json::Value },
    /// Relay frame carrying an event name this engine does not handle
    RelayEvent {
        name: String,
        data: serde_json::Value,
    },

    // -- local media --------------------------------------------------------
    StreamCreated { stream: MediaStream },
    StreamCreateError { error: MeshError },
    /// Every requested stream resolved and the roster is known; outbound
    /// sessions were created
    Ready { sessions: usize },

    // -- roster -------------------------------------------------------------
    /// Full roster received; the relay handshake is complete
    RosterReady {
        peers: Vec<PeerRecord>,
        local: LocalIdentity,
    },
    PeerArrived { peer: PeerRecord },
    PeerRemoved { peer_id: PeerId },

    // -- sessions -----------------------------------------------------------
    OfferReceived { peer_id: PeerId },
    AnswerReceived { peer_id: PeerId },
    CandidateReceived {
        peer_id: PeerId,
        candidate: IceCandidate,
    },
    NegotiationError { peer_id: PeerId, error: MeshError },
    SessionOpened { peer_id: PeerId },
    SessionClosed { peer_id: PeerId },
    RemoteStream {
        peer_id: PeerId,
        stream: MediaStream,
    },

    // -- channels -----------------------------------------------------------
    ChannelOpened { peer_id: PeerId },
    ChannelClosed { peer_id: PeerId },
    ChannelError { peer_id: PeerId, error: MeshError },
    ChatMessage {
        peer_id: PeerId,
        avatar: String,
        text: String,
    },

    // -- transfers ----------------------------------------------------------
    /// Outgoing ask was delivered to the channel
    TransferRequested {
        send_id: SendId,
        peer_id: PeerId,
        file: FileMeta,
    },
    /// A remote peer asks us to accept a file
    TransferIncoming {
        send_id: SendId,
        peer_id: PeerId,
        file: FileMeta,
    },
    TransferAccepted {
        send_id: SendId,
        peer_id: PeerId,
        direction: Direction,
        file: FileMeta,
    },
    TransferRefused {
        send_id: SendId,
        peer_id: PeerId,
        direction: Direction,
        file: FileMeta,
    },
    TransferProgress {
        send_id: SendId,
        peer_id: PeerId,
        direction: Direction,
        file: FileMeta,
        percent: f64,
    },
    TransferSent {
        send_id: SendId,
        peer_id: PeerId,
        file: FileMeta,
    },
    TransferReceived {
        send_id: SendId,
        peer_id: PeerId,
        file: FileMeta,
        /// Where the file sink put the payload
        location: String,
    },
    TransferSendError {
        send_id: SendId,
        peer_id: PeerId,
        error: MeshError,
    },
    TransferReceiveError {
        send_id: SendId,
        peer_id: PeerId,
        error: MeshError,
    },
}

impl Event {
    /// Short stable name, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Connected { .. } => "connected",
            Event::SignalingError { .. } => "signaling-error",
            Event::SignalingClosed => "signaling-closed",
            Event::RawMessage { .. } => "raw-message",
            Event::RelayEvent { .. } => "relay-event",
            Event::StreamCreated { .. } => "stream-created",
            Event::StreamCreateError { .. } => "stream-create-error",
            Event::Ready { .. } => "ready",
            Event::RosterReady { .. } => "roster-ready",
            Event::PeerArrived { .. } => "peer-arrived",
            Event::PeerRemoved { .. } => "peer-removed",
            Event::OfferReceived { .. } => "offer-received",
            Event::AnswerReceived { .. } => "answer-received",
            Event::CandidateReceived { .. } => "candidate-received",
            Event::NegotiationError { .. } => "negotiation-error",
            Event::SessionOpened { .. } => "session-opened",
            Event::SessionClosed { .. } => "session-closed",
            Event::RemoteStream { .. } => "remote-stream",
            Event::ChannelOpened { .. } => "channel-opened",
            Event::ChannelClosed { .. } => "channel-closed",
            Event::ChannelError { .. } => "channel-error",
            Event::ChatMessage { .. } => "chat-message-received",
            Event::TransferRequested { .. } => "transfer-requested",
            Event::TransferIncoming { .. } => "transfer-incoming-ask",
            Event::TransferAccepted { .. } => "transfer-accepted",
            Event::TransferRefused { .. } => "transfer-refused",
            Event::TransferProgress { .. } => "transfer-progress",
            Event::TransferSent { .. } => "transfer-sent",
            Event::TransferReceived { .. } => "transfer-received",
            Event::TransferSendError { .. } => "transfer-send-error",
            Event::TransferReceiveError { .. } => "transfer-receive-error",
        }
    }
}

/// Fan-out dispatcher. Cloning shares the subscriber list.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<UnboundedSender<Event>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver to every live subscriber; dropped receivers are pruned.
    pub fn publish(&self, event: Event) {
        trace!(event = event.name(), "publish");
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_subscriber_sees_events_in_order() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(Event::SignalingClosed);
        bus.publish(Event::PeerRemoved {
            peer_id: PeerId::new("p1"),
        });

        for rx in [&mut a, &mut b] {
            assert_eq!(rx.try_recv().unwrap(), Event::SignalingClosed);
            assert_eq!(rx.try_recv().unwrap().name(), "peer-removed");
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(Event::SignalingClosed);
        assert_eq!(bus.subscriber_count(), 1);
        drop(kept);
    }

    #[test]
    fn test_publish_without_subscribers_is_harmless() {
        let bus = EventBus::new();
        bus.publish(Event::Ready { sessions: 0 });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
