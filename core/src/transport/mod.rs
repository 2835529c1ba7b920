// Transport module: collaborator seams for peer sessions and local media
//
// The engine never talks to a WebRTC stack directly. It opens sessions
// through `PeerTransport`, drives negotiation through `PeerSession`, and
// exchanges application messages over `DataChannel`. Everything the stack
// reports back (trickled candidates, remote streams, channel lifecycle)
// arrives as a `TransportEvent` through the per-session `TransportEvents`
// sink, so it is processed in order with every other engine input.

pub mod loopback;

use crate::types::{
    IceCandidate, IceServer, MediaConstraints, MediaStream, PeerId, SessionDescription,
};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver};

pub use loopback::{LoopbackChannel, LoopbackNetwork, LoopbackTransport, StaticMedia, UnavailableMedia};

/// Stack-assigned channel identifier, unique within one session.
pub type ChannelId = u64;

/// Which side of the offer/answer exchange a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    /// Peer was already in the roster when we joined; we send the offer
    LocalInitiator,
    /// Peer arrived after us; it sends the offer
    RemoteResponder,
}

/// Everything a transport needs to open one session.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub local_id: PeerId,
    pub peer_id: PeerId,
    pub role: SessionRole,
    pub ice_servers: Vec<IceServer>,
}

/// Notifications raised by a session or one of its channels.
#[derive(Clone)]
pub enum TransportEvent {
    /// A local connectivity candidate to trickle to the remote peer
    LocalCandidate(IceCandidate),
    /// Connectivity established
    Connected,
    /// The remote peer attached a media stream
    RemoteStream(MediaStream),
    /// The remote peer opened a channel towards us
    DataChannel(Arc<dyn DataChannel>),
    ChannelOpen(ChannelId),
    ChannelMessage { channel_id: ChannelId, text: String },
    ChannelClosed(ChannelId),
    ChannelError { channel_id: ChannelId, reason: String },
    /// The session is gone (remote hang-up or transport failure)
    Closed,
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            TransportEvent::Connected => f.write_str("Connected"),
            TransportEvent::RemoteStream(s) => f.debug_tuple("RemoteStream").field(&s.id).finish(),
            TransportEvent::DataChannel(ch) => f.debug_tuple("DataChannel").field(&ch.id()).finish(),
            TransportEvent::ChannelOpen(id) => f.debug_tuple("ChannelOpen").field(id).finish(),
            TransportEvent::ChannelMessage { channel_id, text } => f
                .debug_struct("ChannelMessage")
                .field("channel_id", channel_id)
                .field("len", &text.len())
                .finish(),
            TransportEvent::ChannelClosed(id) => f.debug_tuple("ChannelClosed").field(id).finish(),
            TransportEvent::ChannelError { channel_id, reason } => f
                .debug_struct("ChannelError")
                .field("channel_id", channel_id)
                .field("reason", reason)
                .finish(),
            TransportEvent::Closed => f.write_str("Closed"),
        }
    }
}

/// Sink a session reports its events into.
///
/// The engine builds one per session so every event is stamped with the
/// owning peer and session generation before it is queued.
#[derive(Clone)]
pub struct TransportEvents {
    sink: Arc<dyn Fn(TransportEvent) + Send + Sync>,
}

impl TransportEvents {
    pub fn new(sink: impl Fn(TransportEvent) + Send + Sync + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    /// Sink backed by a plain channel, handy when driving a transport
    /// without an engine.
    pub fn channel() -> (Self, UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = Self::new(move |event| {
            let _ = tx.send(event);
        });
        (events, rx)
    }

    pub fn emit(&self, event: TransportEvent) {
        (self.sink)(event)
    }
}

impl fmt::Debug for TransportEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TransportEvents")
    }
}

/// Factory for peer sessions.
pub trait PeerTransport: Send + Sync {
    fn open(
        &self,
        ctx: SessionContext,
        events: TransportEvents,
    ) -> anyhow::Result<Arc<dyn PeerSession>>;
}

/// One peer-to-peer transport handle.
#[async_trait]
pub trait PeerSession: Send + Sync {
    fn attach_stream(&self, stream: &MediaStream) -> anyhow::Result<()>;

    async fn create_offer(&self) -> anyhow::Result<SessionDescription>;

    async fn create_answer(&self) -> anyhow::Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> anyhow::Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> anyhow::Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()>;

    fn create_data_channel(&self, label: &str) -> anyhow::Result<Arc<dyn DataChannel>>;

    fn close(&self);
}

/// Ordered, reliable text conduit on top of a session.
pub trait DataChannel: Send + Sync {
    fn id(&self) -> ChannelId;

    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    fn send(&self, text: &str) -> anyhow::Result<()>;

    /// Bytes queued but not yet handed to the network
    fn buffered_amount(&self) -> usize;

    fn close(&self);
}

/// Local capture devices.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(&self, constraints: MediaConstraints) -> anyhow::Result<MediaStream>;
}
