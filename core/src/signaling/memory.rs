// In-process relay: rooms, rosters, and envelope forwarding without sockets
//
// Behaves like the production relay as seen from a client: `join` is
// answered with a `peers` roster and announced to the room as `new_peer`,
// negotiation envelopes are forwarded to their target with `socketId`
// rewritten to the sender, and a client whose link goes away is announced
// as `remove_peer`.

use super::client::{RelayDialer, RelayFrame, RelayLink};
use super::protocol::{parse_inbound, Inbound, Signal};
use crate::types::PeerId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, trace, warn};

struct Client {
    avatar: String,
    room: Option<String>,
    tx: UnboundedSender<RelayFrame>,
}

#[derive(Default)]
struct RelayState {
    next_client: u64,
    clients: BTreeMap<PeerId, Client>,
    refuse: Option<String>,
}

impl RelayState {
    fn deliver(&self, to: &PeerId, signal: &Signal) {
        let Some(client) = self.clients.get(to) else {
            trace!("relay: no client {}", to);
            return;
        };
        match signal.encode() {
            Ok(text) => {
                let _ = client.tx.send(RelayFrame::Text(text));
            }
            Err(e) => warn!("relay: cannot encode {}: {}", signal.event_name(), e),
        }
    }

    fn room_members(&self, room: &str, except: &PeerId) -> Vec<PeerId> {
        self.clients
            .iter()
            .filter(|(id, c)| *id != except && c.room.as_deref() == Some(room))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following dial fail with `reason`.
    pub fn refuse_connections(&self, reason: impl Into<String>) {
        self.state.lock().refuse = Some(reason.into());
    }

    /// Connected client ids, in join order.
    pub fn clients(&self) -> Vec<PeerId> {
        self.state.lock().clients.keys().cloned().collect()
    }

    /// Push a raw text frame to one client.
    pub fn inject(&self, to: &PeerId, text: impl Into<String>) -> bool {
        let state = self.state.lock();
        match state.clients.get(to) {
            Some(client) => client.tx.send(RelayFrame::Text(text.into())).is_ok(),
            None => false,
        }
    }

    /// Disconnect a client as if its socket dropped.
    pub fn drop_client(&self, id: &PeerId) -> bool {
        self.disconnect(id)
    }

    fn connect(&self) -> (PeerId, mpsc::UnboundedReceiver<RelayFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        state.next_client += 1;
        // Zero-padded so BTreeMap order is join order.
        let id = PeerId::new(format!("peer-{:04}", state.next_client));
        let avatar = format!("avatar-{}", state.next_client);
        state.clients.insert(
            id.clone(),
            Client {
                avatar,
                room: None,
                tx,
            },
        );
        debug!("relay: {} connected", id);
        (id, rx)
    }

    fn disconnect(&self, id: &PeerId) -> bool {
        let mut state = self.state.lock();
        let Some(client) = state.clients.remove(id) else {
            return false;
        };
        let _ = client.tx.send(RelayFrame::Closed);
        if let Some(room) = client.room {
            let leave = Signal::RemovePeer {
                socket_id: id.clone(),
            };
            for member in state.room_members(&room, id) {
                state.deliver(&member, &leave);
            }
        }
        debug!("relay: {} disconnected", id);
        true
    }

    fn handle(&self, from: &PeerId, text: &str) {
        let signal = match parse_inbound(text) {
            Inbound::Signal(signal) => signal,
            other => {
                warn!("relay: ignoring frame from {}: {:?}", from, other);
                return;
            }
        };
        let mut state = self.state.lock();
        match signal {
            Signal::Join { room } => {
                let Some(avatar) = state.clients.get(from).map(|c| c.avatar.clone()) else {
                    return;
                };
                let members = state.room_members(&room, from);
                let announce = Signal::NewPeer {
                    socket_id: from.clone(),
                    socket_avatar: avatar.clone(),
                };
                for member in &members {
                    state.deliver(member, &announce);
                }
                let avatars = members
                    .iter()
                    .filter_map(|m| state.clients.get(m).map(|c| c.avatar.clone()))
                    .collect();
                let roster = Signal::Peers {
                    connections: members,
                    avatars,
                    me: from.clone(),
                    myself_avatar: avatar,
                };
                state.deliver(from, &roster);
                if let Some(client) = state.clients.get_mut(from) {
                    client.room = Some(room);
                }
            }
            Signal::Offer { socket_id, sdp } => {
                let forward = Signal::Offer {
                    socket_id: from.clone(),
                    sdp,
                };
                state.deliver(&socket_id, &forward);
            }
            Signal::Answer { socket_id, sdp } => {
                let forward = Signal::Answer {
                    socket_id: from.clone(),
                    sdp,
                };
                state.deliver(&socket_id, &forward);
            }
            Signal::IceCandidate {
                socket_id,
                candidate,
                label,
            } => {
                let forward = Signal::IceCandidate {
                    socket_id: from.clone(),
                    candidate,
                    label,
                };
                state.deliver(&socket_id, &forward);
            }
            other => warn!("relay: {} sent {}", from, other.event_name()),
        }
    }
}

#[async_trait]
impl RelayDialer for MemoryRelay {
    async fn dial(&self, address: &str) -> anyhow::Result<RelayLink> {
        if let Some(reason) = self.state.lock().refuse.clone() {
            anyhow::bail!("relay {} refused the connection: {}", address, reason);
        }
        let (id, inbound) = self.connect();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let relay = self.clone();
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                relay.handle(&id, &text);
            }
            relay.disconnect(&id);
        });
        Ok(RelayLink {
            outbound: out_tx,
            inbound,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionDescription;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn next_signal(rx: &mut UnboundedReceiver<RelayFrame>) -> Signal {
        match rx.recv().await {
            Some(RelayFrame::Text(text)) => match parse_inbound(&text) {
                Inbound::Signal(signal) => signal,
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    fn send(link: &RelayLink, signal: Signal) {
        link.outbound.send(signal.encode().unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_join_roster_forward_and_leave() {
        let relay = MemoryRelay::new();
        let mut a = relay.dial("mem://").await.unwrap();
        send(&a, Signal::Join { room: "r".into() });
        let a_id = match next_signal(&mut a.inbound).await {
            Signal::Peers {
                connections, me, ..
            } => {
                assert!(connections.is_empty());
                me
            }
            other => panic!("unexpected {:?}", other),
        };

        let mut b = relay.dial("mem://").await.unwrap();
        send(&b, Signal::Join { room: "r".into() });
        let b_id = match next_signal(&mut b.inbound).await {
            Signal::Peers {
                connections, me, ..
            } => {
                assert_eq!(connections, vec![a_id.clone()]);
                me
            }
            other => panic!("unexpected {:?}", other),
        };
        assert!(matches!(
            next_signal(&mut a.inbound).await,
            Signal::NewPeer { socket_id, .. } if socket_id == b_id
        ));

        send(
            &b,
            Signal::Offer {
                socket_id: a_id.clone(),
                sdp: SessionDescription::offer("v=0"),
            },
        );
        assert!(matches!(
            next_signal(&mut a.inbound).await,
            Signal::Offer { socket_id, .. } if socket_id == b_id
        ));

        drop(b);
        assert_eq!(
            next_signal(&mut a.inbound).await,
            Signal::RemovePeer { socket_id: b_id }
        );
    }

    #[tokio::test]
    async fn test_refused_dial() {
        let relay = MemoryRelay::new();
        relay.refuse_connections("maintenance");
        let err = relay.dial("mem://").await.unwrap_err();
        assert!(err.to_string().contains("maintenance"));
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let relay = MemoryRelay::new();
        let mut a = relay.dial("mem://").await.unwrap();
        send(&a, Signal::Join { room: "one".into() });
        next_signal(&mut a.inbound).await;

        let mut b = relay.dial("mem://").await.unwrap();
        send(&b, Signal::Join { room: "two".into() });
        match next_signal(&mut b.inbound).await {
            Signal::Peers { connections, .. } => assert!(connections.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
        assert!(a.inbound.try_recv().is_err());
    }
}
