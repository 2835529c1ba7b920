// Signaling client: the single relay connection
//
// The client itself is a small synchronous state machine owned by the
// engine. Dialing is delegated to a `RelayDialer`; once a link is
// established the engine pumps its inbound frames back through
// `SignalingClient::on_frame` so they are handled in arrival order.

use super::protocol::{parse_inbound, Inbound, Signal};
use crate::error::MeshError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

/// One frame delivered by a relay link.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    Text(String),
    Error(String),
    Closed,
}

/// An established relay connection: a text sink and a frame stream.
#[derive(Debug)]
pub struct RelayLink {
    pub outbound: UnboundedSender<String>,
    pub inbound: UnboundedReceiver<RelayFrame>,
}

/// Opens relay connections.
#[async_trait]
pub trait RelayDialer: Send + Sync {
    async fn dial(&self, address: &str) -> anyhow::Result<RelayLink>;
}

/// Connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Dial in flight
    Connecting,
    /// Link up, join sent
    Connected,
}

/// What a relay frame means to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayInput {
    Message(Inbound),
    Error(String),
    Closed,
}

pub struct SignalingClient {
    dialer: Arc<dyn RelayDialer>,
    room: String,
    state: ConnectionState,
    address: Option<String>,
    outbound: Option<UnboundedSender<String>>,
    /// Bumped on every dial so frames of an abandoned link are ignored
    connection: u64,
}

impl SignalingClient {
    pub fn new(dialer: Arc<dyn RelayDialer>, room: impl Into<String>) -> Self {
        Self {
            dialer,
            room: room.into(),
            state: ConnectionState::Disconnected,
            address: None,
            outbound: None,
            connection: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn dialer(&self) -> Arc<dyn RelayDialer> {
        self.dialer.clone()
    }

    /// Start a connection attempt. Returns the connection number the dial
    /// result must be reported with.
    pub fn begin(&mut self, address: &str) -> Result<u64, MeshError> {
        if self.state != ConnectionState::Disconnected {
            return Err(MeshError::Transport(format!(
                "a relay connection to {} is already {}",
                self.address.as_deref().unwrap_or("?"),
                if self.state == ConnectionState::Connecting {
                    "in progress"
                } else {
                    "open"
                }
            )));
        }
        self.connection += 1;
        self.state = ConnectionState::Connecting;
        self.address = Some(address.to_string());
        info!("Connecting to relay {}", address);
        Ok(self.connection)
    }

    /// The dial for `connection` succeeded: keep the sink and send `join`.
    ///
    /// Returns the frame stream to pump, or `None` when the attempt was
    /// abandoned in the meantime.
    pub fn established(
        &mut self,
        connection: u64,
        link: RelayLink,
    ) -> Result<Option<UnboundedReceiver<RelayFrame>>, MeshError> {
        if connection != self.connection || self.state != ConnectionState::Connecting {
            debug!("Dropping stale relay link #{}", connection);
            return Ok(None);
        }
        self.outbound = Some(link.outbound);
        self.state = ConnectionState::Connected;
        let join = Signal::Join {
            room: self.room.clone(),
        };
        if let Err(e) = self.send(&join) {
            self.reset();
            return Err(e);
        }
        info!("Joined room '{}'", self.room);
        Ok(Some(link.inbound))
    }

    /// The dial for `connection` failed.
    pub fn dial_failed(&mut self, connection: u64) -> bool {
        if connection != self.connection || self.state != ConnectionState::Connecting {
            return false;
        }
        self.reset();
        true
    }

    /// Interpret one frame of link `connection`; `None` for stale links.
    pub fn on_frame(&mut self, connection: u64, frame: RelayFrame) -> Option<RelayInput> {
        if connection != self.connection || self.state != ConnectionState::Connected {
            return None;
        }
        match frame {
            RelayFrame::Text(text) => Some(RelayInput::Message(parse_inbound(&text))),
            RelayFrame::Error(reason) => {
                warn!("Relay link error: {}", reason);
                Some(RelayInput::Error(reason))
            }
            RelayFrame::Closed => {
                info!("Relay link closed");
                self.reset();
                Some(RelayInput::Closed)
            }
        }
    }

    pub fn send(&self, signal: &Signal) -> Result<(), MeshError> {
        let outbound = self
            .outbound
            .as_ref()
            .filter(|_| self.is_connected())
            .ok_or_else(|| MeshError::Transport("not connected to a relay".to_string()))?;
        let text = signal
            .encode()
            .map_err(|e| MeshError::Protocol(format!("encode {}: {}", signal.event_name(), e)))?;
        outbound
            .send(text)
            .map_err(|_| MeshError::Transport("relay link is gone".to_string()))?;
        debug!("→ relay {}", signal.event_name());
        Ok(())
    }

    /// Drop the link; the relay sees the socket close.
    pub fn disconnect(&mut self) {
        if self.state != ConnectionState::Disconnected {
            info!("Disconnecting from relay");
        }
        self.connection += 1;
        self.reset();
    }

    fn reset(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.outbound = None;
    }
}
