// Engine configuration

use crate::types::IceServer;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Chunk size used by the file-transfer protocol, in payload units.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Period of the chunk multiplexing tick.
pub const DEFAULT_CHUNK_INTERVAL_MS: u64 = 10;

/// Channel buffered amount above which a transfer skips its tick.
pub const DEFAULT_MAX_BUFFERED_AMOUNT: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Room announced to the relay in the join envelope
    pub room: String,
    /// ICE servers handed to the transport for every session
    pub ice_servers: Vec<IceServer>,
    /// Label of the application data channel
    pub channel_label: String,
    /// Payload units per file chunk
    pub chunk_size: usize,
    /// Milliseconds between two multiplexing ticks
    pub chunk_interval_ms: u64,
    /// Back-pressure threshold on a channel's outgoing buffer
    pub max_buffered_amount: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            room: String::new(),
            ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
            channel_label: "peermesh".to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_interval_ms: DEFAULT_CHUNK_INTERVAL_MS,
            max_buffered_amount: DEFAULT_MAX_BUFFERED_AMOUNT,
        }
    }
}

impl MeshConfig {
    pub fn for_room(room: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            ..Default::default()
        }
    }

    pub fn chunk_interval(&self) -> Duration {
        Duration::from_millis(self.chunk_interval_ms.max(1))
    }

    /// Chunk size with a floor of one unit.
    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.max(1)
    }
}
