// Signaling: relay connection, envelopes, and relay implementations
//
// `SignalingClient` owns the one relay connection of an engine. Two
// dialers ship with the crate: `WebSocketDialer` for real relays and
// `MemoryRelay`, an in-process relay used by simulations and tests.

pub mod client;
pub mod memory;
pub mod protocol;
pub mod websocket;

pub use client::{ConnectionState, RelayDialer, RelayFrame, RelayInput, RelayLink, SignalingClient};
pub use memory::MemoryRelay;
pub use protocol::{parse_inbound, Inbound, Signal};
pub use websocket::WebSocketDialer;
