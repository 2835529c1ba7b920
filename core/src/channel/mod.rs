// Channel module: per-peer application channels and their wire format

pub mod manager;
pub mod message;

pub use manager::DataChannelManager;
pub use message::{classify, ChannelMessage, FileSignal, Incoming};
