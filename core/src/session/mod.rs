// Session module: roster and per-peer transport sessions

pub mod peer;
pub mod registry;

pub use peer::{CandidateOutcome, PeerConnectionManager, SessionSnapshot, SessionState};
pub use registry::SessionRegistry;
