// PeerMesh Core: session and transfer orchestration
//
// One engine task coordinates a room of direct peer sessions: it negotiates
// them through a signaling relay, keeps one data channel per peer, and runs
// chat and chunked file transfer on top of those channels.

pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod session;
pub mod signaling;
pub mod transfer;
pub mod transport;
pub mod types;

pub use config::MeshConfig;
pub use engine::{Collaborators, MeshEngine, MeshHandle};
pub use error::{MeshError, NegotiationStage};
pub use event::{Event, EventBus, EventStream};
pub use session::{SessionSnapshot, SessionState};
pub use signaling::{MemoryRelay, RelayDialer, WebSocketDialer};
pub use transfer::{
    DirectorySink, Direction, FileHandle, FileMeta, FileSink, FileSource, MemorySink,
    TransferSnapshot, TransferState,
};
pub use transport::{
    LoopbackNetwork, MediaDevices, PeerTransport, SessionRole, StaticMedia, UnavailableMedia,
};
pub use types::{
    IceCandidate, IceServer, LocalIdentity, MediaConstraints, MediaStream, PeerId, PeerRecord,
    SendId,
};
