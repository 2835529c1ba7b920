// Transfer module: chunked request/accept file transfer

pub mod engine;
pub mod io;
pub mod payload;
pub mod record;

pub use engine::{TransferEngine, CONNECTION_CLOSED};
pub use io::{
    sanitize_file_name, DirectorySink, FileHandle, FileSink, FileSource, MemorySink,
    MemorySource, PathSource, FALLBACK_FILE_NAME,
};
pub use record::{Direction, FileMeta, TransferRecord, TransferSnapshot, TransferState};
