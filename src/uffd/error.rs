use std::io;
use std::path::PathBuf;

use super::types::{FileOffset, HostAddr};

/// Failures while constructing the handler. The restore must abort.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("creating socket directory {path}")]
    SocketDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("binding UFFD socket {path}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("opening snapshot memory file {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("reading metadata of snapshot memory file {path}")]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("snapshot memory file {path} is empty")]
    EmptyFile { path: PathBuf },

    #[error("mmapping snapshot memory file {path}")]
    Map {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Failures receiving the UFFD and region layout from Firecracker.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("accepting UFFD connection")]
    Accept(#[source] io::Error),

    #[error("receiving UFFD handshake message")]
    Receive(#[source] io::Error),

    #[error("connection closed before the UFFD was received")]
    ConnectionClosed,

    #[error("no UFFD received via SCM_RIGHTS after {attempts} attempts")]
    NoDescriptor { attempts: usize },

    #[error("parsing memory regions JSON")]
    Json(#[from] serde_json::Error),

    #[error("Firecracker sent 0 memory regions")]
    NoRegions,

    #[error("invalid memory region at index {index}: {reason}")]
    InvalidRegion { index: usize, reason: String },

    #[error("adopting received UFFD")]
    Adopt(#[source] io::Error),
}

/// Failures of the eager copy phase. Pages injected before the failure stay.
#[derive(Debug, thiserror::Error)]
pub enum PopulateError {
    #[error("UFFDIO_COPY of {len} bytes to {dst} (file offset {src}, job {index}) failed")]
    Copy {
        index: usize,
        dst: HostAddr,
        src: FileOffset,
        len: u64,
        #[source]
        source: io::Error,
    },

    #[error("UFFDIO_COPY to {dst} (job {index}) made no progress after {copied} bytes")]
    NoProgress {
        index: usize,
        dst: HostAddr,
        copied: u64,
    },

    #[error("job {index} reads {len} bytes at file offset {src}, past the end of the mapping")]
    OutOfBounds {
        index: usize,
        src: FileOffset,
        len: u64,
    },

    #[error("population cancelled")]
    Cancelled,

    #[error("copy worker panicked")]
    WorkerPanicked,
}

/// Outcome error of the background restore, as observed through `wait()`.
#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    #[error("UFFD handshake failed")]
    Handshake(#[from] HandshakeError),

    #[error("parallel UFFDIO_COPY failed")]
    Populate(#[source] PopulateError),

    #[error("restore cancelled")]
    Cancelled,

    #[error("population task failed: {0}")]
    Task(String),

    #[error("population outcome was already consumed by an earlier wait")]
    OutcomeConsumed,
}

impl From<PopulateError> for RestoreError {
    fn from(err: PopulateError) -> Self {
        match err {
            PopulateError::Cancelled => RestoreError::Cancelled,
            other => RestoreError::Populate(other),
        }
    }
}

impl RestoreError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RestoreError::Cancelled)
    }
}
