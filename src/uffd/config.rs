use std::path::{Path, PathBuf};

use super::handshake::DEFAULT_HANDSHAKE_ATTEMPTS;
use super::populate::{DEFAULT_COPY_CHUNK_SIZE, DEFAULT_COPY_WORKERS};
use super::preload::DEFAULT_WARM_CHUNK_SIZE;

/// Settings for one restore handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerConfig {
    /// Unix socket Firecracker connects to (`mem_backend.backend_path`).
    pub socket_path: PathBuf,
    /// Snapshot memory file.
    pub mem_file: PathBuf,
    /// Parallel UFFDIO_COPY workers.
    pub workers: usize,
    /// Upper bound on a single UFFDIO_COPY.
    pub chunk_size: u64,
    /// Read size used while warming the page cache.
    pub warm_chunk_size: usize,
    /// Handshake messages to accept before giving up on receiving the UFFD.
    pub handshake_attempts: usize,
}

impl HandlerConfig {
    pub fn new(socket_path: impl Into<PathBuf>, mem_file: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            mem_file: mem_file.into(),
            workers: DEFAULT_COPY_WORKERS,
            chunk_size: DEFAULT_COPY_CHUNK_SIZE,
            warm_chunk_size: DEFAULT_WARM_CHUNK_SIZE,
            handshake_attempts: DEFAULT_HANDSHAKE_ATTEMPTS,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_warm_chunk_size(mut self, warm_chunk_size: usize) -> Self {
        self.warm_chunk_size = warm_chunk_size.max(1);
        self
    }

    pub fn with_handshake_attempts(mut self, attempts: usize) -> Self {
        self.handshake_attempts = attempts.max(1);
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}
