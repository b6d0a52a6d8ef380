//! Userfaultfd-backed snapshot restore.
//!
//! Firecracker hands us the guest memory's UFFD over a Unix socket. Every
//! page that holds data in the snapshot file is copied in eagerly; pages in
//! file holes are zero-filled on first touch.

pub mod config;
pub mod error;
pub mod extents;
pub mod fault;
pub mod handler;
pub mod handshake;
pub mod mapping;
pub mod populate;
pub mod preload;
pub mod resolver;
pub mod types;

pub use config::HandlerConfig;
pub use error::{HandshakeError, PopulateError, RestoreError, SetupError};
pub use handler::{HandlerState, RestoreHandler};
pub use populate::PopulateReport;
pub use preload::warm_snapshot_file;
pub use resolver::{PageResolver, ResolverFactory, UffdFactory, UffdResolver};
pub use types::{DataExtent, FileExtents, FileOffset, HostAddr, MemoryRegion};
