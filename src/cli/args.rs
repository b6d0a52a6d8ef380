use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "snapfault",
    version,
    about = "On-demand paging handler for Firecracker snapshot restores"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve guest memory for one restore over userfaultfd
    Serve(ServeArgs),
    /// Pull a snapshot memory file into the page cache
    Warm(WarmArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Snapshot memory file
    #[arg(long)]
    pub mem_file: PathBuf,

    /// Socket Firecracker connects to (mem_backend.backend_path).
    /// Defaults to $XDG_RUNTIME_DIR/snapfault/uffd-<stem>-<pid>.sock
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Parallel UFFDIO_COPY workers
    #[arg(long, default_value_t = crate::uffd::populate::DEFAULT_COPY_WORKERS)]
    pub workers: usize,

    /// Largest single copy, in MiB
    #[arg(long, default_value_t = 128)]
    pub chunk_mib: u64,

    /// Handshake messages to accept before giving up on the UFFD
    #[arg(long, default_value_t = crate::uffd::handshake::DEFAULT_HANDSHAKE_ATTEMPTS)]
    pub handshake_attempts: usize,
}

#[derive(Args, Debug)]
pub struct WarmArgs {
    /// Snapshot memory file
    #[arg(long)]
    pub mem_file: PathBuf,

    /// Parallel readers
    #[arg(long, default_value_t = crate::uffd::preload::DEFAULT_WARM_READERS)]
    pub readers: usize,
}
