pub mod cli;
pub mod commands;
pub mod paths;
pub mod uffd;

// Re-export core types for convenience
pub use uffd::{HandlerConfig, HandlerState, RestoreHandler};
