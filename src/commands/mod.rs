pub mod serve;
pub mod warm;

// Re-export command functions
pub use serve::cmd_serve;
pub use warm::cmd_warm;
