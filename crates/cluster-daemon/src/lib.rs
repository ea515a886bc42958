//! cluster-daemon library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod config;
pub mod instance_store;
pub mod object_store;
pub mod server;
pub mod sync_task;

// Re-export key types for convenience
pub use config::NodeConfig;
pub use object_store::DirectoryStore;
pub use server::ClusterServer;
pub use sync_task::{ReconnectConfig, calculate_backoff, register_with_tracker, sync_with_tracker};
