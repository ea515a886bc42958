//! cluster-core: node-communication core for a tracker/storage file cluster.
//!
//! This crate provides:
//! - A framed channel carrying JSON headers plus length-delimited bodies
//! - The CONNECT handshake with shared-secret authentication
//! - The tracker membership registry and its additive merge
//! - A typed client and a connection responder for the cluster operations
//! - The `UploadStore` trait abstraction for storage backends

pub mod client;
pub mod error;
pub mod instance;
pub mod instance_id;
pub mod protocol;
pub mod registry;
pub mod responder;
pub mod store;

pub use client::{ClientError, ClusterClient};
pub use error::{ChannelError, ProtocolError};
pub use instance::{Instance, Role, Server, ServerParseError, parse_servers};
pub use instance_id::{InstanceId, InstanceIdError};
pub use protocol::{
    FramedChannel, Header, Operation, Request, SecretPolicy, SessionState, Status, UploadReceipt,
};
pub use registry::{MergeSummary, Registration, Registry};
pub use responder::{NodeService, Responder};
pub use store::{MemoryStore, StoreError, UploadStore};
