//! Wire protocol for cluster communication.
//!
//! This module defines:
//! - The JSON header envelope and its typed request views
//! - The framed channel carrying header + body frames
//! - The CONNECT handshake state machine and secret policy

pub mod channel;
pub mod envelope;
pub mod handshake;

pub use channel::{
    BodyConsumer, Collect, DEFAULT_MAX_BODY_SIZE, Discard, FramedChannel, MAX_HEADER_SIZE,
};
pub use envelope::{ConnectRequest, Header, Operation, Request, Status, UploadReceipt};
pub use handshake::{AuthError, PeerKind, SecretPolicy, Session, SessionState};
