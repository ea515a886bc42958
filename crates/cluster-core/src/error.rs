//! Error types for the framed channel and the protocol layered on it.
//!
//! Every variant here is fatal to the channel it was raised on. Application
//! level failures (bad secret, storage failure) travel as `FAILURE`
//! responses instead and never show up as a `ChannelError`.

use crate::protocol::Operation;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Header length {len} exceeds maximum {max}")]
    HeaderTooLarge { len: usize, max: usize },

    #[error("Frame declared an empty header")]
    EmptyHeader,

    #[error("Body length {len} exceeds maximum {max}")]
    BodyTooLarge { len: u64, max: u64 },

    #[error("Malformed header: {0}")]
    MalformedHeader(#[from] serde_json::Error),

    #[error("Stream ended in the middle of a frame")]
    TruncatedFrame,

    #[error("Body truncated: expected {expected} bytes, received {received}")]
    TruncatedBody { expected: u64, received: u64 },

    #[error("Operation {0} requires an authenticated channel")]
    Unauthorized(Operation),

    #[error("Operation {0} requires the cluster secret")]
    Forbidden(Operation),

    #[error("Missing attribute: {0}")]
    MissingAttribute(&'static str),

    #[error("Invalid attribute {key}: {reason}")]
    InvalidAttribute { key: &'static str, reason: String },

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(Operation),

    #[error("Expected a request but received a {0} response")]
    UnexpectedResult(Operation),

    #[error("Response for {0} carries no result")]
    MissingResult(Operation),

    #[error("Expected a {expected} response, got {actual}")]
    UnexpectedResponse {
        expected: Operation,
        actual: Operation,
    },
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Connection closed by peer")]
    Closed,
}

impl ChannelError {
    /// True when the peer closed the transport cleanly between frames.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;
