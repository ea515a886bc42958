//! Message envelope: the JSON header exchanged once per protocol step.
//!
//! Wire format: `{"operation":"CONNECT","attributes":{"secret":"..."}}` for
//! requests, plus `"result"` and an optional `"message"` on responses.
//! Unknown operations, statuses and attribute keys decode without error so
//! newer peers can extend the protocol without breaking older ones.
//!
//! [`Request`] and [`UploadReceipt`] are typed views over a [`Header`].

use crate::error::ProtocolError;
use crate::Instance;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// Shared secret presented on CONNECT.
pub const ATTR_SECRET: &str = "secret";
/// JSON-serialized [`Instance`] registering the connecting node.
pub const ATTR_INSTANCE: &str = "instance";
/// Object reference returned by UPLOAD.
pub const ATTR_PATH: &str = "path";
/// Hex SHA-256 of an uploaded object.
pub const ATTR_DIGEST: &str = "digest";
/// Size in bytes of an uploaded object.
pub const ATTR_SIZE: &str = "size";

/// Operation tag carried by every header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Connect,
    Upload,
    SyncInstances,
    /// Any operation this build does not know about
    #[serde(other)]
    Unknown,
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "CONNECT",
            Self::Upload => "UPLOAD",
            Self::SyncInstances => "SYNC_INSTANCES",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Result code of a response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Success,
    Failure,
    #[serde(other)]
    Unknown,
}

/// One control message. Requests have no `result`; responses always do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Header {
    /// Create a request header with no attributes.
    pub fn request(operation: Operation) -> Self {
        Self {
            operation,
            attributes: BTreeMap::new(),
            result: None,
            message: None,
        }
    }

    /// Create a `SUCCESS` response header.
    pub fn success(operation: Operation) -> Self {
        Self {
            result: Some(Status::Success),
            ..Self::request(operation)
        }
    }

    /// Create a `FAILURE` response header with a diagnostic message.
    pub fn failure(operation: Operation, message: impl Into<String>) -> Self {
        Self {
            result: Some(Status::Failure),
            message: Some(message.into()),
            ..Self::request(operation)
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn is_request(&self) -> bool {
        self.result.is_none()
    }

    pub fn is_response(&self) -> bool {
        self.result.is_some()
    }

    pub fn is_success(&self) -> bool {
        self.result == Some(Status::Success)
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Header serialization should not fail")
    }

    /// Parse from JSON bytes.
    pub fn from_json(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Attributes of a CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub secret: String,
    /// Registration-on-connect
    pub instance: Option<Instance>,
}

/// Typed view of a request header, one case per known operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Connect(ConnectRequest),
    SyncInstances,
    Upload,
}

impl Request {
    pub fn connect(secret: impl Into<String>, instance: Option<Instance>) -> Self {
        Self::Connect(ConnectRequest {
            secret: secret.into(),
            instance,
        })
    }

    pub fn operation(&self) -> Operation {
        match self {
            Self::Connect(_) => Operation::Connect,
            Self::SyncInstances => Operation::SyncInstances,
            Self::Upload => Operation::Upload,
        }
    }

    /// Encode as a request header.
    pub fn to_header(&self) -> Header {
        let header = Header::request(self.operation());
        match self {
            Self::Connect(connect) => {
                let header = header.with_attribute(ATTR_SECRET, connect.secret.as_str());
                match &connect.instance {
                    Some(instance) => header.with_attribute(ATTR_INSTANCE, instance.to_json()),
                    None => header,
                }
            }
            Self::SyncInstances | Self::Upload => header,
        }
    }

    /// Decode a request header. Attribute keys not used by the operation are
    /// ignored.
    pub fn from_header(header: &Header) -> Result<Self, ProtocolError> {
        if header.is_response() {
            return Err(ProtocolError::UnexpectedResult(header.operation));
        }

        match header.operation {
            Operation::Connect => {
                let secret = header
                    .attribute(ATTR_SECRET)
                    .ok_or(ProtocolError::MissingAttribute(ATTR_SECRET))?;
                let instance = header
                    .attribute(ATTR_INSTANCE)
                    .map(|json| {
                        serde_json::from_str::<Instance>(json).map_err(|e| {
                            ProtocolError::InvalidAttribute {
                                key: ATTR_INSTANCE,
                                reason: e.to_string(),
                            }
                        })
                    })
                    .transpose()?;
                Ok(Self::connect(secret, instance))
            }
            Operation::SyncInstances => Ok(Self::SyncInstances),
            Operation::Upload => Ok(Self::Upload),
            Operation::Unknown => Err(ProtocolError::UnsupportedOperation(Operation::Unknown)),
        }
    }
}

/// Typed view of a successful UPLOAD response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    /// Reference to the stored object
    pub path: String,
    /// Hex SHA-256 of the content
    pub digest: String,
    pub size: u64,
}

impl UploadReceipt {
    /// Encode as a `SUCCESS` response header.
    pub fn to_header(&self) -> Header {
        Header::success(Operation::Upload)
            .with_attribute(ATTR_PATH, self.path.as_str())
            .with_attribute(ATTR_DIGEST, self.digest.as_str())
            .with_attribute(ATTR_SIZE, self.size.to_string())
    }

    pub fn from_header(header: &Header) -> Result<Self, ProtocolError> {
        let path = header
            .attribute(ATTR_PATH)
            .filter(|p| !p.is_empty())
            .ok_or(ProtocolError::MissingAttribute(ATTR_PATH))?;
        let digest = header
            .attribute(ATTR_DIGEST)
            .ok_or(ProtocolError::MissingAttribute(ATTR_DIGEST))?;
        let size = header
            .attribute(ATTR_SIZE)
            .ok_or(ProtocolError::MissingAttribute(ATTR_SIZE))?
            .parse()
            .map_err(|e: std::num::ParseIntError| ProtocolError::InvalidAttribute {
                key: ATTR_SIZE,
                reason: e.to_string(),
            })?;

        Ok(Self {
            path: path.to_string(),
            digest: digest.to_string(),
            size,
        })
    }
}
