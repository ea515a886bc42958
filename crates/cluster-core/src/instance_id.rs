//! InstanceId: stable identifier of a node in the cluster.
//!
//! Generated once per data directory from a random UUID, truncated to
//! eight characters, and reused verbatim across restarts. It is the
//! primary key of the membership registry.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Length of every instance id.
pub const INSTANCE_ID_LEN: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InstanceIdError {
    #[error("Invalid instance ID {0:?}: expected {INSTANCE_ID_LEN} characters of [0-9a-z]")]
    InvalidFormat(String),
}

/// A short, stable identifier for a cluster node.
///
/// Two descriptors carrying the same instance id refer to the same logical
/// node even when host or port changed.
///
/// # Examples
/// ```
/// use cluster_core::InstanceId;
///
/// let id = InstanceId::generate();
/// assert_eq!(id.as_str().len(), 8);
///
/// let parsed: InstanceId = "a1b2c3d4".parse().unwrap();
/// assert_eq!(parsed.to_string(), "a1b2c3d4");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(String);

impl InstanceId {
    /// Generate a new random instance id.
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        Self(uuid[..INSTANCE_ID_LEN].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for InstanceId {
    type Err = InstanceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = s.len() == INSTANCE_ID_LEN
            && s.bytes().all(|b| b.is_ascii_digit() || b.is_ascii_lowercase());
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(InstanceIdError::InvalidFormat(s.to_string()))
        }
    }
}

// Serialize as a plain string; validate on the way in
impl serde::Serialize for InstanceId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for InstanceId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
