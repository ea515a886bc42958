//! Node descriptors and cluster instances.
//!
//! A [`Server`] is the address and secret of a node, as written in
//! configuration (`[<secret>@]<host>:<port>`). An [`Instance`] is a server
//! plus the node's instance id and role, and is what trackers store in
//! their membership registry.

use crate::InstanceId;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServerParseError {
    #[error("Invalid server string {0:?}, format must be [<secret>@]<host>:<port>")]
    InvalidFormat(String),

    #[error("Invalid port in server string {0:?}")]
    InvalidPort(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown role {0:?}: expected \"tracker\" or \"storage\"")]
pub struct RoleParseError(String);

/// Role of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Coordinates membership, serves SYNC_INSTANCES
    Tracker,
    /// Holds file content, serves UPLOAD
    Storage,
}

impl Role {
    pub fn is_tracker(&self) -> bool {
        matches!(self, Self::Tracker)
    }

    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage)
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tracker => f.write_str("tracker"),
            Self::Storage => f.write_str("storage"),
        }
    }
}

impl FromStr for Role {
    type Err = RoleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tracker" => Ok(Self::Tracker),
            "storage" => Ok(Self::Storage),
            _ => Err(RoleParseError(s.to_string())),
        }
    }
}

/// Address and shared secret of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub host: String,
    pub port: u16,
    /// Shared secret to present when connecting (empty = none configured)
    #[serde(default)]
    pub secret: String,
}

impl Server {
    pub fn new(host: impl Into<String>, port: u16, secret: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            secret: secret.into(),
        }
    }

    /// `host:port`, suitable for `TcpStream::connect`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Secret configured for this server, if any.
    pub fn secret(&self) -> Option<&str> {
        if self.secret.is_empty() {
            None
        } else {
            Some(&self.secret)
        }
    }
}

// Never print the secret
impl Display for Server {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Server {
    type Err = ServerParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ServerParseError::InvalidFormat(s.to_string());

        let (secret, address) = match s.split_once('@') {
            Some((secret, address)) if !secret.is_empty() => (secret, address),
            Some(_) => return Err(invalid()),
            None => ("", s),
        };

        let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() || host.contains(':') || host.contains('@') {
            return Err(invalid());
        }
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let port: u16 = port
            .parse()
            .map_err(|_| ServerParseError::InvalidPort(s.to_string()))?;

        Ok(Self::new(host, port, secret))
    }
}

/// Parse a comma-separated list of `[<secret>@]<host>:<port>` entries.
///
/// Whitespace around entries is ignored; an empty string yields no servers.
pub fn parse_servers(servers: &str) -> Result<Vec<Server>, ServerParseError> {
    if servers.trim().is_empty() {
        return Ok(Vec::new());
    }
    servers.split(',').map(|s| s.trim().parse()).collect()
}

/// A registered cluster node: descriptor, identity and role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub instance_id: InstanceId,
    #[serde(flatten)]
    pub server: Server,
    pub role: Role,
}

impl Instance {
    pub fn new(instance_id: InstanceId, server: Server, role: Role) -> Self {
        Self {
            instance_id,
            server,
            role,
        }
    }

    /// Serialize to the JSON form carried in the CONNECT `instance` attribute.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("Instance serialization should not fail")
    }
}
