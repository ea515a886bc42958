//! Node configuration.
//!
//! Stored as a single pretty-printed JSON document. Missing fields take
//! their defaults, so a minimal file only needs `role` and `secret`.

use anyhow::{Context, Result, bail};
use cluster_core::protocol::DEFAULT_MAX_BODY_SIZE;
use cluster_core::{Instance, InstanceId, Role, SecretPolicy, Server};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, ToSocketAddrs, UdpSocket};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default listen port for cluster traffic.
pub const DEFAULT_PORT: u16 = 1024;

/// Default interval between tracker syncs and registrations.
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 30;

/// Routable address used to pick the outbound interface when no tracker is
/// configured. Nothing is sent to it.
const PUBLIC_ROUTE_TARGET: &str = "8.8.8.8:53";

/// `~/cluster/data`, or a temp directory when there is no home directory.
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join("cluster").join("data"))
        .unwrap_or_else(|| std::env::temp_dir().join("cluster"))
}

/// Local address of the interface that routes to `target`.
///
/// Connecting a UDP socket only selects a route, so no packet leaves the
/// host. Returns `None` if `target` does not resolve or is unroutable.
pub fn outbound_ip(target: &str) -> Option<IpAddr> {
    let remote = target.to_socket_addrs().ok()?.next()?;
    let bind = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind).ok()?;
    socket.connect(remote).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub role: Role,
    /// Interface to listen on
    pub bind_address: String,
    /// Host other nodes should use to reach this one; detected when unset
    pub advertise_host: Option<String>,
    pub port: u16,
    /// Cluster secret shared by all trackers and storage nodes
    pub secret: String,
    /// Secret for clients that may not register instances
    pub client_secret: Option<String>,
    /// Trackers to sync with or register at, as `[<secret>@]<host>:<port>`
    pub trackers: Vec<String>,
    pub data_dir: PathBuf,
    /// Defaults to `<data_dir>/tmp`
    pub tmp_dir: Option<PathBuf>,
    pub sync_interval_secs: u64,
    /// Largest upload body accepted
    pub max_body_size: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            role: Role::Storage,
            bind_address: "0.0.0.0".to_string(),
            advertise_host: None,
            port: DEFAULT_PORT,
            secret: String::new(),
            client_secret: None,
            trackers: Vec::new(),
            data_dir: default_data_dir(),
            tmp_dir: None,
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

impl NodeConfig {
    /// Load a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Write this config as pretty-printed JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Check settings that cannot be defaulted.
    pub fn validate(&self) -> Result<()> {
        if self.secret.is_empty() {
            bail!("A cluster secret is required");
        }
        if self.sync_interval_secs == 0 {
            bail!("sync_interval_secs must be greater than zero");
        }
        self.tracker_servers()?;
        Ok(())
    }

    /// Parsed tracker descriptors.
    pub fn tracker_servers(&self) -> Result<Vec<Server>> {
        self.trackers
            .iter()
            .map(|entry| {
                entry
                    .trim()
                    .parse::<Server>()
                    .with_context(|| format!("Invalid tracker entry {:?}", entry))
            })
            .collect()
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.tmp_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("tmp"))
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// Configured advertise host, or the address of the interface that
    /// routes to the first tracker.
    pub fn advertise_host(&self) -> String {
        if let Some(host) = self.advertise_host.as_deref().filter(|h| !h.trim().is_empty()) {
            return host.trim().to_string();
        }

        let targets = self
            .tracker_servers()
            .unwrap_or_default()
            .into_iter()
            .map(|server| server.address())
            .chain(std::iter::once(PUBLIC_ROUTE_TARGET.to_string()));
        for target in targets {
            if let Some(ip) = outbound_ip(&target) {
                debug!("Detected advertise address {} via {}", ip, target);
                return ip.to_string();
            }
        }

        warn!("Could not detect an advertise address, falling back to 127.0.0.1");
        "127.0.0.1".to_string()
    }

    /// This node as other nodes should see it.
    pub fn local_instance(&self, instance_id: InstanceId) -> Instance {
        Instance::new(
            instance_id,
            Server::new(self.advertise_host(), self.port, self.secret.as_str()),
            self.role,
        )
    }

    pub fn secret_policy(&self) -> SecretPolicy {
        let policy = SecretPolicy::new(self.secret.as_str());
        match &self.client_secret {
            Some(client) if !client.is_empty() => policy.with_client_secret(client.as_str()),
            _ => policy,
        }
    }

    /// Create the data directory and start from an empty tmp directory.
    pub fn prepare_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("Failed to create {}", self.data_dir.display()))?;

        let tmp = self.tmp_dir();
        if tmp.exists() {
            fs::remove_dir_all(&tmp)
                .with_context(|| format!("Failed to clear {}", tmp.display()))?;
        }
        fs::create_dir_all(&tmp).with_context(|| format!("Failed to create {}", tmp.display()))?;
        Ok(())
    }
}
