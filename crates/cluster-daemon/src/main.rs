//! cluster-daemon: Tracker or storage node of a file storage cluster.
//!
//! Trackers keep the membership registry and sync it with peer trackers.
//! Storage nodes register with the trackers and accept uploads.

use anyhow::{Context, Result};
use clap::Parser;
use cluster_core::{NodeService, Registry, Responder, Role};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cluster_daemon::config::NodeConfig;
use cluster_daemon::instance_store;
use cluster_daemon::object_store::DirectoryStore;
use cluster_daemon::server::ClusterServer;
use cluster_daemon::sync_task::{ReconnectConfig, run_storage_registration, run_tracker_sync};

#[derive(Parser, Debug)]
#[command(name = "cluster-daemon")]
#[command(about = "Tracker/storage node for a file storage cluster")]
struct Args {
    /// Path to the JSON config file
    #[arg(short, long, default_value = "cluster.json")]
    config: PathBuf,

    /// Node role: tracker or storage
    #[arg(long)]
    role: Option<Role>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Comma-separated trackers, as [<secret>@]<host>:<port>
    #[arg(long)]
    trackers: Option<String>,

    /// Cluster secret
    #[arg(long)]
    secret: Option<String>,

    /// Write a default config file and exit
    #[arg(long)]
    init: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

impl Args {
    /// Apply command-line overrides on top of the file config.
    fn apply(&self, config: &mut NodeConfig) -> Result<()> {
        if let Some(role) = self.role {
            config.role = role;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(data_dir) = &self.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(secret) = &self.secret {
            config.secret = secret.clone();
        }
        if let Some(trackers) = &self.trackers {
            // Validate the list up front so a typo fails fast
            cluster_core::parse_servers(trackers)?;
            config.trackers = trackers
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(String::from)
                .collect();
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,cluster_daemon=debug"
    } else {
        "info,cluster_daemon=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if args.init {
        let mut config = NodeConfig::default();
        args.apply(&mut config)?;
        config.save(&args.config)?;
        info!("Wrote default config to {}", args.config.display());
        return Ok(());
    }

    let mut config = if args.config.exists() {
        NodeConfig::load(&args.config)?
    } else {
        warn!("Config {} not found, using defaults", args.config.display());
        NodeConfig::default()
    };
    args.apply(&mut config)?;
    config.validate().context("Invalid configuration")?;

    info!("Starting cluster-daemon as {}", config.role);
    info!("Data directory: {}", config.data_dir.display());

    config.prepare_dirs()?;
    let instance_id = instance_store::load_or_create(&config.data_dir)?;
    let local = config.local_instance(instance_id);
    info!("Instance {} advertised at {}", local.instance_id, local.server);

    let trackers = config.tracker_servers()?;
    let interval = Duration::from_secs(config.sync_interval_secs);

    let service = match config.role {
        Role::Tracker => {
            let registry = Arc::new(Registry::new());
            registry.register(local.clone());
            NodeService::Tracker(registry)
        }
        Role::Storage => NodeService::Storage(Arc::new(DirectoryStore::new(
            config.data_dir.clone(),
            config.tmp_dir(),
            local.instance_id.clone(),
        ))),
    };

    if trackers.is_empty() {
        info!("No trackers configured");
    } else {
        match &service {
            NodeService::Tracker(registry) => {
                tokio::spawn(run_tracker_sync(
                    trackers,
                    local.clone(),
                    Arc::clone(registry),
                    config.secret.clone(),
                    interval,
                    ReconnectConfig::default(),
                ));
            }
            NodeService::Storage(_) => {
                tokio::spawn(run_storage_registration(
                    trackers,
                    local.clone(),
                    config.secret.clone(),
                    interval,
                    ReconnectConfig::default(),
                ));
            }
        }
    }

    let responder = Responder::new(config.secret_policy(), service);
    let server = ClusterServer::new(responder, config.max_body_size);
    let listener = ClusterServer::bind(&config.listen_address())
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_address()))?;

    info!("Daemon running. Press Ctrl+C to stop.");

    tokio::select! {
        _ = server.run(listener) => {
            error!("Server loop exited");
        }
        // Handle graceful shutdown
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    info!("Shutting down");
    Ok(())
}
