//! TCP server for accepting cluster connections.
//!
//! Each accepted connection gets its own task running the shared
//! [`Responder`] over a [`FramedChannel`].

use anyhow::Result;
use cluster_core::{FramedChannel, Responder};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// First pause after a failed `accept`.
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
/// Longest pause between `accept` retries.
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Pause before retrying after `consecutive_errors` failed accepts.
/// Errors like EMFILE persist until connections close.
pub fn accept_backoff(consecutive_errors: u32) -> Duration {
    let exponent = consecutive_errors.saturating_sub(1).min(16);
    ACCEPT_BACKOFF_MIN
        .saturating_mul(1 << exponent)
        .min(ACCEPT_BACKOFF_MAX)
}

pub struct ClusterServer {
    responder: Arc<Responder>,
    max_body_size: u64,
}

impl ClusterServer {
    pub fn new(responder: Responder, max_body_size: u64) -> Self {
        Self {
            responder: Arc::new(responder),
            max_body_size,
        }
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Cluster server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Serve one accepted connection in a background task.
    pub fn accept_connection(&self, stream: TcpStream, addr: SocketAddr) -> JoinHandle<()> {
        let responder = Arc::clone(&self.responder);
        let max_body_size = self.max_body_size;

        tokio::spawn(async move {
            debug!("Accepted connection from {}", addr);
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
            }
            let mut channel = FramedChannel::new(stream).with_max_body_size(max_body_size);
            match responder.serve(&mut channel).await {
                Ok(()) => debug!("Connection from {} closed", addr),
                Err(e) => warn!("Connection from {} failed: {}", addr, e),
            }
        })
    }

    /// Accept connections forever, backing off while `accept` keeps failing.
    pub async fn run(&self, listener: TcpListener) {
        let mut consecutive_errors = 0u32;
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    consecutive_errors = 0;
                    self.accept_connection(stream, addr);
                }
                Err(e) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    let delay = accept_backoff(consecutive_errors);
                    error!("Failed to accept connection, retrying in {:?}: {}", delay, e);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
