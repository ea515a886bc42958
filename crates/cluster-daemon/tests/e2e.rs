//! End-to-end tests for cluster-daemon.
//!
//! Runs trackers and storage nodes on real TCP listeners and drives them
//! with `ClusterClient`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use cluster_core::protocol::{Discard, SecretPolicy, SessionState};
use cluster_core::{
    ClientError, ClusterClient, FramedChannel, Header, Instance, NodeService, Operation,
    Registry, Responder, Role, Server,
};
use cluster_daemon::instance_store;
use cluster_daemon::object_store::DirectoryStore;
use cluster_daemon::server::ClusterServer;
use cluster_daemon::sync_task::{register_with_tracker, sync_with_tracker};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

const SECRET: &str = "s";
const TIMEOUT: Duration = Duration::from_secs(5);

/// Start a node on an ephemeral port.
async fn start_node(service: NodeService) -> SocketAddr {
    let responder = Responder::new(SecretPolicy::new(SECRET), service);
    let server = ClusterServer::new(responder, 1024 * 1024);
    let listener = ClusterServer::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { server.run(listener).await });
    addr
}

async fn start_tracker() -> (Arc<Registry>, SocketAddr) {
    let registry = Arc::new(Registry::new());
    let addr = start_node(NodeService::Tracker(Arc::clone(&registry))).await;
    (registry, addr)
}

async fn client(addr: SocketAddr) -> ClusterClient<TcpStream> {
    let stream = TcpStream::connect(addr).await.expect("Failed to connect");
    ClusterClient::new(stream)
}

fn storage_instance(id: &str, host: &str) -> Instance {
    Instance::new(id.parse().unwrap(), Server::new(host, 1024, SECRET), Role::Storage)
}

fn server_for(addr: SocketAddr) -> Server {
    Server::new(addr.ip().to_string(), addr.port(), SECRET)
}

// ==================== Membership ====================

#[tokio::test]
async fn test_registration_then_sync() {
    let (registry, x) = start_tracker().await;
    let y = storage_instance("yyyyyyyy", "10.0.0.2");
    let z = storage_instance("zzzzzzzz", "10.0.0.3");

    let mut cy = client(x).await;
    cy.connect(SECRET, Some(&y)).await.unwrap();
    let mut cz = client(x).await;
    cz.connect(SECRET, Some(&z)).await.unwrap();

    let mut w = client(x).await;
    w.connect(SECRET, None).await.unwrap();
    let instances = timeout(TIMEOUT, w.sync_instances()).await.unwrap().unwrap();

    assert_eq!(instances, vec![y, z]);
    assert_eq!(registry.len(), 2);
}

#[tokio::test]
async fn test_secret_mismatch_does_not_register() {
    let (registry, x) = start_tracker().await;
    let y = storage_instance("yyyyyyyy", "10.0.0.2");

    let mut c = client(x).await;
    let err = c.connect("wrong", Some(&y)).await.unwrap_err();

    assert!(matches!(err, ClientError::Rejected { .. }));
    assert_eq!(c.state(), SessionState::Rejected);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_sync_requires_connect() {
    let (_registry, x) = start_tracker().await;

    let mut unauthenticated = client(x).await;
    let err = unauthenticated.sync_instances().await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Failed {
            operation: Operation::SyncInstances,
            ..
        }
    ));

    let mut authenticated = client(x).await;
    authenticated.connect(SECRET, None).await.unwrap();
    assert!(authenticated.sync_instances().await.is_ok());
}

#[tokio::test]
async fn test_storage_node_refuses_sync() {
    let dir = TempDir::new().unwrap();
    let store = DirectoryStore::new(
        dir.path().join("data"),
        dir.path().join("tmp"),
        "s0000001".parse().unwrap(),
    );
    let addr = start_node(NodeService::Storage(Arc::new(store))).await;

    let mut c = client(addr).await;
    c.connect(SECRET, None).await.unwrap();
    assert!(matches!(
        c.sync_instances().await,
        Err(ClientError::Failed { .. })
    ));
}

// ==================== Tracker tasks ====================

#[tokio::test]
async fn test_sync_with_tracker_merges_peer_registry() {
    let (remote, remote_addr) = start_tracker().await;
    remote.register(storage_instance("yyyyyyyy", "10.0.0.2"));

    let local_registry = Registry::new();
    let me = Instance::new(
        "tttttttt".parse().unwrap(),
        Server::new("10.0.0.1", 1024, SECRET),
        Role::Tracker,
    );
    local_registry.register(me.clone());
    local_registry.register(storage_instance("aaaaaaaa", "10.0.0.7"));

    let summary = sync_with_tracker(&server_for(remote_addr), &me, &local_registry, SECRET, TIMEOUT)
        .await
        .unwrap();

    // Remote learned about us on CONNECT, so its snapshot includes us
    assert_eq!(summary.added, 1);
    assert_eq!(summary.unchanged, 1);
    assert_eq!(local_registry.len(), 3);
    assert!(remote.contains(&me.instance_id));
    // Nothing local was evicted
    assert!(local_registry.contains(&"aaaaaaaa".parse().unwrap()));
}

#[tokio::test]
async fn test_register_with_tracker() {
    let (registry, x) = start_tracker().await;
    let me = storage_instance("ssssssss", "10.0.0.5");

    register_with_tracker(&server_for(x), &me, SECRET, TIMEOUT).await.unwrap();
    assert_eq!(registry.get(&me.instance_id), Some(me.clone()));

    assert!(register_with_tracker(&server_for(x), &me, "wrong", TIMEOUT).await.is_err());
}

#[tokio::test]
async fn test_sync_with_unreachable_tracker_fails() {
    // Bind and drop to get a port nothing listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let me = storage_instance("ssssssss", "10.0.0.5");
    let registry = Registry::new();
    assert!(sync_with_tracker(&server_for(addr), &me, &registry, SECRET, TIMEOUT).await.is_err());
    assert!(registry.is_empty());
}

// ==================== Upload ====================

#[tokio::test]
async fn test_upload_to_directory_store() {
    let dir = TempDir::new().unwrap();
    let data_dir = dir.path().join("data");
    let id = instance_store::load_or_create(&data_dir).unwrap();
    let store = Arc::new(DirectoryStore::new(data_dir.clone(), dir.path().join("tmp"), id.clone()));
    let addr = start_node(NodeService::Storage(store.clone())).await;

    let mut c = client(addr).await;
    c.connect(SECRET, None).await.unwrap();
    let mut body = &b"hello"[..];
    let receipt = timeout(TIMEOUT, c.upload(&mut body, 5)).await.unwrap().unwrap();

    assert!(!receipt.path.is_empty());
    assert!(receipt.path.starts_with(id.as_str()));
    assert_eq!(std::fs::read(store.object_path(&receipt.digest)).unwrap(), b"hello");

    // Channel stays usable for another upload
    let mut body = &b"world"[..];
    let second = c.upload(&mut body, 5).await.unwrap();
    assert_ne!(second.digest, receipt.digest);
}

#[tokio::test]
async fn test_truncated_upload_is_not_stored() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(DirectoryStore::new(
        dir.path().join("data"),
        dir.path().join("tmp"),
        "s0000001".parse().unwrap(),
    ));
    let addr = start_node(NodeService::Storage(store.clone())).await;

    let mut c = client(addr).await;
    c.connect(SECRET, None).await.unwrap();

    // Declare 10 bytes, send 5, then close our write half
    let channel: &mut FramedChannel<TcpStream> = c.channel_mut();
    let header = Header::request(Operation::Upload).to_json();
    let raw = channel.get_mut();
    raw.write_u32(header.len() as u32).await.unwrap();
    raw.write_all(&header).await.unwrap();
    raw.write_u64(10).await.unwrap();
    raw.write_all(b"hello").await.unwrap();
    raw.shutdown().await.unwrap();

    if let Ok(Ok(response)) = timeout(TIMEOUT, channel.receive(&mut Discard)).await {
        assert!(!response.is_success());
    }

    let hello = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
    assert!(!store.object_path(hello).exists());
}
