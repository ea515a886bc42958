//! Server side of a cluster connection.
//!
//! A [`Responder`] drives one [`FramedChannel`] through the handshake and
//! then answers requests until the peer disconnects. What a node can answer
//! depends on its [`NodeService`]: trackers own a registry and serve
//! SYNC_INSTANCES, storage nodes own an upload store and serve UPLOAD.
//!
//! Application failures (bad secret, storage failure, unsupported
//! operation) are sent back as `FAILURE` responses. Protocol violations get
//! a best-effort `FAILURE` response and then the channel is closed.

use crate::error::{ChannelError, ProtocolError, Result};
use crate::protocol::{
    BodyConsumer, FramedChannel, Header, Operation, Request, SecretPolicy, Session,
};
use crate::registry::{Registration, Registry};
use crate::store::UploadStore;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Capabilities of the local node.
#[derive(Clone)]
pub enum NodeService {
    /// Accepts registrations and serves the registry
    Tracker(Arc<Registry>),
    /// Accepts uploads
    Storage(Arc<dyn UploadStore>),
}

impl NodeService {
    fn name(&self) -> &'static str {
        match self {
            Self::Tracker(_) => "tracker",
            Self::Storage(_) => "storage",
        }
    }
}

/// A response waiting to be sent, with an optional in-memory body.
struct Reply {
    header: Header,
    body: Vec<u8>,
    close: bool,
}

impl Reply {
    fn new(header: Header) -> Self {
        Self {
            header,
            body: Vec::new(),
            close: false,
        }
    }

    fn closing(header: Header) -> Self {
        Self {
            close: true,
            ..Self::new(header)
        }
    }

    fn unsupported(operation: Operation, service: &NodeService) -> Self {
        Self::new(Header::failure(
            operation,
            format!("operation {} not supported by {} node", operation, service.name()),
        ))
    }
}

/// Answers requests on cluster connections.
pub struct Responder {
    policy: SecretPolicy,
    service: NodeService,
}

impl Responder {
    pub fn new(policy: SecretPolicy, service: NodeService) -> Self {
        Self { policy, service }
    }

    pub fn service(&self) -> &NodeService {
        &self.service
    }

    /// Serve one connection until the peer disconnects or the channel fails.
    ///
    /// Returns `Ok(())` on a clean disconnect or after rejecting a bad
    /// secret; transport and framing errors are returned to the caller.
    pub async fn serve<S>(&self, channel: &mut FramedChannel<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut session = Session::new();

        loop {
            let mut exchange = Exchange {
                responder: self,
                session: &mut session,
                operation: Operation::Unknown,
                reply: None,
            };

            let received = channel.receive(&mut exchange).await;
            let operation = exchange.operation;
            let reply = exchange.reply.take();

            match received {
                Ok(_) => {}
                Err(ChannelError::Closed) => {
                    debug!("Peer closed connection");
                    session.close();
                    return Ok(());
                }
                Err(ChannelError::Protocol(e)) => {
                    warn!("Protocol error on {}: {}", operation, e);
                    // Best effort: the peer may already be gone
                    let _ = channel
                        .send_header(&Header::failure(operation, e.to_string()))
                        .await;
                    let _ = channel.shutdown().await;
                    session.close();
                    return Err(e.into());
                }
                Err(e) => {
                    session.close();
                    return Err(e);
                }
            }

            let reply = reply.unwrap_or_else(|| {
                Reply::closing(Header::failure(operation, "request was not handled"))
            });

            let mut body = reply.body.as_slice();
            channel
                .send(&reply.header, Some(&mut body), reply.body.len() as u64)
                .await?;

            if reply.close {
                session.close();
                let _ = channel.shutdown().await;
                return Ok(());
            }
        }
    }

    async fn handle_connect(&self, session: &mut Session, request: Request) -> Reply {
        let Request::Connect(connect) = request else {
            return Reply::closing(Header::failure(Operation::Connect, "malformed CONNECT"));
        };

        session.begin_authentication();
        let peer = match self.policy.verify(&connect) {
            Ok(peer) => peer,
            Err(e) => {
                warn!("Rejected CONNECT: {}", e);
                session.reject();
                return Reply::closing(Header::failure(Operation::Connect, e.to_string()));
            }
        };

        if let Some(instance) = connect.instance {
            match &self.service {
                NodeService::Tracker(registry) => {
                    let id = instance.instance_id.clone();
                    let role = instance.role;
                    let address = instance.server.address();
                    match registry.register(instance) {
                        Registration::Added => {
                            info!("Registered {} {} at {}", role, id, address)
                        }
                        Registration::Updated => {
                            info!("Updated {} {} at {}", role, id, address)
                        }
                        Registration::Unchanged => {
                            debug!("Re-registered {} {} (unchanged)", role, id)
                        }
                    }
                }
                NodeService::Storage(_) => {
                    debug!(
                        "Ignoring registration of {} on storage node",
                        instance.instance_id
                    );
                }
            }
        }

        session.accept(peer);
        debug!("Authenticated {:?}", peer);
        Reply::new(Header::success(Operation::Connect))
    }

    fn handle_sync(&self) -> Reply {
        let NodeService::Tracker(registry) = &self.service else {
            return Reply::unsupported(Operation::SyncInstances, &self.service);
        };

        let snapshot = registry.snapshot();
        match serde_json::to_vec(&snapshot) {
            Ok(body) => {
                debug!("Serving snapshot of {} instance(s)", snapshot.len());
                Reply {
                    body,
                    ..Reply::new(Header::success(Operation::SyncInstances))
                }
            }
            Err(e) => Reply::new(Header::failure(Operation::SyncInstances, e.to_string())),
        }
    }

    async fn handle_upload(&self, body: &mut (dyn AsyncRead + Send + Unpin), len: u64) -> Reply {
        let NodeService::Storage(store) = &self.service else {
            return Reply::unsupported(Operation::Upload, &self.service);
        };

        match store.store(body, len).await {
            Ok(receipt) => {
                info!("Stored {} bytes as {}", receipt.size, receipt.path);
                Reply::new(receipt.to_header())
            }
            Err(e) => {
                warn!("Upload of {} bytes failed: {}", len, e);
                Reply::new(Header::failure(Operation::Upload, e.to_string()))
            }
        }
    }
}

/// Body consumer for one request: dispatches it and records the reply.
struct Exchange<'a> {
    responder: &'a Responder,
    session: &'a mut Session,
    operation: Operation,
    reply: Option<Reply>,
}

#[async_trait]
impl BodyConsumer for Exchange<'_> {
    async fn consume(
        &mut self,
        header: &Header,
        body: &mut (dyn AsyncRead + Send + Unpin),
        len: u64,
    ) -> Result<()> {
        self.operation = header.operation;

        let request = match Request::from_header(header) {
            Ok(request) => request,
            Err(ProtocolError::UnsupportedOperation(operation)) => {
                debug!("Unsupported operation in header: {:?}", header);
                self.reply = Some(Reply::new(Header::failure(
                    operation,
                    "unsupported operation",
                )));
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        self.session.authorize(request.operation())?;

        let reply = match request {
            Request::Connect(_) => self.responder.handle_connect(self.session, request).await,
            Request::SyncInstances => self.responder.handle_sync(),
            Request::Upload => self.responder.handle_upload(body, len).await,
        };
        self.reply = Some(reply);
        Ok(())
    }
}
