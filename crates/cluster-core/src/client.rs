//! Initiator side of a cluster connection.

use crate::error::ChannelError;
use crate::protocol::{
    Collect, Discard, FramedChannel, Header, Operation, Request, SessionState, Status,
    UploadReceipt,
};
use crate::{Instance, ProtocolError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Largest SYNC_INSTANCES body the client will buffer (16MB).
const MAX_SNAPSHOT_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("connection rejected: {message}")]
    Rejected { message: String },

    #[error("{operation} failed: {message}")]
    Failed { operation: Operation, message: String },

    #[error("invalid instance snapshot: {0}")]
    InvalidSnapshot(#[source] serde_json::Error),

    #[error("connection is closed")]
    Closed,
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        Self::Channel(err.into())
    }
}

/// Typed request/response client over a [`FramedChannel`].
///
/// The server enforces authentication; the client only tracks the outcome
/// of its own CONNECT attempts.
pub struct ClusterClient<S> {
    channel: FramedChannel<S>,
    state: SessionState,
}

impl<S> ClusterClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self::from_channel(FramedChannel::new(stream))
    }

    pub fn from_channel(channel: FramedChannel<S>) -> Self {
        Self {
            channel,
            state: SessionState::Opened,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Direct access to the underlying channel.
    pub fn channel_mut(&mut self) -> &mut FramedChannel<S> {
        &mut self.channel
    }

    /// Authenticate, optionally registering `instance` with the peer.
    ///
    /// May be repeated on an authenticated channel to refresh a registration.
    pub async fn connect(
        &mut self,
        secret: &str,
        instance: Option<&Instance>,
    ) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.state = SessionState::Authenticating;

        let header = Request::connect(secret, instance.cloned()).to_header();
        if let Err(e) = self.channel.send_header(&header).await {
            self.state = SessionState::Closed;
            return Err(e.into());
        }
        let response = match self.channel.receive(&mut Discard).await {
            Ok(response) => response,
            Err(e) => {
                self.state = SessionState::Closed;
                return Err(e.into());
            }
        };

        match check_response(Operation::Connect, &response) {
            Ok(()) => {
                self.state = SessionState::Authenticated;
                debug!("CONNECT accepted");
                Ok(())
            }
            Err(ClientError::Failed { message, .. }) => {
                self.state = SessionState::Rejected;
                Err(ClientError::Rejected { message })
            }
            Err(e) => {
                self.state = SessionState::Closed;
                Err(e)
            }
        }
    }

    /// Fetch the peer's full membership snapshot.
    pub async fn sync_instances(&mut self) -> Result<Vec<Instance>, ClientError> {
        self.ensure_open()?;
        let result = self.fetch_snapshot().await;
        self.track(result)
    }

    /// Stream exactly `len` bytes from `body` to the peer for storage.
    ///
    /// A body that ends early leaves a partial frame on the wire, so the
    /// client is closed afterwards.
    pub async fn upload<R>(&mut self, body: &mut R, len: u64) -> Result<UploadReceipt, ClientError>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        self.ensure_open()?;
        let result = self.send_upload(body, len).await;
        self.track(result)
    }

    /// Shut down the write half and mark the session closed.
    pub async fn close(&mut self) -> Result<(), ClientError> {
        self.state = SessionState::Closed;
        self.channel.shutdown().await?;
        Ok(())
    }

    async fn fetch_snapshot(&mut self) -> Result<Vec<Instance>, ClientError> {
        self.channel
            .send_header(&Request::SyncInstances.to_header())
            .await?;

        let mut collect = Collect::new(MAX_SNAPSHOT_SIZE);
        let response = self.channel.receive(&mut collect).await?;
        check_response(Operation::SyncInstances, &response)?;

        let body = collect.into_bytes();
        if body.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&body).map_err(ClientError::InvalidSnapshot)
    }

    async fn send_upload<R>(&mut self, body: &mut R, len: u64) -> Result<UploadReceipt, ClientError>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        self.channel
            .send(&Request::Upload.to_header(), Some(body), len)
            .await?;

        let response = self.channel.receive(&mut Discard).await?;
        check_response(Operation::Upload, &response)?;
        Ok(UploadReceipt::from_header(&response)?)
    }

    /// Channel errors leave the stream mid-frame; nothing may follow them.
    fn track<T>(&mut self, result: Result<T, ClientError>) -> Result<T, ClientError> {
        if let Err(ClientError::Channel(e)) = &result {
            debug!("Closing client after channel error: {}", e);
            self.state = SessionState::Closed;
        }
        result
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        match self.state {
            SessionState::Rejected | SessionState::Closed => Err(ClientError::Closed),
            _ => Ok(()),
        }
    }
}

fn check_response(expected: Operation, response: &Header) -> Result<(), ClientError> {
    if response.operation != expected {
        return Err(ProtocolError::UnexpectedResponse {
            expected,
            actual: response.operation,
        }
        .into());
    }
    match response.result {
        Some(Status::Success) => Ok(()),
        Some(Status::Failure) | Some(Status::Unknown) => Err(ClientError::Failed {
            operation: expected,
            message: response
                .message
                .clone()
                .unwrap_or_else(|| "no message".to_string()),
        }),
        None => Err(ProtocolError::MissingResult(expected).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    /// Run one scripted server exchange on the far end of a pipe.
    async fn scripted(
        response: Header,
        body: &'static [u8],
    ) -> ClusterClient<tokio::io::DuplexStream> {
        let (client_end, server_end) = duplex(64 * 1024);
        tokio::spawn(async move {
            let mut channel = FramedChannel::new(server_end);
            let _ = channel.receive(&mut Discard).await;
            let len = body.len() as u64;
            let mut body = body;
            let _ = channel.send(&response, Some(&mut body), len).await;
        });
        ClusterClient::new(client_end)
    }

    #[tokio::test]
    async fn test_connect_rejected_closes_client() {
        let mut client = scripted(Header::failure(Operation::Connect, "invalid secret"), b"").await;

        let err = client.connect("x", None).await.unwrap_err();
        assert!(matches!(err, ClientError::Rejected { .. }));
        assert_eq!(client.state(), SessionState::Rejected);

        assert!(matches!(client.sync_instances().await, Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn test_short_upload_body_closes_client() {
        let (client_end, _server_end) = duplex(64 * 1024);
        let mut client = ClusterClient::new(client_end);

        let mut body = &b"abc"[..];
        let err = client.upload(&mut body, 10).await.unwrap_err();

        assert!(matches!(err, ClientError::Channel(ChannelError::Io(_))));
        assert_eq!(client.state(), SessionState::Closed);
        assert!(matches!(client.sync_instances().await, Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn test_peer_hangup_closes_client() {
        let (client_end, server_end) = duplex(64 * 1024);
        drop(server_end);
        let mut client = ClusterClient::new(client_end);

        assert!(matches!(
            client.sync_instances().await,
            Err(ClientError::Channel(_))
        ));
        assert_eq!(client.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_failure_response_keeps_client_open() {
        let mut client = scripted(Header::failure(Operation::Upload, "disk full"), b"").await;
        let mut body = &b"hello"[..];
        let err = client.upload(&mut body, 5).await.unwrap_err();
        assert!(matches!(err, ClientError::Failed { .. }));
        assert_eq!(client.state(), SessionState::Opened);
    }

    #[tokio::test]
    async fn test_mismatched_operation() {
        let mut client = scripted(Header::success(Operation::Upload), b"").await;
        let err = client.connect("s", None).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Channel(ChannelError::Protocol(ProtocolError::UnexpectedResponse {
                expected: Operation::Connect,
                actual: Operation::Upload
            }))
        ));
    }

    #[tokio::test]
    async fn test_response_without_result() {
        let mut client = scripted(Header::request(Operation::SyncInstances), b"").await;
        let err = client.sync_instances().await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Channel(ChannelError::Protocol(ProtocolError::MissingResult(_)))
        ));
    }

    #[tokio::test]
    async fn test_invalid_snapshot_body() {
        let mut client = scripted(Header::success(Operation::SyncInstances), b"not json").await;
        let err = client.sync_instances().await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidSnapshot(_)));
    }

    #[tokio::test]
    async fn test_empty_snapshot() {
        let mut client = scripted(Header::success(Operation::SyncInstances), b"[]").await;
        assert!(client.sync_instances().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_receipt_missing_path() {
        let mut client = scripted(Header::success(Operation::Upload), b"").await;
        let mut body = &b"hello"[..];
        let err = client.upload(&mut body, 5).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Channel(ChannelError::Protocol(ProtocolError::MissingAttribute("path")))
        ));
    }
}
