//! Framed channel over a bidirectional byte stream.
//!
//! Frame layout (all integers big-endian):
//!
//! ```text
//! +------------+-----------------+------------+----------------+
//! | u32 hlen   | hlen bytes JSON | u64 blen   | blen body bytes|
//! +------------+-----------------+------------+----------------+
//! ```
//!
//! A channel is a half-duplex request/response pipe: both `send` and
//! `receive` take `&mut self`, so one exchange is in flight at a time.
//! `receive` hands the body to a [`BodyConsumer`] as a stream limited to the
//! declared length, then drains whatever the consumer left unread so the
//! next header always starts on a frame boundary.

use crate::error::{ChannelError, ProtocolError, Result};
use crate::protocol::Header;
use async_trait::async_trait;
use std::io::{self, ErrorKind};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tracing::trace;

/// Maximum size of a serialized header (1MB).
pub const MAX_HEADER_SIZE: usize = 1024 * 1024;

/// Default maximum declared body length (64GB).
pub const DEFAULT_MAX_BODY_SIZE: u64 = 64 * 1024 * 1024 * 1024;

/// Receives the body of a frame.
///
/// Invoked inline by [`FramedChannel::receive`] for every frame, including
/// frames with a zero-length body. `body` yields end-of-stream after `len`
/// bytes even if more data is pending on the transport.
#[async_trait]
pub trait BodyConsumer: Send {
    async fn consume(
        &mut self,
        header: &Header,
        body: &mut (dyn AsyncRead + Send + Unpin),
        len: u64,
    ) -> Result<()>;
}

/// Consumer that ignores the body (the channel drains it).
#[derive(Debug, Default, Clone, Copy)]
pub struct Discard;

#[async_trait]
impl BodyConsumer for Discard {
    async fn consume(
        &mut self,
        _header: &Header,
        _body: &mut (dyn AsyncRead + Send + Unpin),
        _len: u64,
    ) -> Result<()> {
        Ok(())
    }
}

/// Consumer that buffers a small body in memory.
#[derive(Debug)]
pub struct Collect {
    limit: u64,
    data: Vec<u8>,
}

impl Collect {
    /// Buffer bodies of at most `limit` bytes; larger bodies are a protocol error.
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            data: Vec::new(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

#[async_trait]
impl BodyConsumer for Collect {
    async fn consume(
        &mut self,
        _header: &Header,
        body: &mut (dyn AsyncRead + Send + Unpin),
        len: u64,
    ) -> Result<()> {
        if len > self.limit {
            return Err(ProtocolError::BodyTooLarge {
                len,
                max: self.limit,
            }
            .into());
        }
        self.data.clear();
        self.data.reserve(len as usize);
        body.read_to_end(&mut self.data).await?;
        Ok(())
    }
}

/// A byte stream carrying header + body frames.
pub struct FramedChannel<S> {
    stream: BufStream<S>,
    max_body_size: u64,
}

impl<S> FramedChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufStream::new(stream),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }

    /// Reject incoming frames declaring a body longer than `max`.
    pub fn with_max_body_size(mut self, max: u64) -> Self {
        self.max_body_size = max;
        self
    }

    pub fn max_body_size(&self) -> u64 {
        self.max_body_size
    }

    pub fn get_ref(&self) -> &S {
        self.stream.get_ref()
    }

    /// Raw access to the transport. Bypasses framing.
    pub fn get_mut(&mut self) -> &mut S {
        self.stream.get_mut()
    }

    /// Send a header followed by exactly `body_len` bytes read from `body`.
    ///
    /// Fails with an I/O error (`UnexpectedEof`) if `body` ends early; the
    /// channel must be closed after any error.
    pub async fn send<R>(
        &mut self,
        header: &Header,
        body: Option<&mut R>,
        body_len: u64,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let encoded = header.to_json();
        if encoded.len() > MAX_HEADER_SIZE {
            return Err(ProtocolError::HeaderTooLarge {
                len: encoded.len(),
                max: MAX_HEADER_SIZE,
            }
            .into());
        }

        self.stream.write_u32(encoded.len() as u32).await?;
        self.stream.write_all(&encoded).await?;
        self.stream.write_u64(body_len).await?;

        if body_len > 0 {
            let reader = body.ok_or_else(|| {
                io::Error::new(
                    ErrorKind::InvalidInput,
                    "body length declared without a body reader",
                )
            })?;
            let mut limited = reader.take(body_len);
            let copied = tokio::io::copy(&mut limited, &mut self.stream).await?;
            if copied < body_len {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("body reader ended after {} of {} bytes", copied, body_len),
                )
                .into());
            }
        }

        self.stream.flush().await?;
        trace!("Sent {} frame ({} body bytes)", header.operation, body_len);
        Ok(())
    }

    /// Send a header with no body.
    pub async fn send_header(&mut self, header: &Header) -> Result<()> {
        self.send::<tokio::io::Empty>(header, None, 0).await
    }

    /// Receive one frame, handing its body to `consumer`.
    ///
    /// Returns [`ChannelError::Closed`] if the peer closed the transport
    /// before the first byte of a frame.
    pub async fn receive<C>(&mut self, consumer: &mut C) -> Result<Header>
    where
        C: BodyConsumer + ?Sized,
    {
        let mut prefix = [0u8; 4];
        let read = self.stream.read(&mut prefix).await?;
        if read == 0 {
            return Err(ChannelError::Closed);
        }
        if read < prefix.len() {
            self.stream
                .read_exact(&mut prefix[read..])
                .await
                .map_err(truncated)?;
        }

        let header_len = u32::from_be_bytes(prefix) as usize;
        if header_len == 0 {
            return Err(ProtocolError::EmptyHeader.into());
        }
        if header_len > MAX_HEADER_SIZE {
            return Err(ProtocolError::HeaderTooLarge {
                len: header_len,
                max: MAX_HEADER_SIZE,
            }
            .into());
        }

        let mut encoded = vec![0u8; header_len];
        self.stream.read_exact(&mut encoded).await.map_err(truncated)?;
        let header = Header::from_json(&encoded)?;

        let body_len = self.stream.read_u64().await.map_err(truncated)?;
        if body_len > self.max_body_size {
            return Err(ProtocolError::BodyTooLarge {
                len: body_len,
                max: self.max_body_size,
            }
            .into());
        }
        trace!("Received {} frame ({} body bytes)", header.operation, body_len);

        let mut body = (&mut self.stream).take(body_len);
        consumer.consume(&header, &mut body, body_len).await?;

        if body.limit() > 0 {
            tokio::io::copy(&mut body, &mut tokio::io::sink()).await?;
            if body.limit() > 0 {
                return Err(ProtocolError::TruncatedBody {
                    expected: body_len,
                    received: body_len - body.limit(),
                }
                .into());
            }
        }

        Ok(header)
    }

    /// Flush and shut down the write half of the transport.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

fn truncated(err: io::Error) -> ChannelError {
    if err.kind() == ErrorKind::UnexpectedEof {
        ProtocolError::TruncatedFrame.into()
    } else {
        err.into()
    }
}
