//! UploadStore trait abstraction for storage backends.
//!
//! Implementations:
//! - `MemoryStore` - For testing
//! - `DirectoryStore` (in cluster-daemon) - Content-addressed files on disk

use crate::protocol::UploadReceipt;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Body ended early: expected {expected} bytes, received {received}")]
    ShortBody { expected: u64, received: u64 },

    #[error("Storage rejected the object: {0}")]
    Rejected(String),
}

/// Backend that persists uploaded bodies.
#[async_trait]
pub trait UploadStore: Send + Sync {
    /// Consume exactly `len` bytes from `body` and persist them.
    ///
    /// Must fail with [`StoreError::ShortBody`] rather than store a
    /// truncated object.
    async fn store(
        &self,
        body: &mut (dyn AsyncRead + Send + Unpin),
        len: u64,
    ) -> Result<UploadReceipt, StoreError>;
}

/// In-memory store keyed by digest.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, digest: &str) -> Option<Vec<u8>> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(digest)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl UploadStore for MemoryStore {
    async fn store(
        &self,
        body: &mut (dyn AsyncRead + Send + Unpin),
        len: u64,
    ) -> Result<UploadReceipt, StoreError> {
        let mut data = Vec::new();
        body.read_to_end(&mut data).await?;
        if data.len() as u64 != len {
            return Err(StoreError::ShortBody {
                expected: len,
                received: data.len() as u64,
            });
        }

        let digest = hex::encode(Sha256::digest(&data));
        let receipt = UploadReceipt {
            path: format!("memory/{}", digest),
            digest: digest.clone(),
            size: len,
        };
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(digest, data);
        Ok(receipt)
    }
}
