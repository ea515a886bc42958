//! Content-addressed object storage on disk.
//!
//! Uploads stream into a temp file while being hashed, then move to
//! `<data_dir>/objects/<aa>/<bb>/<digest>` where `aa` and `bb` are the first
//! two byte pairs of the hex SHA-256. The returned reference is
//! `<instance_id>/<aa>/<bb>/<digest>`.

use async_trait::async_trait;
use cluster_core::protocol::UploadReceipt;
use cluster_core::{InstanceId, StoreError, UploadStore};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::debug;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

pub struct DirectoryStore {
    data_dir: PathBuf,
    tmp_dir: PathBuf,
    instance_id: InstanceId,
    next_tmp: AtomicU64,
}

impl DirectoryStore {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        tmp_dir: impl Into<PathBuf>,
        instance_id: InstanceId,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            tmp_dir: tmp_dir.into(),
            instance_id,
            next_tmp: AtomicU64::new(0),
        }
    }

    fn objects_dir(&self) -> PathBuf {
        self.data_dir.join("objects")
    }

    /// On-disk location of an object by digest.
    pub fn object_path(&self, digest: &str) -> PathBuf {
        let (aa, bb) = shard(digest);
        self.objects_dir().join(aa).join(bb).join(digest)
    }

    /// Reference returned to uploaders.
    pub fn reference(&self, digest: &str) -> String {
        let (aa, bb) = shard(digest);
        format!("{}/{}/{}/{}", self.instance_id, aa, bb, digest)
    }

    fn tmp_path(&self) -> PathBuf {
        let n = self.next_tmp.fetch_add(1, Ordering::Relaxed);
        self.tmp_dir.join(format!("upload-{}-{}", std::process::id(), n))
    }

    async fn write_tmp(
        &self,
        tmp: &Path,
        body: &mut (dyn AsyncRead + Send + Unpin),
        len: u64,
    ) -> Result<String, StoreError> {
        fs::create_dir_all(&self.tmp_dir).await?;
        let mut file = File::create(tmp).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut received = 0u64;

        loop {
            let n = body.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
            received += n as u64;
        }

        if received != len {
            return Err(StoreError::ShortBody {
                expected: len,
                received,
            });
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(hex::encode(hasher.finalize()))
    }
}

fn shard(digest: &str) -> (&str, &str) {
    let aa = digest.get(0..2).unwrap_or("00");
    let bb = digest.get(2..4).unwrap_or("00");
    (aa, bb)
}

#[async_trait]
impl UploadStore for DirectoryStore {
    async fn store(
        &self,
        body: &mut (dyn AsyncRead + Send + Unpin),
        len: u64,
    ) -> Result<UploadReceipt, StoreError> {
        let tmp = self.tmp_path();

        let digest = match self.write_tmp(&tmp, body, len).await {
            Ok(digest) => digest,
            Err(e) => {
                let _ = fs::remove_file(&tmp).await;
                return Err(e);
            }
        };

        let target = self.object_path(&digest);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        // Identical content may already be stored; rename replaces it
        if let Err(e) = fs::rename(&tmp, &target).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!("Stored object {} ({} bytes)", digest, len);
        Ok(UploadReceipt {
            path: self.reference(&digest),
            digest,
            size: len,
        })
    }
}
