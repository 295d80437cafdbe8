//! Content fingerprints
//!
//! A fingerprint is the lowercase hex SHA-256 digest of a file's bytes. The empty fingerprint
//! stands for "unknown", which is what hashing a missing file yields.

use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::fs::Filesystem;

/// Hex encoded content digest, empty when unknown.
pub type Fingerprint = String;

/// Fingerprint of an in-memory buffer.
pub fn fingerprint(bytes: &[u8]) -> Fingerprint {
    hex::encode(Sha256::digest(bytes))
}

#[async_trait]
pub trait FileHasher: Send + Sync {
    /// Fingerprint of the file at `path`, empty if it does not exist.
    async fn hash_file(&self, path: &str) -> anyhow::Result<Fingerprint>;

    fn hash_bytes(&self, bytes: &[u8]) -> Fingerprint {
        fingerprint(bytes)
    }

    /// Forget anything remembered about `path`.
    fn reset(&self, _path: &str) {}

    /// Restore persisted state, if any.
    async fn load(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Persist state; see [`crate::hash_cache::CachedHasher`] for the flush policy.
    async fn save(&self, _force: bool, _processed_files: u64) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Hasher that reads and hashes the file on every call.
pub struct DirectHasher {
    fs: Arc<dyn Filesystem>,
}

impl DirectHasher {
    pub fn new(fs: Arc<dyn Filesystem>) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl FileHasher for DirectHasher {
    async fn hash_file(&self, path: &str) -> anyhow::Result<Fingerprint> {
        match self.fs.read_all(path).await {
            Ok(bytes) => Ok(self.hash_bytes(&bytes)),
            Err(err) if err.is_not_found() => Ok(Fingerprint::new()),
            Err(err) => Err(anyhow::Error::new(err).context(format!("failed hashing {path:?}"))),
        }
    }
}
