use std::sync::Arc;

use crate::hasher::FileHasher;

/// Decides whether a source file needs to be transferred.
///
/// The source fingerprint is computed from bytes already read by the caller; the destination
/// fingerprint comes from the destination hasher, which is usually cached.
pub struct ChangeValidator {
    source: Arc<dyn FileHasher>,
    destination: Arc<dyn FileHasher>,
}

impl ChangeValidator {
    pub fn new(source: Arc<dyn FileHasher>, destination: Arc<dyn FileHasher>) -> Self {
        Self {
            source,
            destination,
        }
    }

    /// True unless the destination is known to hold exactly `source_content`.
    pub async fn is_file_changed(&self, source_content: &[u8], destination_path: &str) -> bool {
        let source = self.source.hash_bytes(source_content);
        match self.destination.hash_file(destination_path).await {
            Ok(destination) if destination.is_empty() => true,
            Ok(destination) => destination != source,
            Err(err) => {
                tracing::debug!(
                    "cannot fingerprint {:?}, assuming it changed: {:#}",
                    destination_path,
                    &err
                );
                true
            }
        }
    }

    /// Invalidate anything cached for `path` after it was written or removed.
    pub fn on_file_changed(&self, path: &str) {
        self.source.reset(path);
        self.destination.reset(path);
    }

    pub async fn load(&self) -> anyhow::Result<()> {
        self.source.load().await?;
        self.destination.load().await
    }

    pub async fn save(&self, force: bool, processed_files: u64) -> anyhow::Result<()> {
        self.source.save(force, processed_files).await?;
        self.destination.save(force, processed_files).await
    }
}
