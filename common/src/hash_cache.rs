//! Fingerprint memo persisted to a side-car file
//!
//! The side-car file holds one `path|fingerprint` record per line. Records are split at the last
//! `|`, so paths containing the separator survive a round trip. Lines that cannot be parsed are
//! skipped with a warning. Every save rewrites the whole file (delete, then create).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;

use crate::fs::Filesystem;
use crate::hasher::{FileHasher, Fingerprint};

// concurrent modification time lookups during load
const MTIME_CHECK_WIDTH: usize = 16;

#[derive(Debug, Copy, Clone)]
pub struct Settings {
    /// Number of processed files that must accumulate before a non-forced save writes.
    pub save_interval: u64,
    /// Evict entries whose file changed after the side-car file was written.
    pub check_mtime: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            save_interval: 100,
            check_mtime: false,
        }
    }
}

#[derive(Debug, Default)]
struct SaveState {
    processed_at_last_save: u64,
    len_at_last_save: usize,
}

/// Hasher that memoizes fingerprints of another hasher.
pub struct CachedHasher {
    inner: Arc<dyn FileHasher>,
    fs: Arc<dyn Filesystem>,
    cache_path: String,
    settings: Settings,
    memo: DashMap<String, Fingerprint>,
    save_state: tokio::sync::Mutex<SaveState>,
}

fn parse_record(line: &str) -> Option<(&str, &str)> {
    let (path, fingerprint) = line.rsplit_once('|')?;
    if path.is_empty() || fingerprint.is_empty() {
        return None;
    }
    Some((path, fingerprint))
}

impl CachedHasher {
    pub fn new(
        inner: Arc<dyn FileHasher>,
        fs: Arc<dyn Filesystem>,
        cache_path: impl Into<String>,
        settings: Settings,
    ) -> Self {
        Self {
            inner,
            fs,
            cache_path: cache_path.into(),
            settings,
            memo: DashMap::new(),
            save_state: tokio::sync::Mutex::new(SaveState::default()),
        }
    }

    pub fn cache_path(&self) -> &str {
        &self.cache_path
    }

    /// Copy of the current memo, ordered by path.
    pub fn entries(&self) -> BTreeMap<String, Fingerprint> {
        self.memo
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    fn serialize(&self) -> Vec<u8> {
        let mut out = String::new();
        for (path, fingerprint) in self.entries() {
            out.push_str(&path);
            out.push('|');
            out.push_str(&fingerprint);
            out.push('\n');
        }
        out.into_bytes()
    }

    /// Drop records whose file changed after the side-car file was written, or whose
    /// modification time cannot be established.
    async fn evict_modified(&self, records: &mut HashMap<String, Fingerprint>) -> anyhow::Result<()> {
        let saved_at = self
            .fs
            .last_modified(&self.cache_path)
            .await
            .with_context(|| format!("failed reading modification time of {:?}", &self.cache_path))?;
        let paths: Vec<String> = records.keys().cloned().collect();
        let stale: Vec<String> = futures::stream::iter(paths)
            .map(|path| async move {
                match self.fs.last_modified(&path).await {
                    Ok(modified) if modified <= saved_at => None,
                    Ok(_) => Some(path),
                    Err(err) => {
                        tracing::debug!("cannot establish modification time of {:?}: {}", &path, &err);
                        Some(path)
                    }
                }
            })
            .buffer_unordered(MTIME_CHECK_WIDTH)
            .filter_map(|stale| async move { stale })
            .collect()
            .await;
        for path in &stale {
            records.remove(path);
        }
        if !stale.is_empty() {
            tracing::info!("evicted {} stale hash cache entries", stale.len());
        }
        Ok(())
    }

    async fn write(&self) -> anyhow::Result<()> {
        let content = self.serialize();
        if self.fs.file_exists(&self.cache_path).await? {
            self.fs
                .delete_file(&self.cache_path)
                .await
                .with_context(|| format!("failed removing old hash cache {:?}", &self.cache_path))?;
        }
        self.fs
            .create_file(&self.cache_path, &content)
            .await
            .with_context(|| format!("failed writing hash cache {:?}", &self.cache_path))?;
        Ok(())
    }
}

#[async_trait]
impl FileHasher for CachedHasher {
    async fn hash_file(&self, path: &str) -> anyhow::Result<Fingerprint> {
        if path.is_empty() {
            return Ok(Fingerprint::new());
        }
        if let Some(fingerprint) = self.memo.get(path) {
            return Ok(fingerprint.value().clone());
        }
        let fingerprint = self.inner.hash_file(path).await?;
        if !fingerprint.is_empty() {
            self.memo.insert(path.to_string(), fingerprint.clone());
        }
        Ok(fingerprint)
    }

    fn hash_bytes(&self, bytes: &[u8]) -> Fingerprint {
        self.inner.hash_bytes(bytes)
    }

    fn reset(&self, path: &str) {
        self.memo.remove(path);
        self.inner.reset(path);
    }

    /// Replace the memo with the side-car file's records. On error the memo is left empty.
    async fn load(&self) -> anyhow::Result<()> {
        let mut state = self.save_state.lock().await;
        self.memo.clear();
        state.len_at_last_save = 0;
        state.processed_at_last_save = 0;
        if !self.fs.file_exists(&self.cache_path).await? {
            tracing::debug!("no hash cache at {:?}", &self.cache_path);
            return Ok(());
        }
        let content = self
            .fs
            .read_all(&self.cache_path)
            .await
            .with_context(|| format!("failed reading hash cache {:?}", &self.cache_path))?;
        let content = String::from_utf8_lossy(&content);
        let mut records = HashMap::new();
        for (idx, line) in content.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            match parse_record(line) {
                Some((path, fingerprint)) => {
                    records.insert(path.to_string(), fingerprint.to_string());
                }
                None => tracing::warn!(
                    "{:?}:{}: skipping malformed hash cache record",
                    &self.cache_path,
                    idx + 1
                ),
            }
        }
        if self.settings.check_mtime {
            self.evict_modified(&mut records).await?;
        }
        for (path, fingerprint) in records {
            self.memo.insert(path, fingerprint);
        }
        tracing::debug!("loaded {} hash cache entries", self.memo.len());
        state.len_at_last_save = self.memo.len();
        Ok(())
    }

    /// Persist the memo.
    ///
    /// A non-forced save writes only when more than `save_interval` files were processed since
    /// the previous save and the memo grew in the meantime; it is dropped outright while another
    /// save is running. A forced save waits for a running save and always writes.
    async fn save(&self, force: bool, processed_files: u64) -> anyhow::Result<()> {
        let mut state = if force {
            self.save_state.lock().await
        } else {
            match self.save_state.try_lock() {
                Ok(state) => state,
                Err(_) => {
                    tracing::trace!("hash cache save already in progress");
                    return Ok(());
                }
            }
        };
        if !force {
            let processed = processed_files.saturating_sub(state.processed_at_last_save);
            if processed <= self.settings.save_interval || self.memo.len() <= state.len_at_last_save {
                return Ok(());
            }
        }
        let len = self.memo.len();
        self.write().await?;
        tracing::debug!("saved {} hash cache entries to {:?}", len, &self.cache_path);
        state.processed_at_last_save = processed_files;
        state.len_at_last_save = len;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::fs::MemoryFs;
    use crate::hasher::{DirectHasher, fingerprint};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_test::traced_test;

    struct CountingHasher {
        inner: DirectHasher,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FileHasher for CountingHasher {
        async fn hash_file(&self, path: &str) -> anyhow::Result<Fingerprint> {
            self.calls.fetch_add(1, Ordering::AcqRel);
            self.inner.hash_file(path).await
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        fs: Arc<MemoryFs>,
        counting: Arc<CountingHasher>,
    }

    async fn fixture() -> anyhow::Result<Fixture> {
        let clock = Arc::new(ManualClock::at_unix_epoch());
        let fs = Arc::new(MemoryFs::new(clock.clone()));
        fs.create_directory("backup").await?;
        fs.create_file("backup/a", b"alpha").await?;
        fs.create_file("backup/b", b"beta").await?;
        let counting = Arc::new(CountingHasher {
            inner: DirectHasher::new(fs.clone()),
            calls: AtomicUsize::new(0),
        });
        Ok(Fixture { clock, fs, counting })
    }

    fn cached(fixture: &Fixture, settings: Settings) -> CachedHasher {
        CachedHasher::new(
            fixture.counting.clone(),
            fixture.fs.clone(),
            "backup/.hashes",
            settings,
        )
    }

    #[tokio::test]
    #[traced_test]
    async fn memoizes_fingerprints() -> anyhow::Result<()> {
        let fixture = fixture().await?;
        let hasher = cached(&fixture, Settings::default());
        assert_eq!(hasher.hash_file("backup/a").await?, fingerprint(b"alpha"));
        assert_eq!(hasher.hash_file("backup/a").await?, fingerprint(b"alpha"));
        assert_eq!(fixture.counting.calls.load(Ordering::Acquire), 1);
        hasher.reset("backup/a");
        hasher.hash_file("backup/a").await?;
        assert_eq!(fixture.counting.calls.load(Ordering::Acquire), 2);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn empty_fingerprints_are_not_memoized() -> anyhow::Result<()> {
        let fixture = fixture().await?;
        let hasher = cached(&fixture, Settings::default());
        assert_eq!(hasher.hash_file("backup/missing").await?, "");
        assert_eq!(hasher.hash_file("").await?, "");
        assert!(hasher.entries().is_empty());
        assert_eq!(fixture.counting.calls.load(Ordering::Acquire), 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn save_and_load_round_trip() -> anyhow::Result<()> {
        let fixture = fixture().await?;
        let hasher = cached(&fixture, Settings::default());
        hasher.hash_file("backup/a").await?;
        hasher.hash_file("backup/b").await?;
        hasher.save(true, 2).await?;
        let fresh = cached(&fixture, Settings::default());
        fresh.load().await?;
        assert_eq!(fresh.entries(), hasher.entries());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn malformed_records_are_skipped() -> anyhow::Result<()> {
        let fixture = fixture().await?;
        let good = fingerprint(b"alpha");
        let content = format!("garbage\nbackup/a|{good}\n|nopath\nweird|name|{good}\nbackup/b|\n");
        fixture.fs.create_file("backup/.hashes", content.as_bytes()).await?;
        let hasher = cached(&fixture, Settings::default());
        hasher.load().await?;
        let entries = hasher.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries.get("backup/a"), Some(&good));
        assert_eq!(entries.get("weird|name"), Some(&good));
        assert!(logs_contain("skipping malformed hash cache record"));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn mtime_check_evicts_files_changed_after_save() -> anyhow::Result<()> {
        let fixture = fixture().await?;
        let settings = Settings {
            check_mtime: true,
            ..Default::default()
        };
        let hasher = cached(&fixture, settings);
        hasher.hash_file("backup/a").await?;
        hasher.hash_file("backup/b").await?;
        fixture.clock.advance(std::time::Duration::from_secs(5));
        hasher.save(true, 2).await?;
        fixture.clock.advance(std::time::Duration::from_secs(5));
        fixture.fs.create_file("backup/b", b"changed").await?;
        fixture.fs.delete_file("backup/a").await?;
        let fresh = cached(&fixture, settings);
        fresh.load().await?;
        assert!(fresh.entries().is_empty());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn mtime_check_keeps_untouched_files() -> anyhow::Result<()> {
        let fixture = fixture().await?;
        let settings = Settings {
            check_mtime: true,
            ..Default::default()
        };
        let hasher = cached(&fixture, settings);
        hasher.hash_file("backup/a").await?;
        fixture.clock.advance(std::time::Duration::from_secs(5));
        hasher.save(true, 1).await?;
        let fresh = cached(&fixture, settings);
        fresh.load().await?;
        assert_eq!(fresh.entries(), hasher.entries());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn periodic_save_is_throttled() -> anyhow::Result<()> {
        let fixture = fixture().await?;
        let settings = Settings {
            save_interval: 10,
            check_mtime: false,
        };
        let hasher = cached(&fixture, settings);
        hasher.hash_file("backup/a").await?;
        hasher.save(false, 5).await?;
        assert!(!fixture.fs.file_exists("backup/.hashes").await?);
        hasher.save(false, 11).await?;
        assert!(fixture.fs.file_exists("backup/.hashes").await?);
        // memo did not grow since the last save
        let writes = fixture.fs.write_count();
        hasher.save(false, 30).await?;
        assert_eq!(fixture.fs.write_count(), writes);
        // a forced save always writes
        hasher.save(true, 30).await?;
        assert_eq!(fixture.fs.write_count(), writes + 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn overlapping_periodic_save_is_dropped() -> anyhow::Result<()> {
        let fixture = fixture().await?;
        let settings = Settings {
            save_interval: 0,
            check_mtime: false,
        };
        let hasher = cached(&fixture, settings);
        hasher.hash_file("backup/a").await?;
        let in_flight = hasher.save_state.lock().await;
        hasher.save(false, 100).await?;
        assert!(!fixture.fs.file_exists("backup/.hashes").await?);
        let forced = tokio::time::timeout(std::time::Duration::from_millis(50), hasher.save(true, 100)).await;
        assert!(forced.is_err(), "forced save must wait for the running save");
        drop(in_flight);
        hasher.save(true, 100).await?;
        assert!(fixture.fs.file_exists("backup/.hashes").await?);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_mtime_check_leaves_memo_empty() -> anyhow::Result<()> {
        let fixture = fixture().await?;
        let settings = Settings {
            check_mtime: true,
            ..Default::default()
        };
        let content = format!("backup/a|{}\n", fingerprint(b"old alpha"));
        fixture.fs.create_file("backup/.hashes", content.as_bytes()).await?;
        fixture.fs.deny_metadata("backup/.hashes");
        let hasher = cached(&fixture, settings);
        assert!(hasher.load().await.is_err());
        assert!(hasher.entries().is_empty());
        assert_eq!(hasher.hash_file("backup/a").await?, fingerprint(b"alpha"));
        Ok(())
    }
}
