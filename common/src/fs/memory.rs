use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Filesystem, FsError, Result};
use crate::clock::Clock;

#[derive(Debug)]
struct MemFile {
    data: Vec<u8>,
    modified: DateTime<Utc>,
}

#[derive(Debug)]
struct MemDir {
    files: BTreeMap<String, MemFile>,
    dirs: BTreeMap<String, MemDir>,
    modified: DateTime<Utc>,
}

impl MemDir {
    fn new(modified: DateTime<Utc>) -> Self {
        Self {
            files: BTreeMap::new(),
            dirs: BTreeMap::new(),
            modified,
        }
    }

    fn dir(&self, parts: &[&str]) -> Option<&MemDir> {
        parts
            .iter()
            .try_fold(self, |cur, name| cur.dirs.get(*name))
    }

    fn dir_mut(&mut self, parts: &[&str]) -> Option<&mut MemDir> {
        parts
            .iter()
            .try_fold(self, |cur, name| cur.dirs.get_mut(*name))
    }
}

/// In-memory filesystem with `/`-separated paths.
///
/// Modification times come from the injected clock, which makes retention ordering fully
/// deterministic in tests. Reads of paths registered with [`MemoryFs::deny_reads`] and modification
/// time lookups of paths registered with [`MemoryFs::deny_metadata`] fail with an I/O error.
/// [`MemoryFs::refuse_connections`] makes `connect` fail like an unreachable remote host.
pub struct MemoryFs {
    root: std::sync::Mutex<MemDir>,
    clock: Arc<dyn Clock>,
    writes: AtomicUsize,
    unreadable: std::sync::Mutex<HashSet<String>>,
    unstatable: std::sync::Mutex<HashSet<String>>,
    offline: AtomicBool,
    disconnects: AtomicUsize,
}

fn split(path: &str) -> Result<Vec<&str>> {
    let parts: Vec<&str> = path.split('/').filter(|part| !part.is_empty()).collect();
    if parts.iter().any(|part| *part == "." || *part == "..") {
        return Err(FsError::InvalidPath {
            path: path.to_string(),
            reason: "relative components are not supported",
        });
    }
    Ok(parts)
}

fn split_file(path: &str) -> Result<(Vec<&str>, &str)> {
    let mut parts = split(path)?;
    match parts.pop() {
        Some(name) => Ok((parts, name)),
        None => Err(FsError::InvalidPath {
            path: path.to_string(),
            reason: "path has no file name",
        }),
    }
}

impl MemoryFs {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let root = MemDir::new(clock.now());
        Self {
            root: std::sync::Mutex::new(root),
            clock,
            writes: AtomicUsize::new(0),
            unreadable: std::sync::Mutex::new(HashSet::new()),
            unstatable: std::sync::Mutex::new(HashSet::new()),
            offline: AtomicBool::new(false),
            disconnects: AtomicUsize::new(0),
        }
    }

    /// Number of successful `create_file` calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Acquire)
    }

    /// Make every subsequent read of `path` fail.
    pub fn deny_reads(&self, path: &str) {
        self.unreadable.lock().unwrap().insert(path.to_string());
    }

    /// Make every subsequent modification time lookup of `path` fail.
    pub fn deny_metadata(&self, path: &str) {
        self.unstatable.lock().unwrap().insert(path.to_string());
    }

    pub fn refuse_connections(&self) {
        self.offline.store(true, Ordering::Release);
    }

    /// Number of `disconnect` calls so far.
    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Filesystem for MemoryFs {
    fn combine_path(&self, parts: &[&str]) -> String {
        super::posix_join(parts)
    }

    fn leaf_name(&self, path: &str) -> String {
        super::posix_leaf(path)
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        let (dirs, name) = split_file(path)?;
        let root = self.root.lock().unwrap();
        Ok(root
            .dir(&dirs)
            .is_some_and(|dir| dir.files.contains_key(name)))
    }

    async fn read_all(&self, path: &str) -> Result<Vec<u8>> {
        if self.unreadable.lock().unwrap().contains(path) {
            return Err(FsError::Io {
                op: "read",
                path: path.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            });
        }
        let (dirs, name) = split_file(path)?;
        let root = self.root.lock().unwrap();
        root.dir(&dirs)
            .and_then(|dir| dir.files.get(name))
            .map(|file| file.data.clone())
            .ok_or_else(|| FsError::not_found(path))
    }

    async fn create_file(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let (dirs, name) = split_file(path)?;
        let now = self.clock.now();
        let mut root = self.root.lock().unwrap();
        let dir = root
            .dir_mut(&dirs)
            .ok_or_else(|| FsError::not_found(path))?;
        if dir.dirs.contains_key(name) {
            return Err(FsError::InvalidPath {
                path: path.to_string(),
                reason: "a directory with this name already exists",
            });
        }
        dir.files.insert(
            name.to_string(),
            MemFile {
                data: bytes.to_vec(),
                modified: now,
            },
        );
        dir.modified = now;
        self.writes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        let (dirs, name) = split_file(path)?;
        let now = self.clock.now();
        let mut root = self.root.lock().unwrap();
        let dir = root
            .dir_mut(&dirs)
            .ok_or_else(|| FsError::not_found(path))?;
        dir.files
            .remove(name)
            .ok_or_else(|| FsError::not_found(path))?;
        dir.modified = now;
        Ok(())
    }

    async fn directory_exists(&self, path: &str) -> Result<bool> {
        let parts = split(path)?;
        let root = self.root.lock().unwrap();
        Ok(root.dir(&parts).is_some())
    }

    async fn list_files(&self, path: &str) -> Result<Vec<String>> {
        let parts = split(path)?;
        let root = self.root.lock().unwrap();
        let dir = root.dir(&parts).ok_or_else(|| FsError::not_found(path))?;
        Ok(dir.files.keys().cloned().collect())
    }

    async fn list_directories(&self, path: &str) -> Result<Vec<String>> {
        let parts = split(path)?;
        let root = self.root.lock().unwrap();
        let dir = root.dir(&parts).ok_or_else(|| FsError::not_found(path))?;
        Ok(dir.dirs.keys().cloned().collect())
    }

    async fn create_directory(&self, path: &str) -> Result<()> {
        let parts = split(path)?;
        let now = self.clock.now();
        let mut root = self.root.lock().unwrap();
        let mut cur: &mut MemDir = &mut root;
        for name in parts {
            if cur.files.contains_key(name) {
                return Err(FsError::InvalidPath {
                    path: path.to_string(),
                    reason: "a file with this name already exists",
                });
            }
            if !cur.dirs.contains_key(name) {
                cur.modified = now;
            }
            cur = cur
                .dirs
                .entry(name.to_string())
                .or_insert_with(|| MemDir::new(now));
        }
        Ok(())
    }

    async fn delete_directory(&self, path: &str) -> Result<()> {
        let (parents, name) = split_file(path)?;
        let now = self.clock.now();
        let mut root = self.root.lock().unwrap();
        let dir = root
            .dir_mut(&parents)
            .ok_or_else(|| FsError::not_found(path))?;
        dir.dirs
            .remove(name)
            .ok_or_else(|| FsError::not_found(path))?;
        dir.modified = now;
        Ok(())
    }

    async fn last_modified(&self, path: &str) -> Result<DateTime<Utc>> {
        if self.unstatable.lock().unwrap().contains(path) {
            return Err(FsError::Io {
                op: "stat",
                path: path.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            });
        }
        let parts = split(path)?;
        let root = self.root.lock().unwrap();
        if let Some(dir) = root.dir(&parts) {
            return Ok(dir.modified);
        }
        let (dirs, name) = split_file(path)?;
        root.dir(&dirs)
            .and_then(|dir| dir.files.get(name))
            .map(|file| file.modified)
            .ok_or_else(|| FsError::not_found(path))
    }

    async fn connect(&self) -> Result<()> {
        if self.offline.load(Ordering::Acquire) {
            return Err(FsError::Session {
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn memory_fs() -> (Arc<ManualClock>, MemoryFs) {
        let clock = Arc::new(ManualClock::at_unix_epoch());
        let fs = MemoryFs::new(clock.clone());
        (clock, fs)
    }

    #[tokio::test]
    async fn create_and_read_back() -> anyhow::Result<()> {
        let (_, fs) = memory_fs();
        fs.create_directory("root/a/b").await?;
        fs.create_file("root/a/b/file", &[1, 2, 3]).await?;
        assert!(fs.file_exists("root/a/b/file").await?);
        assert!(fs.directory_exists("root/a").await?);
        assert!(!fs.file_exists("root/a").await?);
        assert_eq!(fs.read_all("root/a/b/file").await?, vec![1, 2, 3]);
        assert_eq!(fs.list_files("root/a/b").await?, vec!["file"]);
        assert_eq!(fs.list_directories("root").await?, vec!["a"]);
        assert_eq!(fs.write_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn file_needs_existing_parent() -> anyhow::Result<()> {
        let (_, fs) = memory_fs();
        let err = fs.create_file("missing/file", &[]).await.unwrap_err();
        assert!(err.is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn cant_create_file_over_directory() -> anyhow::Result<()> {
        let (_, fs) = memory_fs();
        fs.create_directory("root/name").await?;
        let err = fs.create_file("root/name", &[1]).await.unwrap_err();
        assert!(matches!(err, FsError::InvalidPath { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn cant_create_directory_over_file() -> anyhow::Result<()> {
        let (_, fs) = memory_fs();
        fs.create_directory("root").await?;
        fs.create_file("root/name", &[1]).await?;
        let err = fs.create_directory("root/name/sub").await.unwrap_err();
        assert!(matches!(err, FsError::InvalidPath { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn modification_time_follows_clock() -> anyhow::Result<()> {
        let (clock, fs) = memory_fs();
        fs.create_directory("root").await?;
        fs.create_file("root/old", &[]).await?;
        clock.advance(std::time::Duration::from_secs(10));
        fs.create_file("root/new", &[]).await?;
        assert_eq!(fs.last_modified("root/old").await?.timestamp(), 0);
        assert_eq!(fs.last_modified("root/new").await?.timestamp(), 10);
        assert!(fs.last_modified("root/none").await.unwrap_err().is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn delete_directory_is_recursive() -> anyhow::Result<()> {
        let (_, fs) = memory_fs();
        fs.create_directory("root/a/b").await?;
        fs.create_file("root/a/b/file", &[]).await?;
        fs.delete_directory("root/a").await?;
        assert!(!fs.directory_exists("root/a").await?);
        assert!(!fs.file_exists("root/a/b/file").await?);
        Ok(())
    }

    #[tokio::test]
    async fn denied_reads_fail() -> anyhow::Result<()> {
        let (_, fs) = memory_fs();
        fs.create_directory("root").await?;
        fs.create_file("root/secret", &[7]).await?;
        fs.deny_reads("root/secret");
        let err = fs.read_all("root/secret").await.unwrap_err();
        assert!(matches!(err, FsError::Io { .. }));
        Ok(())
    }

    #[test]
    fn path_helpers() {
        let (_, fs) = memory_fs();
        assert_eq!(fs.combine_path(&["backup", "source", "file"]), "backup/source/file");
        assert_eq!(fs.leaf_name("backup/source/"), "source");
        assert_eq!(fs.leaf_name("source"), "source");
    }
}
