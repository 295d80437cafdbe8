//! Filesystem capability used by the backup core
//!
//! The orchestrator, hashers and history logic never touch a concrete filesystem directly, they
//! talk to an `Arc<dyn Filesystem>`. Paths are plain strings in the backend's own syntax and are
//! built with [`Filesystem::combine_path`], so a remote POSIX host can be driven from any client.
//!
//! Backends shipped here:
//! - [`LocalFs`] - the local disk via `tokio::fs`
//! - [`MemoryFs`] - an in-memory tree with clock-driven modification times, used by tests
//!
//! The SSH backend lives in the `remote` crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

mod local;
mod memory;

pub use local::LocalFs;
pub use memory::MemoryFs;

/// Errors produced by filesystem backends.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("{path:?} does not exist")]
    NotFound { path: String },
    #[error("failed to {op} {path:?}")]
    Io {
        op: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("remote command for {op} {path:?} failed: {message}")]
    Remote {
        op: &'static str,
        path: String,
        message: String,
    },
    #[error("session failure: {message}")]
    Session { message: String },
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },
}

impl FsError {
    /// Wrap an I/O error, mapping `ErrorKind::NotFound` to [`FsError::NotFound`].
    pub fn io(op: &'static str, path: &str, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            FsError::NotFound {
                path: path.to_string(),
            }
        } else {
            FsError::Io {
                op,
                path: path.to_string(),
                source,
            }
        }
    }

    pub fn not_found(path: &str) -> Self {
        FsError::NotFound {
            path: path.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound { .. })
    }

    /// True for failures of the connection itself, as opposed to the operation.
    pub fn is_session(&self) -> bool {
        matches!(self, FsError::Session { .. })
    }
}

pub type Result<T> = std::result::Result<T, FsError>;

/// Join `/`-separated path components, dropping redundant separators between them.
pub fn posix_join(parts: &[&str]) -> String {
    let mut path = String::new();
    for (idx, part) in parts.iter().enumerate() {
        if idx == 0 {
            path.push_str(part.trim_end_matches('/'));
            if part.starts_with('/') && path.is_empty() {
                path.push('/');
            }
        } else {
            if !path.ends_with('/') {
                path.push('/');
            }
            path.push_str(part.trim_matches('/'));
        }
    }
    path
}

/// Last component of a `/`-separated path, ignoring trailing separators.
pub fn posix_leaf(path: &str) -> String {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Uniform set of operations the backup core needs from a filesystem.
///
/// Implementations must be safe to call concurrently from many tasks.
#[async_trait]
pub trait Filesystem: Send + Sync {
    /// Join path components using the backend's separator.
    fn combine_path(&self, parts: &[&str]) -> String;

    /// Last component of `path`, ignoring trailing separators.
    fn leaf_name(&self, path: &str) -> String;

    async fn file_exists(&self, path: &str) -> Result<bool>;

    /// Read the whole file, [`FsError::NotFound`] if it does not exist.
    async fn read_all(&self, path: &str) -> Result<Vec<u8>>;

    /// Create or replace the file at `path` with `bytes`. The parent directory must exist.
    async fn create_file(&self, path: &str, bytes: &[u8]) -> Result<()>;

    async fn delete_file(&self, path: &str) -> Result<()>;

    async fn directory_exists(&self, path: &str) -> Result<bool>;

    /// Names (not paths) of regular files directly inside `path`.
    async fn list_files(&self, path: &str) -> Result<Vec<String>>;

    /// Names (not paths) of sub-directories directly inside `path`, never `.` or `..`.
    async fn list_directories(&self, path: &str) -> Result<Vec<String>>;

    /// Create `path` and any missing parents.
    async fn create_directory(&self, path: &str) -> Result<()>;

    /// Remove `path` with everything under it.
    async fn delete_directory(&self, path: &str) -> Result<()>;

    async fn last_modified(&self, path: &str) -> Result<DateTime<Utc>>;

    /// Establish the backend's connection, a no-op when already connected.
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    /// Tear down the backend's connection, a no-op when not connected.
    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}
