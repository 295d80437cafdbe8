//! Naming policy for retained versions of changed files
//!
//! A live file `dir/name` keeps its previous versions in `dir/.name.history/`, each stored as
//! `{unix_epoch_seconds}.name`. The provider only names things; the archiving itself is done by
//! the backup orchestrator.

use std::sync::Arc;

use crate::clock::Clock;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("history depth must be at least 1")]
    ZeroDepth,
}

type NameFn = Box<dyn Fn(&str) -> String + Send + Sync>;
type VersionedNameFn = Box<dyn Fn(&str, chrono::DateTime<chrono::Utc>) -> String + Send + Sync>;

pub struct HistoryProvider {
    depth: usize,
    clock: Arc<dyn Clock>,
    directory_name: NameFn,
    versioned_name: VersionedNameFn,
}

impl std::fmt::Debug for HistoryProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryProvider")
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

impl HistoryProvider {
    /// Provider with the default `.{name}.history` / `{epoch}.{name}` naming.
    pub fn new(depth: usize, clock: Arc<dyn Clock>) -> Result<Self, Error> {
        Self::with_naming(
            depth,
            clock,
            |name| format!(".{name}.history"),
            |name, now| format!("{}.{}", now.timestamp(), name),
        )
    }

    pub fn with_naming(
        depth: usize,
        clock: Arc<dyn Clock>,
        directory_name: impl Fn(&str) -> String + Send + Sync + 'static,
        versioned_name: impl Fn(&str, chrono::DateTime<chrono::Utc>) -> String + Send + Sync + 'static,
    ) -> Result<Self, Error> {
        if depth == 0 {
            return Err(Error::ZeroDepth);
        }
        Ok(Self {
            depth,
            clock,
            directory_name: Box::new(directory_name),
            versioned_name: Box::new(versioned_name),
        })
    }

    pub fn history_directory_name(&self, name: &str) -> String {
        (self.directory_name)(name)
    }

    /// Name for a copy of `name` archived right now.
    pub fn versioned_file_name(&self, name: &str) -> String {
        (self.versioned_name)(name, self.clock.now())
    }

    /// Maximum number of retained versions per file.
    pub fn depth(&self) -> usize {
        self.depth
    }
}
