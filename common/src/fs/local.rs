use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Filesystem, FsError, Result};

/// Local disk backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

impl LocalFs {
    pub fn new() -> Self {
        Self
    }

    async fn list_entries(&self, path: &str, want_dirs: bool) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(path)
            .await
            .map_err(|err| FsError::io("list", path, err))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| FsError::io("list", path, err))?
        {
            let entry_path = entry.path();
            // follow symlinks so that a link to a file is backed up as that file
            let metadata = match tokio::fs::metadata(&entry_path).await {
                Ok(metadata) => metadata,
                Err(err) => {
                    tracing::warn!("skipping {:?}: {}", &entry_path, &err);
                    continue;
                }
            };
            let matches = if want_dirs {
                metadata.is_dir()
            } else {
                metadata.is_file()
            };
            if matches {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl Filesystem for LocalFs {
    fn combine_path(&self, parts: &[&str]) -> String {
        let mut path = std::path::PathBuf::new();
        for part in parts {
            path.push(part);
        }
        path.to_string_lossy().into_owned()
    }

    fn leaf_name(&self, path: &str) -> String {
        let path = std::path::Path::new(path);
        match path.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            // "/", "." or ".." - fall back to the resolved directory name when possible
            None => std::fs::canonicalize(path)
                .ok()
                .and_then(|resolved| resolved.file_name().map(|n| n.to_string_lossy().into_owned()))
                .unwrap_or_else(|| path.to_string_lossy().into_owned()),
        }
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        match tokio::fs::metadata(path).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(FsError::io("stat", path, err)),
        }
    }

    async fn read_all(&self, path: &str) -> Result<Vec<u8>> {
        tokio::fs::read(path)
            .await
            .map_err(|err| FsError::io("read", path, err))
    }

    async fn create_file(&self, path: &str, bytes: &[u8]) -> Result<()> {
        tokio::fs::write(path, bytes)
            .await
            .map_err(|err| FsError::Io {
                op: "write",
                path: path.to_string(),
                source: err,
            })
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        tokio::fs::remove_file(path)
            .await
            .map_err(|err| FsError::io("remove", path, err))
    }

    async fn directory_exists(&self, path: &str) -> Result<bool> {
        match tokio::fs::metadata(path).await {
            Ok(metadata) => Ok(metadata.is_dir()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(FsError::io("stat", path, err)),
        }
    }

    async fn list_files(&self, path: &str) -> Result<Vec<String>> {
        self.list_entries(path, false).await
    }

    async fn list_directories(&self, path: &str) -> Result<Vec<String>> {
        self.list_entries(path, true).await
    }

    async fn create_directory(&self, path: &str) -> Result<()> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|err| FsError::Io {
                op: "create directory",
                path: path.to_string(),
                source: err,
            })
    }

    async fn delete_directory(&self, path: &str) -> Result<()> {
        tokio::fs::remove_dir_all(path)
            .await
            .map_err(|err| FsError::io("remove directory", path, err))
    }

    async fn last_modified(&self, path: &str) -> Result<DateTime<Utc>> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|err| FsError::io("stat", path, err))?;
        let modified = metadata
            .modified()
            .map_err(|err| FsError::io("read modification time of", path, err))?;
        Ok(DateTime::<Utc>::from(modified))
    }
}
