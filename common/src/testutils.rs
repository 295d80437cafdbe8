use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Context;
use async_recursion::async_recursion;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::fs::{Filesystem, Result};

/// Create the standard test tree under `root`.
pub async fn populate(fs: &dyn Filesystem, root: &str) -> anyhow::Result<()> {
    // foo
    // |- 0.txt
    // |- bar
    //    |- 1.txt
    //    |- 2.txt
    //    |- 3.txt
    // |- baz
    //    |- 4.txt
    //    |- 5.txt
    let bar = fs.combine_path(&[root, "bar"]);
    let baz = fs.combine_path(&[root, "baz"]);
    fs.create_directory(&bar).await?;
    fs.create_directory(&baz).await?;
    fs.create_file(&fs.combine_path(&[root, "0.txt"]), b"0").await?;
    for idx in 1..=3 {
        fs.create_file(&fs.combine_path(&[&bar, &format!("{idx}.txt")]), idx.to_string().as_bytes())
            .await?;
    }
    for idx in 4..=5 {
        fs.create_file(&fs.combine_path(&[&baz, &format!("{idx}.txt")]), idx.to_string().as_bytes())
            .await?;
    }
    Ok(())
}

/// Check that every file and directory under `src` has an identical counterpart under `dst`.
#[async_recursion]
pub async fn check_mirrored(
    src_fs: &dyn Filesystem,
    src: &str,
    dst_fs: &dyn Filesystem,
    dst: &str,
) -> anyhow::Result<()> {
    for name in src_fs.list_files(src).await? {
        let src_path = src_fs.combine_path(&[src, &name]);
        let dst_path = dst_fs.combine_path(&[dst, &name]);
        let expected = src_fs.read_all(&src_path).await?;
        let actual = dst_fs
            .read_all(&dst_path)
            .await
            .with_context(|| format!("destination file {dst_path:?} is missing"))?;
        anyhow::ensure!(expected == actual, "{:?} differs from {:?}", &dst_path, &src_path);
    }
    for name in src_fs.list_directories(src).await? {
        let src_path = src_fs.combine_path(&[src, &name]);
        let dst_path = dst_fs.combine_path(&[dst, &name]);
        anyhow::ensure!(
            dst_fs.directory_exists(&dst_path).await?,
            "destination directory {:?} is missing",
            &dst_path
        );
        check_mirrored(src_fs, &src_path, dst_fs, &dst_path).await?;
    }
    Ok(())
}

/// Filesystem wrapper that slows down reads and records how many overlap.
pub struct GaugedFs {
    inner: Arc<dyn Filesystem>,
    read_delay: std::time::Duration,
    reads: AtomicUsize,
    peak_reads: AtomicUsize,
}

impl GaugedFs {
    pub fn new(inner: Arc<dyn Filesystem>, read_delay: std::time::Duration) -> Self {
        Self {
            inner,
            read_delay,
            reads: AtomicUsize::new(0),
            peak_reads: AtomicUsize::new(0),
        }
    }

    pub fn peak_reads(&self) -> usize {
        self.peak_reads.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Filesystem for GaugedFs {
    fn combine_path(&self, parts: &[&str]) -> String {
        self.inner.combine_path(parts)
    }

    fn leaf_name(&self, path: &str) -> String {
        self.inner.leaf_name(path)
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        self.inner.file_exists(path).await
    }

    async fn read_all(&self, path: &str) -> Result<Vec<u8>> {
        let current = self.reads.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_reads.fetch_max(current, Ordering::AcqRel);
        tokio::time::sleep(self.read_delay).await;
        let res = self.inner.read_all(path).await;
        self.reads.fetch_sub(1, Ordering::AcqRel);
        res
    }

    async fn create_file(&self, path: &str, bytes: &[u8]) -> Result<()> {
        self.inner.create_file(path, bytes).await
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        self.inner.delete_file(path).await
    }

    async fn directory_exists(&self, path: &str) -> Result<bool> {
        self.inner.directory_exists(path).await
    }

    async fn list_files(&self, path: &str) -> Result<Vec<String>> {
        self.inner.list_files(path).await
    }

    async fn list_directories(&self, path: &str) -> Result<Vec<String>> {
        self.inner.list_directories(path).await
    }

    async fn create_directory(&self, path: &str) -> Result<()> {
        self.inner.create_directory(path).await
    }

    async fn delete_directory(&self, path: &str) -> Result<()> {
        self.inner.delete_directory(path).await
    }

    async fn last_modified(&self, path: &str) -> Result<DateTime<Utc>> {
        self.inner.last_modified(path).await
    }
}
