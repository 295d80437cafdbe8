//! Backup orchestrator
//!
//! [`BackupManager::dump`] mirrors a source directory tree into a backup directory. Files whose
//! content did not change are skipped, changed files have their previous destination copy rotated
//! into a bounded history directory before being replaced.
//!
//! Every file and sub-directory of a directory is processed by its own task. File failures are
//! recorded in the returned [`BackupDirResult`] and never stop the traversal, while failures to
//! enumerate or create a directory abort the whole dump.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use async_recursion::async_recursion;
use chrono::{DateTime, Utc};
use tracing::instrument;

use crate::clock::{Clock, elapsed_between};
use crate::fs::Filesystem;
use crate::history::HistoryProvider;
use crate::progress::{BackupProgress, ProgressHandle, ProgressSnapshot};
use crate::result::{BackupDirResult, BackupFileResult};
use crate::validator::ChangeValidator;

#[derive(Debug, Copy, Clone, Default)]
pub struct Settings {
    /// Maximum number of file transfers in flight, 0 means no limit.
    pub max_concurrent_transfers: usize,
}

pub struct BackupManager {
    source: Arc<dyn Filesystem>,
    destination: Arc<dyn Filesystem>,
    validator: Option<Arc<ChangeValidator>>,
    history: Option<Arc<HistoryProvider>>,
    clock: Arc<dyn Clock>,
    settings: Settings,
    progress: ProgressHandle,
}

/// State shared by all tasks of one dump.
struct Run {
    source: Arc<dyn Filesystem>,
    destination: Arc<dyn Filesystem>,
    validator: Option<Arc<ChangeValidator>>,
    history: Option<Arc<HistoryProvider>>,
    clock: Arc<dyn Clock>,
    slots: throttle::TransferSlots,
    progress: Arc<BackupProgress>,
    started: DateTime<Utc>,
    processed: AtomicU64,
}

impl Run {
    fn elapsed(&self) -> std::time::Duration {
        elapsed_between(self.started, self.clock.now())
    }

    fn invalidate(&self, path: &str) {
        if let Some(validator) = &self.validator {
            validator.on_file_changed(path);
        }
    }
}

impl BackupManager {
    pub fn new(
        source: Arc<dyn Filesystem>,
        destination: Arc<dyn Filesystem>,
        clock: Arc<dyn Clock>,
        settings: Settings,
    ) -> Self {
        Self {
            source,
            destination,
            validator: None,
            history: None,
            clock,
            settings,
            progress: ProgressHandle::new(),
        }
    }

    /// Skip files whose destination already holds the same content.
    pub fn with_validator(mut self, validator: Arc<ChangeValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Keep previous versions of changed files instead of discarding them.
    pub fn with_history(mut self, history: Arc<HistoryProvider>) -> Self {
        self.history = Some(history);
        self
    }

    /// Report progress through `progress` instead of a private handle.
    pub fn with_progress(mut self, progress: ProgressHandle) -> Self {
        self.progress = progress;
        self
    }

    /// Handle for polling progress from another task.
    pub fn progress_handle(&self) -> ProgressHandle {
        self.progress.clone()
    }

    pub fn latest_progress(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    async fn connect(&self) -> anyhow::Result<()> {
        self.source
            .connect()
            .await
            .context("failed connecting to the source filesystem")?;
        self.destination
            .connect()
            .await
            .context("failed connecting to the destination filesystem")?;
        Ok(())
    }

    /// Back up `source_dir` into `backup_dir/<leaf name of source_dir>`.
    #[instrument(skip(self))]
    pub async fn dump(&self, source_dir: &str, backup_dir: &str) -> anyhow::Result<BackupDirResult> {
        let progress = self.progress.reset();
        let started = self.clock.now();
        let run = Arc::new(Run {
            source: self.source.clone(),
            destination: self.destination.clone(),
            validator: self.validator.clone(),
            history: self.history.clone(),
            clock: self.clock.clone(),
            slots: throttle::TransferSlots::new(self.settings.max_concurrent_transfers),
            progress,
            started,
            processed: AtomicU64::new(0),
        });
        let (connected, outcome) = match self.connect().await {
            Ok(()) => {
                if let Some(validator) = &self.validator
                    && let Err(error) = validator.load().await
                {
                    tracing::warn!("failed loading hash caches, starting with empty ones: {:#}", &error);
                }
                (true, dump_root(&run, source_dir, backup_dir).await)
            }
            Err(error) => (false, Err(error)),
        };
        if connected && let Some(validator) = &self.validator {
            let processed = run.processed.load(Ordering::Acquire);
            if let Err(error) = validator.save(true, processed).await {
                tracing::error!("failed saving hash caches: {:#}", &error);
            }
        }
        if let Err(error) = self.source.disconnect().await {
            tracing::warn!("failed disconnecting from the source filesystem: {:#}", &error);
        }
        if let Err(error) = self.destination.disconnect().await {
            tracing::warn!("failed disconnecting from the destination filesystem: {:#}", &error);
        }
        let elapsed = run.elapsed();
        run.progress.finish(elapsed);
        tracing::debug!("peak concurrent transfers: {}", run.slots.peak());
        let files = outcome?;
        Ok(BackupDirResult::new(
            source_dir.to_string(),
            backup_dir.to_string(),
            files,
            elapsed,
        ))
    }
}

async fn ensure_directory(fs: &dyn Filesystem, path: &str) -> anyhow::Result<()> {
    if !fs
        .directory_exists(path)
        .await
        .with_context(|| format!("failed checking directory {path:?}"))?
    {
        tracing::debug!("creating directory {:?}", path);
        fs.create_directory(path)
            .await
            .with_context(|| format!("cannot create directory {path:?}"))?;
    }
    Ok(())
}

async fn dump_root(
    run: &Arc<Run>,
    source_dir: &str,
    backup_dir: &str,
) -> anyhow::Result<Vec<BackupFileResult>> {
    ensure_directory(run.destination.as_ref(), backup_dir).await?;
    let leaf = run.source.leaf_name(source_dir);
    let destination_dir = run.destination.combine_path(&[backup_dir, &leaf]);
    dump_directory(run.clone(), source_dir.to_string(), destination_dir).await
}

#[instrument(skip(run))]
#[async_recursion]
async fn dump_directory(
    run: Arc<Run>,
    src: String,
    dst: String,
) -> anyhow::Result<Vec<BackupFileResult>> {
    ensure_directory(run.destination.as_ref(), &dst).await?;
    let files = run
        .source
        .list_files(&src)
        .await
        .with_context(|| format!("cannot list files of {:?}", &src))?;
    let directories = run
        .source
        .list_directories(&src)
        .await
        .with_context(|| format!("cannot list directories of {:?}", &src))?;
    let directories = match &run.history {
        Some(history) => {
            let reserved: HashSet<String> = files
                .iter()
                .map(|name| history.history_directory_name(name))
                .collect();
            directories
                .into_iter()
                .filter(|name| {
                    if reserved.contains(name) {
                        tracing::warn!(
                            "skipping {:?} in {:?}, its name is reserved for history of a sibling file",
                            name,
                            &src
                        );
                        return false;
                    }
                    true
                })
                .collect()
        }
        None => directories,
    };
    let mut join_set: tokio::task::JoinSet<anyhow::Result<Vec<BackupFileResult>>> =
        tokio::task::JoinSet::new();
    for name in files {
        let run = run.clone();
        let src_path = run.source.combine_path(&[&src, &name]);
        let dst_dir = dst.clone();
        join_set.spawn(async move { Ok(vec![dump_file(&run, src_path, dst_dir, name).await]) });
    }
    for name in directories {
        let src_path = run.source.combine_path(&[&src, &name]);
        let dst_path = run.destination.combine_path(&[&dst, &name]);
        join_set.spawn(dump_directory(run.clone(), src_path, dst_path));
    }
    let mut results = Vec::new();
    let mut first_error = None;
    while let Some(res) = join_set.join_next().await {
        match res? {
            Ok(mut child_results) => results.append(&mut child_results),
            Err(error) => {
                tracing::error!("{:#}", &error);
                first_error.get_or_insert(error);
            }
        }
    }
    if let Some(error) = first_error {
        return Err(error);
    }
    Ok(results)
}

async fn dump_file(run: &Run, src: String, dst_dir: String, name: String) -> BackupFileResult {
    let dst = run.destination.combine_path(&[&dst_dir, &name]);
    let outcome = {
        let _slot = run.slots.acquire().await;
        transfer_file(run, &src, &dst_dir, &name, &dst).await
    };
    let elapsed = run.elapsed();
    let result = match outcome {
        Ok(Some(bytes)) => {
            tracing::debug!("backed up {:?} ({} bytes)", &src, bytes);
            run.progress.record_transfer(bytes, elapsed);
            BackupFileResult::transferred(src, dst, bytes)
        }
        Ok(None) => {
            tracing::debug!("{:?} is unchanged, skipping", &src);
            run.progress.record_skip(elapsed);
            BackupFileResult::skipped(src, dst)
        }
        Err(error) => {
            tracing::error!("failed backing up {:?}: {:#}", &src, &error);
            run.progress.record_failure(elapsed);
            BackupFileResult::failed(src, dst, error)
        }
    };
    let processed = run.processed.fetch_add(1, Ordering::AcqRel) + 1;
    if let Some(validator) = &run.validator
        && let Err(error) = validator.save(false, processed).await
    {
        tracing::warn!("periodic hash cache save failed: {:#}", &error);
    }
    result
}

/// Transfer one file, `None` when the destination is already up to date.
async fn transfer_file(
    run: &Run,
    src: &str,
    dst_dir: &str,
    name: &str,
    dst: &str,
) -> anyhow::Result<Option<u64>> {
    let content = run
        .source
        .read_all(src)
        .await
        .with_context(|| format!("cannot read {src:?}"))?;
    if let Some(validator) = &run.validator
        && !validator.is_file_changed(&content, dst).await
    {
        return Ok(None);
    }
    if run
        .destination
        .file_exists(dst)
        .await
        .with_context(|| format!("failed checking {dst:?}"))?
    {
        if let Some(history) = &run.history {
            let previous = run
                .destination
                .read_all(dst)
                .await
                .with_context(|| format!("cannot read previous version of {dst:?}"))?;
            archive(run, history, dst_dir, name, &previous)
                .await
                .with_context(|| format!("cannot archive previous version of {dst:?}"))?;
        }
        run.destination
            .delete_file(dst)
            .await
            .with_context(|| format!("cannot remove {dst:?}"))?;
        run.invalidate(dst);
    }
    run.destination
        .create_file(dst, &content)
        .await
        .with_context(|| format!("cannot write {dst:?}"))?;
    run.invalidate(dst);
    Ok(Some(content.len() as u64))
}

/// Store `content` as the newest version of `dst_dir/name`, evicting the oldest versions first
/// so that at most `depth` remain.
async fn archive(
    run: &Run,
    history: &HistoryProvider,
    dst_dir: &str,
    name: &str,
    content: &[u8],
) -> anyhow::Result<()> {
    let fs = run.destination.as_ref();
    let history_dir = fs.combine_path(&[dst_dir, &history.history_directory_name(name)]);
    let versioned = fs.combine_path(&[&history_dir, &history.versioned_file_name(name)]);
    if !fs.directory_exists(&history_dir).await? {
        fs.create_directory(&history_dir).await?;
    } else {
        if fs.file_exists(&versioned).await? {
            tracing::warn!(
                "{:?} already holds a version from the same second, replacing it",
                &versioned
            );
            fs.delete_file(&versioned).await?;
        }
        loop {
            let entries = fs.list_files(&history_dir).await?;
            if entries.len() < history.depth() {
                break;
            }
            let mut oldest: Option<(DateTime<Utc>, String)> = None;
            for entry in entries {
                let path = fs.combine_path(&[&history_dir, &entry]);
                let modified = fs.last_modified(&path).await?;
                if oldest.as_ref().is_none_or(|(time, _)| modified < *time) {
                    oldest = Some((modified, path));
                }
            }
            let Some((_, path)) = oldest else {
                break;
            };
            tracing::info!("evicting oldest version {:?}", &path);
            fs.delete_file(&path).await?;
            run.invalidate(&path);
        }
    }
    tracing::info!("archiving previous version as {:?}", &versioned);
    fs.create_file(&versioned, content).await?;
    run.invalidate(&versioned);
    Ok(())
}
