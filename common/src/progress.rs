//! Live progress of a backup run
//!
//! [`BackupProgress`] is updated concurrently by file tasks and read through immutable
//! [`ProgressSnapshot`]s. A [`ProgressHandle`] always points at the accumulator of the current
//! (or most recent) run and can be handed to reporters that do not own the backup manager.

use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct BackupProgress {
    bytes: AtomicU64,
    files: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    elapsed_ms: AtomicU64,
    done: AtomicBool,
}

/// Point-in-time copy of a [`BackupProgress`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// Bytes written to the destination so far.
    pub bytes: u64,
    /// Files completed successfully, skipped ones included.
    pub files: u64,
    pub skipped: u64,
    pub failed: u64,
    /// Elapsed run time as of the latest completion.
    pub elapsed: std::time::Duration,
    pub done: bool,
}

impl BackupProgress {
    pub fn new() -> Self {
        Self::default()
    }

    fn set_elapsed(&self, elapsed: std::time::Duration) {
        self.elapsed_ms
            .fetch_max(elapsed.as_millis() as u64, Ordering::AcqRel);
    }

    pub fn record_transfer(&self, bytes: u64, elapsed: std::time::Duration) {
        self.bytes.fetch_add(bytes, Ordering::AcqRel);
        self.files.fetch_add(1, Ordering::AcqRel);
        self.set_elapsed(elapsed);
    }

    pub fn record_skip(&self, elapsed: std::time::Duration) {
        self.skipped.fetch_add(1, Ordering::AcqRel);
        self.files.fetch_add(1, Ordering::AcqRel);
        self.set_elapsed(elapsed);
    }

    pub fn record_failure(&self, elapsed: std::time::Duration) {
        self.failed.fetch_add(1, Ordering::AcqRel);
        self.set_elapsed(elapsed);
    }

    /// Mark the run as finished. Returns false if it was already marked.
    pub fn finish(&self, elapsed: std::time::Duration) -> bool {
        self.set_elapsed(elapsed);
        self.done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            bytes: self.bytes.load(Ordering::Acquire),
            files: self.files.load(Ordering::Acquire),
            skipped: self.skipped.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
            elapsed: std::time::Duration::from_millis(self.elapsed_ms.load(Ordering::Acquire)),
            done: self.done.load(Ordering::Acquire),
        }
    }
}

/// Shared pointer to the accumulator of the latest run.
#[derive(Debug, Clone, Default)]
pub struct ProgressHandle {
    current: Arc<std::sync::Mutex<Arc<BackupProgress>>>,
}

impl ProgressHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a fresh accumulator, leaving the previous one to whoever still holds it.
    pub fn reset(&self) -> Arc<BackupProgress> {
        let fresh = Arc::new(BackupProgress::new());
        *self.current.lock().unwrap() = fresh.clone();
        fresh
    }

    pub fn current(&self) -> Arc<BackupProgress> {
        self.current.lock().unwrap().clone()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.current().snapshot()
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ProgressType {
    /// Progress bar when stderr is a terminal, text updates otherwise
    #[default]
    #[value(alias = "Auto")]
    Auto,
    /// Animated progress bar
    #[value(alias = "ProgressBar")]
    ProgressBar,
    /// Periodic text updates, suitable for logs
    #[value(alias = "TextUpdates")]
    TextUpdates,
}

impl ProgressType {
    /// Resolve `Auto` against the attached terminal.
    pub fn resolve(self) -> Self {
        match self {
            ProgressType::Auto if std::io::stderr().is_terminal() => ProgressType::ProgressBar,
            ProgressType::Auto => ProgressType::TextUpdates,
            other => other,
        }
    }

    pub fn default_delay(self) -> std::time::Duration {
        match self {
            ProgressType::TextUpdates => std::time::Duration::from_secs(10),
            _ => std::time::Duration::from_millis(200),
        }
    }
}

/// Formats progress updates, tracking rates between consecutive calls.
pub struct ProgressPrinter {
    handle: ProgressHandle,
    started: std::time::Instant,
    last_files: u64,
    last_bytes: u64,
    last_update: std::time::Instant,
}

impl ProgressPrinter {
    pub fn new(handle: ProgressHandle) -> Self {
        let snapshot = handle.snapshot();
        let now = std::time::Instant::now();
        Self {
            handle,
            started: now,
            last_files: snapshot.files,
            last_bytes: snapshot.bytes,
            last_update: now,
        }
    }

    fn advance(&mut self) -> (ProgressSnapshot, f64, f64) {
        let now = std::time::Instant::now();
        let snapshot = self.handle.snapshot();
        // a new run may have started since the previous update
        let files_delta = snapshot.files.saturating_sub(self.last_files);
        let bytes_delta = snapshot.bytes.saturating_sub(self.last_bytes);
        let secs = (now - self.last_update).as_secs_f64().max(f64::EPSILON);
        self.last_files = snapshot.files;
        self.last_bytes = snapshot.bytes;
        self.last_update = now;
        (snapshot, files_delta as f64 / secs, bytes_delta as f64 / secs)
    }

    /// One-line status for the progress bar.
    pub fn line(&mut self) -> String {
        let (snapshot, files_rate, bytes_rate) = self.advance();
        format!(
            "files: {} (skipped: {}, failed: {}) | {} | {:.1} files/s | {}/s",
            snapshot.files,
            snapshot.skipped,
            snapshot.failed,
            bytesize::ByteSize(snapshot.bytes),
            files_rate,
            bytesize::ByteSize(bytes_rate as u64),
        )
    }

    /// Multi-line status block for text updates.
    pub fn print(&mut self) -> String {
        let (snapshot, files_rate, bytes_rate) = self.advance();
        let total_secs = self.started.elapsed().as_secs_f64().max(f64::EPSILON);
        format!(
            "---------------------\n\
            FILES:\n\
            done:    {:>10}\n\
            skipped: {:>10}\n\
            failed:  {:>10}\n\
            average: {:>10.2} files/s\n\
            current: {:>10.2} files/s\n\
            -----------------------\n\
            TRANSFERRED:\n\
            total:   {:>10}\n\
            average: {:>10}/s\n\
            current: {:>10}/s",
            snapshot.files,
            snapshot.skipped,
            snapshot.failed,
            snapshot.files as f64 / total_secs,
            files_rate,
            bytesize::ByteSize(snapshot.bytes),
            bytesize::ByteSize((snapshot.bytes as f64 / total_secs) as u64),
            bytesize::ByteSize(bytes_rate as u64),
        )
    }
}

/// Render progress until `stop` fires.
pub async fn report(
    handle: ProgressHandle,
    progress_type: ProgressType,
    delay: std::time::Duration,
    mut stop: tokio::sync::oneshot::Receiver<()>,
) {
    let mut printer = ProgressPrinter::new(handle);
    match progress_type.resolve() {
        ProgressType::TextUpdates => loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = tokio::time::sleep(delay) => eprintln!("{}", printer.print()),
            }
        },
        _ => {
            let bar = indicatif::ProgressBar::new_spinner();
            if let Ok(style) = indicatif::ProgressStyle::with_template("{spinner} [{elapsed_precise}] {msg}") {
                bar.set_style(style);
            }
            loop {
                bar.set_message(printer.line());
                bar.tick();
                tokio::select! {
                    _ = &mut stop => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            bar.finish_and_clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skipped_files_add_no_bytes() {
        let progress = BackupProgress::new();
        progress.record_transfer(100, std::time::Duration::from_millis(5));
        progress.record_skip(std::time::Duration::from_millis(7));
        progress.record_failure(std::time::Duration::from_millis(6));
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.bytes, 100);
        assert_eq!(snapshot.files, 2);
        assert_eq!(snapshot.skipped, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.elapsed, std::time::Duration::from_millis(7));
        assert!(!snapshot.done);
    }

    #[test]
    fn done_is_set_once() {
        let progress = BackupProgress::new();
        assert!(progress.finish(std::time::Duration::from_secs(1)));
        assert!(!progress.finish(std::time::Duration::from_secs(2)));
        assert!(progress.snapshot().done);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let progress = BackupProgress::new();
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..1000 {
                        progress.record_transfer(2, std::time::Duration::ZERO);
                    }
                });
            }
        });
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.files, 8000);
        assert_eq!(snapshot.bytes, 16000);
    }

    #[test]
    fn reset_leaves_previous_accumulator_alone() {
        let handle = ProgressHandle::new();
        let first = handle.reset();
        first.record_transfer(10, std::time::Duration::ZERO);
        let second = handle.reset();
        assert_eq!(first.snapshot().bytes, 10);
        assert_eq!(second.snapshot().bytes, 0);
        assert_eq!(handle.snapshot().bytes, 0);
    }

    #[test]
    fn printer_reports_totals() {
        let handle = ProgressHandle::new();
        let progress = handle.reset();
        let mut printer = ProgressPrinter::new(handle);
        progress.record_transfer(2048, std::time::Duration::ZERO);
        progress.record_skip(std::time::Duration::ZERO);
        let text = printer.print();
        assert!(text.contains(&format!("done:    {:>10}", 2)));
        assert!(text.contains(&format!("skipped: {:>10}", 1)));
        assert!(printer.line().starts_with("files: 2 (skipped: 1, failed: 0)"));
    }

    #[tokio::test]
    async fn reporter_stops_on_signal() {
        let handle = ProgressHandle::new();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
        let reporter = tokio::spawn(report(
            handle,
            ProgressType::TextUpdates,
            std::time::Duration::from_secs(3600),
            stop_rx,
        ));
        stop_tx.send(()).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), reporter)
            .await
            .unwrap()
            .unwrap();
    }
}
