//! Core library of the `rbak` backup tool
//!
//! The backup core is written against the [`fs::Filesystem`] capability and never touches a
//! concrete filesystem directly:
//!
//! - [`backup`] - the orchestrator walking the source tree and producing [`result`] records
//! - [`hasher`] and [`hash_cache`] - content fingerprints, optionally memoized in a side-car file
//! - [`validator`] - per-file "did it change" decisions
//! - [`history`] - naming of retained previous versions
//! - [`progress`] - live progress accumulator and reporting
//!
//! [`run`] wires up logging, the tokio runtime and progress reporting around an async entry point.

use tracing_subscriber::prelude::*;

pub mod backup;
pub mod clock;
pub mod config;
pub mod fs;
pub mod hash_cache;
pub mod hasher;
pub mod history;
pub mod progress;
pub mod result;
pub mod validator;

#[cfg(test)]
mod testutils;

pub use config::{
    BackupConfig, BackupTask, ConfigError, Endpoint, Location, OutputConfig, ProgressSettings,
    RuntimeConfig, SshTarget, TracingConfig,
};
pub use progress::{ProgressHandle, ProgressType};

fn init_tracing(output: &OutputConfig, tracing_config: &TracingConfig) -> anyhow::Result<()> {
    let env_filter = match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.is_empty() => tracing_subscriber::EnvFilter::new(directives),
        _ => {
            let level = match output.verbose {
                0 => "error",
                1 => "info",
                2 => "debug",
                _ => "trace",
            };
            tracing_subscriber::EnvFilter::new(level)
        }
    };
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);
    let file_layer = match &tracing_config.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|err| anyhow::anyhow!("cannot open log file {:?}: {}", path, err))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false),
            )
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow::anyhow!("cannot initialize logging: {}", err))?;
    Ok(())
}

/// Run `func` on a freshly built tokio runtime.
///
/// Logging is initialized from `output` and `tracing_config`. When `progress` is given a reporter
/// polls the [`ProgressHandle`] passed to `func` until it completes. The summary is printed when
/// requested (or when running verbose), errors are printed unless `quiet` is set.
///
/// Returns `None` if setup failed or `func` returned an error.
pub fn run<Fut, Summary, Func>(
    progress: Option<ProgressSettings>,
    output: OutputConfig,
    runtime: RuntimeConfig,
    tracing_config: TracingConfig,
    func: Func,
) -> Option<Summary>
where
    Func: FnOnce(ProgressHandle) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<Summary>>,
    Summary: std::fmt::Display,
{
    if let Err(error) = init_tracing(&output, &tracing_config) {
        eprintln!("{error:#}");
        return None;
    }
    let reporter_settings = match progress {
        Some(settings) => match settings.delay() {
            Ok(delay) => Some((settings.progress_type, delay)),
            Err(error) => {
                eprintln!("{:#}", anyhow::Error::new(error));
                return None;
            }
        },
        None => None,
    };
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let tokio_runtime = match builder.build() {
        Ok(tokio_runtime) => tokio_runtime,
        Err(error) => {
            eprintln!("failed to build tokio runtime: {error}");
            return None;
        }
    };
    let handle = ProgressHandle::new();
    let res = tokio_runtime.block_on(async {
        let reporter = reporter_settings.map(|(progress_type, delay)| {
            let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
            let task = tokio::spawn(progress::report(handle.clone(), progress_type, delay, stop_rx));
            (stop_tx, task)
        });
        let res = func(handle.clone()).await;
        if let Some((stop_tx, task)) = reporter {
            // the reporter may have exited already
            let _ = stop_tx.send(());
            if let Err(error) = task.await {
                tracing::warn!("progress reporter failed: {}", &error);
            }
        }
        res
    });
    match res {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                eprintln!("{error:#}");
            }
            None
        }
    }
}
