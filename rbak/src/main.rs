use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use common::backup::BackupManager;
use common::clock::{Clock, SystemClock};
use common::fs::{Filesystem, LocalFs};
use common::hash_cache::CachedHasher;
use common::hasher::DirectHasher;
use common::history::HistoryProvider;
use common::result::BackupDirResult;
use common::validator::ChangeValidator;
use tracing::instrument;

mod path;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rbak",
    version,
    about = "Incremental directory backup keeping previous versions of changed files",
    long_about = "`rbak` mirrors a directory tree into a backup directory. Files whose content did not
change since the last run are skipped, changed files are replaced and their previous copy is kept
in a hidden `.<name>.history` directory next to them, up to --depth versions per file.

Either side can live on a remote host reached over ssh: [user@]host[:port]:/absolute/path

EXAMPLES:
    # Back up ~/photos into /mnt/usb/photos
    rbak ~/photos /mnt/usb --progress --summary

    # Back up to a NAS keeping 5 versions of each file
    rbak ~/photos backup@nas:/srv/backup --depth 5

    # Run every task of a JSON task file
    rbak --config tasks.json"
)]
struct Args {
    // Backup options
    /// Number of previous versions kept for each changed file
    #[arg(
        long,
        default_value = "3",
        value_name = "N",
        help_heading = "Backup options"
    )]
    depth: usize,

    /// Replace changed files without keeping their previous version
    #[arg(long, help_heading = "Backup options")]
    no_history: bool,

    /// Maximum number of files transferred at the same time, 0 means no limit
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Backup options"
    )]
    max_concurrent_transfers: usize,

    /// Read backup tasks from a JSON file instead of SRC and DST
    ///
    /// Settings in the file's `common` section take precedence over --depth,
    /// --max-concurrent-transfers, --cache-save-interval and --check-cache-mtime.
    #[arg(long, value_name = "PATH", conflicts_with_all = ["src", "dst"], help_heading = "Backup options")]
    config: Option<std::path::PathBuf>,

    // Change detection
    /// Hash destination files on every run instead of remembering their fingerprints
    #[arg(long, help_heading = "Change detection")]
    no_cache: bool,

    /// Persist the fingerprint cache after this many processed files
    #[arg(
        long,
        default_value = "100",
        value_name = "N",
        help_heading = "Change detection"
    )]
    cache_save_interval: u64,

    /// Forget cached fingerprints of destination files modified after the cache was written
    #[arg(long, help_heading = "Change detection")]
    check_cache_mtime: bool,

    // Progress & output
    /// Show progress
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Toggles the type of progress to show
    ///
    /// If specified, --progress flag is implied.
    ///
    /// Options are: `ProgressBar` (animated progress bar), `TextUpdates` (appropriate for logging), Auto (default, will
    /// choose between `ProgressBar` or `TextUpdates` depending on the type of terminal attached to stderr)
    #[arg(long, value_name = "TYPE", help_heading = "Progress & output")]
    progress_type: Option<common::ProgressType>,

    /// Sets the delay between progress updates
    ///
    /// - For the interactive (--progress-type=ProgressBar), the default is 200ms.
    /// - For the non-interactive (--progress-type=TextUpdates), the default is 10s.
    ///
    /// If specified, --progress flag is implied.
    ///
    /// This option accepts a human readable duration, e.g. "200ms", "10s", "5min" etc.
    #[arg(long, value_name = "DELAY", help_heading = "Progress & output")]
    progress_delay: Option<String>,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    /// Also append log output to this file
    #[arg(long, value_name = "PATH", help_heading = "Progress & output")]
    log_file: Option<String>,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// Directory to back up
    #[arg(required_unless_present = "config")]
    src: Option<String>,

    /// Directory receiving the backup, SRC is mirrored into `DST/<name of SRC>`
    #[arg(required_unless_present = "config")]
    dst: Option<String>,
}

/// Everything needed to run the backup, resolved from the command line and the task file.
#[derive(Debug, Clone)]
struct Plan {
    tasks: Vec<common::BackupTask>,
    options: common::config::CommonOptions,
    history: bool,
    cache: bool,
    log_file: Option<String>,
}

impl Plan {
    fn from_args(args: &Args) -> Result<Self> {
        let (tasks, options, config_log_file) = match &args.config {
            Some(config_path) => {
                let config = common::BackupConfig::from_file(config_path)?;
                (config.tasks()?, config.common, config.log_file)
            }
            None => {
                let (Some(src), Some(dst)) = (&args.src, &args.dst) else {
                    return Err(anyhow!("both SRC and DST are required without --config"));
                };
                let task = common::BackupTask {
                    source: path::parse_path(src)?,
                    destination: path::parse_path(dst)?,
                };
                let options = common::config::CommonOptions {
                    max_concurrent_transfers: args.max_concurrent_transfers,
                    history_depth: args.depth,
                    cache_save_interval: args.cache_save_interval,
                    check_cache_mtime: args.check_cache_mtime,
                };
                (vec![task], options, None)
            }
        };
        for task in &tasks {
            path::validate_destination_path(&task.destination)?;
        }
        if !args.no_history && options.history_depth == 0 {
            return Err(common::ConfigError::ZeroDepth.into());
        }
        Ok(Self {
            tasks,
            options,
            history: !args.no_history,
            cache: !args.no_cache,
            log_file: args.log_file.clone().or(config_log_file),
        })
    }
}

/// Results of all tasks of one invocation.
#[derive(Debug, Default)]
struct Summary {
    results: Vec<BackupDirResult>,
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for (idx, result) in self.results.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
                writeln!(f)?;
            }
            write!(f, "{result}")?;
        }
        Ok(())
    }
}

fn filesystem(location: &common::Location) -> Arc<dyn Filesystem> {
    match location {
        common::Location::Local => Arc::new(LocalFs::new()),
        common::Location::Ssh(target) => Arc::new(remote::SshFs::new(target.clone())),
    }
}

#[instrument(skip(task, plan, progress), fields(source = %task.source, destination = %task.destination))]
async fn run_task(
    task: &common::BackupTask,
    plan: &Plan,
    progress: common::ProgressHandle,
) -> Result<BackupDirResult> {
    let source = filesystem(&task.source.location);
    let destination = filesystem(&task.destination.location);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let destination_hasher: Arc<dyn common::hasher::FileHasher> = if plan.cache {
        let leaf = source.leaf_name(&task.source.path);
        let cache_path =
            destination.combine_path(&[&task.destination.path, &format!(".{leaf}.hashes")]);
        tracing::debug!("using hash cache {:?}", &cache_path);
        Arc::new(CachedHasher::new(
            Arc::new(DirectHasher::new(destination.clone())),
            destination.clone(),
            cache_path,
            common::hash_cache::Settings {
                save_interval: plan.options.cache_save_interval,
                check_mtime: plan.options.check_cache_mtime,
            },
        ))
    } else {
        Arc::new(DirectHasher::new(destination.clone()))
    };
    let validator = ChangeValidator::new(
        Arc::new(DirectHasher::new(source.clone())),
        destination_hasher,
    );
    let mut manager = BackupManager::new(
        source,
        destination,
        clock.clone(),
        common::backup::Settings {
            max_concurrent_transfers: plan.options.max_concurrent_transfers,
        },
    )
    .with_validator(Arc::new(validator))
    .with_progress(progress);
    if plan.history {
        let history = HistoryProvider::new(plan.options.history_depth, clock)
            .context("invalid history settings")?;
        manager = manager.with_history(Arc::new(history));
    }
    manager
        .dump(&task.source.path, &task.destination.path)
        .await
        .with_context(|| format!("backup of {} into {} failed", &task.source, &task.destination))
}

async fn async_main(
    plan: Plan,
    print_summary: bool,
    progress: common::ProgressHandle,
) -> Result<Summary> {
    let mut summary = Summary::default();
    let mut success = true;
    for task in &plan.tasks {
        match run_task(task, &plan, progress.clone()).await {
            Ok(result) => {
                if result.failed() > 0 {
                    success = false;
                }
                summary.results.push(result);
            }
            Err(error) => {
                tracing::error!("{:#}", &error);
                success = false;
            }
        }
    }
    if !success {
        if print_summary {
            return Err(anyhow!("rbak encountered errors\n\n{}", &summary));
        }
        return Err(anyhow!("rbak encountered errors"));
    }
    Ok(summary)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let plan = match Plan::from_args(&args) {
        Ok(plan) => plan,
        Err(error) => {
            eprintln!("{error:#}");
            std::process::exit(1);
        }
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let tracing = common::TracingConfig {
        log_file: plan.log_file.clone(),
    };
    let func = {
        let print_summary = args.summary;
        move |progress| async_main(plan, print_summary, progress)
    };
    let res = common::run(
        if args.progress || args.progress_type.is_some() || args.progress_delay.is_some() {
            Some(common::ProgressSettings {
                progress_type: args.progress_type.unwrap_or_default(),
                progress_delay: args.progress_delay,
            })
        } else {
            None
        },
        output,
        runtime,
        tracing,
        func,
    );
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
