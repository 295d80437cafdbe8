//! Configuration types for runtime, output and backup tasks

use std::collections::BTreeMap;

use serde::Deserialize;

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

/// Tracing configuration
#[derive(Debug, Clone, Default)]
pub struct TracingConfig {
    /// Also write log output to this file
    pub log_file: Option<String>,
}

/// Progress reporting configuration
#[derive(Debug, Clone, Default)]
pub struct ProgressSettings {
    pub progress_type: crate::progress::ProgressType,
    /// Human readable delay between updates, e.g. "200ms" or "10s"
    pub progress_delay: Option<String>,
}

impl ProgressSettings {
    pub fn delay(&self) -> Result<std::time::Duration, ConfigError> {
        match &self.progress_delay {
            Some(delay) => humantime::parse_duration(delay).map_err(|source| ConfigError::Delay {
                value: delay.clone(),
                source,
            }),
            None => Ok(self.progress_type.resolve().default_delay()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read configuration file {path:?}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration")]
    Parse(#[from] serde_json::Error),
    #[error("configuration has no backup tasks")]
    NoTasks,
    #[error("backup task #{task}: empty {side} path")]
    EmptyPath { task: usize, side: &'static str },
    #[error("backup task #{task}: ssh {side} requires a host name")]
    MissingHost { task: usize, side: &'static str },
    #[error("backup task #{task}: unknown ssh host {name:?}")]
    UnknownHost { task: usize, name: String },
    #[error("history depth must be at least 1")]
    ZeroDepth,
    #[error("invalid progress delay {value:?}")]
    Delay {
        value: String,
        #[source]
        source: humantime::DurationError,
    },
}

/// Settings shared by all tasks of a configuration file.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct CommonOptions {
    /// 0 means unlimited
    pub max_concurrent_transfers: usize,
    pub history_depth: usize,
    pub cache_save_interval: u64,
    pub check_cache_mtime: bool,
}

impl Default for CommonOptions {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: 0,
            history_depth: 3,
            cache_save_interval: 100,
            check_cache_mtime: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SshHostOptions {
    pub host: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemMode {
    #[default]
    Local,
    #[serde(alias = "sftp")]
    Ssh,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct EndpointOptions {
    pub path: Option<String>,
    /// Several source directories sharing one destination
    pub paths: Vec<String>,
    pub mode: FilesystemMode,
    /// Key into the `ssh` table
    pub host: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BackupOptions {
    pub from: EndpointOptions,
    pub to: EndpointOptions,
}

/// Contents of a JSON task file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct BackupConfig {
    pub common: CommonOptions,
    pub log_file: Option<String>,
    pub ssh: BTreeMap<String, SshHostOptions>,
    pub backup: Vec<BackupOptions>,
}

/// Remote host reached over ssh.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SshTarget {
    pub host: String,
    pub user: Option<String>,
    pub port: Option<u16>,
}

impl std::fmt::Display for SshTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        write!(f, "{}", &self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Local,
    Ssh(SshTarget),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub location: Location,
    pub path: String,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.location {
            Location::Local => write!(f, "{}", &self.path),
            Location::Ssh(target) => write!(f, "{}:{}", target, &self.path),
        }
    }
}

/// One source directory to back up into one destination directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupTask {
    pub source: Endpoint,
    pub destination: Endpoint,
}

impl BackupConfig {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    fn location(
        &self,
        task: usize,
        side: &'static str,
        endpoint: &EndpointOptions,
    ) -> Result<Location, ConfigError> {
        match endpoint.mode {
            FilesystemMode::Local => Ok(Location::Local),
            FilesystemMode::Ssh => {
                let name = endpoint
                    .host
                    .as_ref()
                    .ok_or(ConfigError::MissingHost { task, side })?;
                let options = self.ssh.get(name).ok_or_else(|| ConfigError::UnknownHost {
                    task,
                    name: name.clone(),
                })?;
                Ok(Location::Ssh(SshTarget {
                    host: options.host.clone(),
                    user: options.user.clone(),
                    port: options.port,
                }))
            }
        }
    }

    /// Validate the configuration and expand it into one task per source directory.
    pub fn tasks(&self) -> Result<Vec<BackupTask>, ConfigError> {
        if self.common.history_depth == 0 {
            return Err(ConfigError::ZeroDepth);
        }
        if self.backup.is_empty() {
            return Err(ConfigError::NoTasks);
        }
        let mut tasks = Vec::new();
        for (idx, entry) in self.backup.iter().enumerate() {
            let task = idx + 1;
            let source_location = self.location(task, "source", &entry.from)?;
            let destination_location = self.location(task, "destination", &entry.to)?;
            let destination_path = match entry.to.path.as_deref() {
                Some(path) if !path.is_empty() => path.to_string(),
                _ => {
                    return Err(ConfigError::EmptyPath {
                        task,
                        side: "destination",
                    });
                }
            };
            let source_paths: Vec<&str> = if entry.from.paths.is_empty() {
                vec![entry.from.path.as_deref().unwrap_or_default()]
            } else {
                entry.from.paths.iter().map(String::as_str).collect()
            };
            for path in source_paths {
                if path.is_empty() {
                    return Err(ConfigError::EmptyPath {
                        task,
                        side: "source",
                    });
                }
                tasks.push(BackupTask {
                    source: Endpoint {
                        location: source_location.clone(),
                        path: path.to_string(),
                    },
                    destination: Endpoint {
                        location: destination_location.clone(),
                        path: destination_path.clone(),
                    },
                });
            }
        }
        Ok(tasks)
    }
}
