//! SSH backed filesystem
//!
//! [`SshFs`] implements [`common::fs::Filesystem`] for a remote POSIX host. It keeps one
//! multiplexed `openssh` session and runs every operation as a small `sh -c` script (see
//! [`script`]). File content travels over the command's stdin and stdout.
//!
//! The session is opened lazily (or by [`Filesystem::connect`]). When a command fails because the
//! session itself broke, the session is re-established and the command is retried once.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::SshTarget;
use common::fs::{Filesystem, FsError, Result};
use tracing::instrument;

pub mod script;

/// Quote `value` for safe use as a single POSIX shell word.
pub fn shell_escape(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn ssh_destination(target: &SshTarget) -> String {
    let host = target.host.as_str();
    match (target.user.as_deref(), target.port) {
        (Some(user), Some(port)) => format!("ssh://{user}@{host}:{port}"),
        (None, Some(port)) => format!("ssh://{host}:{port}"),
        (Some(user), None) => format!("ssh://{user}@{host}"),
        (None, None) => format!("ssh://{host}"),
    }
}

async fn setup_ssh_session(target: &SshTarget) -> Result<Arc<openssh::Session>> {
    let destination = ssh_destination(target);
    tracing::debug!("Connecting to SSH destination: {}", destination);
    let session = openssh::Session::connect(destination, openssh::KnownHosts::Accept)
        .await
        .map_err(|err| FsError::Session {
            message: format!("failed to establish SSH connection to {target}: {err}"),
        })?;
    Ok(Arc::new(session))
}

fn session_error(target: &SshTarget, err: openssh::Error) -> FsError {
    FsError::Session {
        message: format!("{target}: {err}"),
    }
}

/// Filesystem on a remote host reached over ssh.
pub struct SshFs {
    target: SshTarget,
    session: tokio::sync::Mutex<Option<Arc<openssh::Session>>>,
}

impl SshFs {
    pub fn new(target: SshTarget) -> Self {
        Self {
            target,
            session: tokio::sync::Mutex::new(None),
        }
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    async fn session(&self) -> Result<Arc<openssh::Session>> {
        let mut session = self.session.lock().await;
        if let Some(session) = session.as_ref() {
            return Ok(session.clone());
        }
        let fresh = setup_ssh_session(&self.target).await?;
        *session = Some(fresh.clone());
        Ok(fresh)
    }

    /// Forget `broken` unless another task already replaced it.
    async fn drop_session(&self, broken: &Arc<openssh::Session>) {
        let mut session = self.session.lock().await;
        if session
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, broken))
        {
            *session = None;
        }
    }

    async fn exec_once(
        &self,
        session: &Arc<openssh::Session>,
        cmd: &str,
        stdin: Option<&[u8]>,
    ) -> Result<std::process::Output> {
        let Some(bytes) = stdin else {
            return session
                .command("sh")
                .arg("-c")
                .arg(cmd)
                .output()
                .await
                .map_err(|err| session_error(&self.target, err));
        };
        use tokio::io::AsyncWriteExt;
        let mut child = session
            .command("sh")
            .arg("-c")
            .arg(cmd)
            .stdin(openssh::Stdio::piped())
            .stdout(openssh::Stdio::piped())
            .stderr(openssh::Stdio::piped())
            .spawn()
            .await
            .map_err(|err| session_error(&self.target, err))?;
        let mut child_stdin = child.stdin().take().ok_or_else(|| FsError::Session {
            message: format!("{}: remote command has no stdin", &self.target),
        })?;
        let write = async {
            child_stdin.write_all(bytes).await?;
            // EOF must reach the remote side before waiting for the command
            child_stdin.shutdown().await?;
            drop(child_stdin);
            Ok::<(), std::io::Error>(())
        };
        if let Err(err) = write.await {
            return Err(FsError::Session {
                message: format!("{}: failed to send data: {}", &self.target, err),
            });
        }
        child
            .wait_with_output()
            .await
            .map_err(|err| session_error(&self.target, err))
    }

    /// Run `cmd` remotely, reconnecting and retrying once if the session broke.
    async fn exec(&self, cmd: &str, stdin: Option<&[u8]>) -> Result<std::process::Output> {
        let session = self.session().await?;
        match self.exec_once(&session, cmd, stdin).await {
            Err(err) if err.is_session() => {
                tracing::warn!("ssh session failed, reconnecting: {}", &err);
                self.drop_session(&session).await;
                let session = self.session().await?;
                self.exec_once(&session, cmd, stdin).await
            }
            other => other,
        }
    }

    /// Run `cmd` and require success, mapping [`script::NOT_FOUND_EXIT`] to `NotFound`.
    async fn exec_checked(
        &self,
        op: &'static str,
        path: &str,
        cmd: &str,
        stdin: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        let output = self.exec(cmd, stdin).await?;
        if output.status.success() {
            return Ok(output.stdout);
        }
        if output.status.code() == Some(script::NOT_FOUND_EXIT) {
            return Err(FsError::not_found(path));
        }
        Err(FsError::Remote {
            op,
            path: path.to_string(),
            message: format!(
                "status {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        })
    }

    /// Run a `test` script: success is true, status 1 is false.
    async fn exec_test(&self, op: &'static str, path: &str, cmd: &str) -> Result<bool> {
        let output = self.exec(cmd, None).await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            code => Err(FsError::Remote {
                op,
                path: path.to_string(),
                message: format!(
                    "status {:?}: {}",
                    code,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            }),
        }
    }
}

#[async_trait]
impl Filesystem for SshFs {
    fn combine_path(&self, parts: &[&str]) -> String {
        common::fs::posix_join(parts)
    }

    fn leaf_name(&self, path: &str) -> String {
        common::fs::posix_leaf(path)
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        self.exec_test("stat", path, &script::file_exists(path))
            .await
    }

    #[instrument(skip(self))]
    async fn read_all(&self, path: &str) -> Result<Vec<u8>> {
        self.exec_checked("read", path, &script::read_file(path), None)
            .await
    }

    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    async fn create_file(&self, path: &str, bytes: &[u8]) -> Result<()> {
        self.exec_checked("write", path, &script::write_file(path), Some(bytes))
            .await?;
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        self.exec_checked("remove", path, &script::delete_file(path), None)
            .await?;
        Ok(())
    }

    async fn directory_exists(&self, path: &str) -> Result<bool> {
        self.exec_test("stat", path, &script::directory_exists(path))
            .await
    }

    async fn list_files(&self, path: &str) -> Result<Vec<String>> {
        let stdout = self
            .exec_checked("list", path, &script::list(path, 'f'), None)
            .await?;
        Ok(script::parse_names(&stdout))
    }

    async fn list_directories(&self, path: &str) -> Result<Vec<String>> {
        let stdout = self
            .exec_checked("list", path, &script::list(path, 'd'), None)
            .await?;
        Ok(script::parse_names(&stdout))
    }

    async fn create_directory(&self, path: &str) -> Result<()> {
        self.exec_checked("create directory", path, &script::create_directory(path), None)
            .await?;
        Ok(())
    }

    async fn delete_directory(&self, path: &str) -> Result<()> {
        self.exec_checked("remove directory", path, &script::delete_directory(path), None)
            .await?;
        Ok(())
    }

    async fn last_modified(&self, path: &str) -> Result<DateTime<Utc>> {
        let stdout = self
            .exec_checked("stat", path, &script::last_modified(path), None)
            .await?;
        let text = String::from_utf8_lossy(&stdout);
        text.trim()
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .ok_or_else(|| FsError::Remote {
                op: "stat",
                path: path.to_string(),
                message: format!("unexpected modification time {:?}", text.trim()),
            })
    }

    async fn connect(&self) -> Result<()> {
        self.session().await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };
        match Arc::try_unwrap(session) {
            Ok(session) => session
                .close()
                .await
                .map_err(|err| session_error(&self.target, err)),
            // still used by a command in flight, closes when that finishes
            Err(_) => Ok(()),
        }
    }
}
