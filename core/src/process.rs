//! The process-manager collaborator seam.
//!
//! The dispatcher never spawns or signals processes itself; it goes through
//! [`ProcessManager`]. [`SystemProcessManager`] is the default
//! implementation over OS processes. Tests substitute their own.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn '{executable}': {source}")]
    SpawnFailed {
        executable: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no running process for identifier '{0}'")]
    NotRunning(String),
    #[error("process for '{0}' has already exited")]
    AlreadyExited(String),
    #[error("failed to deliver termination signal to pid {0}")]
    SignalFailed(u32),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything needed to launch one instance. Either taken verbatim from a
/// Tray `start` or resolved through the application catalog for GUI starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    pub executable: String,
    /// Directory the executable lives in; empty if `executable` stands alone.
    pub base_directory: String,
    pub working_directory: String,
    /// Whitespace-separated commandline arguments.
    pub arguments: String,
}

impl LaunchSpec {
    /// The program path handed to the OS.
    pub fn program(&self) -> PathBuf {
        if self.base_directory.is_empty() {
            PathBuf::from(&self.executable)
        } else {
            Path::new(&self.base_directory).join(&self.executable)
        }
    }
}

#[async_trait]
pub trait ProcessManager: Send + Sync {
    async fn launch(&self, identifier: &str, spec: &LaunchSpec) -> Result<(), ProcessError>;
    /// Hard stop. The process is gone when this returns.
    async fn kill(&self, identifier: &str) -> Result<(), ProcessError>;
    /// Graceful stop. Delivers a termination signal and resolves once the
    /// process has exited.
    async fn terminate(&self, identifier: &str) -> Result<(), ProcessError>;
    async fn is_alive(&self, identifier: &str) -> bool;
}

/// Manages instances as child processes of the Core.
#[derive(Default)]
pub struct SystemProcessManager {
    children: Mutex<HashMap<String, Child>>,
}

impl SystemProcessManager {
    pub fn new() -> Self {
        Self::default()
    }

    async fn take(&self, identifier: &str) -> Result<Child, ProcessError> {
        self.children
            .lock()
            .await
            .remove(identifier)
            .ok_or_else(|| ProcessError::NotRunning(identifier.to_string()))
    }
}

#[async_trait]
impl ProcessManager for SystemProcessManager {
    async fn launch(&self, identifier: &str, spec: &LaunchSpec) -> Result<(), ProcessError> {
        let program = spec.program();
        let mut command = Command::new(&program);
        if !spec.working_directory.is_empty() {
            command.current_dir(&spec.working_directory);
        }
        if !spec.arguments.is_empty() {
            command.args(spec.arguments.split_whitespace());
        }
        command.stdout(Stdio::null()).stderr(Stdio::null());
        let child = command.spawn().map_err(|source| ProcessError::SpawnFailed {
            executable: program.display().to_string(),
            source,
        })?;
        debug!(identifier, pid = child.id(), "spawned process");
        self.children.lock().await.insert(identifier.to_string(), child);
        Ok(())
    }

    async fn kill(&self, identifier: &str) -> Result<(), ProcessError> {
        let mut child = self.take(identifier).await?;
        if child.try_wait()?.is_some() {
            return Err(ProcessError::AlreadyExited(identifier.to_string()));
        }
        child.kill().await?;
        debug!(identifier, "process killed");
        Ok(())
    }

    async fn terminate(&self, identifier: &str) -> Result<(), ProcessError> {
        let mut child = self.take(identifier).await?;
        if child.try_wait()?.is_some() {
            return Err(ProcessError::AlreadyExited(identifier.to_string()));
        }
        let Some(pid) = child.id() else {
            return Err(ProcessError::AlreadyExited(identifier.to_string()));
        };
        // Ask nicely (SIGTERM) and wait for the process to leave on its own.
        let status = Command::new("kill").arg(pid.to_string()).status().await;
        match status {
            Ok(status) if status.success() => {}
            Ok(_) | Err(_) => {
                self.children.lock().await.insert(identifier.to_string(), child);
                return Err(ProcessError::SignalFailed(pid));
            }
        }
        let exit = child.wait().await?;
        debug!(identifier, code = exit.code(), "process exited after terminate");
        Ok(())
    }

    async fn is_alive(&self, identifier: &str) -> bool {
        let mut children = self.children.lock().await;
        match children.get_mut(identifier) {
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(_)) | Err(_) => {
                    children.remove(identifier);
                    false
                }
            },
            None => false,
        }
    }
}
