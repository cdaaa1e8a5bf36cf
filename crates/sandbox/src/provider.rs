use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{command} failed: {message}")]
    Command { command: String, message: String },
    #[error("invalid sandbox path: {0}")]
    InvalidPath(String),
    #[error("sandbox {0} was destroyed")]
    Destroyed(String),
    #[error("unknown sandbox provider: {0}")]
    UnknownProvider(String),
}

impl ProviderError {
    pub fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub(crate) fn from_process(output: std::process::Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        }
    }
}

/// One provisioned environment. Commands run with the sandbox workspace as
/// their working directory; relative file paths resolve against it.
#[async_trait]
pub trait RemoteSandbox: Send + Sync {
    fn id(&self) -> &str;

    async fn execute_command(&self, command: &str) -> Result<CommandOutput, ProviderError>;

    async fn write_file(&self, path: &str, content: &str) -> Result<(), ProviderError>;

    /// Best-effort return to a clean state: stray processes are killed and the
    /// workspace is emptied. An error means the sandbox must not be reused.
    async fn reset(&self) -> Result<(), ProviderError>;

    async fn destroy(&self) -> Result<(), ProviderError>;
}

impl fmt::Debug for dyn RemoteSandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSandbox")
            .field("id", &self.id())
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create(&self, language: &str) -> Result<Arc<dyn RemoteSandbox>, ProviderError>;
}

/// Normalizes a caller supplied path to one relative to the sandbox
/// workspace. Leading `/` is stripped; `..` components are rejected.
pub fn workspace_relative(path: &str) -> Result<PathBuf, ProviderError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(ProviderError::InvalidPath(path.to_owned()));
    }
    let mut relative = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(ProviderError::InvalidPath(path.to_owned()));
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(ProviderError::InvalidPath(path.to_owned()));
    }
    Ok(relative)
}
