use std::collections::HashSet;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tempfile::TempDir;
use tokio::process::Command;

use crate::provider::{
    CommandOutput, ProviderError, RemoteSandbox, SandboxProvider, workspace_relative,
};

/// Runs sandboxes as host directories. Provides no isolation beyond a
/// private working directory and process group per command; meant for
/// development and tests.
#[derive(Debug, Default)]
pub struct LocalProvider;

impl LocalProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SandboxProvider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn create(&self, language: &str) -> Result<Arc<dyn RemoteSandbox>, ProviderError> {
        let workspace = tempfile::Builder::new().prefix("sandbox-").tempdir()?;
        let root = workspace.path().to_path_buf();
        let id = root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| root.display().to_string());
        tracing::debug!(sandbox = %id, language, "local sandbox created");
        Ok(Arc::new(LocalSandbox {
            id,
            root,
            workspace: Mutex::new(Some(workspace)),
            groups: Mutex::new(HashSet::new()),
        }))
    }
}

pub struct LocalSandbox {
    id: String,
    root: PathBuf,
    workspace: Mutex<Option<TempDir>>,
    /// Process groups of commands that have not been observed to exit.
    groups: Mutex<HashSet<i32>>,
}

impl LocalSandbox {
    fn ensure_alive(&self) -> Result<(), ProviderError> {
        let alive = self
            .workspace
            .lock()
            .map(|workspace| workspace.is_some())
            .unwrap_or(false);
        if alive {
            Ok(())
        } else {
            Err(ProviderError::Destroyed(self.id.clone()))
        }
    }

    fn track(&self, group: i32) {
        if let Ok(mut groups) = self.groups.lock() {
            groups.insert(group);
        }
    }

    fn untrack(&self, group: i32) {
        if let Ok(mut groups) = self.groups.lock() {
            groups.remove(&group);
        }
    }

    fn kill_groups(&self) -> Result<(), ProviderError> {
        let groups: Vec<i32> = match self.groups.lock() {
            Ok(mut groups) => groups.drain().collect(),
            Err(_) => return Err(ProviderError::command("reset", "process table poisoned")),
        };
        for group in groups {
            match killpg(Pid::from_raw(group), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(err) => {
                    return Err(ProviderError::command(
                        "kill",
                        format!("process group {group}: {err}"),
                    ));
                }
            }
        }
        Ok(())
    }
}

async fn clear_dir(root: &Path) -> Result<(), ProviderError> {
    let mut entries = tokio::fs::read_dir(root).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
    }
    Ok(())
}

#[async_trait]
impl RemoteSandbox for LocalSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute_command(&self, command: &str) -> Result<CommandOutput, ProviderError> {
        self.ensure_alive()?;
        let mut std_command = std::process::Command::new("sh");
        std_command
            .arg("-c")
            .arg(command)
            .current_dir(&self.root)
            .env("HOME", &self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        let mut command = Command::from(std_command);
        command.kill_on_drop(true);

        let child = command.spawn()?;
        let group = child.id().and_then(|pid| i32::try_from(pid).ok());
        if let Some(group) = group {
            self.track(group);
        }
        let output = child.wait_with_output().await?;
        if let Some(group) = group {
            self.untrack(group);
        }
        Ok(CommandOutput::from_process(output))
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), ProviderError> {
        self.ensure_alive()?;
        let target = self.root.join(workspace_relative(path)?);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content).await?;
        Ok(())
    }

    async fn reset(&self) -> Result<(), ProviderError> {
        self.ensure_alive()?;
        self.kill_groups()?;
        clear_dir(&self.root).await
    }

    async fn destroy(&self) -> Result<(), ProviderError> {
        let workspace = self
            .workspace
            .lock()
            .map_err(|_| ProviderError::command("destroy", "workspace lock poisoned"))?
            .take();
        let Some(workspace) = workspace else {
            return Ok(());
        };
        self.kill_groups()?;
        tokio::task::spawn_blocking(move || workspace.close())
            .await
            .map_err(|err| ProviderError::command("destroy", err.to_string()))??;
        Ok(())
    }
}
