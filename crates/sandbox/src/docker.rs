use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::provider::{
    CommandOutput, ProviderError, RemoteSandbox, SandboxProvider, workspace_relative,
};

pub const WORKDIR: &str = "/home/user";

const RESET_SCRIPT: &str =
    "kill -9 -1 2>/dev/null; rm -rf /tmp/* /home/user/* /home/user/.[!.]* 2>/dev/null; exit 0";
const WRITE_SCRIPT: &str = "mkdir -p \"$(dirname \"$1\")\" && cat > \"$1\"";

#[derive(Debug, Clone)]
pub struct DockerConfig {
    pub image: String,
    /// OCI runtime passed as `--runtime`, e.g. `runsc`. `None` uses the
    /// daemon default.
    pub runtime: Option<String>,
    pub memory: String,
    pub pids_limit: u32,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: "sandbox-runtime:latest".to_owned(),
            runtime: Some("runsc".to_owned()),
            memory: "512m".to_owned(),
            pids_limit: 256,
        }
    }
}

pub struct DockerProvider {
    config: DockerConfig,
}

impl DockerProvider {
    pub fn new(config: DockerConfig) -> Self {
        Self { config }
    }

    fn run_args(&self, language: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_owned(),
            "-d".to_owned(),
            "--rm".to_owned(),
            "--network=none".to_owned(),
            format!("--memory={}", self.config.memory),
            format!("--pids-limit={}", self.config.pids_limit),
            "--label".to_owned(),
            format!("sandbox.language={language}"),
            "-w".to_owned(),
            WORKDIR.to_owned(),
        ];
        if let Some(runtime) = self.config.runtime.as_deref().filter(|r| !r.is_empty()) {
            args.push(format!("--runtime={runtime}"));
        }
        args.push(self.config.image.clone());
        args.push("sleep".to_owned());
        args.push("infinity".to_owned());
        args
    }
}

#[async_trait]
impl SandboxProvider for DockerProvider {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create(&self, language: &str) -> Result<Arc<dyn RemoteSandbox>, ProviderError> {
        let output = Command::new("docker")
            .args(self.run_args(language))
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProviderError::command("docker run", stderr.trim()));
        }
        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        if container_id.is_empty() {
            return Err(ProviderError::command(
                "docker run",
                "no container id returned",
            ));
        }
        tracing::debug!(container = %container_id, language, "docker sandbox started");
        Ok(Arc::new(DockerSandbox {
            container_id,
            destroyed: AtomicBool::new(false),
        }))
    }
}

pub struct DockerSandbox {
    container_id: String,
    destroyed: AtomicBool,
}

impl DockerSandbox {
    fn ensure_alive(&self) -> Result<(), ProviderError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(ProviderError::Destroyed(self.container_id.clone()));
        }
        Ok(())
    }

    fn exec_command(&self, interactive: bool) -> Command {
        let mut command = Command::new("docker");
        command.arg("exec");
        if interactive {
            command.arg("-i");
        }
        command
            .arg("-w")
            .arg(WORKDIR)
            .arg(&self.container_id)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

/// `docker exec` reports daemon-side failures on stderr with this prefix,
/// which separates them from the user command's own stderr.
fn is_daemon_failure(output: &CommandOutput) -> bool {
    output.exit_code != 0 && output.stderr.starts_with("Error response from daemon")
}

#[async_trait]
impl RemoteSandbox for DockerSandbox {
    fn id(&self) -> &str {
        &self.container_id
    }

    async fn execute_command(&self, command: &str) -> Result<CommandOutput, ProviderError> {
        self.ensure_alive()?;
        let output = self
            .exec_command(false)
            .args(["sh", "-c", command])
            .stdin(Stdio::null())
            .output()
            .await?;
        let output = CommandOutput::from_process(output);
        if is_daemon_failure(&output) {
            return Err(ProviderError::command("docker exec", output.stderr.trim()));
        }
        Ok(output)
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), ProviderError> {
        self.ensure_alive()?;
        let relative = workspace_relative(path)?;
        let target = relative.to_string_lossy().into_owned();
        let mut child = self
            .exec_command(true)
            .args(["sh", "-c", WRITE_SCRIPT, "sh", target.as_str()])
            .stdin(Stdio::piped())
            .spawn()?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProviderError::command("docker exec", "missing stdin"))?;
        stdin.write_all(content.as_bytes()).await?;
        stdin.shutdown().await?;
        drop(stdin);
        let output = CommandOutput::from_process(child.wait_with_output().await?);
        if !output.success() {
            return Err(ProviderError::command(
                format!("write {target}"),
                output.stderr.trim(),
            ));
        }
        Ok(())
    }

    async fn reset(&self) -> Result<(), ProviderError> {
        let output = self.execute_command(RESET_SCRIPT).await?;
        if !output.success() {
            return Err(ProviderError::command("reset", output.stderr.trim()));
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<(), ProviderError> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let output = Command::new("docker")
            .args(["rm", "-f", &self.container_id])
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProviderError::command("docker rm", stderr.trim()));
        }
        Ok(())
    }
}
