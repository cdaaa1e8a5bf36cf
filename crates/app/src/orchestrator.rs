use std::sync::Arc;
use std::time::{Duration, Instant};

use sandbox::provider::workspace_relative;
use sandbox::{
    CapabilityRegistry, ExecutionOutcome, FailureReason, LanguageAdapter, LanguageCapability,
    RemoteSandbox,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BrokerError;
use crate::pool::SandboxPool;
use crate::session::SessionRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub language: String,
    pub source: String,
    pub timeout: Option<Duration>,
    pub session_id: Option<String>,
    pub files: Vec<SourceFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
    pub execution_id: String,
    #[serde(flatten)]
    pub outcome: ExecutionOutcome,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    pub default_timeout: Duration,
    pub max_timeout: Duration,
    pub max_output_bytes: usize,
}

/// Runs source text in a pooled or session sandbox and makes sure the
/// sandbox is disposed of exactly once, however the run ends.
#[derive(Clone)]
pub struct Orchestrator {
    pool: SandboxPool,
    sessions: SessionRegistry,
    capabilities: Arc<CapabilityRegistry>,
    limits: RunLimits,
}

impl Orchestrator {
    pub fn new(
        pool: SandboxPool,
        sessions: SessionRegistry,
        capabilities: Arc<CapabilityRegistry>,
        limits: RunLimits,
    ) -> Self {
        Self {
            pool,
            sessions,
            capabilities,
            limits,
        }
    }

    pub fn pool(&self) -> &SandboxPool {
        &self.pool
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn capabilities(&self) -> &CapabilityRegistry {
        &self.capabilities
    }

    pub fn limits(&self) -> RunLimits {
        self.limits
    }

    /// Absent means the default; zero is rejected; anything above the
    /// maximum is clamped to it.
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Result<Duration, BrokerError> {
        match requested {
            None => Ok(self.limits.default_timeout),
            Some(timeout) if timeout.is_zero() => {
                Err(BrokerError::invalid("timeout must be positive"))
            }
            Some(timeout) => Ok(timeout.min(self.limits.max_timeout)),
        }
    }

    pub async fn run(&self, request: RunRequest) -> Result<RunOutcome, BrokerError> {
        let timeout = self.effective_timeout(request.timeout)?;
        for file in &request.files {
            workspace_relative(&file.path)
                .map_err(|_| BrokerError::invalid(format!("invalid file path: {:?}", file.path)))?;
        }
        let capability = self.capabilities.resolve(&request.language)?;
        let execution_id = Uuid::new_v4().to_string();
        let started = Instant::now();

        let outcome = match request.session_id.as_deref() {
            Some(session_id) => {
                self.run_in_session(session_id, capability, &request, timeout)
                    .await?
            }
            None => self.run_ephemeral(capability, &request, timeout).await?,
        };
        let outcome = outcome.truncated(self.limits.max_output_bytes);
        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            execution = %execution_id,
            language = capability.name(),
            session = request.session_id.as_deref().unwrap_or_default(),
            exit_code = outcome.exit_code,
            failure = ?outcome.failure,
            duration_ms,
            "execution finished"
        );
        Ok(RunOutcome {
            execution_id,
            outcome,
            duration_ms,
            session_id: request.session_id,
        })
    }

    async fn run_ephemeral(
        &self,
        capability: &LanguageCapability,
        request: &RunRequest,
        timeout: Duration,
    ) -> Result<ExecutionOutcome, BrokerError> {
        let lease = self.pool.acquire(capability.name()).await?;
        let outcome = execute(
            capability.adapter().as_ref(),
            lease.sandbox().as_ref(),
            &request.source,
            &request.files,
            timeout,
        )
        .await;
        match outcome.failure {
            Some(FailureReason::Infrastructure) => self.pool.discard(lease),
            _ => self.pool.release(lease, outcome.is_clean()),
        }
        Ok(outcome)
    }

    async fn run_in_session(
        &self,
        session_id: &str,
        capability: &LanguageCapability,
        request: &RunRequest,
        timeout: Duration,
    ) -> Result<ExecutionOutcome, BrokerError> {
        let session = self.sessions.resolve(session_id)?;
        if session.language() != capability.name() {
            return Err(BrokerError::SessionLanguageMismatch {
                session_id: session_id.to_owned(),
                expected: session.language().to_owned(),
                requested: capability.name().to_owned(),
            });
        }
        let _running = session
            .begin_run()
            .await
            .ok_or_else(|| BrokerError::SessionNotFound(session_id.to_owned()))?;
        let outcome = execute(
            capability.adapter().as_ref(),
            session.sandbox().as_ref(),
            &request.source,
            &request.files,
            timeout,
        )
        .await;
        session.touch();
        if outcome.failure == Some(FailureReason::Infrastructure) {
            self.sessions.retire(session_id);
        }
        Ok(outcome)
    }
}

/// Writes the request files and runs the adapter under one deadline.
async fn execute(
    adapter: &dyn LanguageAdapter,
    sandbox: &dyn RemoteSandbox,
    source: &str,
    files: &[SourceFile],
    timeout: Duration,
) -> ExecutionOutcome {
    let work = async {
        for file in files {
            sandbox.write_file(&file.path, &file.content).await?;
        }
        adapter.execute(sandbox, source).await
    };
    match tokio::time::timeout(timeout, work).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(err)) => {
            tracing::warn!(remote = sandbox.id(), error = %err, "sandbox failed during execution");
            ExecutionOutcome::failed(FailureReason::Infrastructure, err.to_string())
        }
        Err(_) => {
            tracing::debug!(
                remote = sandbox.id(),
                timeout_ms = timeout.as_millis() as u64,
                "execution timed out"
            );
            ExecutionOutcome::timed_out()
        }
    }
}
