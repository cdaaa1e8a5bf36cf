use async_trait::async_trait;

use crate::outcome::ExecutionOutcome;
use crate::provider::{ProviderError, RemoteSandbox};

/// Drives a sandbox to run source text for one language.
///
/// User code failures (syntax errors, compiler diagnostics, non-zero exits)
/// come back as `Ok` with the exit code and stderr populated. `Err` is
/// reserved for the sandbox itself failing.
#[async_trait]
pub trait LanguageAdapter: Send + Sync {
    async fn execute(
        &self,
        sandbox: &dyn RemoteSandbox,
        source: &str,
    ) -> Result<ExecutionOutcome, ProviderError>;
}

/// Writes the source to a file and runs it with an interpreter.
pub struct ScriptAdapter {
    file_name: &'static str,
    interpreter: &'static str,
}

impl ScriptAdapter {
    pub const fn new(file_name: &'static str, interpreter: &'static str) -> Self {
        Self {
            file_name,
            interpreter,
        }
    }

    pub const fn python() -> Self {
        Self::new("main.py", "python3")
    }

    pub const fn node() -> Self {
        Self::new("script.js", "node")
    }

    pub const fn bash() -> Self {
        Self::new("script.sh", "bash")
    }

    pub fn command(&self) -> String {
        format!("{} {}", self.interpreter, self.file_name)
    }
}

#[async_trait]
impl LanguageAdapter for ScriptAdapter {
    async fn execute(
        &self,
        sandbox: &dyn RemoteSandbox,
        source: &str,
    ) -> Result<ExecutionOutcome, ProviderError> {
        sandbox.write_file(self.file_name, source).await?;
        let output = sandbox.execute_command(&self.command()).await?;
        Ok(output.into())
    }
}

#[derive(Debug, Default)]
pub struct CAdapter;

impl CAdapter {
    fn program_name() -> String {
        format!("program_{:08x}", rand::random::<u32>())
    }
}

#[async_trait]
impl LanguageAdapter for CAdapter {
    async fn execute(
        &self,
        sandbox: &dyn RemoteSandbox,
        source: &str,
    ) -> Result<ExecutionOutcome, ProviderError> {
        let program = Self::program_name();
        let source_file = format!("{program}.c");
        sandbox.write_file(&source_file, source).await?;

        let compiled = sandbox
            .execute_command(&format!("gcc -o {program} {source_file}"))
            .await?;
        if !compiled.success() {
            return Ok(ExecutionOutcome::completed(
                "",
                format!("Compilation error:\n{}", compiled.stderr),
                compiled.exit_code,
            ));
        }

        let output = sandbox.execute_command(&format!("./{program}")).await?;
        Ok(output.into())
    }
}
