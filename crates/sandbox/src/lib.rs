pub mod adapters;
pub mod docker;
#[cfg(unix)]
pub mod local;
pub mod outcome;
pub mod provider;
pub mod registry;

use std::str::FromStr;
use std::sync::Arc;

pub use adapters::LanguageAdapter;
pub use outcome::{ExecutionOutcome, FailureReason};
pub use provider::{CommandOutput, ProviderError, RemoteSandbox, SandboxProvider};
pub use registry::{CapabilityRegistry, LanguageCapability, UnsupportedLanguage};

use docker::{DockerConfig, DockerProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Docker,
    Local,
}

impl FromStr for ProviderKind {
    type Err = ProviderError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "local" => Ok(Self::Local),
            other => Err(ProviderError::UnknownProvider(other.to_owned())),
        }
    }
}

pub fn build_provider(
    kind: ProviderKind,
    docker: DockerConfig,
) -> Result<Arc<dyn SandboxProvider>, ProviderError> {
    match kind {
        ProviderKind::Docker => Ok(Arc::new(DockerProvider::new(docker))),
        #[cfg(unix)]
        ProviderKind::Local => Ok(Arc::new(local::LocalProvider::new())),
        #[cfg(not(unix))]
        ProviderKind::Local => Err(ProviderError::UnknownProvider("local".to_owned())),
    }
}
