pub mod config;
pub mod error;
pub mod orchestrator;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod session;

use std::sync::Arc;

use sandbox::{CapabilityRegistry, SandboxProvider};

pub use config::{BrokerConfig, ConfigError};
pub use error::BrokerError;
pub use orchestrator::{Orchestrator, RunLimits, RunOutcome, RunRequest, SourceFile};
pub use pool::{Lease, PoolConfig, PoolError, PoolStats, SandboxPool};
pub use session::{SessionInfo, SessionRegistry};

/// Wires a pool, a session registry and an orchestrator around one provider.
/// Must be called inside a tokio runtime.
pub fn build_broker(
    provider: Arc<dyn SandboxProvider>,
    capabilities: CapabilityRegistry,
    config: &BrokerConfig,
) -> Orchestrator {
    let capabilities = Arc::new(capabilities);
    let pool = SandboxPool::spawn(
        provider,
        PoolConfig {
            capacity: config.max_pool_size,
        },
    );
    let sessions = SessionRegistry::new(pool.clone(), capabilities.clone());
    Orchestrator::new(
        pool,
        sessions,
        capabilities,
        RunLimits {
            default_timeout: config.default_timeout,
            max_timeout: config.max_timeout,
            max_output_bytes: config.max_output_bytes,
        },
    )
}
