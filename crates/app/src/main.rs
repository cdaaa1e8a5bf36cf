use std::sync::Arc;

use anyhow::Context;
use app::server::router;
use app::{BrokerConfig, Orchestrator, build_broker};
use sandbox::{CapabilityRegistry, SandboxProvider, build_provider};
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = BrokerConfig::from_env().context("invalid configuration")?;
    let capabilities = CapabilityRegistry::builtin_subset(&config.languages)?;
    let provider = build_provider(config.provider, config.docker.clone())?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(serve(config, provider, capabilities))
}

async fn serve(
    config: BrokerConfig,
    provider: Arc<dyn SandboxProvider>,
    capabilities: CapabilityRegistry,
) -> anyhow::Result<()> {
    let provider_name = provider.name();
    let orchestrator = build_broker(provider, capabilities, &config);
    warm_pool(&orchestrator, &config).await;

    let reaper = config
        .session_idle_timeout
        .map(|max_idle| orchestrator.sessions().spawn_reaper(max_idle));

    let addr = config.bind_addr();
    let app = router(orchestrator.clone(), config.max_inflight);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(
        %addr,
        provider = provider_name,
        capacity = config.max_pool_size,
        languages = ?config.languages,
        "listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(reaper) = reaper {
        reaper.abort();
    }
    orchestrator.sessions().end_all().await;
    orchestrator.pool().drain().await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn warm_pool(orchestrator: &Orchestrator, config: &BrokerConfig) {
    let mut warming = JoinSet::new();
    for (language, count) in config.warm_plan() {
        let pool = orchestrator.pool().clone();
        warming.spawn(async move { pool.warm(&language, count).await });
    }
    let mut warmed = 0;
    while let Some(result) = warming.join_next().await {
        match result {
            Ok(created) => warmed += created,
            Err(err) => tracing::error!(error = %err, "pool warm-up task failed"),
        }
    }
    tracing::info!(warmed, requested = config.initial_pool_size, "initial pool ready");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
