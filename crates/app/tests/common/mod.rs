#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use app::{BrokerConfig, Orchestrator, PoolStats, SandboxPool, build_broker};
use async_trait::async_trait;
use sandbox::{
    CapabilityRegistry, CommandOutput, ExecutionOutcome, LanguageAdapter, LanguageCapability,
    ProviderError, RemoteSandbox, SandboxProvider,
};

/// Counters and switches shared by a provider and every sandbox it creates.
#[derive(Default)]
pub struct Script {
    pub created: AtomicUsize,
    pub destroyed: AtomicUsize,
    pub resets: AtomicUsize,
    pub fail_create: AtomicBool,
    pub fail_reset: AtomicBool,
    create_delay_ms: AtomicUsize,
}

impl Script {
    pub fn set_create_delay(&self, delay: Duration) {
        self.create_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

/// In-memory provider. Sandboxes understand a handful of commands:
/// `cat <path>`, `ls`, `hang`, `fail`, `exit <code>`; anything else is
/// echoed back on stdout.
#[derive(Default)]
pub struct FakeProvider {
    pub script: Arc<Script>,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SandboxProvider for FakeProvider {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn create(&self, language: &str) -> Result<Arc<dyn RemoteSandbox>, ProviderError> {
        let delay = self.script.create_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        if self.script.fail_create.load(Ordering::SeqCst) {
            return Err(ProviderError::command("create", "quota exceeded"));
        }
        let n = self.script.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeSandbox {
            id: format!("fake-{language}-{n}"),
            script: self.script.clone(),
            files: Mutex::new(BTreeMap::new()),
            destroyed: AtomicBool::new(false),
        }))
    }
}

pub struct FakeSandbox {
    id: String,
    script: Arc<Script>,
    files: Mutex<BTreeMap<String, String>>,
    destroyed: AtomicBool,
}

impl FakeSandbox {
    fn check(&self) -> Result<(), ProviderError> {
        if self.destroyed.load(Ordering::SeqCst) {
            Err(ProviderError::Destroyed(self.id.clone()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteSandbox for FakeSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute_command(&self, command: &str) -> Result<CommandOutput, ProviderError> {
        self.check()?;
        let command = command.trim();
        let output = |stdout: String, exit_code: i32| CommandOutput {
            stdout,
            stderr: String::new(),
            exit_code,
        };
        if command == "hang" {
            std::future::pending::<()>().await;
        }
        if command == "fail" {
            return Err(ProviderError::command("exec", "connection reset by peer"));
        }
        if command == "ls" {
            let files = self.files.lock().unwrap();
            let names: Vec<&str> = files.keys().map(String::as_str).collect();
            return Ok(output(names.join("\n"), 0));
        }
        if let Some(path) = command.strip_prefix("cat ") {
            return Ok(match self.files.lock().unwrap().get(path.trim()) {
                Some(content) => output(content.clone(), 0),
                None => CommandOutput {
                    stdout: String::new(),
                    stderr: format!("cat: {path}: No such file or directory\n"),
                    exit_code: 1,
                },
            });
        }
        if let Some(code) = command.strip_prefix("exit ") {
            return Ok(output(String::new(), code.trim().parse().unwrap_or(1)));
        }
        Ok(output(format!("{command}\n"), 0))
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), ProviderError> {
        self.check()?;
        self.files
            .lock()
            .unwrap()
            .insert(path.trim_start_matches('/').to_owned(), content.to_owned());
        Ok(())
    }

    async fn reset(&self) -> Result<(), ProviderError> {
        self.check()?;
        self.script.resets.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_reset.load(Ordering::SeqCst) {
            return Err(ProviderError::command("reset", "container unhealthy"));
        }
        self.files.lock().unwrap().clear();
        Ok(())
    }

    async fn destroy(&self) -> Result<(), ProviderError> {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            self.script.destroyed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Runs the source text as a single sandbox command.
pub struct CommandAdapter;

#[async_trait]
impl LanguageAdapter for CommandAdapter {
    async fn execute(
        &self,
        sandbox: &dyn RemoteSandbox,
        source: &str,
    ) -> Result<ExecutionOutcome, ProviderError> {
        Ok(sandbox.execute_command(source).await?.into())
    }
}

/// `fake` (alias `fk`) and `other`, both driven by [`CommandAdapter`].
pub fn fake_capabilities() -> CapabilityRegistry {
    let adapter: Arc<dyn LanguageAdapter> = Arc::new(CommandAdapter);
    let mut registry = CapabilityRegistry::new();
    registry.register(LanguageCapability::new("fake", ["fk"], adapter.clone()));
    registry.register(LanguageCapability::new("other", ["ot"], adapter));
    registry
}

pub fn test_config(capacity: usize) -> BrokerConfig {
    BrokerConfig {
        max_pool_size: capacity,
        initial_pool_size: 0,
        default_timeout: Duration::from_secs(5),
        max_timeout: Duration::from_secs(10),
        languages: vec!["fake".to_owned(), "other".to_owned()],
        ..BrokerConfig::default()
    }
}

pub fn fake_broker(capacity: usize) -> (Orchestrator, Arc<FakeProvider>) {
    fake_broker_with(test_config(capacity))
}

pub fn fake_broker_with(config: BrokerConfig) -> (Orchestrator, Arc<FakeProvider>) {
    let provider = FakeProvider::new();
    let orchestrator = build_broker(provider.clone(), fake_capabilities(), &config);
    (orchestrator, provider)
}

/// Polls until no sandbox is provisioning or being reset.
pub async fn settled(pool: &SandboxPool) -> PoolStats {
    for _ in 0..200 {
        let stats = pool.stats().await.unwrap();
        if stats.provisioning == 0 && stats.recycling == 0 {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("pool did not settle: {:?}", pool.stats().await.unwrap());
}

/// Polls until every session sandbox is back and the pool has settled.
pub async fn unbound(pool: &SandboxPool) -> PoolStats {
    for _ in 0..200 {
        let stats = pool.stats().await.unwrap();
        if stats.session == 0 && stats.provisioning == 0 && stats.recycling == 0 {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("session sandboxes not returned: {:?}", pool.stats().await.unwrap());
}

pub fn has_tool(tool: &str) -> bool {
    std::process::Command::new("sh")
        .arg("-c")
        .arg(format!("command -v {tool}"))
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

pub async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}
