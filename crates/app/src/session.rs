use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use sandbox::{CapabilityRegistry, RemoteSandbox};
use serde::Serialize;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::BrokerError;
use crate::pool::{Lease, SandboxId, SandboxPool};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub language: String,
    pub user_id: String,
    /// Unix seconds.
    pub created_at: u64,
    pub idle_secs: u64,
}

/// A live session as seen by callers running code in it.
pub struct SessionEntry {
    id: String,
    language: String,
    principal: String,
    created_at: u64,
    sandbox_id: SandboxId,
    sandbox: Arc<dyn RemoteSandbox>,
    last_used: Mutex<Instant>,
    run_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl SessionEntry {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn sandbox_id(&self) -> SandboxId {
        self.sandbox_id
    }

    pub fn sandbox(&self) -> &Arc<dyn RemoteSandbox> {
        &self.sandbox
    }

    pub fn touch(&self) {
        *lock(&self.last_used) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        lock(&self.last_used).elapsed()
    }

    /// Waits for earlier runs in this session to finish. Returns `None` once
    /// the session has ended, in which case the sandbox may already belong
    /// to someone else.
    pub async fn begin_run(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        let guard = self.run_lock.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        Some(guard)
    }

    fn is_busy(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            language: self.language.clone(),
            user_id: self.principal.clone(),
            created_at: self.created_at,
            idle_secs: self.idle_for().as_secs(),
        }
    }

    async fn close(&self) {
        let _guard = self.run_lock.lock().await;
        self.closed.store(true, Ordering::Release);
    }
}

struct Binding {
    lease: Lease,
    entry: Arc<SessionEntry>,
}

#[derive(Default)]
struct SessionState {
    sessions: HashMap<String, Binding>,
    by_principal: HashMap<String, BTreeSet<String>>,
}

impl SessionState {
    fn remove(&mut self, session_id: &str) -> Option<Binding> {
        let binding = self.sessions.remove(session_id)?;
        let principal = binding.entry.principal();
        if let Some(ids) = self.by_principal.get_mut(principal) {
            ids.remove(session_id);
            if ids.is_empty() {
                self.by_principal.remove(principal);
            }
        }
        Some(binding)
    }
}

/// Session bookkeeping. Kept apart from the pool task so session lookups
/// never queue behind pool commands.
#[derive(Clone)]
pub struct SessionRegistry {
    pool: SandboxPool,
    capabilities: Arc<CapabilityRegistry>,
    state: Arc<Mutex<SessionState>>,
}

impl SessionRegistry {
    pub fn new(pool: SandboxPool, capabilities: Arc<CapabilityRegistry>) -> Self {
        Self {
            pool,
            capabilities,
            state: Arc::new(Mutex::new(SessionState::default())),
        }
    }

    pub async fn create(&self, language: &str, principal: &str) -> Result<SessionInfo, BrokerError> {
        let principal = principal.trim();
        if principal.is_empty() {
            return Err(BrokerError::invalid("user_id required"));
        }
        let language = self.capabilities.resolve(language)?.name().to_owned();
        let lease = self.pool.acquire(&language).await?;
        let session_id = Uuid::new_v4().to_string();
        let lease = self
            .pool
            .bind_to_session(lease, &session_id, principal)
            .await?;

        let entry = Arc::new(SessionEntry {
            id: session_id.clone(),
            language,
            principal: principal.to_owned(),
            created_at: unix_now(),
            sandbox_id: lease.id(),
            sandbox: lease.sandbox().clone(),
            last_used: Mutex::new(Instant::now()),
            run_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        });
        let info = entry.info();
        {
            let mut state = lock(&self.state);
            state
                .by_principal
                .entry(entry.principal.clone())
                .or_default()
                .insert(session_id.clone());
            state.sessions.insert(session_id, Binding { lease, entry });
        }
        tracing::info!(
            session = %info.session_id,
            language = %info.language,
            user = %info.user_id,
            "session created"
        );
        Ok(info)
    }

    /// Ends a session. Any run already in progress finishes first; the
    /// sandbox is then reset and returned to the pool. Once the record is
    /// removed the sandbox goes back even if this future is dropped.
    pub async fn end(&self, session_id: &str) -> Result<(), BrokerError> {
        let binding = lock(&self.state)
            .remove(session_id)
            .ok_or_else(|| BrokerError::SessionNotFound(session_id.to_owned()))?;
        finish(vec![self.release(binding)]).await;
        tracing::info!(session = %session_id, "session ended");
        Ok(())
    }

    /// Ends a session whose sandbox failed and discards the sandbox instead
    /// of resetting it. Called with the session's run lock held, so queued
    /// runs see the session as gone.
    pub fn retire(&self, session_id: &str) {
        let Some(Binding { lease, entry }) = lock(&self.state).remove(session_id) else {
            return;
        };
        entry.closed.store(true, Ordering::Release);
        tracing::warn!(
            session = %session_id,
            sandbox = %entry.sandbox_id,
            "session retired after sandbox failure"
        );
        self.pool.discard(lease);
    }

    pub fn resolve(&self, session_id: &str) -> Result<Arc<SessionEntry>, BrokerError> {
        let state = lock(&self.state);
        let binding = state
            .sessions
            .get(session_id)
            .ok_or_else(|| BrokerError::SessionNotFound(session_id.to_owned()))?;
        binding.entry.touch();
        Ok(binding.entry.clone())
    }

    pub fn info(&self, session_id: &str) -> Result<SessionInfo, BrokerError> {
        lock(&self.state)
            .sessions
            .get(session_id)
            .map(|binding| binding.entry.info())
            .ok_or_else(|| BrokerError::SessionNotFound(session_id.to_owned()))
    }

    /// Sessions owned by `principal`, oldest first.
    pub fn list(&self, principal: &str) -> Vec<SessionInfo> {
        let state = lock(&self.state);
        let mut sessions: Vec<SessionInfo> = state
            .by_principal
            .get(principal.trim())
            .into_iter()
            .flatten()
            .filter_map(|id| state.sessions.get(id))
            .map(|binding| binding.entry.info())
            .collect();
        sessions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        sessions
    }

    pub fn len(&self) -> usize {
        lock(&self.state).sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ends every session unused for longer than `max_idle`. A session with
    /// a run in progress counts as used.
    pub async fn reap_idle(&self, max_idle: Duration) -> usize {
        let stale: Vec<Binding> = {
            let mut state = lock(&self.state);
            let ids: Vec<String> = state
                .sessions
                .iter()
                .filter(|(_, binding)| {
                    binding.entry.idle_for() > max_idle && !binding.entry.is_busy()
                })
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| state.remove(id)).collect()
        };
        let reaped = stale.len();
        let releases = stale
            .into_iter()
            .map(|binding| {
                tracing::info!(
                    session = %binding.entry.id,
                    idle_secs = binding.entry.idle_for().as_secs(),
                    "reaping idle session"
                );
                self.release(binding)
            })
            .collect();
        finish(releases).await;
        reaped
    }

    pub fn spawn_reaper(&self, max_idle: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        let period = (max_idle / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reaped = registry.reap_idle(max_idle).await;
                if reaped > 0 {
                    tracing::debug!(reaped, "idle sessions reaped");
                }
            }
        })
    }

    pub async fn end_all(&self) -> usize {
        let bindings: Vec<Binding> = {
            let mut state = lock(&self.state);
            state.by_principal.clear();
            state.sessions.drain().map(|(_, binding)| binding).collect()
        };
        let ended = bindings.len();
        let releases = bindings
            .into_iter()
            .map(|binding| self.release(binding))
            .collect();
        finish(releases).await;
        if ended > 0 {
            tracing::info!(ended, "all sessions ended");
        }
        ended
    }

    /// Waits out the session's current run, then unbinds its sandbox. The
    /// work is spawned so it completes even when the caller stops waiting.
    fn release(&self, binding: Binding) -> JoinHandle<()> {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let Binding { lease, entry } = binding;
            entry.close().await;
            pool.unbind_from_session(lease);
        })
    }
}

async fn finish(releases: Vec<JoinHandle<()>>) {
    for release in releases {
        if let Err(err) = release.await {
            tracing::error!(error = %err, "session release task failed");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}
