use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use sandbox::{ProviderError, RemoteSandbox, SandboxProvider};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{self, JoinError, JoinSet};
use uuid::Uuid;

pub type SandboxId = Uuid;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("sandbox capacity exhausted ({capacity} provisioned); retry later")]
    CapacityExhausted { capacity: usize },
    #[error("failed to provision sandbox: {0}")]
    Provision(#[from] ProviderError),
    #[error("sandbox pool is draining")]
    Draining,
    #[error("sandbox pool is unavailable")]
    Closed,
    #[error("sandbox {0} is not held by an ephemeral lease")]
    NotEphemeral(SandboxId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleState {
    Idle,
    ActiveEphemeral,
    ActiveSession,
    /// Being reset after a failed use or a session end. Never acquirable.
    Recycling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub capacity: usize,
}

/// Pool bookkeeping for one provisioned sandbox. Lives in exactly one of the
/// idle, ephemeral or session collections.
struct SandboxHandle {
    id: SandboxId,
    language: String,
    sandbox: Arc<dyn RemoteSandbox>,
    state: HandleState,
    created_at: Instant,
    session_id: Option<String>,
    principal: Option<String>,
}

impl SandboxHandle {
    fn new(language: String, sandbox: Arc<dyn RemoteSandbox>, state: HandleState) -> Self {
        Self {
            id: Uuid::new_v4(),
            language,
            sandbox,
            state,
            created_at: Instant::now(),
            session_id: None,
            principal: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseMode {
    Ephemeral,
    Session,
}

/// Caller-side ownership of an acquired sandbox.
///
/// Dropping a lease without handing it back releases it as failed (or
/// unbinds it, for a session lease), so the sandbox is reset before anyone
/// else can acquire it.
pub struct Lease {
    id: SandboxId,
    language: String,
    sandbox: Arc<dyn RemoteSandbox>,
    mode: LeaseMode,
    pool: mpsc::UnboundedSender<PoolCommand>,
    armed: bool,
}

impl Lease {
    pub fn id(&self) -> SandboxId {
        self.id
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn sandbox(&self) -> &Arc<dyn RemoteSandbox> {
        &self.sandbox
    }

    pub fn is_session(&self) -> bool {
        self.mode == LeaseMode::Session
    }

    fn disarm(mut self) -> SandboxId {
        self.armed = false;
        self.id
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("language", &self.language)
            .field("mode", &self.mode)
            .field("remote", &self.sandbox.id())
            .finish_non_exhaustive()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let command = match self.mode {
            LeaseMode::Ephemeral => PoolCommand::Release {
                id: self.id,
                outcome_ok: false,
            },
            LeaseMode::Session => PoolCommand::Unbind { id: self.id },
        };
        let _ = self.pool.send(command);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub idle: BTreeMap<String, usize>,
    pub ephemeral: usize,
    pub session: usize,
    pub provisioning: usize,
    pub recycling: usize,
    pub total: usize,
    pub hits: u64,
    pub misses: u64,
    pub created: u64,
    pub discarded: u64,
    pub provision_failures: u64,
    pub draining: bool,
}

impl PoolStats {
    pub fn idle_for(&self, language: &str) -> usize {
        self.idle.get(language).copied().unwrap_or(0)
    }

    pub fn idle_total(&self) -> usize {
        self.idle.values().sum()
    }
}

enum PoolCommand {
    Acquire {
        language: String,
        respond_to: oneshot::Sender<Result<Lease, PoolError>>,
    },
    Provision {
        language: String,
        respond_to: oneshot::Sender<Result<SandboxId, PoolError>>,
    },
    Release {
        id: SandboxId,
        outcome_ok: bool,
    },
    Discard {
        id: SandboxId,
    },
    Bind {
        id: SandboxId,
        session_id: String,
        principal: String,
        respond_to: oneshot::Sender<Result<(), PoolError>>,
    },
    Unbind {
        id: SandboxId,
    },
    Stats {
        respond_to: oneshot::Sender<PoolStats>,
    },
    Drain {
        respond_to: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the pool task, which is the only place pool state is
/// mutated.
#[derive(Clone)]
pub struct SandboxPool {
    sender: mpsc::UnboundedSender<PoolCommand>,
    capacity: usize,
}

impl SandboxPool {
    /// Spawns the pool task on the current tokio runtime.
    pub fn spawn(provider: Arc<dyn SandboxProvider>, config: PoolConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let actor = PoolActor::new(provider, config.capacity, sender.downgrade());
        tokio::spawn(actor.run(receiver));
        tracing::info!(capacity = config.capacity, "sandbox pool started");
        Self {
            sender,
            capacity: config.capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Takes an idle sandbox for `language`, or provisions one if the pool is
    /// under capacity. Fails fast when it is not.
    pub async fn acquire(&self, language: &str) -> Result<Lease, PoolError> {
        let (respond_to, response) = oneshot::channel();
        self.send(PoolCommand::Acquire {
            language: language.to_owned(),
            respond_to,
        })?;
        response.await.map_err(|_| PoolError::Closed)?
    }

    /// Provisions one sandbox and parks it idle.
    pub async fn provision(&self, language: &str) -> Result<SandboxId, PoolError> {
        let (respond_to, response) = oneshot::channel();
        self.send(PoolCommand::Provision {
            language: language.to_owned(),
            respond_to,
        })?;
        response.await.map_err(|_| PoolError::Closed)?
    }

    /// Provisions up to `count` idle sandboxes, stopping at the first failure.
    pub async fn warm(&self, language: &str, count: usize) -> usize {
        let mut created = 0;
        for _ in 0..count {
            match self.provision(language).await {
                Ok(_) => created += 1,
                Err(err) => {
                    tracing::warn!(language, error = %err, "pool warm-up stopped early");
                    break;
                }
            }
        }
        tracing::info!(language, created, requested = count, "pool warmed");
        created
    }

    /// Hands an ephemeral lease back. A failed use is reset before the
    /// sandbox becomes acquirable again; the caller does not wait for it.
    pub fn release(&self, lease: Lease, outcome_ok: bool) {
        if lease.is_session() {
            self.unbind_from_session(lease);
            return;
        }
        let id = lease.disarm();
        let _ = self.send(PoolCommand::Release { id, outcome_ok });
    }

    /// Destroys the sandbox without attempting a reset.
    pub fn discard(&self, lease: Lease) {
        let id = lease.disarm();
        let _ = self.send(PoolCommand::Discard { id });
    }

    pub async fn bind_to_session(
        &self,
        lease: Lease,
        session_id: &str,
        principal: &str,
    ) -> Result<Lease, PoolError> {
        let (respond_to, response) = oneshot::channel();
        self.send(PoolCommand::Bind {
            id: lease.id,
            session_id: session_id.to_owned(),
            principal: principal.to_owned(),
            respond_to,
        })?;
        response.await.map_err(|_| PoolError::Closed)??;
        let mut lease = lease;
        lease.mode = LeaseMode::Session;
        Ok(lease)
    }

    /// Returns a session sandbox to rotation. It is always reset first.
    pub fn unbind_from_session(&self, lease: Lease) {
        let id = lease.disarm();
        let _ = self.send(PoolCommand::Unbind { id });
    }

    pub async fn stats(&self) -> Result<PoolStats, PoolError> {
        let (respond_to, response) = oneshot::channel();
        self.send(PoolCommand::Stats { respond_to })?;
        response.await.map_err(|_| PoolError::Closed)
    }

    /// Destroys every sandbox and waits for background work to finish.
    /// Later acquisitions fail with [`PoolError::Draining`].
    pub async fn drain(&self) {
        let (respond_to, response) = oneshot::channel();
        if self.send(PoolCommand::Drain { respond_to }).is_ok() {
            let _ = response.await;
        }
    }

    fn send(&self, command: PoolCommand) -> Result<(), PoolError> {
        self.sender.send(command).map_err(|_| PoolError::Closed)
    }
}

enum Waiter {
    Acquire(oneshot::Sender<Result<Lease, PoolError>>),
    Provision(oneshot::Sender<Result<SandboxId, PoolError>>),
}

impl Waiter {
    fn fail(self, err: PoolError) {
        match self {
            Waiter::Acquire(respond_to) => {
                let _ = respond_to.send(Err(err));
            }
            Waiter::Provision(respond_to) => {
                let _ = respond_to.send(Err(err));
            }
        }
    }
}

enum Completion {
    Provisioned {
        language: String,
        result: Result<Arc<dyn RemoteSandbox>, ProviderError>,
        waiter: Waiter,
        started: Instant,
    },
    Recycled {
        id: SandboxId,
        result: Result<(), ProviderError>,
    },
    Destroyed {
        id: SandboxId,
        remote_id: String,
        result: Result<(), ProviderError>,
    },
}

/// What a background task was doing, kept outside the task so the pool can
/// roll back its bookkeeping if the task panics.
#[derive(Debug, Clone, Copy)]
enum Job {
    Provision,
    Reset(SandboxId),
    Destroy(SandboxId),
}

#[derive(Default)]
struct Counters {
    hits: u64,
    misses: u64,
    created: u64,
    discarded: u64,
    provision_failures: u64,
}

struct PoolActor {
    provider: Arc<dyn SandboxProvider>,
    capacity: usize,
    sender: mpsc::WeakUnboundedSender<PoolCommand>,
    idle: HashMap<String, VecDeque<SandboxHandle>>,
    ephemeral: HashMap<SandboxId, SandboxHandle>,
    session: HashMap<SandboxId, SandboxHandle>,
    provisioning: usize,
    tasks: JoinSet<Completion>,
    jobs: HashMap<task::Id, Job>,
    counters: Counters,
    draining: bool,
    drain_waiters: Vec<oneshot::Sender<()>>,
}

impl PoolActor {
    fn new(
        provider: Arc<dyn SandboxProvider>,
        capacity: usize,
        sender: mpsc::WeakUnboundedSender<PoolCommand>,
    ) -> Self {
        Self {
            provider,
            capacity,
            sender,
            idle: HashMap::new(),
            ephemeral: HashMap::new(),
            session: HashMap::new(),
            provisioning: 0,
            tasks: JoinSet::new(),
            jobs: HashMap::new(),
            counters: Counters::default(),
            draining: false,
            drain_waiters: Vec::new(),
        }
    }

    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<PoolCommand>) {
        loop {
            tokio::select! {
                command = receiver.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                Some(joined) = self.tasks.join_next_with_id(), if !self.tasks.is_empty() => {
                    self.complete(joined);
                }
            }
        }

        self.begin_drain();
        while let Some(joined) = self.tasks.join_next_with_id().await {
            self.complete(joined);
        }
        tracing::info!("sandbox pool stopped");
    }

    fn spawn<F>(&mut self, job: Job, work: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let task = self.tasks.spawn(work);
        self.jobs.insert(task.id(), job);
    }

    fn total(&self) -> usize {
        self.idle.values().map(VecDeque::len).sum::<usize>()
            + self.ephemeral.len()
            + self.session.len()
            + self.provisioning
    }

    fn handle(&mut self, command: PoolCommand) {
        match command {
            PoolCommand::Acquire {
                language,
                respond_to,
            } => self.acquire(language, respond_to),
            PoolCommand::Provision {
                language,
                respond_to,
            } => {
                if let Err(waiter) = self.reserve(language, Waiter::Provision(respond_to)) {
                    waiter.fail(self.refusal());
                }
            }
            PoolCommand::Release { id, outcome_ok } => self.release(id, outcome_ok),
            PoolCommand::Discard { id } => {
                let handle = self.ephemeral.remove(&id).or_else(|| self.session.remove(&id));
                match handle {
                    Some(handle) => self.discard(handle, "discarded by caller"),
                    None => tracing::debug!(sandbox = %id, "discard for unknown sandbox"),
                }
            }
            PoolCommand::Bind {
                id,
                session_id,
                principal,
                respond_to,
            } => {
                let _ = respond_to.send(self.bind(id, session_id, principal));
            }
            PoolCommand::Unbind { id } => self.unbind(id),
            PoolCommand::Stats { respond_to } => {
                let _ = respond_to.send(self.stats());
            }
            PoolCommand::Drain { respond_to } => {
                self.begin_drain();
                self.drain_waiters.push(respond_to);
                self.notify_drained();
            }
        }
    }

    fn refusal(&self) -> PoolError {
        if self.draining {
            PoolError::Draining
        } else {
            PoolError::CapacityExhausted {
                capacity: self.capacity,
            }
        }
    }

    fn acquire(&mut self, language: String, respond_to: oneshot::Sender<Result<Lease, PoolError>>) {
        if self.draining {
            let _ = respond_to.send(Err(PoolError::Draining));
            return;
        }
        let idle = self.idle.get_mut(&language).and_then(VecDeque::pop_front);
        if let Some(handle) = idle {
            self.counters.hits += 1;
            self.hand_out(handle, respond_to);
            return;
        }
        match self.reserve(language, Waiter::Acquire(respond_to)) {
            Ok(()) => self.counters.misses += 1,
            Err(waiter) => waiter.fail(self.refusal()),
        }
    }

    /// Claims a capacity slot and provisions in the background. The slot is
    /// counted from this point on, so concurrent requests see it.
    fn reserve(&mut self, language: String, waiter: Waiter) -> Result<(), Waiter> {
        if self.draining || self.total() >= self.capacity {
            return Err(waiter);
        }
        self.provisioning += 1;
        let provider = self.provider.clone();
        self.spawn(Job::Provision, async move {
            let started = Instant::now();
            let result = provider.create(&language).await;
            Completion::Provisioned {
                language,
                result,
                waiter,
                started,
            }
        });
        Ok(())
    }

    fn hand_out(
        &mut self,
        mut handle: SandboxHandle,
        respond_to: oneshot::Sender<Result<Lease, PoolError>>,
    ) {
        let Some(pool) = self.sender.upgrade() else {
            self.park_idle(handle);
            let _ = respond_to.send(Err(PoolError::Closed));
            return;
        };
        handle.state = HandleState::ActiveEphemeral;
        let lease = Lease {
            id: handle.id,
            language: handle.language.clone(),
            sandbox: handle.sandbox.clone(),
            mode: LeaseMode::Ephemeral,
            pool,
            armed: true,
        };
        tracing::debug!(sandbox = %handle.id, language = %handle.language, "sandbox acquired");
        let id = handle.id;
        self.ephemeral.insert(id, handle);
        if let Err(Ok(lease)) = respond_to.send(Ok(lease)) {
            // The caller went away before receiving it; the sandbox was never used.
            lease.disarm();
            if let Some(handle) = self.ephemeral.remove(&id) {
                self.park_idle(handle);
            }
        }
    }

    fn park_idle(&mut self, mut handle: SandboxHandle) {
        handle.state = HandleState::Idle;
        handle.session_id = None;
        handle.principal = None;
        self.idle
            .entry(handle.language.clone())
            .or_default()
            .push_back(handle);
    }

    fn release(&mut self, id: SandboxId, outcome_ok: bool) {
        if let Some(handle) = self.ephemeral.remove(&id) {
            if self.draining {
                self.discard(handle, "released while draining");
            } else if outcome_ok {
                tracing::debug!(sandbox = %id, "sandbox returned to idle");
                self.park_idle(handle);
            } else {
                self.recycle(handle, false);
            }
            return;
        }
        if self.session.contains_key(&id) {
            // An ephemeral lease was dropped after its bind went through.
            self.unbind(id);
            return;
        }
        tracing::debug!(sandbox = %id, "release for unknown sandbox");
    }

    fn recycle(&mut self, mut handle: SandboxHandle, bound: bool) {
        handle.state = HandleState::Recycling;
        let id = handle.id;
        let sandbox = handle.sandbox.clone();
        if bound {
            self.session.insert(id, handle);
        } else {
            self.ephemeral.insert(id, handle);
        }
        tracing::debug!(sandbox = %id, "sandbox resetting");
        self.spawn(Job::Reset(id), async move {
            let result = sandbox.reset().await;
            Completion::Recycled { id, result }
        });
    }

    fn bind(
        &mut self,
        id: SandboxId,
        session_id: String,
        principal: String,
    ) -> Result<(), PoolError> {
        if self.draining {
            return Err(PoolError::Draining);
        }
        let Some(mut handle) = self.ephemeral.remove(&id) else {
            return Err(PoolError::NotEphemeral(id));
        };
        if handle.state != HandleState::ActiveEphemeral {
            self.ephemeral.insert(id, handle);
            return Err(PoolError::NotEphemeral(id));
        }
        tracing::debug!(sandbox = %id, session = %session_id, "sandbox bound to session");
        handle.state = HandleState::ActiveSession;
        handle.session_id = Some(session_id);
        handle.principal = Some(principal);
        self.session.insert(id, handle);
        Ok(())
    }

    fn unbind(&mut self, id: SandboxId) {
        let Some(handle) = self.session.remove(&id) else {
            tracing::debug!(sandbox = %id, "unbind for unknown sandbox");
            return;
        };
        if handle.state == HandleState::Recycling {
            self.session.insert(id, handle);
            return;
        }
        tracing::debug!(
            sandbox = %id,
            session = handle.session_id.as_deref().unwrap_or_default(),
            principal = handle.principal.as_deref().unwrap_or_default(),
            "sandbox unbound from session"
        );
        if self.draining {
            self.discard(handle, "unbound while draining");
        } else {
            self.recycle(handle, true);
        }
    }

    fn discard(&mut self, handle: SandboxHandle, reason: &str) {
        self.counters.discarded += 1;
        tracing::info!(
            sandbox = %handle.id,
            remote = handle.sandbox.id(),
            language = %handle.language,
            age_ms = handle.created_at.elapsed().as_millis() as u64,
            reason,
            "discarding sandbox"
        );
        let id = handle.id;
        let sandbox = handle.sandbox;
        self.spawn(Job::Destroy(id), async move {
            let result = sandbox.destroy().await;
            Completion::Destroyed {
                id,
                remote_id: sandbox.id().to_owned(),
                result,
            }
        });
    }

    fn complete(&mut self, joined: Result<(task::Id, Completion), JoinError>) {
        let completion = match joined {
            Ok((task_id, completion)) => {
                self.jobs.remove(&task_id);
                completion
            }
            Err(err) => {
                let job = self.jobs.remove(&err.id());
                self.abandoned(job, &err);
                self.notify_drained();
                return;
            }
        };
        match completion {
            Completion::Provisioned {
                language,
                result,
                waiter,
                started,
            } => {
                self.provisioning -= 1;
                self.provisioned(language, result, waiter, started);
            }
            Completion::Recycled { id, result } => self.recycled(id, result),
            Completion::Destroyed {
                id,
                remote_id,
                result,
            } => {
                if let Err(err) = result {
                    tracing::warn!(sandbox = %id, remote = %remote_id, error = %err, "sandbox destroy failed");
                }
            }
        }
        self.notify_drained();
    }

    /// Undoes the bookkeeping of a task that panicked or was cancelled.
    fn abandoned(&mut self, job: Option<Job>, err: &JoinError) {
        tracing::error!(job = ?job, error = %err, "pool background task failed");
        match job {
            Some(Job::Provision) => {
                self.provisioning = self.provisioning.saturating_sub(1);
                self.counters.provision_failures += 1;
            }
            Some(Job::Reset(id)) => {
                let handle = self.ephemeral.remove(&id).or_else(|| self.session.remove(&id));
                if let Some(handle) = handle {
                    self.discard(handle, "reset did not finish");
                }
            }
            Some(Job::Destroy(_)) | None => {}
        }
    }

    fn provisioned(
        &mut self,
        language: String,
        result: Result<Arc<dyn RemoteSandbox>, ProviderError>,
        waiter: Waiter,
        started: Instant,
    ) {
        let sandbox = match result {
            Ok(sandbox) => sandbox,
            Err(err) => {
                self.counters.provision_failures += 1;
                tracing::warn!(language = %language, error = %err, "sandbox provisioning failed");
                waiter.fail(PoolError::Provision(err));
                return;
            }
        };
        self.counters.created += 1;
        tracing::info!(
            language = %language,
            remote = sandbox.id(),
            provider = self.provider.name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sandbox provisioned"
        );
        let handle = SandboxHandle::new(language, sandbox, HandleState::Idle);
        if self.draining {
            self.discard(handle, "provisioned while draining");
            waiter.fail(PoolError::Draining);
            return;
        }
        match waiter {
            Waiter::Acquire(respond_to) => self.hand_out(handle, respond_to),
            Waiter::Provision(respond_to) => {
                let id = handle.id;
                self.park_idle(handle);
                let _ = respond_to.send(Ok(id));
            }
        }
    }

    fn recycled(&mut self, id: SandboxId, result: Result<(), ProviderError>) {
        let handle = self.ephemeral.remove(&id).or_else(|| self.session.remove(&id));
        let Some(handle) = handle else {
            return;
        };
        match result {
            Ok(()) if !self.draining => {
                tracing::debug!(sandbox = %id, "sandbox reset and returned to idle");
                self.park_idle(handle);
            }
            Ok(()) => self.discard(handle, "reset finished while draining"),
            Err(err) => {
                tracing::warn!(sandbox = %id, error = %err, "sandbox reset failed");
                self.discard(handle, "reset failed");
            }
        }
    }

    fn begin_drain(&mut self) {
        if !self.draining {
            tracing::info!(total = self.total(), "draining sandbox pool");
        }
        self.draining = true;
        let idle: Vec<SandboxHandle> = self
            .idle
            .drain()
            .flat_map(|(_, handles)| handles)
            .collect();
        let ephemeral: Vec<SandboxHandle> = self.ephemeral.drain().map(|(_, h)| h).collect();
        let session: Vec<SandboxHandle> = self.session.drain().map(|(_, h)| h).collect();
        for handle in idle.into_iter().chain(ephemeral).chain(session) {
            self.discard(handle, "pool drained");
        }
    }

    fn notify_drained(&mut self) {
        if self.draining && self.tasks.is_empty() {
            for waiter in self.drain_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    fn stats(&self) -> PoolStats {
        let idle = self
            .idle
            .iter()
            .filter(|(_, handles)| !handles.is_empty())
            .map(|(language, handles)| (language.clone(), handles.len()))
            .collect();
        let recycling = self
            .ephemeral
            .values()
            .chain(self.session.values())
            .filter(|handle| handle.state == HandleState::Recycling)
            .count();
        PoolStats {
            capacity: self.capacity,
            idle,
            ephemeral: self.ephemeral.len(),
            session: self.session.len(),
            provisioning: self.provisioning,
            recycling,
            total: self.total(),
            hits: self.counters.hits,
            misses: self.counters.misses,
            created: self.counters.created,
            discarded: self.counters.discarded,
            provision_failures: self.counters.provision_failures,
            draining: self.draining,
        }
    }
}
