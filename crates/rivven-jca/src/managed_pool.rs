//! Per-key sub-pool
//!
//! A [`ManagedConnectionPool`] bounds, reuses, validates and recycles the
//! managed connections of one [`PoolKey`]. Capacity is a counting semaphore
//! sized to `max_size`: a caller holds one permit for as long as it has a
//! connection checked out, and fill tasks hold one while they create.
//!
//! ```text
//!   get ──► permit ──► idle.pop_back() ──► match / validate ──► InUse
//!                          │ none
//!                          └──► factory.create ──► InUse ──► prefill, capacity request
//!
//!   return ──► cleanup ──► idle.push_back()      (release permit)
//!                 └─ kill / flushed / over max ──► destroy (release permit)
//! ```
//!
//! Idle reuse is LIFO (back of the deque); the idle sweep inspects the front,
//! where the longest-unused connections collect. The entry lock is a
//! `parking_lot` mutex and is never held across an `.await`.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, trace, warn};

use crate::capacity::Capacity;
use crate::config::PoolConfiguration;
use crate::connection::{
    same_connection, ConnectionRequestInfo, ManagedConnectionFactory, Subject,
};
use crate::error::{Error, Result};
use crate::listener::{ConnectionListener, ListenerState};
use crate::scheduler::{next_owner_id, Scheduler};
use crate::stats::{ManagedConnectionPoolStatistics, PoolStatistics};
use crate::strategy::PoolKey;

/// Scope of a sub-pool flush
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlushMode {
    /// Destroy idle connections
    Idle,
    /// Destroy idle connections that fail validation
    Invalid,
    /// Destroy idle connections now and in-use ones when returned
    Gracefully,
    /// Destroy idle connections now and detach in-use ones
    All,
}

/// Capacity permit held by a checked-out connection or a fill task
pub struct Permit {
    inner: Option<OwnedSemaphorePermit>,
    released: Arc<Notify>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        drop(self.inner.take());
        self.released.notify_waiters();
    }
}

impl fmt::Debug for Permit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit").finish_non_exhaustive()
    }
}

/// Notified when a sub-pool has no connections left
#[async_trait]
pub(crate) trait SubPoolOwner: Send + Sync {
    async fn sub_pool_emptied(&self, pool: &Arc<ManagedConnectionPool>);
}

/// Everything a sub-pool borrows from the pool that owns it
#[derive(Clone)]
pub(crate) struct SubPoolContext {
    pub(crate) pool_name: String,
    pub(crate) config: Arc<PoolConfiguration>,
    pub(crate) capacity: Capacity,
    pub(crate) factory: Arc<dyn ManagedConnectionFactory>,
    pub(crate) statistics: Arc<PoolStatistics>,
    pub(crate) scheduler: Scheduler,
    pub(crate) owner: Weak<dyn SubPoolOwner>,
    pub(crate) supports_prefill: bool,
    pub(crate) reauthenticate: bool,
    pub(crate) fill_subject: Option<Subject>,
    pub(crate) fill_cri: Option<ConnectionRequestInfo>,
}

#[derive(Default)]
struct PoolState {
    /// Back is the most recently returned connection
    idle: VecDeque<Arc<ConnectionListener>>,
    checked_out: HashMap<u64, Arc<ConnectionListener>>,
    /// Taken out of the idle set by background validation; not in use
    validating: HashMap<u64, Arc<ConnectionListener>>,
    /// Creations in flight
    pending: usize,
}

impl PoolState {
    fn active(&self) -> usize {
        self.idle.len() + self.checked_out.len() + self.validating.len()
    }

    fn idle(&self) -> usize {
        self.idle.len() + self.validating.len()
    }
}

/// `None` when `timeout` reaches past the end of the clock
fn deadline_after(timeout: Duration) -> Option<tokio::time::Instant> {
    tokio::time::Instant::now().checked_add(timeout)
}

/// Await `fut` until `deadline`, or forever without one
async fn until<F: std::future::Future>(
    deadline: Option<tokio::time::Instant>,
    fut: F,
) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

enum Wait {
    Acquired(OwnedSemaphorePermit),
    TimedOut,
    Closed,
}

enum Grow {
    Created,
    Full,
    Failed,
}

/// Decrements the in-flight fill count when the fill task ends or is cancelled
struct FillGuard(Arc<ManagedConnectionPool>);

impl FillGuard {
    fn new(pool: Arc<ManagedConnectionPool>) -> Self {
        pool.filling.fetch_add(1, Ordering::AcqRel);
        Self(pool)
    }
}

impl Drop for FillGuard {
    fn drop(&mut self) {
        self.0.filling.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Bounded set of managed connections for one partition key
pub struct ManagedConnectionPool {
    id: u64,
    key: PoolKey,
    pool_name: String,
    config: Arc<PoolConfiguration>,
    capacity: Capacity,
    factory: Arc<dyn ManagedConnectionFactory>,
    scheduler: Scheduler,
    owner: Weak<dyn SubPoolOwner>,
    fill_enabled: bool,
    reauthenticate: bool,
    fill_subject: Option<Subject>,
    fill_cri: Option<ConnectionRequestInfo>,
    semaphore: Arc<Semaphore>,
    released: Arc<Notify>,
    state: Mutex<PoolState>,
    last_idle_check: Mutex<Option<Instant>>,
    statistics: ManagedConnectionPoolStatistics,
    filling: AtomicUsize,
    shutdown: AtomicBool,
    self_ref: Weak<Self>,
}

impl ManagedConnectionPool {
    pub(crate) fn new(key: PoolKey, ctx: &SubPoolContext) -> Arc<Self> {
        let config = ctx.config.clone();
        let fill_enabled = (config.prefill || config.strict_min) && ctx.supports_prefill;
        Arc::new_cyclic(|self_ref| Self {
            id: next_owner_id(),
            fill_subject: key.subject().cloned().or_else(|| ctx.fill_subject.clone()),
            fill_cri: key.cri().cloned().or_else(|| ctx.fill_cri.clone()),
            key,
            pool_name: ctx.pool_name.clone(),
            capacity: ctx.capacity.clone(),
            factory: ctx.factory.clone(),
            scheduler: ctx.scheduler.clone(),
            owner: ctx.owner.clone(),
            fill_enabled,
            reauthenticate: ctx.reauthenticate,
            semaphore: Arc::new(Semaphore::new(config.max_size)),
            released: Arc::new(Notify::new()),
            state: Mutex::new(PoolState::default()),
            last_idle_check: Mutex::new(None),
            statistics: ManagedConnectionPoolStatistics::new(
                ctx.statistics.clone(),
                config.max_size,
            ),
            filling: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            self_ref: self_ref.clone(),
            config,
        })
    }

    /// Register background tasks and run the initial fill
    pub(crate) fn start(self: &Arc<Self>, initial_fill: usize) {
        self.scheduler.register(self.id);
        if !self.config.idle_timeout.is_zero() {
            let weak = Arc::downgrade(self);
            self.scheduler
                .schedule_periodic(self.id, self.sweep_interval(), move || {
                    weak.upgrade().map(|pool| async move {
                        pool.remove_idle_connections().await;
                    })
                });
        }
        if self.config.background_validation {
            let weak = Arc::downgrade(self);
            self.scheduler.schedule_periodic(
                self.id,
                self.config.background_validation_interval,
                move || {
                    weak.upgrade().map(|pool| async move {
                        pool.validate_connections().await;
                    })
                },
            );
        }
        if self.fill_enabled && self.config.prefill && initial_fill > 0 {
            self.submit_fill(initial_fill);
        }
    }

    /// Partition key
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Sub-pool statistics
    pub fn statistics(&self) -> &ManagedConnectionPoolStatistics {
        &self.statistics
    }

    /// Connections owned by the sub-pool
    pub fn active_count(&self) -> usize {
        self.state.lock().active()
    }

    /// Idle connections, including those under background validation
    pub fn idle_count(&self) -> usize {
        self.state.lock().idle()
    }

    /// Connections checked out
    pub fn in_use_count(&self) -> usize {
        self.state.lock().checked_out.len()
    }

    /// Permits not held by a caller or fill task
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// No connections and none being created
    pub fn is_empty(&self) -> bool {
        let state = self.state.lock();
        state.active() == 0 && state.pending == 0
    }

    /// Every permit is taken
    pub fn is_full(&self) -> bool {
        self.semaphore.available_permits() == 0
    }

    /// A fill task is scheduled or running
    pub fn is_filling(&self) -> bool {
        self.filling.load(Ordering::Acquire) > 0
    }

    /// Whether the sub-pool keeps itself filled to `min_size`
    pub fn is_prefill_enabled(&self) -> bool {
        self.fill_enabled
    }

    /// Whether the sub-pool was shut down or retired
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// One-line summary for debug output
    pub fn dump_state(&self) -> String {
        let state = self.state.lock();
        format!(
            "[InUse:{}/Idle:{}/Max:{}]",
            state.checked_out.len(),
            state.idle(),
            self.config.max_size
        )
    }

    fn sweep_interval(&self) -> Duration {
        self.config.idle_timeout / 2
    }

    /// Caller must hold the state lock.
    fn sync_gauges(&self, state: &PoolState) {
        if !self.is_shutdown() {
            self.statistics
                .set_gauges(state.active(), state.checked_out.len(), state.idle());
        }
    }

    fn wrap(&self, permit: OwnedSemaphorePermit) -> Permit {
        Permit {
            inner: Some(permit),
            released: self.released.clone(),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shutdown() {
            Err(Error::shutdown(&self.pool_name))
        } else {
            Ok(())
        }
    }

    async fn wait_unfair(&self, deadline: Option<tokio::time::Instant>) -> Wait {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => return Wait::Acquired(permit),
                Err(TryAcquireError::Closed) => return Wait::Closed,
                Err(TryAcquireError::NoPermits) => {}
            }
            if until(deadline, notified).await.is_none() {
                return Wait::TimedOut;
            }
        }
    }

    /// Acquire a permit within the blocking timeout. `record` counts caller waits.
    async fn acquire_permit(&self, record: bool) -> Result<Permit> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => return Ok(self.wrap(permit)),
            Err(TryAcquireError::Closed) => return Err(Error::shutdown(&self.pool_name)),
            Err(TryAcquireError::NoPermits) => {}
        }

        if record {
            self.statistics.record_wait();
        }
        let started = Instant::now();
        let deadline = deadline_after(self.config.blocking_timeout);
        let wait = if self.config.fair {
            match until(deadline, self.semaphore.clone().acquire_owned()).await {
                Some(Ok(permit)) => Wait::Acquired(permit),
                Some(Err(_)) => Wait::Closed,
                None => Wait::TimedOut,
            }
        } else {
            self.wait_unfair(deadline).await
        };

        let waited = started.elapsed();
        if record {
            self.statistics.record_blocking_time(waited);
        }
        match wait {
            Wait::Acquired(permit) => Ok(self.wrap(permit)),
            Wait::Closed => Err(Error::shutdown(&self.pool_name)),
            Wait::TimedOut => {
                if record {
                    self.statistics.record_blocking_failure();
                }
                debug!(
                    pool = %self.pool_name,
                    key = %self.key,
                    waited_ms = waited.as_millis() as u64,
                    "blocking timeout"
                );
                Err(Error::timeout(&self.pool_name, self.key.to_string(), waited))
            }
        }
    }

    /// Obtain a connection for the caller.
    ///
    /// Reuses the most recently returned idle connection that matches, or
    /// creates a new one. The returned listener holds a capacity permit until
    /// it is returned.
    pub async fn get_connection(
        &self,
        subject: Option<&Subject>,
        cri: Option<&ConnectionRequestInfo>,
    ) -> Result<Arc<ConnectionListener>> {
        self.ensure_running()?;
        let started = Instant::now();
        let mut permit = self.acquire_permit(true).await?;

        loop {
            let candidate = {
                let mut state = self.state.lock();
                let candidate = state.idle.pop_back();
                if let Some(cl) = &candidate {
                    cl.set_state(ListenerState::InUse);
                    state.checked_out.insert(cl.id(), cl.clone());
                    self.sync_gauges(&state);
                }
                candidate
            };
            let Some(cl) = candidate else { break };

            match self.prepare_candidate(&cl, subject, cri).await {
                Ok(true) => match self.claim(&cl, permit) {
                    Ok(()) => {
                        cl.set_subject(subject.cloned());
                        self.statistics.record_get(started.elapsed());
                        trace!(pool = %self.pool_name, listener = cl.id(), "reused idle connection");
                        return Ok(cl);
                    }
                    // Flushed while matching
                    Err(returned) => permit = returned,
                },
                Ok(false) => {
                    debug!(pool = %self.pool_name, listener = cl.id(), "idle connection rejected");
                }
                Err(e) => {
                    warn!(pool = %self.pool_name, listener = cl.id(), error = %e, "unable to match idle connection");
                }
            }
            self.remove_and_destroy(&cl).await;
            if self.config.use_fast_fail {
                debug!(pool = %self.pool_name, "fast fail, creating a new connection");
                break;
            }
        }

        let cl = self.create_checked_out(subject, cri, permit).await?;
        self.statistics.record_get(started.elapsed());
        self.prefill();
        self.increase_capacity(subject, cri);
        Ok(cl)
    }

    /// `Ok(false)` rejects the candidate; `Err` is a failed lookup.
    async fn prepare_candidate(
        &self,
        cl: &Arc<ConnectionListener>,
        subject: Option<&Subject>,
        cri: Option<&ConnectionRequestInfo>,
    ) -> Result<bool> {
        let mc = cl.managed_connection();
        if self.reauthenticate && cl.subject().as_ref() != subject {
            mc.reauthenticate(subject, cri).await?;
            cl.set_subject(subject.cloned());
        }

        let matched = self
            .factory
            .match_managed_connection(std::slice::from_ref(mc), subject, cri)
            .await?;
        if !matched.is_some_and(|m| same_connection(&m, mc)) {
            return Ok(false);
        }

        if self.config.validate_on_match && !self.factory.is_valid(mc).await {
            return Ok(false);
        }
        Ok(true)
    }

    /// Hand the permit to a candidate that is still checked out and unflushed
    fn claim(&self, cl: &Arc<ConnectionListener>, permit: Permit) -> std::result::Result<(), Permit> {
        let state = self.state.lock();
        if cl.state() == ListenerState::InUse && state.checked_out.contains_key(&cl.id()) {
            cl.attach_permit(permit);
            Ok(())
        } else {
            Err(permit)
        }
    }

    async fn create_checked_out(
        &self,
        subject: Option<&Subject>,
        cri: Option<&ConnectionRequestInfo>,
        permit: Permit,
    ) -> Result<Arc<ConnectionListener>> {
        self.state.lock().pending += 1;
        let started = Instant::now();
        let result = self.factory.create_managed_connection(subject, cri).await;

        let rejected = {
            let mut state = self.state.lock();
            state.pending -= 1;
            match result {
                Err(e) => {
                    drop(state);
                    drop(permit);
                    warn!(pool = %self.pool_name, key = %self.key, error = %e, "unable to create connection");
                    return Err(e);
                }
                Ok(mc) => {
                    self.statistics.record_created(started.elapsed());
                    let cl = Arc::new(ConnectionListener::new(
                        mc,
                        self.self_ref.clone(),
                        subject.cloned(),
                    ));
                    if self.is_shutdown() {
                        cl
                    } else {
                        cl.set_state(ListenerState::InUse);
                        cl.attach_permit(permit);
                        state.checked_out.insert(cl.id(), cl.clone());
                        self.sync_gauges(&state);
                        trace!(pool = %self.pool_name, listener = cl.id(), "created connection");
                        return Ok(cl);
                    }
                }
            }
        };

        self.destroy_listener(&rejected).await;
        Err(Error::shutdown(&self.pool_name))
    }

    /// Return a connection. `kill` destroys it instead of pooling it.
    ///
    /// Returning a listener that is already idle or destroyed is a no-op; its
    /// permit can never be released twice.
    pub async fn return_connection(&self, cl: &Arc<ConnectionListener>, kill: bool) {
        match cl.state() {
            ListenerState::Destroyed => {
                drop(cl.take_permit());
                trace!(pool = %self.pool_name, listener = cl.id(), "returned destroyed connection");
                return;
            }
            ListenerState::Idle => {
                warn!(pool = %self.pool_name, listener = cl.id(), "connection returned twice");
                return;
            }
            ListenerState::InUse | ListenerState::Destroy => {}
        }

        let mut kill = kill || cl.state() == ListenerState::Destroy;
        if !kill {
            if let Err(e) = cl.managed_connection().cleanup().await {
                warn!(pool = %self.pool_name, listener = cl.id(), error = %e, "cleanup failed, destroying connection");
                kill = true;
            }
        }
        if !kill
            && self.config.validate_on_return
            && !self.factory.is_valid(cl.managed_connection()).await
        {
            debug!(pool = %self.pool_name, listener = cl.id(), "invalid on return");
            kill = true;
        }

        let (destroy, permit) = {
            let mut state = self.state.lock();
            if matches!(cl.state(), ListenerState::Idle | ListenerState::Destroyed) {
                warn!(pool = %self.pool_name, listener = cl.id(), "connection returned twice");
                return;
            }
            let tracked = state.checked_out.remove(&cl.id()).is_some();
            let over_max = state.active() >= self.config.max_size;
            if over_max && !kill {
                warn!(pool = %self.pool_name, listener = cl.id(), "returned connection exceeds max pool size");
            }
            let destroy = kill
                || !tracked
                || over_max
                || cl.state() == ListenerState::Destroy
                || self.is_shutdown();
            if !destroy {
                cl.touch();
                cl.set_state(ListenerState::Idle);
                state.idle.push_back(cl.clone());
            }
            self.sync_gauges(&state);
            (destroy, cl.take_permit())
        };
        drop(permit);

        if destroy {
            self.destroy_listener(cl).await;
            self.prefill();
        }
    }

    async fn remove_and_destroy(&self, cl: &Arc<ConnectionListener>) {
        let permit = {
            let mut state = self.state.lock();
            state.checked_out.remove(&cl.id());
            self.sync_gauges(&state);
            cl.take_permit()
        };
        drop(permit);
        self.destroy_listener(cl).await;
    }

    /// Destruction failures are logged, never propagated.
    async fn destroy_listener(&self, cl: &Arc<ConnectionListener>) {
        if !cl.mark_destroyed() {
            return;
        }
        cl.detach();
        drop(cl.take_permit());
        if let Err(e) = self
            .factory
            .destroy_managed_connection(cl.managed_connection())
            .await
        {
            let e = Error::destruction_with_source(format!("listener {}", cl.id()), e);
            warn!(pool = %self.pool_name, listener = cl.id(), error = %e, "unable to destroy connection");
        }
        self.statistics.record_destroyed();
        trace!(pool = %self.pool_name, listener = cl.id(), "destroyed connection");
    }

    /// Idle sweep: destroy idle connections as the decrementer decides.
    ///
    /// Runs at most once per sweep interval (half the idle timeout); earlier
    /// calls return 0 without touching the pool.
    pub async fn remove_idle_connections(&self) -> usize {
        if self.is_shutdown() {
            return 0;
        }
        let now = Instant::now();
        {
            let mut last = self.last_idle_check.lock();
            if let Some(previous) = *last {
                if now.saturating_duration_since(previous) < self.sweep_interval() {
                    trace!(pool = %self.pool_name, "idle sweep skipped");
                    return 0;
                }
            }
            *last = Some(now);
        }

        let decrementer = self.capacity.decrementer().clone();
        let min_size = self.config.min_size;
        let mut destroyed = 0;
        loop {
            let victim = {
                let mut state = self.state.lock();
                let size = state.active();
                let floor_reached = self.config.strict_min && size <= min_size;
                let selected = match state.idle.front() {
                    Some(oldest) if !floor_reached => {
                        let last_used = oldest.last_used();
                        let cutoff = now
                            .checked_sub(self.config.idle_timeout)
                            .unwrap_or(last_used);
                        decrementer.should_destroy(last_used, cutoff, size, min_size, destroyed)
                    }
                    _ => false,
                };
                let victim = if selected { state.idle.pop_front() } else { None };
                if victim.is_some() {
                    self.sync_gauges(&state);
                }
                victim
            };
            let Some(cl) = victim else { break };
            self.statistics.record_timed_out();
            self.destroy_listener(&cl).await;
            destroyed += 1;
        }

        if destroyed > 0 {
            debug!(pool = %self.pool_name, key = %self.key, destroyed, state = %self.dump_state(), "removed idle connections");
        }

        if self.fill_enabled && min_size > 0 {
            self.prefill();
        } else if self.is_empty() && !self.is_filling() {
            if let (Some(owner), Some(me)) = (self.owner.upgrade(), self.self_ref.upgrade()) {
                owner.sub_pool_emptied(&me).await;
            }
        }
        destroyed
    }

    /// Create one idle connection if the sub-pool holds fewer than `limit`
    async fn grow_one(
        &self,
        limit: usize,
        subject: Option<&Subject>,
        cri: Option<&ConnectionRequestInfo>,
    ) -> Grow {
        let limit = limit.min(self.config.max_size);
        {
            let state = self.state.lock();
            if state.active() + state.pending >= limit {
                return Grow::Full;
            }
        }
        let permit = match self.acquire_permit(false).await {
            Ok(permit) => permit,
            Err(e) => {
                debug!(pool = %self.pool_name, error = %e, "no permit for fill");
                return Grow::Failed;
            }
        };
        {
            let mut state = self.state.lock();
            if self.is_shutdown() || state.active() + state.pending >= limit {
                return Grow::Full;
            }
            state.pending += 1;
        }

        let started = Instant::now();
        let result = self.factory.create_managed_connection(subject, cri).await;
        let rejected = {
            let mut state = self.state.lock();
            state.pending -= 1;
            match result {
                Err(e) => {
                    warn!(pool = %self.pool_name, key = %self.key, error = %e, "unable to fill pool");
                    return Grow::Failed;
                }
                Ok(mc) => {
                    self.statistics.record_created(started.elapsed());
                    let cl = Arc::new(ConnectionListener::new(
                        mc,
                        self.self_ref.clone(),
                        subject.cloned(),
                    ));
                    if self.is_shutdown() {
                        cl
                    } else {
                        state.idle.push_back(cl);
                        self.sync_gauges(&state);
                        drop(state);
                        drop(permit);
                        return Grow::Created;
                    }
                }
            }
        };
        drop(permit);
        self.destroy_listener(&rejected).await;
        Grow::Failed
    }

    /// Create idle connections until `target` (at most `max_size`) exist.
    ///
    /// A creation failure ends this invocation; it is logged, not returned.
    pub async fn fill_to(&self, target: usize) -> usize {
        let mut created = 0;
        let (subject, cri) = (self.fill_subject.clone(), self.fill_cri.clone());
        while !self.is_shutdown() {
            match self.grow_one(target, subject.as_ref(), cri.as_ref()).await {
                Grow::Created => created += 1,
                Grow::Full | Grow::Failed => break,
            }
        }
        if created > 0 {
            debug!(pool = %self.pool_name, key = %self.key, created, target, "filled pool");
        }
        created
    }

    fn submit_fill(&self, target: usize) {
        if self.is_shutdown() {
            return;
        }
        let Some(me) = self.self_ref.upgrade() else {
            return;
        };
        let guard = FillGuard::new(me);
        self.scheduler.submit(self.id, async move {
            guard.0.fill_to(target).await;
        });
    }

    /// Schedule a fill to `min_size` when prefill or strict-min is in effect
    pub fn prefill(&self) {
        if self.fill_enabled && self.config.min_size > 0 {
            self.submit_fill(self.config.min_size);
        }
    }

    fn increase_capacity(&self, subject: Option<&Subject>, cri: Option<&ConnectionRequestInfo>) {
        if self.capacity.incrementer().is_none() || self.is_shutdown() {
            return;
        }
        let Some(me) = self.self_ref.upgrade() else {
            return;
        };
        let (subject, cri) = (subject.cloned(), cri.cloned());
        let guard = FillGuard::new(me);
        self.scheduler.submit(self.id, async move {
            guard
                .0
                .run_capacity_request(subject.as_ref(), cri.as_ref())
                .await;
        });
    }

    async fn run_capacity_request(
        &self,
        subject: Option<&Subject>,
        cri: Option<&ConnectionRequestInfo>,
    ) -> usize {
        let Some(incrementer) = self.capacity.incrementer().cloned() else {
            return 0;
        };
        let max_size = self.config.max_size;
        let mut created = 0;
        while !self.is_shutdown() {
            let size = {
                let state = self.state.lock();
                state.active() + state.pending
            };
            if !incrementer.should_create(size, max_size, created) {
                break;
            }
            match self.grow_one(max_size, subject, cri).await {
                Grow::Created => created += 1,
                Grow::Full | Grow::Failed => break,
            }
        }
        if created > 0 {
            debug!(pool = %self.pool_name, key = %self.key, created, policy = incrementer.name(), "increased capacity");
        }
        created
    }

    /// Background validation of idle connections.
    ///
    /// Each idle connection not validated within the interval is taken out of
    /// the idle set under a non-blocking permit, validated, and either put
    /// back or destroyed. In-use connections are never inspected, and a
    /// connection under validation does not count as in use.
    pub async fn validate_connections(&self) -> usize {
        let interval = self.config.background_validation_interval;
        let mut destroyed = 0;
        while !self.is_shutdown() {
            let Ok(raw) = self.semaphore.clone().try_acquire_owned() else {
                break;
            };
            let permit = self.wrap(raw);

            let candidate = {
                let mut state = self.state.lock();
                let now = Instant::now();
                let position = state
                    .idle
                    .iter()
                    .position(|cl| now.saturating_duration_since(cl.last_validated()) >= interval);
                let candidate = position.and_then(|i| state.idle.remove(i));
                if let Some(cl) = &candidate {
                    state.validating.insert(cl.id(), cl.clone());
                    self.sync_gauges(&state);
                }
                candidate
            };
            let Some(cl) = candidate else { break };

            let valid = self.factory.is_valid(cl.managed_connection()).await;
            let keep = {
                let mut state = self.state.lock();
                let present = state.validating.remove(&cl.id()).is_some();
                let keep = valid
                    && present
                    && cl.state() == ListenerState::Idle
                    && !self.is_shutdown();
                if keep {
                    cl.validated();
                    let last_used = cl.last_used();
                    let at = state
                        .idle
                        .iter()
                        .position(|other| other.last_used() > last_used)
                        .unwrap_or(state.idle.len());
                    state.idle.insert(at, cl.clone());
                }
                self.sync_gauges(&state);
                keep
            };
            drop(permit);

            if !keep {
                if !valid {
                    debug!(pool = %self.pool_name, listener = cl.id(), "destroying invalid connection");
                }
                self.destroy_listener(&cl).await;
                destroyed += 1;
            }
        }

        if destroyed > 0 {
            self.prefill();
        }
        destroyed
    }

    /// Destroy connections according to `mode`, then prefill.
    ///
    /// Only idle connections or connections already marked for destruction
    /// are ever destroyed here; a connection being handed to a caller is left
    /// to the caller's own path.
    pub async fn flush(&self, mode: FlushMode) -> usize {
        let (victims, released) = {
            let mut state = self.state.lock();
            let mut released = Vec::new();
            match mode {
                FlushMode::All => {
                    for (_, cl) in state.checked_out.drain() {
                        cl.set_state(ListenerState::Destroy);
                        cl.detach();
                        released.extend(cl.take_permit());
                    }
                }
                FlushMode::Gracefully => {
                    for cl in state.checked_out.values() {
                        cl.set_state(ListenerState::Destroy);
                        cl.detach();
                    }
                }
                FlushMode::Idle | FlushMode::Invalid => {}
            }
            if mode != FlushMode::Invalid {
                // Destroyed by the validation task once it is done
                for cl in state.validating.values() {
                    cl.set_state(ListenerState::Destroy);
                }
            }
            let victims: Vec<_> = if mode == FlushMode::Invalid {
                Vec::new()
            } else {
                state.idle.drain(..).collect()
            };
            self.sync_gauges(&state);
            (victims, released)
        };
        drop(released);

        let mut destroyed = 0;
        for cl in &victims {
            self.destroy_listener(cl).await;
            destroyed += 1;
        }

        if mode == FlushMode::Invalid {
            let snapshot: Vec<_> = self.state.lock().idle.iter().cloned().collect();
            for cl in snapshot {
                if self.factory.is_valid(cl.managed_connection()).await {
                    continue;
                }
                let removed = {
                    let mut state = self.state.lock();
                    match state.idle.iter().position(|other| other.id() == cl.id()) {
                        Some(position) => {
                            state.idle.remove(position);
                            self.sync_gauges(&state);
                            true
                        }
                        None => false,
                    }
                };
                if removed {
                    self.destroy_listener(&cl).await;
                    destroyed += 1;
                }
            }
        }

        debug!(pool = %self.pool_name, key = %self.key, ?mode, destroyed, "flushed");
        self.prefill();
        destroyed
    }

    /// Destroy every connection, including checked-out ones, and stop.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.semaphore.close();
        self.released.notify_waiters();

        let victims: Vec<_> = {
            let mut state = self.state.lock();
            let mut victims: Vec<_> = state.idle.drain(..).collect();
            victims.extend(state.checked_out.drain().map(|(_, cl)| cl));
            victims.extend(state.validating.drain().map(|(_, cl)| cl));
            self.statistics.detach_from_parent();
            victims
        };
        for cl in &victims {
            self.destroy_listener(cl).await;
        }
        debug!(pool = %self.pool_name, key = %self.key, destroyed = victims.len(), "sub-pool shut down");
        // Last: this may cancel the task running this very call
        self.scheduler.cancel(self.id);
    }
}

impl fmt::Debug for ManagedConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedConnectionPool")
            .field("key", &self.key)
            .field("state", &self.dump_state())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
