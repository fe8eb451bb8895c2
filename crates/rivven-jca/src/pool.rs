//! Pool: strategy routing, transactions, flush and shutdown
//!
//! A [`Pool`] owns the key → sub-pool map. Each request is routed by the
//! configured [`PoolStrategy`] to one [`ManagedConnectionPool`], created on
//! first use. The pool layers transaction sharing, connection-error flush
//! strategies and the two-phase graceful shutdown on top.
//!
//! # Example
//!
//! ```rust,ignore
//! use rivven_jca::prelude::*;
//!
//! let pool = Pool::builder(factory)
//!     .config(PoolConfiguration::new("orders").with_max_size(10))
//!     .strategy(Arc::new(PoolBySubject))
//!     .build()?;
//!
//! let handle = pool.get_connection(Some(&subject), None).await?;
//! // ...
//! handle.close().await?;
//! ```

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::capacity::Capacity;
use crate::config::{FlushStrategy, PoolConfiguration};
use crate::connection::{ConnectionRequestInfo, ManagedConnectionFactory, Subject};
use crate::error::{Error, ErrorCategory, Result};
use crate::handle::ConnectionHandle;
use crate::listener::{ConnectionListener, ListenerState};
use crate::managed_pool::{FlushMode, ManagedConnectionPool, SubPoolContext, SubPoolOwner};
use crate::scheduler::{next_owner_id, Scheduler};
use crate::stats::PoolStatistics;
use crate::strategy::{OnePool, PoolKey, PoolStrategy};
use crate::transaction::{Transaction, TransactionIntegration, TransactionKey, TransactionTracker};

/// Notified about the outcome of a graceful shutdown
pub trait GracefulCallback: Send + Sync {
    /// The pending shutdown was cancelled
    fn cancel(&self);

    /// The pool drained (or the grace period ran out) and is shut down
    fn done(&self);
}

struct GracefulShutdown {
    callback: Option<Arc<dyn GracefulCallback>>,
    deadline: Option<Instant>,
    timer: Option<u64>,
}

/// Builder for [`Pool`]
pub struct PoolBuilder {
    factory: Arc<dyn ManagedConnectionFactory>,
    config: PoolConfiguration,
    strategy: Arc<dyn PoolStrategy>,
    capacity: Option<Capacity>,
    transactions: Option<Arc<dyn TransactionIntegration>>,
    scheduler: Option<Scheduler>,
    fill_subject: Option<Subject>,
    fill_cri: Option<ConnectionRequestInfo>,
}

impl PoolBuilder {
    /// Create a builder around a managed-connection factory
    pub fn new(factory: Arc<dyn ManagedConnectionFactory>) -> Self {
        Self {
            factory,
            config: PoolConfiguration::default(),
            strategy: Arc::new(OnePool),
            capacity: None,
            transactions: None,
            scheduler: None,
            fill_subject: None,
            fill_cri: None,
        }
    }

    /// Set the pool configuration
    pub fn config(mut self, config: PoolConfiguration) -> Self {
        self.config = config;
        self
    }

    /// Set the partitioning strategy (default: [`OnePool`])
    pub fn strategy(mut self, strategy: Arc<dyn PoolStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Use this capacity policy instead of the configured one
    pub fn capacity(mut self, capacity: Capacity) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Set the transaction manager contract
    pub fn transaction_integration(mut self, integration: Arc<dyn TransactionIntegration>) -> Self {
        self.transactions = Some(integration);
        self
    }

    /// Share a scheduler with other pools
    pub fn scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Credentials used to create connections ahead of demand
    pub fn prefill_credentials(
        mut self,
        subject: Option<Subject>,
        cri: Option<ConnectionRequestInfo>,
    ) -> Self {
        self.fill_subject = subject;
        self.fill_cri = cri;
        self
    }

    /// Validate the configuration and build the pool.
    ///
    /// With prefill enabled and a strategy that supports it, the default
    /// sub-pool is created right away and filled in the background.
    pub fn build(self) -> Result<Pool> {
        self.config.validate()?;
        let capacity = match self.capacity {
            Some(capacity) => capacity,
            None => Capacity::from_config(&self.config.capacity)?,
        };
        if self.config.prefill && !self.strategy.supports_prefill() {
            warn!(
                pool = %self.config.pool_name,
                strategy = self.strategy.name(),
                "prefill requested but not supported by strategy"
            );
        }

        let statistics = Arc::new(PoolStatistics::new(
            self.config.max_size,
            self.config.statistics_enabled,
        ));
        let inner = Arc::new_cyclic(|self_ref| PoolInner {
            name: self.config.pool_name.clone(),
            config: Arc::new(self.config),
            strategy: self.strategy,
            factory: self.factory,
            capacity,
            transactions: self.transactions,
            scheduler: self.scheduler.unwrap_or_default(),
            statistics,
            sub_pools: RwLock::new(HashMap::new()),
            tracker: TransactionTracker::default(),
            shutdown: AtomicBool::new(false),
            graceful: Mutex::new(None),
            fill_subject: self.fill_subject,
            fill_cri: self.fill_cri,
            self_ref: self_ref.clone(),
        });
        let pool = Pool { inner };

        info!(
            pool = %pool.inner.name,
            strategy = pool.inner.strategy.name(),
            max_size = pool.inner.config.max_size,
            min_size = pool.inner.config.min_size,
            "pool created"
        );

        if pool.inner.config.prefill && pool.inner.strategy.supports_prefill() {
            let subject = pool.inner.fill_subject.clone();
            let cri = pool.inner.fill_cri.clone();
            let mut partitions = vec![false];
            if pool.inner.config.separate_no_tx {
                partitions.push(true);
            }
            for separate in partitions {
                let key = pool
                    .inner
                    .strategy
                    .key(subject.as_ref(), cri.as_ref(), separate);
                pool.inner.sub_pool(&key);
            }
        }
        Ok(pool)
    }
}

struct PoolInner {
    name: String,
    config: Arc<PoolConfiguration>,
    strategy: Arc<dyn PoolStrategy>,
    factory: Arc<dyn ManagedConnectionFactory>,
    capacity: Capacity,
    transactions: Option<Arc<dyn TransactionIntegration>>,
    scheduler: Scheduler,
    statistics: Arc<PoolStatistics>,
    sub_pools: RwLock<HashMap<PoolKey, Arc<ManagedConnectionPool>>>,
    tracker: TransactionTracker,
    shutdown: AtomicBool,
    graceful: Mutex<Option<GracefulShutdown>>,
    fill_subject: Option<Subject>,
    fill_cri: Option<ConnectionRequestInfo>,
    self_ref: Weak<PoolInner>,
}

impl PoolInner {
    fn context(&self) -> SubPoolContext {
        let owner: Weak<dyn SubPoolOwner> = self.self_ref.clone();
        SubPoolContext {
            pool_name: self.name.clone(),
            config: self.config.clone(),
            capacity: self.capacity.clone(),
            factory: self.factory.clone(),
            statistics: self.statistics.clone(),
            scheduler: self.scheduler.clone(),
            owner,
            supports_prefill: self.strategy.supports_prefill(),
            reauthenticate: self.strategy.supports_reauthentication(),
            fill_subject: self.fill_subject.clone(),
            fill_cri: self.fill_cri.clone(),
        }
    }

    /// Construct-or-fetch. The map lock is held only for the insert.
    fn sub_pool(&self, key: &PoolKey) -> Arc<ManagedConnectionPool> {
        if let Some(pool) = self.sub_pools.read().get(key) {
            if !pool.is_shutdown() {
                return pool.clone();
            }
        }

        let (pool, created) = {
            let mut pools = self.sub_pools.write();
            match pools.get(key) {
                Some(existing) if !existing.is_shutdown() => (existing.clone(), false),
                _ => {
                    let pool = ManagedConnectionPool::new(key.clone(), &self.context());
                    pools.insert(key.clone(), pool.clone());
                    (pool, true)
                }
            }
        };
        if created {
            debug!(pool = %self.name, %key, "created sub-pool");
            pool.start(self.config.initial_fill_target());
        }
        pool
    }

    /// Drop `pool` from the map if it is still the registered instance
    fn unregister(&self, pool: &Arc<ManagedConnectionPool>) -> bool {
        let mut pools = self.sub_pools.write();
        match pools.get(pool.key()) {
            Some(current) if Arc::ptr_eq(current, pool) => {
                pools.remove(pool.key());
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl SubPoolOwner for PoolInner {
    async fn sub_pool_emptied(&self, pool: &Arc<ManagedConnectionPool>) {
        if pool.is_prefill_enabled() || !pool.is_empty() || pool.is_filling() {
            return;
        }
        if self.unregister(pool) {
            debug!(pool = %self.name, key = %pool.key(), "removing empty sub-pool");
            pool.shutdown().await;
        }
    }
}

/// Connection pool partitioned by a [`PoolStrategy`]
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Start building a pool around `factory`
    pub fn builder(factory: Arc<dyn ManagedConnectionFactory>) -> PoolBuilder {
        PoolBuilder::new(factory)
    }

    /// Pool name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfiguration {
        &self.inner.config
    }

    /// Partitioning strategy
    pub fn strategy(&self) -> &Arc<dyn PoolStrategy> {
        &self.inner.strategy
    }

    /// Pool-wide statistics
    pub fn statistics(&self) -> &Arc<PoolStatistics> {
        &self.inner.statistics
    }

    /// Reset cumulative counters of the pool and every sub-pool
    pub fn clear_statistics(&self) {
        self.inner.statistics.clear();
        for pool in self.managed_connection_pools() {
            pool.statistics().clear();
        }
    }

    /// Partition key for a request
    pub fn key(
        &self,
        subject: Option<&Subject>,
        cri: Option<&ConnectionRequestInfo>,
        separate_no_tx: bool,
    ) -> PoolKey {
        self.inner.strategy.key(subject, cri, separate_no_tx)
    }

    /// Sub-pool for `key`, created if absent
    pub fn managed_connection_pool(&self, key: &PoolKey) -> Result<Arc<ManagedConnectionPool>> {
        self.ensure_accepting()?;
        Ok(self.inner.sub_pool(key))
    }

    /// Live sub-pools
    pub fn managed_connection_pools(&self) -> Vec<Arc<ManagedConnectionPool>> {
        self.inner.sub_pools.read().values().cloned().collect()
    }

    /// Whether any sub-pool has every permit taken
    pub fn is_full(&self) -> bool {
        self.inner
            .sub_pools
            .read()
            .values()
            .any(|pool| pool.is_full())
    }

    /// Whether the pool has completed shutdown
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Whether a graceful shutdown is pending
    pub fn is_shutdown_pending(&self) -> bool {
        self.inner.graceful.lock().is_some()
    }

    fn in_use_count(&self) -> usize {
        self.inner
            .sub_pools
            .read()
            .values()
            .map(|pool| pool.in_use_count())
            .sum()
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.is_shutdown() || self.is_shutdown_pending() {
            Err(Error::shutdown(&self.inner.name))
        } else {
            Ok(())
        }
    }

    /// Obtain a connection handle.
    ///
    /// With transaction tracking enabled, the current transaction (if any)
    /// is looked up through the transaction integration and the connection
    /// is shared with every other request of that transaction.
    pub async fn get_connection(
        &self,
        subject: Option<&Subject>,
        cri: Option<&ConnectionRequestInfo>,
    ) -> Result<ConnectionHandle> {
        let transaction = match &self.inner.transactions {
            Some(integration) if self.inner.config.track_by_transaction => {
                integration.current_transaction()
            }
            _ => None,
        };
        self.get_connection_with_transaction(subject, cri, transaction)
            .await
    }

    /// Obtain a connection handle for an explicit transaction context
    pub async fn get_connection_with_transaction(
        &self,
        subject: Option<&Subject>,
        cri: Option<&ConnectionRequestInfo>,
        transaction: Option<Transaction>,
    ) -> Result<ConnectionHandle> {
        self.ensure_accepting()?;
        let separate = self.inner.config.separate_no_tx && transaction.is_none();
        let key = self.inner.strategy.key(subject, cri, separate);

        let listener = match transaction {
            Some(tx) if self.inner.config.track_by_transaction => {
                self.get_tracked(&key, subject, cri, tx).await?
            }
            _ => self.get_untracked(&key, subject, cri).await?,
        };
        Ok(ConnectionHandle::new(listener, self.clone()))
    }

    async fn get_untracked(
        &self,
        key: &PoolKey,
        subject: Option<&Subject>,
        cri: Option<&ConnectionRequestInfo>,
    ) -> Result<Arc<ConnectionListener>> {
        let pool = self.inner.sub_pool(key);
        match pool.get_connection(subject, cri).await {
            // Sub-pool retired between lookup and acquisition
            Err(e) if e.category() == ErrorCategory::Shutdown && !self.is_shutdown() => {
                debug!(pool = %self.inner.name, %key, "sub-pool retired, retrying");
                self.ensure_accepting()?;
                self.inner.sub_pool(key).get_connection(subject, cri).await
            }
            other => other,
        }
    }

    fn shared(listener: &Option<Arc<ConnectionListener>>) -> Option<Arc<ConnectionListener>> {
        listener
            .as_ref()
            .filter(|cl| cl.state() != ListenerState::Destroyed && !cl.is_detached())
            .cloned()
    }

    async fn get_tracked(
        &self,
        key: &PoolKey,
        subject: Option<&Subject>,
        cri: Option<&ConnectionRequestInfo>,
        tx: Transaction,
    ) -> Result<Arc<ConnectionListener>> {
        if !tx.can_enlist() {
            if let Some(slot) = self.inner.tracker.existing(tx.key, key) {
                if let Some(cl) = Self::shared(&*slot.lock().await) {
                    return Ok(cl);
                }
            }
            debug!(pool = %self.inner.name, tx = %tx.key, status = ?tx.status, "transaction not active, connection untracked");
            return self.get_untracked(key, subject, cri).await;
        }

        let slot = self.inner.tracker.slot(tx.key, key);
        let mut tracked = slot.lock().await;
        if let Some(cl) = Self::shared(&tracked) {
            debug!(pool = %self.inner.name, tx = %tx.key, listener = cl.id(), "sharing transaction connection");
            return Ok(cl);
        }

        let cl = self.get_untracked(key, subject, cri).await?;
        cl.set_transaction(Some(tx.clone()));
        if let Some(integration) = &self.inner.transactions {
            if let Err(e) = integration.enlist(cl.managed_connection(), &tx).await {
                warn!(pool = %self.inner.name, tx = %tx.key, error = %e, "unable to enlist connection");
                cl.set_transaction(None);
                self.return_connection(&cl, false).await;
                return Err(Error::transaction_with_source(
                    format!("unable to enlist connection in {}", tx.key),
                    e,
                ));
            }
        }
        *tracked = Some(cl.clone());
        Ok(cl)
    }

    /// A handle was closed; return the connection once nothing uses it
    pub(crate) async fn handle_closed(&self, handle: u64, listener: &Arc<ConnectionListener>) {
        let remaining = listener.unregister_handle(handle);
        if remaining == 0 && !listener.is_track_by_tx() {
            self.return_connection(listener, false).await;
        }
    }

    /// Return a listener to its sub-pool. `kill` destroys it.
    pub async fn return_connection(&self, listener: &Arc<ConnectionListener>, kill: bool) {
        match listener.pool() {
            Some(pool) => pool.return_connection(listener, kill).await,
            None => {
                // Sub-pool already gone
                drop(listener.take_permit());
                if listener.mark_destroyed() {
                    if let Err(e) = self
                        .inner
                        .factory
                        .destroy_managed_connection(listener.managed_connection())
                        .await
                    {
                        let e = Error::destruction_with_source(format!("listener {}", listener.id()), e);
                        warn!(pool = %self.inner.name, listener = listener.id(), error = %e, "unable to destroy orphaned connection");
                    }
                }
            }
        }
        self.check_drained().await;
    }

    /// Connection error event: kill the connection, then apply the flush strategy
    pub async fn connection_error_occurred(&self, listener: &Arc<ConnectionListener>, cause: &Error) {
        warn!(
            pool = %self.inner.name,
            listener = listener.id(),
            error = %cause,
            strategy = %self.inner.config.flush_strategy,
            "connection error"
        );
        if let Some(tx) = listener.transaction() {
            self.inner.tracker.forget(tx.key, listener);
            listener.set_transaction(None);
        }
        let owner = listener.pool();
        self.return_connection(listener, true).await;

        let mode = match self.inner.config.flush_strategy {
            // The kill itself triggers the prefill
            FlushStrategy::FailingConnectionOnly => return,
            FlushStrategy::IdleConnections | FlushStrategy::AllIdleConnections => FlushMode::Idle,
            FlushStrategy::InvalidIdleConnections | FlushStrategy::AllInvalidIdleConnections => {
                FlushMode::Invalid
            }
            FlushStrategy::EntirePool | FlushStrategy::AllConnections => FlushMode::All,
            FlushStrategy::Gracefully | FlushStrategy::AllGracefully => FlushMode::Gracefully,
        };
        if self.inner.config.flush_strategy.is_pool_wide() {
            self.flush_mode(mode).await;
        } else if let Some(pool) = owner {
            pool.flush(mode).await;
            self.check_drained().await;
        }
    }

    /// The transaction completed: delist and release its connections
    pub async fn transaction_completed(&self, tx: TransactionKey) {
        for slot in self.inner.tracker.complete(tx) {
            let listener = slot.lock().await.take();
            let Some(cl) = listener else { continue };
            if let (Some(integration), Some(transaction)) =
                (&self.inner.transactions, cl.transaction())
            {
                if let Err(e) = integration.delist(cl.managed_connection(), &transaction).await {
                    warn!(pool = %self.inner.name, %tx, listener = cl.id(), error = %e, "unable to delist connection");
                }
            }
            cl.set_transaction(None);
            if cl.handle_count() == 0 {
                self.return_connection(&cl, false).await;
            }
        }
        debug!(pool = %self.inner.name, %tx, "transaction completed");
    }

    /// Operator flush: `false` destroys idle connections, `true` every connection
    pub async fn flush(&self, force: bool) {
        let mode = if force { FlushMode::All } else { FlushMode::Idle };
        self.flush_mode(mode).await;
    }

    /// Flush every sub-pool, then retire those left empty
    pub async fn flush_mode(&self, mode: FlushMode) {
        for pool in self.managed_connection_pools() {
            pool.flush(mode).await;
        }

        let retired: Vec<_> = {
            let mut pools = self.inner.sub_pools.write();
            let mut retired = Vec::new();
            pools.retain(|_, pool| {
                let keep = pool.is_prefill_enabled() || !pool.is_empty() || pool.is_filling();
                if !keep {
                    retired.push(pool.clone());
                }
                keep
            });
            retired
        };
        for pool in &retired {
            pool.shutdown().await;
        }
        info!(pool = %self.inner.name, ?mode, retired = retired.len(), "pool flushed");
        self.check_drained().await;
    }

    /// Verify a connection can be obtained and returned
    pub async fn test_connection(&self) -> bool {
        self.test_connection_with(None, None).await
    }

    /// [`Pool::test_connection`] for a given subject and request info
    pub async fn test_connection_with(
        &self,
        subject: Option<&Subject>,
        cri: Option<&ConnectionRequestInfo>,
    ) -> bool {
        if self.ensure_accepting().is_err() {
            return false;
        }
        let key = self
            .inner
            .strategy
            .key(subject, cri, self.inner.config.separate_no_tx);
        let pool = self.inner.sub_pool(&key);
        if pool.is_full() {
            return false;
        }
        match pool.get_connection(subject, cri).await {
            Ok(cl) => {
                pool.return_connection(&cl, false).await;
                true
            }
            Err(e) => {
                debug!(pool = %self.inner.name, error = %e, "test connection failed");
                false
            }
        }
    }

    /// Destroy every connection in every sub-pool and reject further requests.
    ///
    /// A pending graceful shutdown completes here and its callback is told.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let pools: Vec<_> = {
            let mut map = self.inner.sub_pools.write();
            map.drain().map(|(_, pool)| pool).collect()
        };
        for pool in &pools {
            pool.shutdown().await;
        }
        self.inner.tracker.clear();
        info!(pool = %self.inner.name, sub_pools = pools.len(), "pool shut down");

        let graceful = self.inner.graceful.lock().take();
        if let Some(graceful) = graceful {
            if let Some(callback) = graceful.callback {
                callback.done();
            }
            // Last: may cancel the timer task running this call
            if let Some(timer) = graceful.timer {
                self.inner.scheduler.cancel(timer);
            }
        }
    }

    /// Stop accepting requests and shut down once every connection is back.
    ///
    /// `grace` bounds the wait; `None`, zero, or a grace period too long to
    /// represent as a deadline waits for a natural drain.
    /// Repeated calls keep the first callback and the earliest deadline.
    pub async fn prepare_shutdown(
        &self,
        grace: Option<Duration>,
        callback: Option<Arc<dyn GracefulCallback>>,
    ) {
        if self.is_shutdown() {
            return;
        }
        let deadline = grace
            .filter(|grace| !grace.is_zero())
            .and_then(|grace| Instant::now().checked_add(grace));

        let rearm = {
            let mut graceful = self.inner.graceful.lock();
            let state = graceful.get_or_insert_with(|| GracefulShutdown {
                callback: None,
                deadline: None,
                timer: None,
            });
            if state.callback.is_none() {
                state.callback = callback;
            }
            match (deadline, state.deadline) {
                (Some(new), Some(current)) if new >= current => None,
                (Some(new), _) => {
                    state.deadline = Some(new);
                    let previous = state.timer.replace(next_owner_id());
                    state.timer.map(|timer| (timer, previous))
                }
                (None, _) => None,
            }
        };

        if let (Some((timer, previous)), Some(deadline)) = (rearm, deadline) {
            if let Some(previous) = previous {
                self.inner.scheduler.cancel(previous);
            }
            let weak = Arc::downgrade(&self.inner);
            let delay = deadline.saturating_duration_since(Instant::now());
            self.inner.scheduler.register(timer);
            self.inner.scheduler.schedule_once(timer, delay, async move {
                if let Some(inner) = weak.upgrade() {
                    let pool = Pool { inner };
                    info!(pool = %pool.inner.name, "grace period elapsed");
                    pool.shutdown().await;
                }
            });
        }
        info!(pool = %self.inner.name, ?grace, "shutdown prepared");
        self.check_drained().await;
    }

    /// Cancel a pending graceful shutdown; `false` if none was pending
    pub fn cancel_shutdown(&self) -> bool {
        let graceful = self.inner.graceful.lock().take();
        let Some(graceful) = graceful else {
            return false;
        };
        if let Some(timer) = graceful.timer {
            self.inner.scheduler.cancel(timer);
        }
        if let Some(callback) = graceful.callback {
            callback.cancel();
        }
        info!(pool = %self.inner.name, "shutdown cancelled");
        true
    }

    async fn check_drained(&self) {
        if self.is_shutdown_pending() && self.in_use_count() == 0 {
            debug!(pool = %self.inner.name, "pool drained");
            self.shutdown().await;
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.inner.name)
            .field("strategy", &self.inner.strategy.name())
            .field("sub_pools", &self.inner.sub_pools.read().len())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
