//! Pool statistics
//!
//! Every sub-pool owns a [`ManagedConnectionPoolStatistics`]; each update is
//! applied to it and, in the same call, to the pool-wide [`PoolStatistics`].
//! The aggregate is therefore never re-summed and never diverges from its
//! parts once an operation has completed.
//!
//! Gauges (`ActiveCount`, `IdleCount`, `InUseCount`) are always maintained.
//! Timing counters are only recorded while statistics are enabled.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Connections created and not yet destroyed
pub const ACTIVE_COUNT: &str = "ActiveCount";
/// Permits not held by a caller
pub const AVAILABLE_COUNT: &str = "AvailableCount";
/// Average time spent blocked waiting for a permit
pub const AVERAGE_BLOCKING_TIME: &str = "AverageBlockingTime";
/// Average connection creation time
pub const AVERAGE_CREATION_TIME: &str = "AverageCreationTime";
/// Average time to obtain a connection
pub const AVERAGE_GET_TIME: &str = "AverageGetTime";
/// Callers that timed out waiting for a permit
pub const BLOCKING_FAILURE_COUNT: &str = "BlockingFailureCount";
/// Connections created
pub const CREATED_COUNT: &str = "CreatedCount";
/// Connections destroyed
pub const DESTROYED_COUNT: &str = "DestroyedCount";
/// Connections in the idle set
pub const IDLE_COUNT: &str = "IdleCount";
/// Connections checked out
pub const IN_USE_COUNT: &str = "InUseCount";
/// Longest connection creation time
pub const MAX_CREATION_TIME: &str = "MaxCreationTime";
/// Longest time to obtain a connection
pub const MAX_GET_TIME: &str = "MaxGetTime";
/// Highest number of connections checked out at once
pub const MAX_USED_COUNT: &str = "MaxUsedCount";
/// Longest time a caller blocked for a permit
pub const MAX_WAIT_TIME: &str = "MaxWaitTime";
/// Connections removed by the idle sweep
pub const TIMED_OUT: &str = "TimedOut";
/// Total time spent blocked waiting for permits
pub const TOTAL_BLOCKING_TIME: &str = "TotalBlockingTime";
/// Total connection creation time
pub const TOTAL_CREATION_TIME: &str = "TotalCreationTime";
/// Total time spent obtaining connections
pub const TOTAL_GET_TIME: &str = "TotalGetTime";
/// Callers that had to block for a permit
pub const WAIT_COUNT: &str = "WaitCount";

const NAMES: [&str; 19] = [
    ACTIVE_COUNT,
    AVAILABLE_COUNT,
    AVERAGE_BLOCKING_TIME,
    AVERAGE_CREATION_TIME,
    AVERAGE_GET_TIME,
    BLOCKING_FAILURE_COUNT,
    CREATED_COUNT,
    DESTROYED_COUNT,
    IDLE_COUNT,
    IN_USE_COUNT,
    MAX_CREATION_TIME,
    MAX_GET_TIME,
    MAX_USED_COUNT,
    MAX_WAIT_TIME,
    TIMED_OUT,
    TOTAL_BLOCKING_TIME,
    TOTAL_CREATION_TIME,
    TOTAL_GET_TIME,
    WAIT_COUNT,
];

fn english_description(name: &str) -> Option<&'static str> {
    Some(match name {
        ACTIVE_COUNT => "The active count",
        AVAILABLE_COUNT => "The available count",
        AVERAGE_BLOCKING_TIME => "Average time spent blocking on a connection (ms)",
        AVERAGE_CREATION_TIME => "The average time spent creating a physical connection (ms)",
        AVERAGE_GET_TIME => "The average time spent obtaining a physical connection (ms)",
        BLOCKING_FAILURE_COUNT => "The number of failures trying to obtain a physical connection",
        CREATED_COUNT => "The created count",
        DESTROYED_COUNT => "The destroyed count",
        IDLE_COUNT => "The number of physical connections currently idle",
        IN_USE_COUNT => "The number of physical connections currently in use",
        MAX_CREATION_TIME => "The maximum time for creating a physical connection (ms)",
        MAX_GET_TIME => "The maximum time for obtaining a physical connection (ms)",
        MAX_USED_COUNT => "The maximum number of connections used",
        MAX_WAIT_TIME => "The maximum wait time for a connection (ms)",
        TIMED_OUT => "The timed out count",
        TOTAL_BLOCKING_TIME => "The total blocking time (ms)",
        TOTAL_CREATION_TIME => "The total time spent creating physical connections (ms)",
        TOTAL_GET_TIME => "The total time spent obtaining physical connections (ms)",
        WAIT_COUNT => "The number of requests that had to wait to obtain a physical connection",
        _ => return None,
    })
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn average(total: u64, count: u64) -> u64 {
    if count == 0 {
        0
    } else {
        total / count
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
#[allow(missing_docs)]
pub struct StatisticsSnapshot {
    pub active_count: u64,
    pub available_count: u64,
    pub average_blocking_time: u64,
    pub average_creation_time: u64,
    pub average_get_time: u64,
    pub blocking_failure_count: u64,
    pub created_count: u64,
    pub destroyed_count: u64,
    pub idle_count: u64,
    pub in_use_count: u64,
    pub max_creation_time: u64,
    pub max_get_time: u64,
    pub max_used_count: u64,
    pub max_wait_time: u64,
    pub timed_out: u64,
    pub total_blocking_time: u64,
    pub total_creation_time: u64,
    pub total_get_time: u64,
    pub wait_count: u64,
}

#[derive(Debug, Default)]
struct Counters {
    active: AtomicU64,
    idle: AtomicU64,
    in_use: AtomicU64,
    max_used: AtomicU64,
    created: AtomicU64,
    destroyed: AtomicU64,
    timed_out: AtomicU64,
    wait_count: AtomicU64,
    blocking_failures: AtomicU64,
    blocking_count: AtomicU64,
    total_blocking_ms: AtomicU64,
    max_wait_ms: AtomicU64,
    creation_count: AtomicU64,
    total_creation_ms: AtomicU64,
    max_creation_ms: AtomicU64,
    get_count: AtomicU64,
    total_get_ms: AtomicU64,
    max_get_ms: AtomicU64,
}

impl Counters {
    fn apply_gauge(gauge: &AtomicU64, old: u64, new: u64) {
        if new >= old {
            gauge.fetch_add(new - old, Ordering::AcqRel);
        } else {
            // CAS floor at 0
            let _ = gauge.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(old - new))
            });
        }
    }

    fn gauges(&self, active: u64, in_use: u64, idle: u64) -> (u64, u64, u64) {
        (
            self.active.swap(active, Ordering::AcqRel),
            self.in_use.swap(in_use, Ordering::AcqRel),
            self.idle.swap(idle, Ordering::AcqRel),
        )
    }

    fn apply_gauges(&self, old: (u64, u64, u64), new: (u64, u64, u64)) {
        Self::apply_gauge(&self.active, old.0, new.0);
        Self::apply_gauge(&self.in_use, old.1, new.1);
        Self::apply_gauge(&self.idle, old.2, new.2);
        self.max_used
            .fetch_max(self.in_use.load(Ordering::Acquire), Ordering::AcqRel);
    }

    fn record_created(&self, elapsed: Duration, timed: bool) {
        self.created.fetch_add(1, Ordering::Relaxed);
        if timed {
            let ms = millis(elapsed);
            self.creation_count.fetch_add(1, Ordering::Relaxed);
            self.total_creation_ms.fetch_add(ms, Ordering::Relaxed);
            self.max_creation_ms.fetch_max(ms, Ordering::Relaxed);
        }
    }

    fn record_blocking(&self, waited: Duration) {
        let ms = millis(waited);
        self.blocking_count.fetch_add(1, Ordering::Relaxed);
        self.total_blocking_ms.fetch_add(ms, Ordering::Relaxed);
        self.max_wait_ms.fetch_max(ms, Ordering::Relaxed);
    }

    fn record_get(&self, elapsed: Duration) {
        let ms = millis(elapsed);
        self.get_count.fetch_add(1, Ordering::Relaxed);
        self.total_get_ms.fetch_add(ms, Ordering::Relaxed);
        self.max_get_ms.fetch_max(ms, Ordering::Relaxed);
    }

    fn clear(&self) {
        for counter in [
            &self.created,
            &self.destroyed,
            &self.timed_out,
            &self.wait_count,
            &self.blocking_failures,
            &self.blocking_count,
            &self.total_blocking_ms,
            &self.max_wait_ms,
            &self.creation_count,
            &self.total_creation_ms,
            &self.max_creation_ms,
            &self.get_count,
            &self.total_get_ms,
            &self.max_get_ms,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.max_used
            .store(self.in_use.load(Ordering::Acquire), Ordering::Relaxed);
    }

    fn snapshot(&self, available: u64) -> StatisticsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Acquire);
        StatisticsSnapshot {
            active_count: load(&self.active),
            available_count: available,
            average_blocking_time: average(
                load(&self.total_blocking_ms),
                load(&self.blocking_count),
            ),
            average_creation_time: average(
                load(&self.total_creation_ms),
                load(&self.creation_count),
            ),
            average_get_time: average(load(&self.total_get_ms), load(&self.get_count)),
            blocking_failure_count: load(&self.blocking_failures),
            created_count: load(&self.created),
            destroyed_count: load(&self.destroyed),
            idle_count: load(&self.idle),
            in_use_count: load(&self.in_use),
            max_creation_time: load(&self.max_creation_ms),
            max_get_time: load(&self.max_get_ms),
            max_used_count: load(&self.max_used),
            max_wait_time: load(&self.max_wait_ms),
            timed_out: load(&self.timed_out),
            total_blocking_time: load(&self.total_blocking_ms),
            total_creation_time: load(&self.total_creation_ms),
            total_get_time: load(&self.total_get_ms),
            wait_count: load(&self.wait_count),
        }
    }
}

impl StatisticsSnapshot {
    /// Value of a named counter
    pub fn get(&self, name: &str) -> Option<u64> {
        Some(match name {
            ACTIVE_COUNT => self.active_count,
            AVAILABLE_COUNT => self.available_count,
            AVERAGE_BLOCKING_TIME => self.average_blocking_time,
            AVERAGE_CREATION_TIME => self.average_creation_time,
            AVERAGE_GET_TIME => self.average_get_time,
            BLOCKING_FAILURE_COUNT => self.blocking_failure_count,
            CREATED_COUNT => self.created_count,
            DESTROYED_COUNT => self.destroyed_count,
            IDLE_COUNT => self.idle_count,
            IN_USE_COUNT => self.in_use_count,
            MAX_CREATION_TIME => self.max_creation_time,
            MAX_GET_TIME => self.max_get_time,
            MAX_USED_COUNT => self.max_used_count,
            MAX_WAIT_TIME => self.max_wait_time,
            TIMED_OUT => self.timed_out,
            TOTAL_BLOCKING_TIME => self.total_blocking_time,
            TOTAL_CREATION_TIME => self.total_creation_time,
            TOTAL_GET_TIME => self.total_get_time,
            WAIT_COUNT => self.wait_count,
            _ => return None,
        })
    }
}

/// Pool-wide statistics, the running sum of all sub-pool statistics
#[derive(Debug)]
pub struct PoolStatistics {
    counters: Counters,
    enabled: AtomicBool,
    max_size: usize,
    sub_pools: AtomicUsize,
}

impl PoolStatistics {
    /// Statistics for a pool whose sub-pools hold at most `max_size` each
    pub fn new(max_size: usize, enabled: bool) -> Self {
        Self {
            counters: Counters::default(),
            enabled: AtomicBool::new(enabled),
            max_size,
            sub_pools: AtomicUsize::new(0),
        }
    }

    /// Counter names
    pub fn names(&self) -> &'static [&'static str] {
        &NAMES
    }

    /// Value of a named counter
    pub fn get(&self, name: &str) -> Option<u64> {
        self.snapshot().get(name)
    }

    /// English description of a counter
    pub fn description(&self, name: &str) -> Option<&'static str> {
        english_description(name)
    }

    /// Localized description; only English is bundled, other locales fall back
    pub fn description_localized(&self, name: &str, _locale: &str) -> Option<&'static str> {
        english_description(name)
    }

    /// Whether timing statistics are recorded
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Enable or disable timing statistics
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Reset cumulative counters; gauges keep their live values
    pub fn clear(&self) {
        self.counters.clear();
    }

    /// Point-in-time copy
    pub fn snapshot(&self) -> StatisticsSnapshot {
        let sub_pools = self.sub_pools.load(Ordering::Acquire);
        let capacity = if sub_pools == 0 {
            self.max_size
        } else {
            self.max_size.saturating_mul(sub_pools)
        } as u64;
        let in_use = self.counters.in_use.load(Ordering::Acquire);
        self.counters.snapshot(capacity.saturating_sub(in_use))
    }

    /// Active connections across all sub-pools
    pub fn active_count(&self) -> u64 {
        self.counters.active.load(Ordering::Acquire)
    }

    /// Checked-out connections across all sub-pools
    pub fn in_use_count(&self) -> u64 {
        self.counters.in_use.load(Ordering::Acquire)
    }

    /// Idle connections across all sub-pools
    pub fn idle_count(&self) -> u64 {
        self.counters.idle.load(Ordering::Acquire)
    }

    /// Destroyed connections across all sub-pools
    pub fn destroyed_count(&self) -> u64 {
        self.counters.destroyed.load(Ordering::Acquire)
    }

    /// Created connections across all sub-pools
    pub fn created_count(&self) -> u64 {
        self.counters.created.load(Ordering::Acquire)
    }

    pub(crate) fn sub_pool_added(&self) {
        self.sub_pools.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn sub_pool_removed(&self) {
        let _ = self
            .sub_pools
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(1))
            });
    }
}

/// Statistics of one sub-pool; every update is forwarded to the pool
#[derive(Debug)]
pub struct ManagedConnectionPoolStatistics {
    counters: Counters,
    parent: Arc<PoolStatistics>,
    max_size: usize,
}

impl ManagedConnectionPoolStatistics {
    pub(crate) fn new(parent: Arc<PoolStatistics>, max_size: usize) -> Self {
        parent.sub_pool_added();
        Self {
            counters: Counters::default(),
            parent,
            max_size,
        }
    }

    /// Counter names
    pub fn names(&self) -> &'static [&'static str] {
        &NAMES
    }

    /// Value of a named counter
    pub fn get(&self, name: &str) -> Option<u64> {
        self.snapshot().get(name)
    }

    /// English description of a counter
    pub fn description(&self, name: &str) -> Option<&'static str> {
        english_description(name)
    }

    /// Whether timing statistics are recorded
    pub fn is_enabled(&self) -> bool {
        self.parent.is_enabled()
    }

    /// Reset cumulative counters of this sub-pool
    pub fn clear(&self) {
        self.counters.clear();
    }

    /// Point-in-time copy
    pub fn snapshot(&self) -> StatisticsSnapshot {
        let in_use = self.counters.in_use.load(Ordering::Acquire);
        self.counters
            .snapshot((self.max_size as u64).saturating_sub(in_use))
    }

    /// Active connections
    pub fn active_count(&self) -> u64 {
        self.counters.active.load(Ordering::Acquire)
    }

    /// Checked-out connections
    pub fn in_use_count(&self) -> u64 {
        self.counters.in_use.load(Ordering::Acquire)
    }

    /// Idle connections
    pub fn idle_count(&self) -> u64 {
        self.counters.idle.load(Ordering::Acquire)
    }

    /// Permits not held by a caller
    pub fn available_count(&self) -> u64 {
        (self.max_size as u64).saturating_sub(self.in_use_count())
    }

    /// Destroyed connections
    pub fn destroyed_count(&self) -> u64 {
        self.counters.destroyed.load(Ordering::Acquire)
    }

    /// Created connections
    pub fn created_count(&self) -> u64 {
        self.counters.created.load(Ordering::Acquire)
    }

    /// Must be called with the sub-pool lock held, so gauge writes are ordered.
    pub(crate) fn set_gauges(&self, active: usize, in_use: usize, idle: usize) {
        let new = (active as u64, in_use as u64, idle as u64);
        let old = self.counters.gauges(new.0, new.1, new.2);
        self.counters
            .max_used
            .fetch_max(new.1, Ordering::AcqRel);
        self.parent.counters.apply_gauges(old, new);
    }

    pub(crate) fn record_created(&self, elapsed: Duration) {
        let timed = self.is_enabled();
        self.counters.record_created(elapsed, timed);
        self.parent.counters.record_created(elapsed, timed);
    }

    pub(crate) fn record_destroyed(&self) {
        self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
        self.parent.counters.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timed_out(&self) {
        self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
        self.parent.counters.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_wait(&self) {
        self.counters.wait_count.fetch_add(1, Ordering::Relaxed);
        self.parent.counters.wait_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_blocking_failure(&self) {
        self.counters
            .blocking_failures
            .fetch_add(1, Ordering::Relaxed);
        self.parent
            .counters
            .blocking_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_blocking_time(&self, waited: Duration) {
        if self.is_enabled() {
            self.counters.record_blocking(waited);
            self.parent.counters.record_blocking(waited);
        }
    }

    pub(crate) fn record_get(&self, elapsed: Duration) {
        if self.is_enabled() {
            self.counters.record_get(elapsed);
            self.parent.counters.record_get(elapsed);
        }
    }

    /// Remove this sub-pool's gauges from the aggregate
    pub(crate) fn detach_from_parent(&self) {
        self.set_gauges(0, 0, 0);
        self.parent.sub_pool_removed();
    }
}
