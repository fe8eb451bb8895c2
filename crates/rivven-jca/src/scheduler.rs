//! Shared background task facility
//!
//! Sub-pools register their idle sweep, background validation and fill
//! requests here, keyed by an owner id. An owner must be registered before
//! it schedules anything. Cancelling an owner stops all of its tasks and
//! unregisters it, so a task submitted afterwards is dropped; nothing
//! outlives the sub-pool that scheduled it.
//!
//! One [`Scheduler`] may be shared by any number of pools. It is passed in
//! explicitly, so independent pools never share state by accident.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate an owner id unique within the process
pub(crate) fn next_owner_id() -> u64 {
    NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Background task facility
#[derive(Clone, Default)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

#[derive(Default)]
struct SchedulerInner {
    root: CancellationToken,
    owners: Mutex<HashMap<u64, CancellationToken>>,
}

impl Scheduler {
    /// New scheduler with no registered owners
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `owner` to schedule tasks until it is cancelled
    pub fn register(&self, owner: u64) {
        if self.inner.root.is_cancelled() {
            return;
        }
        self.inner
            .owners
            .lock()
            .entry(owner)
            .or_insert_with(|| self.inner.root.child_token());
    }

    fn spawn<F>(&self, owner: u64, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Some(token) = self.inner.owners.lock().get(&owner).cloned() else {
            trace!(owner, "owner not registered, background task dropped");
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = task => {}
                    }
                });
            }
            Err(_) => warn!(owner, "no tokio runtime, background task not scheduled"),
        }
    }

    /// Run `task` every `period`, measured from the end of the previous run.
    ///
    /// The loop stops when the owner is cancelled or `task` returns `None`.
    pub fn schedule_periodic<F, Fut>(&self, owner: u64, period: Duration, mut task: F)
    where
        F: FnMut() -> Option<Fut> + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if period.is_zero() {
            return;
        }
        trace!(owner, ?period, "scheduling periodic task");
        self.spawn(owner, async move {
            loop {
                tokio::time::sleep(period).await;
                match task() {
                    Some(run) => run.await,
                    None => break,
                }
            }
        });
    }

    /// Run `task` once after `delay`
    pub fn schedule_once<Fut>(&self, owner: u64, delay: Duration, task: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn(owner, async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
    }

    /// Run `task` as soon as possible
    pub fn submit<Fut>(&self, owner: u64, task: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn(owner, task);
    }

    /// Stop every task of `owner`
    pub fn cancel(&self, owner: u64) {
        if let Some(token) = self.inner.owners.lock().remove(&owner) {
            trace!(owner, "cancelling background tasks");
            token.cancel();
        }
    }

    /// Whether `owner` has tasks registered
    pub fn is_registered(&self, owner: u64) -> bool {
        self.inner.owners.lock().contains_key(&owner)
    }

    /// Number of owners with registered tasks
    pub fn owner_count(&self) -> usize {
        self.inner.owners.lock().len()
    }

    /// Stop every task of every owner
    pub fn shutdown(&self) {
        self.inner.root.cancel();
        self.inner.owners.lock().clear();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("owners", &self.owner_count())
            .finish()
    }
}
