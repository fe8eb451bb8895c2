//! Connection listener
//!
//! A [`ConnectionListener`] bundles one managed connection with the pool's
//! bookkeeping for it: lifecycle state, the capacity permit it holds while
//! checked out, transaction association and open application handles.
//!
//! State transitions happen under the owning sub-pool's lock:
//!
//! ```text
//!   Idle ⇄ InUse ──► Destroy (flushed while in use) ──► Destroyed
//!     └──────────────────────────────────────────────────┘
//! ```

use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use crate::connection::{ManagedConnection, Subject};
use crate::managed_pool::{ManagedConnectionPool, Permit};
use crate::transaction::Transaction;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ListenerState {
    /// In the idle set
    Idle = 0,
    /// Checked out by a caller
    InUse = 1,
    /// Flushed while in use; destroyed when returned
    Destroy = 2,
    /// Physical connection destroyed
    Destroyed = 3,
}

impl ListenerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::InUse,
            2 => Self::Destroy,
            _ => Self::Destroyed,
        }
    }
}

/// Pool-side wrapper of one managed connection
pub struct ConnectionListener {
    id: u64,
    connection: Arc<dyn ManagedConnection>,
    pool: Weak<ManagedConnectionPool>,
    state: AtomicU8,
    permit: Mutex<Option<Permit>>,
    detached: AtomicBool,
    transaction: Mutex<Option<Transaction>>,
    handles: Mutex<HashSet<u64>>,
    subject: Mutex<Option<Subject>>,
    created_at: Instant,
    last_used: Mutex<Instant>,
    last_validated: Mutex<Instant>,
}

impl ConnectionListener {
    pub(crate) fn new(
        connection: Arc<dyn ManagedConnection>,
        pool: Weak<ManagedConnectionPool>,
        subject: Option<Subject>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed),
            connection,
            pool,
            state: AtomicU8::new(ListenerState::Idle as u8),
            permit: Mutex::new(None),
            detached: AtomicBool::new(false),
            transaction: Mutex::new(None),
            handles: Mutex::new(HashSet::new()),
            subject: Mutex::new(subject),
            created_at: now,
            last_used: Mutex::new(now),
            last_validated: Mutex::new(now),
        }
    }

    /// Unique listener id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The managed connection
    pub fn managed_connection(&self) -> &Arc<dyn ManagedConnection> {
        &self.connection
    }

    /// Owning sub-pool, if it still exists
    pub fn pool(&self) -> Option<Arc<ManagedConnectionPool>> {
        self.pool.upgrade()
    }

    /// Current lifecycle state
    pub fn state(&self) -> ListenerState {
        ListenerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ListenerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Returns `false` if the listener was already destroyed
    pub(crate) fn mark_destroyed(&self) -> bool {
        self.state
            .swap(ListenerState::Destroyed as u8, Ordering::AcqRel)
            != ListenerState::Destroyed as u8
    }

    /// Whether the connection was removed from pool management
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    pub(crate) fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    /// Whether a capacity permit is attached
    pub fn holds_permit(&self) -> bool {
        self.permit.lock().is_some()
    }

    pub(crate) fn attach_permit(&self, permit: Permit) {
        *self.permit.lock() = Some(permit);
    }

    /// Taking the permit out of the slot is the only way to release it.
    pub(crate) fn take_permit(&self) -> Option<Permit> {
        self.permit.lock().take()
    }

    /// Transaction the connection is enlisted in
    pub fn transaction(&self) -> Option<Transaction> {
        self.transaction.lock().clone()
    }

    /// Whether the connection stays checked out until its transaction ends
    pub fn is_track_by_tx(&self) -> bool {
        self.transaction.lock().is_some()
    }

    pub(crate) fn set_transaction(&self, transaction: Option<Transaction>) {
        *self.transaction.lock() = transaction;
    }

    pub(crate) fn register_handle(&self, handle: u64) {
        self.handles.lock().insert(handle);
    }

    /// Returns the number of handles left open
    pub(crate) fn unregister_handle(&self, handle: u64) -> usize {
        let mut handles = self.handles.lock();
        handles.remove(&handle);
        handles.len()
    }

    /// Number of open application handles
    pub fn handle_count(&self) -> usize {
        self.handles.lock().len()
    }

    /// Subject the connection was last used with
    pub fn subject(&self) -> Option<Subject> {
        self.subject.lock().clone()
    }

    pub(crate) fn set_subject(&self, subject: Option<Subject>) {
        *self.subject.lock() = subject;
    }

    /// Creation time
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Time of the last return to the pool
    pub fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    pub(crate) fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    /// Time of the last successful validation
    pub fn last_validated(&self) -> Instant {
        *self.last_validated.lock()
    }

    pub(crate) fn validated(&self) {
        *self.last_validated.lock() = Instant::now();
    }

    /// Whether the connection sat idle since before `cutoff`
    pub fn is_timed_out(&self, cutoff: Instant) -> bool {
        self.last_used() < cutoff
    }
}

impl fmt::Debug for ConnectionListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionListener")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("detached", &self.is_detached())
            .field("handles", &self.handle_count())
            .field("transaction", &self.transaction())
            .finish()
    }
}
