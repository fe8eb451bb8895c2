//! Transaction integration
//!
//! Inside a tracked transaction every sub-pool hands out at most one
//! connection; further requests in the same transaction share it.
//!
//! ```text
//!   (tx, key) ──► slot ──► Option<ConnectionListener>
//!                  │
//!                  └─ async mutex: concurrent requests of one transaction
//!                     serialize here, so only the first acquires
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::connection::ManagedConnection;
use crate::error::Result;
use crate::listener::ConnectionListener;
use crate::strategy::PoolKey;

/// Identifier of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionKey(pub u64);

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// Transaction status as reported by the transaction manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    /// Running; may enlist resources
    Active,
    /// Will roll back; no new enlistments
    MarkedRollback,
    /// Committed
    Committed,
    /// Rolled back
    RolledBack,
}

/// Transaction context of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Transaction identifier
    pub key: TransactionKey,
    /// Current status
    pub status: TransactionStatus,
}

impl Transaction {
    /// Active transaction
    pub fn active(id: u64) -> Self {
        Self {
            key: TransactionKey(id),
            status: TransactionStatus::Active,
        }
    }

    /// Whether a connection may be enlisted
    pub fn can_enlist(&self) -> bool {
        self.status == TransactionStatus::Active
    }
}

/// Minimal transaction-manager contract consumed by the pool
#[async_trait]
pub trait TransactionIntegration: Send + Sync {
    /// Transaction bound to the calling context, if any
    fn current_transaction(&self) -> Option<Transaction>;

    /// Enlist a connection in a transaction
    async fn enlist(
        &self,
        connection: &Arc<dyn ManagedConnection>,
        transaction: &Transaction,
    ) -> Result<()>;

    /// Delist a connection from a transaction
    async fn delist(
        &self,
        connection: &Arc<dyn ManagedConnection>,
        transaction: &Transaction,
    ) -> Result<()>;
}

/// Slot holding the connection a transaction uses from one sub-pool
pub(crate) type TransactionSlot = Arc<tokio::sync::Mutex<Option<Arc<ConnectionListener>>>>;

/// Transaction → sub-pool → connection map
#[derive(Default)]
pub(crate) struct TransactionTracker {
    slots: Mutex<HashMap<TransactionKey, HashMap<PoolKey, TransactionSlot>>>,
}

impl TransactionTracker {
    /// Get or create the slot for `(tx, key)`
    pub(crate) fn slot(&self, tx: TransactionKey, key: &PoolKey) -> TransactionSlot {
        let mut slots = self.slots.lock();
        slots
            .entry(tx)
            .or_default()
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Slot for `(tx, key)` if one was created
    pub(crate) fn existing(&self, tx: TransactionKey, key: &PoolKey) -> Option<TransactionSlot> {
        self.slots
            .lock()
            .get(&tx)
            .and_then(|per_pool| per_pool.get(key))
            .cloned()
    }

    /// Drop the slot of a killed connection so the next request acquires anew
    pub(crate) fn forget(&self, tx: TransactionKey, listener: &ConnectionListener) {
        let mut slots = self.slots.lock();
        if let Some(per_pool) = slots.get_mut(&tx) {
            per_pool.retain(|_, slot| match slot.try_lock() {
                Ok(guard) => guard.as_ref().map_or(true, |cl| cl.id() != listener.id()),
                // Locked slots are mid-acquisition and hold no listener yet
                Err(_) => true,
            });
            if per_pool.is_empty() {
                slots.remove(&tx);
            }
        }
    }

    /// Remove every slot of a completed transaction
    pub(crate) fn complete(&self, tx: TransactionKey) -> Vec<TransactionSlot> {
        self.slots
            .lock()
            .remove(&tx)
            .map(|per_pool| per_pool.into_values().collect())
            .unwrap_or_default()
    }

    /// Number of transactions currently tracked
    pub(crate) fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub(crate) fn clear(&self) {
        self.slots.lock().clear();
    }
}
