//! # rivven-jca
//!
//! Managed connection pooling for resource adapters in the Rivven platform.
//!
//! The pool sits between application code and a managed-connection factory
//! (a database driver, a message broker client, any expensive connection)
//! and handles the lifecycle, reuse and health of those connections.
//!
//! ## Features
//!
//! - **Partitioned Pools**: one sub-pool per subject and/or request info, chosen by strategy
//! - **Bounded Acquisition**: semaphore-gated checkout with fair or barging waiters and a blocking timeout
//! - **Capacity Policies**: pluggable incrementers and decrementers for growth and the idle sweep
//! - **Validation**: on match, on return, and in the background for idle connections
//! - **Flush Strategies**: from the failing connection only up to every connection in every sub-pool
//! - **Transaction Sharing**: one enlisted connection per sub-pool and transaction
//! - **Graceful Shutdown**: drain with an optional grace period, cancellable
//! - **Statistics**: named live counters, pool-wide and per sub-pool
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rivven_jca::prelude::*;
//!
//! let pool = Pool::builder(Arc::new(MyFactory::new()))
//!     .config(
//!         PoolConfiguration::new("orders")
//!             .with_min_size(2)
//!             .with_max_size(10)
//!             .with_prefill(true)
//!             .with_flush_strategy(FlushStrategy::EntirePool),
//!     )
//!     .build()?;
//!
//! let handle = pool.get_connection(None, None).await?;
//! handle.with_connection(|conn: &MyConnection| conn.ping())?;
//! handle.close().await?;
//!
//! pool.prepare_shutdown(Some(Duration::from_secs(30)), None).await;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod capacity;
pub mod config;
pub mod connection;
pub mod error;
pub mod handle;
pub mod listener;
pub mod managed_pool;
pub mod pool;
pub mod scheduler;
pub mod stats;
pub mod strategy;
pub mod transaction;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{Error, ErrorCategory, Result};

    // Configuration and capacity
    pub use crate::capacity::{Capacity, CapacityDecrementer, CapacityIncrementer};
    pub use crate::config::{CapacityConfig, FlushStrategy, PoolConfiguration};

    // Connection contracts
    pub use crate::connection::{
        ConnectionRequestInfo, ManagedConnection, ManagedConnectionFactory, Subject,
    };
    pub use crate::handle::{Closeable, ConnectionHandle};
    pub use crate::listener::{ConnectionListener, ListenerState};

    // Pool types
    pub use crate::managed_pool::{FlushMode, ManagedConnectionPool};
    pub use crate::pool::{GracefulCallback, Pool, PoolBuilder};
    pub use crate::scheduler::Scheduler;
    pub use crate::stats::{ManagedConnectionPoolStatistics, PoolStatistics, StatisticsSnapshot};
    pub use crate::strategy::{
        strategy_for, OnePool, PoolByCri, PoolBySubject, PoolBySubjectAndCri, PoolKey,
        PoolStrategy, ReauthPool,
    };

    // Transactions
    pub use crate::transaction::{
        Transaction, TransactionIntegration, TransactionKey, TransactionStatus,
    };
}

// Re-export commonly used items at crate root
pub use error::{Error, Result};
pub use pool::{Pool, PoolBuilder};
