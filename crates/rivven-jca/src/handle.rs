//! Application-facing connection handles

use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

use crate::connection::ManagedConnection;
use crate::error::{Error, Result};
use crate::listener::{ConnectionListener, ListenerState};
use crate::pool::Pool;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Explicit close contract for handles
#[async_trait]
pub trait Closeable: Send + Sync {
    /// Release the handle. Closing twice is a no-op.
    async fn close(&self) -> Result<()>;

    /// Whether the handle was closed
    fn is_closed(&self) -> bool;
}

/// A connection borrowed from a [`Pool`].
///
/// Closing the handle gives the connection back to the pool (unless a
/// transaction still holds it). Dropping an open handle closes it in the
/// background.
pub struct ConnectionHandle {
    id: u64,
    listener: Arc<ConnectionListener>,
    pool: Pool,
    closed: AtomicBool,
}

impl ConnectionHandle {
    pub(crate) fn new(listener: Arc<ConnectionListener>, pool: Pool) -> Self {
        let id = NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed);
        listener.register_handle(id);
        Self {
            id,
            listener,
            pool,
            closed: AtomicBool::new(false),
        }
    }

    /// Handle id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Pool-side listener of the connection
    pub fn listener(&self) -> &Arc<ConnectionListener> {
        &self.listener
    }

    /// Whether the connection was removed from pool management by a flush
    /// or shutdown
    pub fn is_detached(&self) -> bool {
        self.listener.is_detached()
    }

    /// The managed connection, unless the handle is closed or the
    /// connection was destroyed
    pub fn managed_connection(&self) -> Result<Arc<dyn ManagedConnection>> {
        if self.is_closed() {
            return Err(Error::not_available("connection handle is closed"));
        }
        if self.listener.state() == ListenerState::Destroyed {
            return Err(Error::not_available(format!(
                "connection {} was destroyed",
                self.listener.id()
            )));
        }
        Ok(self.listener.managed_connection().clone())
    }

    /// Run `f` against the concrete connection type
    pub fn with_connection<T, R>(&self, f: impl FnOnce(&T) -> R) -> Result<R>
    where
        T: Any,
    {
        let connection = self.managed_connection()?;
        let concrete = connection
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| Error::illegal_state("unexpected managed connection type"))?;
        Ok(f(concrete))
    }

    /// Report that the connection is broken.
    ///
    /// The connection is destroyed and the pool's flush strategy applied.
    /// The handle is closed afterwards.
    pub async fn fail(&self, cause: &Error) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.listener.unregister_handle(self.id);
        self.pool
            .connection_error_occurred(&self.listener, cause)
            .await;
    }
}

#[async_trait]
impl Closeable for ConnectionHandle {
    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.pool.handle_closed(self.id, &self.listener).await;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let pool = self.pool.clone();
        let listener = self.listener.clone();
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    pool.handle_closed(id, &listener).await;
                });
            }
            Err(_) => warn!(
                listener = listener.id(),
                "connection handle dropped outside a runtime, connection not returned"
            ),
        }
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("listener", &self.listener.id())
            .field("closed", &self.is_closed())
            .field("detached", &self.is_detached())
            .finish()
    }
}
