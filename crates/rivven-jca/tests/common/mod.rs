//! Shared fixtures for rivven-jca integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rivven_jca::prelude::*;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Connection produced by [`MockFactory`]
#[derive(Debug)]
pub struct MockConnection {
    pub serial: u64,
    pub principal: Option<String>,
    destroyed: AtomicBool,
}

impl MockConnection {
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ManagedConnection for MockConnection {
    async fn destroy(&self) -> Result<()> {
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn reauthenticate(
        &self,
        _subject: Option<&Subject>,
        _cri: Option<&ConnectionRequestInfo>,
    ) -> Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Factory with switches for failure injection
#[derive(Default)]
pub struct MockFactory {
    serial: AtomicU64,
    created: AtomicUsize,
    destroyed: AtomicUsize,
    invalid: AtomicBool,
    fail_create: AtomicBool,
    create_delay_ms: AtomicU64,
    validate_delay_ms: AtomicU64,
    fail_destroy: AtomicBool,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Every connection fails validation from now on
    pub fn set_invalid(&self, invalid: bool) {
        self.invalid.store(invalid, Ordering::SeqCst);
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_create_delay(&self, delay: Duration) {
        self.create_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_validate_delay(&self, delay: Duration) {
        self.validate_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_fail_destroy(&self, fail: bool) {
        self.fail_destroy.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ManagedConnectionFactory for MockFactory {
    async fn create_managed_connection(
        &self,
        subject: Option<&Subject>,
        _cri: Option<&ConnectionRequestInfo>,
    ) -> Result<Arc<dyn ManagedConnection>> {
        let delay = self.create_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::creation("connection refused"));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockConnection {
            serial: self.serial.fetch_add(1, Ordering::SeqCst),
            principal: subject.map(|s| s.principal().to_string()),
            destroyed: AtomicBool::new(false),
        }))
    }

    async fn destroy_managed_connection(&self, connection: &Arc<dyn ManagedConnection>) -> Result<()> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        connection.destroy().await?;
        if self.fail_destroy.load(Ordering::SeqCst) {
            return Err(Error::creation("socket reset"));
        }
        Ok(())
    }

    async fn is_valid(&self, _connection: &Arc<dyn ManagedConnection>) -> bool {
        let delay = self.validate_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        !self.invalid.load(Ordering::SeqCst)
    }
}

/// Transaction manager stand-in with a settable current transaction
#[derive(Default)]
pub struct MockTransactions {
    current: Mutex<Option<Transaction>>,
    enlisted: AtomicUsize,
    delisted: AtomicUsize,
    fail_enlist: AtomicBool,
}

impl MockTransactions {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn begin(&self, id: u64) {
        *self.current.lock() = Some(Transaction::active(id));
    }

    pub fn set_current(&self, transaction: Option<Transaction>) {
        *self.current.lock() = transaction;
    }

    pub fn end(&self) {
        *self.current.lock() = None;
    }

    pub fn enlisted(&self) -> usize {
        self.enlisted.load(Ordering::SeqCst)
    }

    pub fn delisted(&self) -> usize {
        self.delisted.load(Ordering::SeqCst)
    }

    pub fn set_fail_enlist(&self, fail: bool) {
        self.fail_enlist.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransactionIntegration for MockTransactions {
    fn current_transaction(&self) -> Option<Transaction> {
        self.current.lock().clone()
    }

    async fn enlist(
        &self,
        _connection: &Arc<dyn ManagedConnection>,
        _transaction: &Transaction,
    ) -> Result<()> {
        if self.fail_enlist.load(Ordering::SeqCst) {
            return Err(Error::transaction("resource rejected"));
        }
        self.enlisted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delist(
        &self,
        _connection: &Arc<dyn ManagedConnection>,
        _transaction: &Transaction,
    ) -> Result<()> {
        self.delisted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records graceful shutdown outcomes
#[derive(Default)]
pub struct RecordingCallback {
    cancelled: AtomicUsize,
    done: AtomicUsize,
}

impl RecordingCallback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn cancel_count(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn done_count(&self) -> usize {
        self.done.load(Ordering::SeqCst)
    }
}

impl GracefulCallback for RecordingCallback {
    fn cancel(&self) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
    }

    fn done(&self) {
        self.done.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn pool_with(factory: Arc<MockFactory>, config: PoolConfiguration) -> Pool {
    Pool::builder(factory).config(config).build().unwrap()
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
