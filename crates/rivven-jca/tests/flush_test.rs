//! Tests for flush strategies and background validation

mod common;

use common::{eventually, pool_with, MockFactory};
use rivven_jca::prelude::*;
use std::sync::Arc;
use std::time::Duration;

fn broken() -> Error {
    Error::validation("broken pipe")
}

fn config(name: &str, strategy: FlushStrategy) -> PoolConfiguration {
    PoolConfiguration::new(name)
        .with_max_size(5)
        .with_flush_strategy(strategy)
}

// ==================== Connection Error Tests ====================

#[tokio::test]
async fn test_failing_connection_only() {
    let factory = MockFactory::new();
    let pool = pool_with(
        factory.clone(),
        config("failing", FlushStrategy::FailingConnectionOnly),
    );
    let c = pool.get_connection(None, None).await.unwrap();
    let idle = pool.get_connection(None, None).await.unwrap();
    idle.close().await.unwrap();

    c.fail(&broken()).await;
    assert!(c.is_closed());
    assert_eq!(factory.destroyed(), 1);
    assert_eq!(pool.statistics().idle_count(), 1);
    assert_eq!(pool.statistics().active_count(), 1);
    assert!(c.managed_connection().is_err());
}

#[tokio::test]
async fn test_entire_pool_detaches_in_use_and_refills() {
    let factory = MockFactory::new();
    let pool = pool_with(
        factory.clone(),
        config("entire", FlushStrategy::EntirePool)
            .with_min_size(2)
            .with_prefill(true),
    );
    let stats = pool.statistics().clone();
    assert!(eventually(Duration::from_secs(1), || stats.idle_count() == 2).await);

    let c = pool.get_connection(None, None).await.unwrap();
    let c1 = pool.get_connection(None, None).await.unwrap();
    let c2 = pool.get_connection(None, None).await.unwrap();
    assert_eq!(stats.in_use_count(), 3);
    assert_eq!(stats.active_count(), 3);

    c.fail(&broken()).await;
    assert!(c1.is_detached());
    assert!(c2.is_detached());
    assert!(
        eventually(Duration::from_secs(1), || {
            stats.active_count() == 2 && stats.idle_count() == 2
        })
        .await
    );
    assert_eq!(stats.in_use_count(), 0);
    assert_eq!(stats.snapshot().available_count, 5);

    c1.close().await.unwrap();
    c2.close().await.unwrap();
    assert_eq!(c1.listener().state(), ListenerState::Destroyed);
    assert_eq!(factory.destroyed(), 3);
    assert_eq!(stats.active_count(), 2);
}

#[tokio::test]
async fn test_idle_connections_flush() {
    let factory = MockFactory::new();
    let pool = pool_with(factory.clone(), config("idle", FlushStrategy::IdleConnections));
    let busy = pool.get_connection(None, None).await.unwrap();
    let c = pool.get_connection(None, None).await.unwrap();
    let extra = pool.get_connection(None, None).await.unwrap();
    extra.close().await.unwrap();
    assert_eq!(pool.statistics().idle_count(), 1);

    c.fail(&broken()).await;
    assert_eq!(pool.statistics().idle_count(), 0);
    assert_eq!(pool.statistics().in_use_count(), 1);
    assert!(!busy.is_detached());
    busy.close().await.unwrap();
}

#[tokio::test]
async fn test_invalid_idle_connections_flush() {
    let factory = MockFactory::new();
    let pool = pool_with(
        factory.clone(),
        config("invalid", FlushStrategy::InvalidIdleConnections),
    );
    let c = pool.get_connection(None, None).await.unwrap();
    let a = pool.get_connection(None, None).await.unwrap();
    let b = pool.get_connection(None, None).await.unwrap();
    a.close().await.unwrap();
    b.close().await.unwrap();

    // Valid idle connections survive
    let d = pool.get_connection(None, None).await.unwrap();
    d.fail(&broken()).await;
    assert_eq!(pool.statistics().idle_count(), 1);

    factory.set_invalid(true);
    c.fail(&broken()).await;
    assert_eq!(pool.statistics().idle_count(), 0);
    assert_eq!(pool.statistics().active_count(), 0);
}

#[tokio::test]
async fn test_gracefully_defers_in_use() {
    let factory = MockFactory::new();
    let pool = pool_with(factory.clone(), config("graceful", FlushStrategy::Gracefully));
    let c = pool.get_connection(None, None).await.unwrap();
    let c1 = pool.get_connection(None, None).await.unwrap();
    let idle = pool.get_connection(None, None).await.unwrap();
    idle.close().await.unwrap();

    c.fail(&broken()).await;
    assert!(c1.is_detached());
    assert_eq!(c1.listener().state(), ListenerState::Destroy);
    assert!(c1.managed_connection().is_ok());
    assert_eq!(pool.statistics().in_use_count(), 1);
    assert_eq!(pool.statistics().idle_count(), 0);

    c1.close().await.unwrap();
    assert_eq!(pool.statistics().active_count(), 0);
    assert_eq!(factory.destroyed(), 3);
}

#[tokio::test]
async fn test_all_idle_connections_spans_sub_pools() {
    let factory = MockFactory::new();
    let pool = Pool::builder(factory.clone())
        .config(config("all-idle", FlushStrategy::AllIdleConnections))
        .strategy(Arc::new(PoolBySubject))
        .build()
        .unwrap();
    let alice = Subject::with_password("alice", "a");
    let bob = Subject::with_password("bob", "b");

    let a = pool.get_connection(Some(&alice), None).await.unwrap();
    let b = pool.get_connection(Some(&bob), None).await.unwrap();
    b.close().await.unwrap();
    assert_eq!(pool.managed_connection_pools().len(), 2);

    a.fail(&broken()).await;
    assert_eq!(factory.destroyed(), 2);
    assert_eq!(pool.statistics().active_count(), 0);
    assert!(pool.managed_connection_pools().is_empty());
}

#[tokio::test]
async fn test_all_connections_detaches_every_sub_pool() {
    let pool = Pool::builder(MockFactory::new())
        .config(config("all", FlushStrategy::AllConnections))
        .strategy(Arc::new(PoolBySubject))
        .build()
        .unwrap();
    let alice = Subject::with_password("alice", "a");
    let bob = Subject::with_password("bob", "b");

    let a = pool.get_connection(Some(&alice), None).await.unwrap();
    let b = pool.get_connection(Some(&bob), None).await.unwrap();
    a.fail(&broken()).await;

    assert!(b.is_detached());
    b.close().await.unwrap();
    assert_eq!(b.listener().state(), ListenerState::Destroyed);
}

// ==================== Operator Flush Tests ====================

#[tokio::test]
async fn test_flush_empty_pool_is_noop() {
    let pool = pool_with(MockFactory::new(), PoolConfiguration::new("empty"));
    pool.flush(false).await;
    assert_eq!(pool.managed_connection_pools().len(), 0);
    pool.flush(true).await;
    assert_eq!(pool.managed_connection_pools().len(), 0);
}

#[tokio::test]
async fn test_flush_removes_emptied_sub_pools() {
    let factory = MockFactory::new();
    let pool = pool_with(factory.clone(), PoolConfiguration::new("retire"));
    let handle = pool.get_connection(None, None).await.unwrap();
    handle.close().await.unwrap();
    assert_eq!(pool.managed_connection_pools().len(), 1);

    pool.flush(false).await;
    assert_eq!(pool.managed_connection_pools().len(), 0);
    assert_eq!(factory.destroyed(), 1);
    assert_eq!(pool.statistics().snapshot().available_count, 20);

    // A fresh sub-pool serves the next request
    let handle = pool.get_connection(None, None).await.unwrap();
    assert_eq!(factory.created(), 2);
    handle.close().await.unwrap();
}

#[tokio::test]
async fn test_forced_flush_detaches_in_use() {
    let factory = MockFactory::new();
    let pool = pool_with(factory.clone(), PoolConfiguration::new("forced"));
    let handle = pool.get_connection(None, None).await.unwrap();

    pool.flush(true).await;
    assert!(handle.is_detached());
    assert_eq!(pool.statistics().in_use_count(), 0);

    handle.close().await.unwrap();
    assert_eq!(handle.listener().state(), ListenerState::Destroyed);
    assert_eq!(factory.destroyed(), 1);
}

#[tokio::test]
async fn test_flush_keeps_prefilled_sub_pool() {
    let pool = pool_with(
        MockFactory::new(),
        PoolConfiguration::new("keep")
            .with_min_size(1)
            .with_prefill(true),
    );
    let stats = pool.statistics().clone();
    assert!(eventually(Duration::from_secs(1), || stats.idle_count() == 1).await);

    pool.flush(false).await;
    assert_eq!(pool.managed_connection_pools().len(), 1);
    assert!(eventually(Duration::from_secs(1), || stats.idle_count() == 1).await);
}

// ==================== Background Validation Tests ====================

#[tokio::test]
async fn test_background_validation_destroys_invalid_idle() {
    let factory = MockFactory::new();
    let pool = pool_with(
        factory.clone(),
        PoolConfiguration::new("validate")
            .with_max_size(5)
            .with_background_validation(Duration::from_millis(300)),
    );
    let busy = pool.get_connection(None, None).await.unwrap();
    let a = pool.get_connection(None, None).await.unwrap();
    let b = pool.get_connection(None, None).await.unwrap();
    a.close().await.unwrap();
    b.close().await.unwrap();

    factory.set_invalid(true);
    let stats = pool.statistics().clone();
    assert!(eventually(Duration::from_secs(2), || stats.destroyed_count() == 2).await);

    assert_eq!(stats.idle_count(), 0);
    assert_eq!(stats.in_use_count(), 1);
    assert_eq!(busy.listener().state(), ListenerState::InUse);
    assert!(busy.managed_connection().is_ok());
    busy.close().await.unwrap();
}

#[tokio::test]
async fn test_background_validation_keeps_valid_idle() {
    let factory = MockFactory::new();
    let pool = pool_with(
        factory.clone(),
        PoolConfiguration::new("still-valid")
            .with_background_validation(Duration::from_millis(100)),
    );
    let handle = pool.get_connection(None, None).await.unwrap();
    handle.close().await.unwrap();

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(factory.destroyed(), 0);
    assert_eq!(pool.statistics().idle_count(), 1);

    let handle = pool.get_connection(None, None).await.unwrap();
    assert_eq!(factory.created(), 1);
    handle.close().await.unwrap();
}
