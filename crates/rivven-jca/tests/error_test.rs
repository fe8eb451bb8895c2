//! Unit tests for rivven-jca error module

use rivven_jca::error::{Error, ErrorCategory};
use std::time::Duration;

#[test]
fn test_error_timeout() {
    let err = Error::timeout("orders", "PoolKey(alice)", Duration::from_millis(1500));

    assert_eq!(err.category(), ErrorCategory::Timeout);
    assert_eq!(
        err.to_string(),
        "resource timeout in pool 'orders' for key PoolKey(alice): waited 1500 ms"
    );
    assert!(err.is_retriable());
}

#[test]
fn test_error_creation() {
    let err = Error::creation("connection refused");

    assert_eq!(err.category(), ErrorCategory::Creation);
    assert!(err.to_string().contains("connection refused"));
    assert!(err.is_retriable());
}

#[test]
fn test_error_creation_with_source() {
    let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "port closed");
    let err = Error::creation_with_source("unable to open socket", io);

    assert_eq!(err.category(), ErrorCategory::Creation);
    let source = std::error::Error::source(&err).unwrap();
    assert!(source.to_string().contains("port closed"));
}

#[test]
fn test_error_shutdown() {
    let err = Error::shutdown("orders");

    assert_eq!(err.category(), ErrorCategory::Shutdown);
    assert_eq!(err.to_string(), "pool 'orders' is shut down");
    assert!(!err.is_retriable());
}

#[test]
fn test_error_config() {
    let err = Error::config("max_pool_size must be greater than 0");

    assert_eq!(err.category(), ErrorCategory::Configuration);
    assert!(err.to_string().contains("max_pool_size"));
    assert!(!err.is_retriable());
}

#[test]
fn test_error_not_available() {
    let err = Error::not_available("connection handle is closed");

    assert_eq!(err.category(), ErrorCategory::NotAvailable);
    assert!(!err.is_retriable());
}

#[test]
fn test_error_transaction() {
    let err = Error::transaction_with_source(
        "unable to enlist connection in tx-4",
        Error::transaction("resource rejected"),
    );

    assert_eq!(err.category(), ErrorCategory::Transaction);
    assert!(err.to_string().contains("tx-4"));
    assert!(std::error::Error::source(&err).is_some());
    assert!(!err.is_retriable());
}

#[test]
fn test_remaining_categories() {
    assert_eq!(Error::validation("stale").category(), ErrorCategory::Validation);
    assert_eq!(Error::destruction("busy").category(), ErrorCategory::Destruction);
    assert_eq!(
        Error::illegal_state("returned twice").category(),
        ErrorCategory::IllegalState
    );
    assert_eq!(Error::unsupported("reauth").category(), ErrorCategory::Other);
}

#[test]
fn test_error_destruction_with_source() {
    let err = Error::destruction_with_source("listener 7", Error::creation("socket reset"));

    assert_eq!(err.category(), ErrorCategory::Destruction);
    assert!(err.to_string().contains("listener 7"));
    let source = std::error::Error::source(&err).unwrap();
    assert!(source.to_string().contains("socket reset"));
    assert!(!err.is_retriable());
}

#[test]
fn test_error_category_display() {
    assert_eq!(ErrorCategory::Timeout.to_string(), "timeout");
    assert_eq!(ErrorCategory::NotAvailable.to_string(), "not_available");
    assert_eq!(ErrorCategory::IllegalState.to_string(), "illegal_state");
    assert_eq!(ErrorCategory::Shutdown.to_string(), "shutdown");
}

#[test]
fn test_only_timeout_and_creation_are_retriable() {
    let retriable = [
        ErrorCategory::Timeout,
        ErrorCategory::Creation,
    ];
    let permanent = [
        ErrorCategory::Validation,
        ErrorCategory::Destruction,
        ErrorCategory::Configuration,
        ErrorCategory::IllegalState,
        ErrorCategory::NotAvailable,
        ErrorCategory::Shutdown,
        ErrorCategory::Transaction,
        ErrorCategory::Other,
    ];

    assert!(retriable.iter().all(|c| c.is_retriable()));
    assert!(permanent.iter().all(|c| !c.is_retriable()));
}
