//! Tests for configuration parsing and validation

use rivven_jca::prelude::*;
use std::time::Duration;

#[test]
fn test_deserialize_descriptor_shape() {
    let json = r#"{
        "pool_name": "orders",
        "min_pool_size": 2,
        "initial_pool_size": 4,
        "max_pool_size": 10,
        "prefill": true,
        "use_strict_min": true,
        "fair": false,
        "blocking_timeout_millis": 5000,
        "idle_timeout_minutes": 15,
        "background_validation": true,
        "background_validation_millis": 60000,
        "flush_strategy": "EntirePool",
        "no_tx_separate_pools": true,
        "track_by_tx": false,
        "capacity": {
            "incrementer": "com.acme.pool.capacity.SizeIncrementer",
            "incrementer_properties": { "size": "3" }
        }
    }"#;

    let config: PoolConfiguration = serde_json::from_str(json).unwrap();
    assert_eq!(config.pool_name, "orders");
    assert_eq!(config.min_size, 2);
    assert_eq!(config.initial_size, Some(4));
    assert_eq!(config.max_size, 10);
    assert!(config.prefill);
    assert!(config.strict_min);
    assert!(!config.fair);
    assert_eq!(config.blocking_timeout, Duration::from_secs(5));
    assert_eq!(config.idle_timeout, Duration::from_secs(15 * 60));
    assert!(config.background_validation);
    assert_eq!(config.background_validation_interval, Duration::from_secs(60));
    assert_eq!(config.flush_strategy, FlushStrategy::EntirePool);
    assert!(config.separate_no_tx);
    assert!(!config.track_by_transaction);
    assert_eq!(config.initial_fill_target(), 4);
    assert!(config.validate().is_ok());

    let capacity = Capacity::from_config(&config.capacity).unwrap();
    assert_eq!(
        capacity.incrementer().map(|i| i.name()),
        Some("SizeIncrementer")
    );
    assert!(capacity.is_timed_out_decrementer());
}

#[test]
fn test_missing_fields_take_defaults() {
    let config: PoolConfiguration = serde_json::from_str(r#"{"pool_name": "sparse"}"#).unwrap();
    let defaults = PoolConfiguration::new("sparse");
    assert_eq!(config, defaults);
    assert_eq!(config.max_size, 20);
    assert_eq!(config.blocking_timeout, Duration::from_millis(30_000));
}

#[test]
fn test_serialize_uses_descriptor_names() {
    let config = PoolConfiguration::new("out")
        .with_max_size(8)
        .with_blocking_timeout(Duration::from_millis(750))
        .with_idle_timeout(Duration::from_secs(120));
    let value = serde_json::to_value(&config).unwrap();

    assert_eq!(value["max_pool_size"], 8);
    assert_eq!(value["blocking_timeout_millis"], 750);
    assert_eq!(value["idle_timeout_minutes"], 2);
    assert_eq!(value["flush_strategy"], "FailingConnectionOnly");
    assert!(value.get("max_size").is_none());

    let back: PoolConfiguration = serde_json::from_value(value).unwrap();
    assert_eq!(back, config);
}

#[test]
fn test_unknown_flush_strategy_is_rejected() {
    let result: std::result::Result<PoolConfiguration, _> =
        serde_json::from_str(r#"{"flush_strategy": "Sometimes"}"#);
    assert!(result.is_err());
}

#[test]
fn test_flush_strategy_from_descriptor_text() {
    assert_eq!(
        "IdleConnections".parse::<FlushStrategy>().unwrap(),
        FlushStrategy::IdleConnections
    );
    assert_eq!(
        "ALL_GRACEFULLY".parse::<FlushStrategy>().unwrap(),
        FlushStrategy::AllGracefully
    );
    assert_eq!(
        " entire-pool".trim().parse::<FlushStrategy>().unwrap(),
        FlushStrategy::EntirePool
    );
    let err = "Never".parse::<FlushStrategy>().unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);
}

#[test]
fn test_builder_rejects_invalid_configuration() {
    struct NoFactory;

    #[async_trait::async_trait]
    impl ManagedConnectionFactory for NoFactory {
        async fn create_managed_connection(
            &self,
            _subject: Option<&Subject>,
            _cri: Option<&ConnectionRequestInfo>,
        ) -> rivven_jca::Result<std::sync::Arc<dyn ManagedConnection>> {
            Err(Error::unsupported("no connections"))
        }
    }

    let err = Pool::builder(std::sync::Arc::new(NoFactory))
        .config(PoolConfiguration::new("bad").with_min_size(5).with_max_size(2))
        .build()
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);

    let err = Pool::builder(std::sync::Arc::new(NoFactory))
        .config(
            PoolConfiguration::new("bad-capacity")
                .with_capacity(CapacityConfig::default().with_decrementer("Shrinker")),
        )
        .build()
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);
}
