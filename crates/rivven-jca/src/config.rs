//! Pool configuration
//!
//! [`PoolConfiguration`] is the shape handed over by descriptor parsing. It is
//! validated once when a [`Pool`](crate::pool::Pool) is built and never
//! mutated afterwards.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default maximum pool size
pub const DEFAULT_MAX_POOL_SIZE: usize = 20;

/// Default blocking timeout
pub const DEFAULT_BLOCKING_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Default idle timeout
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default background validation interval
pub const DEFAULT_VALIDATION_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// What to destroy when a connection reports an error.
///
/// Strategies without the `All` prefix act on the sub-pool that owns the
/// failing connection; the `All` variants act on every sub-pool of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FlushStrategy {
    /// Only the failing connection
    #[default]
    FailingConnectionOnly,
    /// Idle connections of the owning sub-pool
    IdleConnections,
    /// Idle connections of the owning sub-pool that fail validation
    InvalidIdleConnections,
    /// Every connection of the owning sub-pool; in-use ones are detached
    EntirePool,
    /// Every connection of the owning sub-pool, in-use ones on their return
    Gracefully,
    /// Idle connections of every sub-pool
    AllIdleConnections,
    /// Invalid idle connections of every sub-pool
    AllInvalidIdleConnections,
    /// Every sub-pool, in-use connections on their return
    AllGracefully,
    /// Every connection of every sub-pool
    AllConnections,
}

impl FlushStrategy {
    /// All strategies, in descriptor order
    pub const ALL: [FlushStrategy; 9] = [
        Self::FailingConnectionOnly,
        Self::IdleConnections,
        Self::InvalidIdleConnections,
        Self::EntirePool,
        Self::Gracefully,
        Self::AllIdleConnections,
        Self::AllInvalidIdleConnections,
        Self::AllGracefully,
        Self::AllConnections,
    ];

    /// Descriptor spelling
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FailingConnectionOnly => "FailingConnectionOnly",
            Self::IdleConnections => "IdleConnections",
            Self::InvalidIdleConnections => "InvalidIdleConnections",
            Self::EntirePool => "EntirePool",
            Self::Gracefully => "Gracefully",
            Self::AllIdleConnections => "AllIdleConnections",
            Self::AllInvalidIdleConnections => "AllInvalidIdleConnections",
            Self::AllGracefully => "AllGracefully",
            Self::AllConnections => "AllConnections",
        }
    }

    /// Whether the strategy spans every sub-pool
    pub const fn is_pool_wide(self) -> bool {
        matches!(
            self,
            Self::AllIdleConnections
                | Self::AllInvalidIdleConnections
                | Self::AllGracefully
                | Self::AllConnections
        )
    }
}

impl fmt::Display for FlushStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlushStrategy {
    type Err = Error;

    /// Accepts `EntirePool`, `entire-pool` and `ENTIRE_POOL` alike.
    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .map(|c| c.to_ascii_lowercase())
            .collect();
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str().to_ascii_lowercase() == normalized)
            .ok_or_else(|| Error::config(format!("unknown flush strategy: {s}")))
    }
}

/// Capacity policy reference: a policy name plus named string parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityConfig {
    /// Incrementer policy name (no growth beyond on-demand creation when unset)
    pub incrementer: Option<String>,
    /// Incrementer parameters
    pub incrementer_properties: BTreeMap<String, String>,
    /// Decrementer policy name (`TimedOutDecrementer` when unset)
    pub decrementer: Option<String>,
    /// Decrementer parameters
    pub decrementer_properties: BTreeMap<String, String>,
}

impl CapacityConfig {
    /// Set the incrementer policy
    pub fn with_incrementer(mut self, name: impl Into<String>) -> Self {
        self.incrementer = Some(name.into());
        self
    }

    /// Add an incrementer parameter
    pub fn with_incrementer_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.incrementer_properties.insert(key.into(), value.into());
        self
    }

    /// Set the decrementer policy
    pub fn with_decrementer(mut self, name: impl Into<String>) -> Self {
        self.decrementer = Some(name.into());
        self
    }

    /// Add a decrementer parameter
    pub fn with_decrementer_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.decrementer_properties.insert(key.into(), value.into());
        self
    }
}

/// Pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfiguration {
    /// Pool name used in logs and errors
    pub pool_name: String,
    /// Minimum number of connections per sub-pool
    #[serde(rename = "min_pool_size")]
    pub min_size: usize,
    /// Fill target when a prefilled sub-pool is first created
    #[serde(rename = "initial_pool_size")]
    pub initial_size: Option<usize>,
    /// Maximum number of connections per sub-pool
    #[serde(rename = "max_pool_size")]
    pub max_size: usize,
    /// Create `min_size` connections ahead of demand
    pub prefill: bool,
    /// Never let the idle sweep shrink below `min_size`
    #[serde(rename = "use_strict_min")]
    pub strict_min: bool,
    /// Grant permits to blocked callers in arrival order
    pub fair: bool,
    /// Maximum time a caller blocks waiting for a permit
    #[serde(rename = "blocking_timeout_millis", with = "millis")]
    pub blocking_timeout: Duration,
    /// Time after which an idle connection is eligible for removal
    #[serde(rename = "idle_timeout_minutes", with = "minutes")]
    pub idle_timeout: Duration,
    /// Validate idle connections periodically
    pub background_validation: bool,
    /// Period of background validation
    #[serde(rename = "background_validation_millis", with = "millis")]
    pub background_validation_interval: Duration,
    /// Stop scanning idle connections after the first failed match
    pub use_fast_fail: bool,
    /// Validate a reused connection before handing it out
    pub validate_on_match: bool,
    /// Validate a connection before it goes back to the idle set
    pub validate_on_return: bool,
    /// Reaction to a connection error event
    pub flush_strategy: FlushStrategy,
    /// Capacity policy
    pub capacity: CapacityConfig,
    /// Keep connections used outside a transaction in their own sub-pools
    #[serde(rename = "no_tx_separate_pools")]
    pub separate_no_tx: bool,
    /// Share one connection per sub-pool within a transaction
    #[serde(rename = "track_by_tx")]
    pub track_by_transaction: bool,
    /// Maintain timing statistics
    pub statistics_enabled: bool,
}

impl Default for PoolConfiguration {
    fn default() -> Self {
        Self {
            pool_name: "default".into(),
            min_size: 0,
            initial_size: None,
            max_size: DEFAULT_MAX_POOL_SIZE,
            prefill: false,
            strict_min: false,
            fair: true,
            blocking_timeout: DEFAULT_BLOCKING_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            background_validation: false,
            background_validation_interval: DEFAULT_VALIDATION_INTERVAL,
            use_fast_fail: false,
            validate_on_match: false,
            validate_on_return: false,
            flush_strategy: FlushStrategy::default(),
            capacity: CapacityConfig::default(),
            separate_no_tx: false,
            track_by_transaction: true,
            statistics_enabled: true,
        }
    }
}

impl PoolConfiguration {
    /// Create a configuration with defaults and the given pool name
    pub fn new(pool_name: impl Into<String>) -> Self {
        Self {
            pool_name: pool_name.into(),
            ..Default::default()
        }
    }

    /// Set minimum pool size
    pub fn with_min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }

    /// Set initial pool size
    pub fn with_initial_size(mut self, size: usize) -> Self {
        self.initial_size = Some(size);
        self
    }

    /// Set maximum pool size
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Enable or disable prefill
    pub fn with_prefill(mut self, prefill: bool) -> Self {
        self.prefill = prefill;
        self
    }

    /// Enable or disable strict minimum
    pub fn with_strict_min(mut self, strict_min: bool) -> Self {
        self.strict_min = strict_min;
        self
    }

    /// Enable or disable FIFO permit grants
    pub fn with_fair(mut self, fair: bool) -> Self {
        self.fair = fair;
        self
    }

    /// Set blocking timeout
    pub fn with_blocking_timeout(mut self, timeout: Duration) -> Self {
        self.blocking_timeout = timeout;
        self
    }

    /// Set idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Enable background validation with the given interval
    pub fn with_background_validation(mut self, interval: Duration) -> Self {
        self.background_validation = true;
        self.background_validation_interval = interval;
        self
    }

    /// Enable or disable fast fail
    pub fn with_fast_fail(mut self, fast_fail: bool) -> Self {
        self.use_fast_fail = fast_fail;
        self
    }

    /// Enable or disable validation on match
    pub fn with_validate_on_match(mut self, validate: bool) -> Self {
        self.validate_on_match = validate;
        self
    }

    /// Enable or disable validation on return
    pub fn with_validate_on_return(mut self, validate: bool) -> Self {
        self.validate_on_return = validate;
        self
    }

    /// Set flush strategy
    pub fn with_flush_strategy(mut self, strategy: FlushStrategy) -> Self {
        self.flush_strategy = strategy;
        self
    }

    /// Set capacity policy
    pub fn with_capacity(mut self, capacity: CapacityConfig) -> Self {
        self.capacity = capacity;
        self
    }

    /// Enable or disable separate no-transaction sub-pools
    pub fn with_separate_no_tx(mut self, separate: bool) -> Self {
        self.separate_no_tx = separate;
        self
    }

    /// Enable or disable transaction tracking
    pub fn with_track_by_transaction(mut self, track: bool) -> Self {
        self.track_by_transaction = track;
        self
    }

    /// Enable or disable timing statistics
    pub fn with_statistics(mut self, enabled: bool) -> Self {
        self.statistics_enabled = enabled;
        self
    }

    /// Fill target for a newly created prefilled sub-pool
    pub fn initial_fill_target(&self) -> usize {
        self.initial_size.unwrap_or(self.min_size).min(self.max_size)
    }

    /// Check the configuration for contradictions
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::config("max_pool_size must be greater than 0"));
        }
        if self.min_size > self.max_size {
            return Err(Error::config(format!(
                "min_pool_size ({}) exceeds max_pool_size ({})",
                self.min_size, self.max_size
            )));
        }
        if let Some(initial) = self.initial_size {
            if initial > self.max_size {
                return Err(Error::config(format!(
                    "initial_pool_size ({initial}) exceeds max_pool_size ({})",
                    self.max_size
                )));
            }
        }
        if self.blocking_timeout.is_zero() {
            return Err(Error::config("blocking_timeout_millis must be greater than 0"));
        }
        if self.background_validation && self.background_validation_interval.is_zero() {
            return Err(Error::config(
                "background_validation_millis must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Serde helpers for Duration as milliseconds
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Serde helpers for Duration as whole minutes
mod minutes {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs() / 60)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let minutes = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(minutes.saturating_mul(60)))
    }
}
