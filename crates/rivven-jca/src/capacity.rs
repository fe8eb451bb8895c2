//! Capacity policies
//!
//! An incrementer decides how many extra connections a capacity request
//! creates after an on-demand creation; a decrementer decides which idle
//! connections the idle sweep destroys. Both are asked one step at a time:
//!
//! ```text
//!   increase_capacity:  while should_create(size, max, created) { create }
//!   remove_idle:        while should_destroy(oldest, cutoff, size, min, destroyed) { destroy oldest }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::config::CapacityConfig;
use crate::error::{Error, Result};

/// Decides whether a capacity request creates one more connection
pub trait CapacityIncrementer: Send + Sync + fmt::Debug {
    /// Policy name
    fn name(&self) -> &'static str;

    /// `created` counts the connections this request already made
    fn should_create(&self, current_size: usize, max_size: usize, created: usize) -> bool;
}

/// Decides whether the idle sweep destroys the oldest idle connection
pub trait CapacityDecrementer: Send + Sync + fmt::Debug {
    /// Policy name
    fn name(&self) -> &'static str;

    /// `destroyed` counts the connections this sweep already removed
    fn should_destroy(
        &self,
        last_used: Instant,
        cutoff: Instant,
        current_size: usize,
        min_size: usize,
        destroyed: usize,
    ) -> bool;
}

/// Grow until the pool is full
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxPoolSizeIncrementer;

impl CapacityIncrementer for MaxPoolSizeIncrementer {
    fn name(&self) -> &'static str {
        "MaxPoolSizeIncrementer"
    }

    fn should_create(&self, current_size: usize, max_size: usize, _created: usize) -> bool {
        current_size < max_size
    }
}

/// Grow by a fixed number of connections per request
#[derive(Debug, Clone, Copy)]
pub struct SizeIncrementer {
    /// Connections created per request
    pub size: usize,
}

impl Default for SizeIncrementer {
    fn default() -> Self {
        Self { size: 1 }
    }
}

impl CapacityIncrementer for SizeIncrementer {
    fn name(&self) -> &'static str {
        "SizeIncrementer"
    }

    fn should_create(&self, current_size: usize, max_size: usize, created: usize) -> bool {
        current_size < max_size && created < self.size
    }
}

/// Grow until a watermark is reached
#[derive(Debug, Clone, Copy)]
pub struct WatermarkIncrementer {
    /// Target size; `None` means the maximum pool size
    pub watermark: Option<usize>,
}

impl CapacityIncrementer for WatermarkIncrementer {
    fn name(&self) -> &'static str {
        "WatermarkIncrementer"
    }

    fn should_create(&self, current_size: usize, max_size: usize, _created: usize) -> bool {
        let watermark = self.watermark.unwrap_or(max_size).min(max_size);
        current_size < watermark
    }
}

/// Destroy connections idle since before the cutoff
#[derive(Debug, Clone, Copy, Default)]
pub struct TimedOutDecrementer;

impl CapacityDecrementer for TimedOutDecrementer {
    fn name(&self) -> &'static str {
        "TimedOutDecrementer"
    }

    fn should_destroy(
        &self,
        last_used: Instant,
        cutoff: Instant,
        _current_size: usize,
        _min_size: usize,
        _destroyed: usize,
    ) -> bool {
        last_used < cutoff
    }
}

/// Shrink to the minimum pool size, regardless of idle time
#[derive(Debug, Clone, Copy, Default)]
pub struct MinPoolSizeDecrementer;

impl CapacityDecrementer for MinPoolSizeDecrementer {
    fn name(&self) -> &'static str {
        "MinPoolSizeDecrementer"
    }

    fn should_destroy(
        &self,
        _last_used: Instant,
        _cutoff: Instant,
        current_size: usize,
        min_size: usize,
        _destroyed: usize,
    ) -> bool {
        min_size == 0 || current_size > min_size
    }
}

/// Destroy a fixed number of connections per sweep
#[derive(Debug, Clone, Copy)]
pub struct SizeDecrementer {
    /// Connections destroyed per sweep
    pub size: usize,
}

impl CapacityDecrementer for SizeDecrementer {
    fn name(&self) -> &'static str {
        "SizeDecrementer"
    }

    fn should_destroy(
        &self,
        _last_used: Instant,
        _cutoff: Instant,
        _current_size: usize,
        _min_size: usize,
        destroyed: usize,
    ) -> bool {
        destroyed < self.size
    }
}

/// Shrink down to a watermark
#[derive(Debug, Clone, Copy)]
pub struct WatermarkDecrementer {
    /// Floor kept by the sweep
    pub watermark: usize,
}

impl CapacityDecrementer for WatermarkDecrementer {
    fn name(&self) -> &'static str {
        "WatermarkDecrementer"
    }

    fn should_destroy(
        &self,
        _last_used: Instant,
        _cutoff: Instant,
        current_size: usize,
        _min_size: usize,
        _destroyed: usize,
    ) -> bool {
        current_size > self.watermark
    }
}

/// Resolved capacity policy pair
#[derive(Debug, Clone)]
pub struct Capacity {
    incrementer: Option<Arc<dyn CapacityIncrementer>>,
    decrementer: Arc<dyn CapacityDecrementer>,
}

impl Default for Capacity {
    fn default() -> Self {
        Self {
            incrementer: None,
            decrementer: Arc::new(TimedOutDecrementer),
        }
    }
}

impl Capacity {
    /// Custom policy pair
    pub fn new(
        incrementer: Option<Arc<dyn CapacityIncrementer>>,
        decrementer: Arc<dyn CapacityDecrementer>,
    ) -> Self {
        Self {
            incrementer,
            decrementer,
        }
    }

    /// Resolve policy names and parameters from configuration
    pub fn from_config(config: &CapacityConfig) -> Result<Self> {
        let incrementer: Option<Arc<dyn CapacityIncrementer>> = match config.incrementer.as_deref()
        {
            None => None,
            Some(name) => Some(match simple_name(name) {
                "MaxPoolSizeIncrementer" => Arc::new(MaxPoolSizeIncrementer),
                "SizeIncrementer" => Arc::new(SizeIncrementer {
                    size: property(&config.incrementer_properties, "size")?.unwrap_or(1),
                }),
                "WatermarkIncrementer" => Arc::new(WatermarkIncrementer {
                    watermark: property(&config.incrementer_properties, "watermark")?,
                }),
                other => {
                    return Err(Error::config(format!("unknown capacity incrementer: {other}")))
                }
            }),
        };

        let decrementer: Arc<dyn CapacityDecrementer> = match config.decrementer.as_deref() {
            None => Arc::new(TimedOutDecrementer),
            Some(name) => match simple_name(name) {
                "TimedOutDecrementer" => Arc::new(TimedOutDecrementer),
                "MinPoolSizeDecrementer" => Arc::new(MinPoolSizeDecrementer),
                "SizeDecrementer" => Arc::new(SizeDecrementer {
                    size: property(&config.decrementer_properties, "size")?.unwrap_or(1),
                }),
                "WatermarkDecrementer" => Arc::new(WatermarkDecrementer {
                    watermark: property(&config.decrementer_properties, "watermark")?
                        .unwrap_or(0),
                }),
                other => {
                    return Err(Error::config(format!("unknown capacity decrementer: {other}")))
                }
            },
        };

        Ok(Self {
            incrementer,
            decrementer,
        })
    }

    /// Configured incrementer, if any
    pub fn incrementer(&self) -> Option<&Arc<dyn CapacityIncrementer>> {
        self.incrementer.as_ref()
    }

    /// Configured decrementer
    pub fn decrementer(&self) -> &Arc<dyn CapacityDecrementer> {
        &self.decrementer
    }

    /// Whether idle removal may destroy connections that have not timed out
    pub fn is_timed_out_decrementer(&self) -> bool {
        self.decrementer.name() == "TimedOutDecrementer"
    }
}

/// Descriptors may carry fully qualified class names
fn simple_name(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

fn property(
    properties: &std::collections::BTreeMap<String, String>,
    key: &str,
) -> Result<Option<usize>> {
    properties
        .get(key)
        .map(|value| {
            value.trim().parse::<usize>().map_err(|_| {
                Error::config(format!("capacity property '{key}' is not a number: {value}"))
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_max_pool_size_incrementer() {
        let inc = MaxPoolSizeIncrementer;
        assert!(inc.should_create(0, 20, 0));
        assert!(inc.should_create(19, 20, 100));
        assert!(!inc.should_create(20, 20, 0));
    }

    #[test]
    fn test_size_incrementer() {
        let inc = SizeIncrementer { size: 2 };
        assert!(inc.should_create(1, 20, 0));
        assert!(inc.should_create(2, 20, 1));
        assert!(!inc.should_create(3, 20, 2));
        assert!(!inc.should_create(20, 20, 0));
    }

    #[test]
    fn test_watermark_incrementer() {
        let inc = WatermarkIncrementer { watermark: Some(5) };
        assert!(inc.should_create(4, 20, 0));
        assert!(!inc.should_create(5, 20, 0));

        let unbounded = WatermarkIncrementer { watermark: None };
        assert!(unbounded.should_create(19, 20, 0));
        assert!(!unbounded.should_create(20, 20, 0));
    }

    #[test]
    fn test_decrementers() {
        let now = Instant::now();
        let earlier = now.checked_sub(Duration::from_secs(10)).unwrap_or(now);

        assert!(TimedOutDecrementer.should_destroy(earlier, now, 5, 0, 0));
        assert!(!TimedOutDecrementer.should_destroy(now, earlier, 5, 0, 0));

        assert!(MinPoolSizeDecrementer.should_destroy(now, now, 5, 1, 0));
        assert!(!MinPoolSizeDecrementer.should_destroy(now, now, 1, 1, 4));
        assert!(MinPoolSizeDecrementer.should_destroy(now, now, 1, 0, 4));

        let size = SizeDecrementer { size: 2 };
        assert!(size.should_destroy(now, now, 5, 0, 1));
        assert!(!size.should_destroy(now, now, 5, 0, 2));

        let watermark = WatermarkDecrementer { watermark: 2 };
        assert!(watermark.should_destroy(now, now, 3, 0, 0));
        assert!(!watermark.should_destroy(now, now, 2, 0, 3));
    }

    #[test]
    fn test_from_config() {
        let capacity = Capacity::from_config(
            &CapacityConfig::default()
                .with_incrementer("com.acme.pool.capacity.SizeIncrementer")
                .with_incrementer_property("size", "3")
                .with_decrementer("WatermarkDecrementer")
                .with_decrementer_property("watermark", "2"),
        )
        .unwrap();

        assert_eq!(
            capacity.incrementer().map(|i| i.name()),
            Some("SizeIncrementer")
        );
        assert_eq!(capacity.decrementer().name(), "WatermarkDecrementer");
        assert!(!capacity.is_timed_out_decrementer());
    }

    #[test]
    fn test_from_config_defaults_and_errors() {
        let capacity = Capacity::from_config(&CapacityConfig::default()).unwrap();
        assert!(capacity.incrementer().is_none());
        assert!(capacity.is_timed_out_decrementer());

        assert!(Capacity::from_config(&CapacityConfig::default().with_incrementer("Nope")).is_err());
        assert!(Capacity::from_config(
            &CapacityConfig::default()
                .with_decrementer("SizeDecrementer")
                .with_decrementer_property("size", "many")
        )
        .is_err());
    }
}
