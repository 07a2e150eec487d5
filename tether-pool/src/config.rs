//! Pool configuration.

use crate::error::{PoolError, PoolResult};
use serde::{Deserialize, Serialize};
use tether_timer::INFINITE;

/// Connection pool configuration.
///
/// Durations are milliseconds as `i32`; [`INFINITE`] (`-1`) means no limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum streams owned by the pool; `0` means unbounded
    pub max_pool_size: usize,
    /// Idle sweeps never evict below this many streams
    pub min_pool_size: usize,
    /// Idle lifetime; sweeps run every half of this
    pub idle_timeout_ms: i32,
    /// How long acquisition waits for a stream
    pub creation_timeout_ms: i32,
    /// How long the pool stays errored after an abort
    pub error_backoff_ms: i32,
    /// How long the async worker thread idles before exiting
    pub async_worker_idle_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 10,
            min_pool_size: 0,
            idle_timeout_ms: 100_000,
            creation_timeout_ms: 100_000,
            error_backoff_ms: 5_000,
            async_worker_idle_ms: 500,
        }
    }
}

impl PoolConfig {
    /// Create a configuration with the given maximum size.
    pub fn new(max_pool_size: usize) -> Self {
        Self {
            max_pool_size,
            ..Self::default()
        }
    }

    /// Create a configuration builder.
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::new()
    }

    /// Create a builder seeded from environment variables.
    ///
    /// Reads `TETHER_POOL_MAX`, `TETHER_POOL_MIN`,
    /// `TETHER_POOL_IDLE_TIMEOUT_MS` and `TETHER_POOL_CREATION_TIMEOUT_MS`.
    /// Unparseable values are ignored.
    pub fn from_env() -> PoolConfigBuilder {
        let mut builder = PoolConfigBuilder::new();

        if let Ok(max) = std::env::var("TETHER_POOL_MAX")
            && let Ok(max) = max.parse()
        {
            builder = builder.max_pool_size(max);
        }

        if let Ok(min) = std::env::var("TETHER_POOL_MIN")
            && let Ok(min) = min.parse()
        {
            builder = builder.min_pool_size(min);
        }

        if let Ok(idle) = std::env::var("TETHER_POOL_IDLE_TIMEOUT_MS")
            && let Ok(idle) = idle.parse()
        {
            builder = builder.idle_timeout_ms(idle);
        }

        if let Ok(timeout) = std::env::var("TETHER_POOL_CREATION_TIMEOUT_MS")
            && let Ok(timeout) = timeout.parse()
        {
            builder = builder.creation_timeout_ms(timeout);
        }

        builder
    }

    /// Check the configuration for contradictions.
    pub fn validate(&self) -> PoolResult<()> {
        if self.max_pool_size != 0 && self.min_pool_size > self.max_pool_size {
            return Err(PoolError::Config(format!(
                "min_pool_size ({}) exceeds max_pool_size ({})",
                self.min_pool_size, self.max_pool_size
            )));
        }

        for (name, value) in [
            ("idle_timeout_ms", self.idle_timeout_ms),
            ("creation_timeout_ms", self.creation_timeout_ms),
            ("error_backoff_ms", self.error_backoff_ms),
        ] {
            if value < 0 && value != INFINITE {
                return Err(PoolError::Config(format!(
                    "{name} must be >= 0 or INFINITE, got {value}"
                )));
            }
        }

        Ok(())
    }

    /// Period of the idle sweep: half the idle timeout, at least 1ms.
    pub fn sweep_period_ms(&self) -> i32 {
        if self.idle_timeout_ms == INFINITE {
            INFINITE
        } else {
            (self.idle_timeout_ms / 2).max(1)
        }
    }
}

/// Builder for [`PoolConfig`].
#[derive(Debug, Default)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum pool size; `0` means unbounded.
    pub fn max_pool_size(mut self, size: usize) -> Self {
        self.config.max_pool_size = size;
        self
    }

    /// Set the minimum pool size kept through idle sweeps.
    pub fn min_pool_size(mut self, size: usize) -> Self {
        self.config.min_pool_size = size;
        self
    }

    /// Set the idle timeout.
    pub fn idle_timeout_ms(mut self, ms: i32) -> Self {
        self.config.idle_timeout_ms = ms;
        self
    }

    /// Set the acquisition timeout.
    pub fn creation_timeout_ms(mut self, ms: i32) -> Self {
        self.config.creation_timeout_ms = ms;
        self
    }

    /// Set the error backoff window.
    pub fn error_backoff_ms(mut self, ms: i32) -> Self {
        self.config.error_backoff_ms = ms;
        self
    }

    /// Set how long the async worker idles before exiting.
    pub fn async_worker_idle_ms(mut self, ms: u64) -> Self {
        self.config.async_worker_idle_ms = ms;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> PoolConfig {
        self.config
    }
}
