//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{MemDbError, MemDbResult};

const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 10;
const DEFAULT_EVICT_INTERVAL_SECS: u64 = 30;
const DEFAULT_MAX_CONNECTIONS: usize = 5;

/// Configuration for a MEMDB engine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemDbConfig {
    /// Connection string for the persistent store.
    pub db_url: String,
    /// Period between background flush ticks.
    pub flush_interval: Duration,
    /// Idle TTL for clean entries; also the eviction tick period.
    pub evict_interval: Duration,
    /// Upper bound on the store connection pool.
    pub max_connections: usize,
}

impl MemDbConfig {
    /// Create a configuration with default intervals for the given store.
    pub fn new(db_url: impl Into<String>) -> Self {
        Self {
            db_url: db_url.into(),
            flush_interval: Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS),
            evict_interval: Duration::from_secs(DEFAULT_EVICT_INTERVAL_SECS),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }

    /// Create a configuration from environment variables.
    ///
    /// # Environment Variables
    /// - `PG_DSN`: connection string (required)
    /// - `FLUSH_INTERVAL`: seconds between flush ticks (default: 10)
    /// - `IDLE_TTL`: idle TTL / eviction period in seconds (default: 30)
    /// - `MAX_CONNECTIONS`: pool upper bound (default: 5)
    pub fn from_env() -> MemDbResult<Self> {
        let db_url = std::env::var("PG_DSN")
            .map_err(|_| MemDbError::invalid_argument("PG_DSN is not set"))?;

        let flush_interval = Duration::from_secs(
            std::env::var("FLUSH_INTERVAL")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_FLUSH_INTERVAL_SECS),
        );

        let evict_interval = Duration::from_secs(
            std::env::var("IDLE_TTL")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_EVICT_INTERVAL_SECS),
        );

        let max_connections = std::env::var("MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_CONNECTIONS);

        let config = Self {
            db_url,
            flush_interval,
            evict_interval,
            max_connections,
        };
        config.validate()?;
        Ok(config)
    }

    /// Create a configuration for development/testing with short intervals.
    pub fn development(db_url: impl Into<String>) -> Self {
        Self {
            db_url: db_url.into(),
            flush_interval: Duration::from_secs(1),
            evict_interval: Duration::from_secs(2),
            max_connections: 2,
        }
    }

    /// Set the flush interval.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the idle TTL / eviction period.
    pub fn with_evict_interval(mut self, interval: Duration) -> Self {
        self.evict_interval = interval;
        self
    }

    /// Set the connection pool bound.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Check interval and pool bounds.
    pub fn validate(&self) -> MemDbResult<()> {
        if self.db_url.is_empty() {
            return Err(MemDbError::invalid_argument("db_url must not be empty"));
        }
        if self.flush_interval < Duration::from_secs(1) {
            return Err(MemDbError::invalid_argument(
                "flush_interval must be at least 1 second",
            ));
        }
        if self.evict_interval < Duration::from_secs(1) {
            return Err(MemDbError::invalid_argument(
                "evict_interval must be at least 1 second",
            ));
        }
        if self.max_connections == 0 {
            return Err(MemDbError::invalid_argument(
                "max_connections must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = MemDbConfig::new("postgres://localhost/memdb");
        assert_eq!(config.flush_interval, Duration::from_secs(10));
        assert_eq!(config.evict_interval, Duration::from_secs(30));
        assert_eq!(config.max_connections, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = MemDbConfig::new("postgres://localhost/memdb")
            .with_flush_interval(Duration::from_secs(5))
            .with_evict_interval(Duration::from_secs(60))
            .with_max_connections(8);
        assert_eq!(config.flush_interval, Duration::from_secs(5));
        assert_eq!(config.evict_interval, Duration::from_secs(60));
        assert_eq!(config.max_connections, 8);
    }

    #[test]
    fn test_config_validation_rejects_bad_bounds() {
        let base = MemDbConfig::new("postgres://localhost/memdb");

        let config = base.clone().with_flush_interval(Duration::from_millis(100));
        assert!(config.validate().is_err());

        let config = base.clone().with_evict_interval(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = base.with_max_connections(0);
        assert!(config.validate().is_err());

        let config = MemDbConfig::new("");
        assert!(config.validate().is_err());
    }
}
