//! Engine configuration
//!
//! Layered the usual way: built-in defaults, then an optional TOML file,
//! then `PHOTONWIRE_`-prefixed environment variables with `__` between
//! section and key (`PHOTONWIRE_SERVER__BIND_ADDR=0.0.0.0:9000`).

use crate::buffer::PoolConfig;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

const ENV_PREFIX: &str = "PHOTONWIRE";

/// Ids below this are reserved
pub const FIRST_SOCKET_ID: u64 = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub server: ServerSection,
    pub read_pool: PoolConfig,
    pub write_pool: PoolConfig,
    pub event_loop: LoopConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind_addr: SocketAddr,
    /// Accepted connections waiting for the socket processor
    pub inbound_queue_capacity: usize,
    pub accept_poll_interval_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 9999)),
            inbound_queue_capacity: 1024,
            accept_poll_interval_ms: 100,
        }
    }
}

impl ServerSection {
    pub fn accept_poll_interval(&self) -> Duration {
        Duration::from_millis(self.accept_poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Sleep after a cycle that did no work
    pub idle_backoff_ms: u64,
    /// Double the idle sleep on consecutive idle cycles
    pub adaptive_backoff: bool,
    pub max_idle_backoff_ms: u64,
    /// Scratch buffer for socket reads
    pub read_buffer_size: usize,
    pub events_capacity: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            idle_backoff_ms: 1,
            adaptive_backoff: true,
            max_idle_backoff_ms: 100,
            read_buffer_size: 1024 * 1024,
            events_capacity: 1024,
        }
    }
}

impl LoopConfig {
    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    pub fn max_idle_backoff(&self) -> Duration {
        Duration::from_millis(self.max_idle_backoff_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server: ServerSection::default(),
            read_pool: PoolConfig::default(),
            write_pool: PoolConfig::default(),
            event_loop: LoopConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load defaults, then `path` if given, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: EngineConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.read_pool
            .validate()
            .map_err(|e| Error::Config(format!("read_pool: {}", e)))?;
        self.write_pool
            .validate()
            .map_err(|e| Error::Config(format!("write_pool: {}", e)))?;

        if self.server.inbound_queue_capacity == 0 {
            return Err(Error::Config(
                "server.inbound_queue_capacity must be non-zero".into(),
            ));
        }
        if self.server.accept_poll_interval_ms == 0 {
            return Err(Error::Config(
                "server.accept_poll_interval_ms must be non-zero".into(),
            ));
        }
        if self.event_loop.read_buffer_size == 0 || self.event_loop.events_capacity == 0 {
            return Err(Error::Config(
                "event_loop.read_buffer_size and events_capacity must be non-zero".into(),
            ));
        }
        if self.event_loop.max_idle_backoff_ms < self.event_loop.idle_backoff_ms {
            return Err(Error::Config(format!(
                "event_loop.max_idle_backoff_ms ({}) is below idle_backoff_ms ({})",
                self.event_loop.max_idle_backoff_ms, self.event_loop.idle_backoff_ms
            )));
        }
        Ok(())
    }

    /// Effective configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{TierConfig, KB};
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.read_pool.small, TierConfig::new(4 * KB, 1024));
        assert_eq!(config.server.inbound_queue_capacity, 1024);
    }

    #[test]
    fn test_rejects_non_increasing_tiers() {
        let mut config = EngineConfig::default();
        config.write_pool.medium = TierConfig::new(4 * KB, 8);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("write_pool"));
    }

    #[test]
    fn test_rejects_inverted_backoff() {
        let mut config = EngineConfig::default();
        config.event_loop.idle_backoff_ms = 50;
        config.event_loop.max_idle_backoff_ms = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip_through_loader() {
        let mut config = EngineConfig::default();
        config.server.bind_addr = "127.0.0.1:7000".parse().unwrap();
        config.read_pool.large = TierConfig::new(2 * 1024 * 1024, 4);
        config.event_loop.adaptive_backoff = false;

        let path = std::env::temp_dir().join(format!(
            "photonwire-config-{}.toml",
            std::process::id()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(config.to_toml().unwrap().as_bytes()).unwrap();
        drop(file);

        let loaded = EngineConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let path = std::env::temp_dir().join(format!(
            "photonwire-partial-{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, "[event_loop]\nidle_backoff_ms = 5\n").unwrap();

        let loaded = EngineConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded.event_loop.idle_backoff_ms, 5);
        assert_eq!(loaded.read_pool, PoolConfig::default());
    }
}
