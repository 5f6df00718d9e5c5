use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::core::delivery::DeliveryConfig;
use crate::net::NetworkConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind_addr: String,
    pub port: u16,
    /// Default visibility timeout for reads that do not pass their own.
    pub visibility_timeout_ms: u64,
    pub expired_lease_retention_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: 4242,
            visibility_timeout_ms: 30_000,
            expired_lease_retention_ms: 60_000,
            shutdown_grace_ms: 2_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    pub bind_addr: Option<String>,
    pub port: Option<u16>,
    pub visibility_timeout_ms: Option<u64>,
    pub expired_lease_retention_ms: Option<u64>,
    pub shutdown_grace_ms: Option<u64>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("config parse error: {0}")]
    Parse(String),
}

fn env_number<T>(name: &str, slot: &mut T) -> Result<(), ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(v) = env::var(name) {
        *slot = v
            .parse()
            .map_err(|e| ConfigError::Parse(format!("{name}: {e}")))?;
    }
    Ok(())
}

impl Config {
    fn load_file<P: AsRef<Path>>(path: P) -> Result<FileConfig, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let cfg: FileConfig = toml::from_str(&raw)?;
        Ok(cfg)
    }

    /// Load configuration from an optional file path and environment variables.
    ///
    /// Precedence: file values provide defaults, environment variables override.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let env_path = env::var("LEASEMQ_CONFIG").ok();
        let effective_path = path.map(|s| s.to_string()).or(env_path);

        let file_cfg = if let Some(p) = effective_path {
            Self::load_file(p)?
        } else {
            FileConfig::default()
        };

        let defaults = Config::default();
        let mut cfg = Config {
            bind_addr: file_cfg.bind_addr.unwrap_or(defaults.bind_addr),
            port: file_cfg.port.unwrap_or(defaults.port),
            visibility_timeout_ms: file_cfg
                .visibility_timeout_ms
                .unwrap_or(defaults.visibility_timeout_ms),
            expired_lease_retention_ms: file_cfg
                .expired_lease_retention_ms
                .unwrap_or(defaults.expired_lease_retention_ms),
            shutdown_grace_ms: file_cfg
                .shutdown_grace_ms
                .unwrap_or(defaults.shutdown_grace_ms),
        };

        // Env overrides.
        if let Ok(v) = env::var("LEASEMQ_BIND_ADDR") {
            cfg.bind_addr = v;
        }
        env_number("LEASEMQ_PORT", &mut cfg.port)?;
        env_number("LEASEMQ_VISIBILITY_TIMEOUT_MS", &mut cfg.visibility_timeout_ms)?;
        env_number(
            "LEASEMQ_EXPIRED_LEASE_RETENTION_MS",
            &mut cfg.expired_lease_retention_ms,
        )?;
        env_number("LEASEMQ_SHUTDOWN_GRACE_MS", &mut cfg.shutdown_grace_ms)?;

        if cfg.visibility_timeout_ms == 0 {
            return Err(ConfigError::Parse(
                "visibility_timeout_ms must be greater than zero".to_string(),
            ));
        }

        Ok(cfg)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_addr, self.port)
            .parse()
            .map_err(|e| ConfigError::Parse(format!("bind address {}:{}: {e}", self.bind_addr, self.port)))
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    /// Timeout for one read: an explicit value wins over the configured default.
    pub fn read_timeout(&self, override_ms: Option<u64>) -> Duration {
        override_ms.map_or_else(|| self.visibility_timeout(), Duration::from_millis)
    }

    pub fn delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            expired_retention: Duration::from_millis(self.expired_lease_retention_ms),
        }
    }

    pub fn network_config(&self) -> Result<NetworkConfig, ConfigError> {
        Ok(NetworkConfig {
            bind_addr: self.socket_addr()?,
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
        })
    }
}

/// Read a TOML file, then apply the usual environment overrides.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let path = path
        .to_str()
        .ok_or_else(|| ConfigError::Parse(format!("non UTF-8 config path {:?}", path)))?;
    Config::load(Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_to_loopback() {
        let cfg = Config::default();
        assert_eq!(cfg.socket_addr().unwrap(), "127.0.0.1:4242".parse().unwrap());
        assert_eq!(cfg.visibility_timeout(), Duration::from_secs(30));
        assert_eq!(
            cfg.delivery_config().expired_retention,
            Duration::from_secs(60)
        );
    }

    #[test]
    fn read_timeout_prefers_explicit_value() {
        let cfg = Config {
            visibility_timeout_ms: 1_500,
            ..Config::default()
        };
        assert_eq!(cfg.read_timeout(None), Duration::from_millis(1_500));
        assert_eq!(cfg.read_timeout(Some(20)), Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn configured_retention_reaches_the_coordinator() {
        use std::sync::Arc;

        use crate::core::{BrokerError, DeliveryCoordinator, QueueRegistry};

        let cfg = Config {
            visibility_timeout_ms: 1_000,
            expired_lease_retention_ms: 5_000,
            ..Config::default()
        };
        let registry = Arc::new(QueueRegistry::new());
        let coord = DeliveryCoordinator::with_config(Arc::clone(&registry), cfg.delivery_config());
        let q = coord.create_queue("q").await.unwrap();
        coord.enqueue(&q, "P").await.unwrap();

        let d = coord.read(&q, cfg.read_timeout(None)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(matches!(
            coord.ack(&q, d.entity_id),
            Err(BrokerError::LeaseExpired { .. })
        ));

        // Past the configured retention, not the 60 s default.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(matches!(
            coord.ack(&q, d.entity_id),
            Err(BrokerError::NoSuchLease { .. })
        ));
        assert_eq!(registry.depth(&q).unwrap(), 1);
    }

    #[test]
    fn bad_bind_addr_is_a_parse_error() {
        let cfg = Config {
            bind_addr: "not an address".into(),
            ..Config::default()
        };
        assert!(matches!(cfg.socket_addr(), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn file_config_rejects_unknown_keys() {
        let parsed: Result<FileConfig, _> = toml::from_str("bogus = 1");
        assert!(parsed.is_err());
    }
}
