//! Crawler configuration.
//!
//! [`CrawlerConfig`] can be loaded from TOML with [`CrawlerConfig::from_file`],
//! built from the [`CrawlerConfig::mainnet`]/[`CrawlerConfig::testnet`]
//! presets, and overridden from `LOOKOUT_*` environment variables. Every
//! field has a default, so a config file only needs the values it changes:
//!
//! ```toml
//! network_passphrase = "Test SDF Network ; September 2015"
//! max_open_connections = 50
//! blacklist = ["GBLACKLISTED..."]
//!
//! [logging]
//! level = "debug"
//! format = "json"
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use lookout_common::{NetworkId, MAINNET_PASSPHRASE, TESTNET_PASSPHRASE};
use lookout_crypto::PublicKey;
use serde::{Deserialize, Serialize};
use stellar_xdr::curr::NodeId;

use crate::error::CrawlerError;
use crate::logging::{LogConfig, LogFormat};

/// Default number of simultaneously open connections.
pub const DEFAULT_MAX_OPEN_CONNECTIONS: usize = 25;
/// Default global crawl deadline (30 minutes).
pub const DEFAULT_MAX_CRAWL_TIME_SECS: u64 = 1800;
/// Default period of the listen-duration policy.
pub const DEFAULT_SCP_LISTEN_TIMEOUT_MS: u64 = 6000;
/// Default listen cycle cap, about 100 seconds at the default period.
pub const DEFAULT_MAX_LISTEN_CYCLES: u32 = 17;
/// Default time to wait for a quorum set reply before asking someone else.
pub const DEFAULT_QUORUM_SET_REQUEST_TIMEOUT_MS: u64 = 2000;
/// Default capacity of the recently-seen envelope cache.
pub const DEFAULT_ENVELOPE_CACHE_SIZE: usize = 5000;
/// Default period of the crawl progress log line.
pub const DEFAULT_PROGRESS_LOG_INTERVAL_SECS: u64 = 10;

/// Configuration for a [`Crawler`](crate::Crawler).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Passphrase of the network being crawled. SCP signatures are verified
    /// against its hash.
    pub network_passphrase: String,

    /// Maximum number of connections being attempted or listened to at once.
    pub max_open_connections: usize,

    /// Wall-clock limit for a whole crawl.
    pub max_crawl_time_secs: u64,

    /// Period of the listen-duration policy.
    pub scp_listen_timeout_ms: u64,

    /// Hard cap on listen cycles per connection.
    pub max_listen_cycles: u32,

    /// How long to wait for a quorum set reply.
    pub quorum_set_request_timeout_ms: u64,

    /// Capacity of the recently-seen envelope signature cache.
    pub envelope_cache_size: usize,

    /// Period of the progress log line while a crawl runs.
    pub progress_log_interval_secs: u64,

    /// Public keys (G...) whose connections are dropped right after the handshake.
    pub blacklist: Vec<String>,

    /// Logging settings.
    pub logging: LoggingConfig,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            network_passphrase: MAINNET_PASSPHRASE.to_string(),
            max_open_connections: DEFAULT_MAX_OPEN_CONNECTIONS,
            max_crawl_time_secs: DEFAULT_MAX_CRAWL_TIME_SECS,
            scp_listen_timeout_ms: DEFAULT_SCP_LISTEN_TIMEOUT_MS,
            max_listen_cycles: DEFAULT_MAX_LISTEN_CYCLES,
            quorum_set_request_timeout_ms: DEFAULT_QUORUM_SET_REQUEST_TIMEOUT_MS,
            envelope_cache_size: DEFAULT_ENVELOPE_CACHE_SIZE,
            progress_log_interval_secs: DEFAULT_PROGRESS_LOG_INTERVAL_SECS,
            blacklist: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl CrawlerConfig {
    /// Defaults for the public network.
    pub fn mainnet() -> Self {
        Self::default()
    }

    /// Defaults for the test network.
    pub fn testnet() -> Self {
        Self {
            network_passphrase: TESTNET_PASSPHRASE.to_string(),
            ..Self::default()
        }
    }

    /// Parse a configuration from TOML text.
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content).context("failed to parse crawler config")?;
        Ok(config)
    }

    /// Load a configuration from a TOML file, then apply `LOOKOUT_*`
    /// environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config =
            Self::from_toml_str(&content).with_context(|| format!("in {}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `LOOKOUT_*` environment variable overrides.
    ///
    /// Unparseable numeric values are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("LOOKOUT_NETWORK_PASSPHRASE") {
            self.network_passphrase = val;
        }
        if let Some(val) = env_parse("LOOKOUT_MAX_OPEN_CONNECTIONS") {
            self.max_open_connections = val;
        }
        if let Some(val) = env_parse("LOOKOUT_MAX_CRAWL_TIME_SECS") {
            self.max_crawl_time_secs = val;
        }
        if let Some(val) = env_parse("LOOKOUT_SCP_LISTEN_TIMEOUT_MS") {
            self.scp_listen_timeout_ms = val;
        }
        if let Ok(val) = std::env::var("LOOKOUT_LOG_LEVEL") {
            self.logging.level = val;
        }
    }

    /// Check configuration consistency.
    pub fn validate(&self) -> Result<(), CrawlerError> {
        if self.network_passphrase.is_empty() {
            return Err(CrawlerError::InvalidConfig(
                "network_passphrase must not be empty".to_string(),
            ));
        }
        if self.max_open_connections == 0 {
            return Err(CrawlerError::InvalidConfig(
                "max_open_connections must be > 0".to_string(),
            ));
        }
        if self.max_crawl_time_secs == 0 {
            return Err(CrawlerError::InvalidConfig(
                "max_crawl_time_secs must be > 0".to_string(),
            ));
        }
        if self.scp_listen_timeout_ms == 0 {
            return Err(CrawlerError::InvalidConfig(
                "scp_listen_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.max_listen_cycles == 0 {
            return Err(CrawlerError::InvalidConfig(
                "max_listen_cycles must be > 0".to_string(),
            ));
        }
        if self.quorum_set_request_timeout_ms == 0 {
            return Err(CrawlerError::InvalidConfig(
                "quorum_set_request_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.envelope_cache_size == 0 {
            return Err(CrawlerError::InvalidConfig(
                "envelope_cache_size must be > 0".to_string(),
            ));
        }
        if self.progress_log_interval_secs == 0 {
            return Err(CrawlerError::InvalidConfig(
                "progress_log_interval_secs must be > 0".to_string(),
            ));
        }
        self.blacklisted_nodes()?;
        Ok(())
    }

    /// Parse the blacklist into node identities.
    pub fn blacklisted_nodes(&self) -> Result<HashSet<NodeId>, CrawlerError> {
        self.blacklist
            .iter()
            .map(|key| {
                PublicKey::from_strkey(key)
                    .map(|pk| pk.to_node_id())
                    .map_err(|e| CrawlerError::InvalidConfig(format!("blacklist entry: {e}")))
            })
            .collect()
    }

    pub fn network_id(&self) -> NetworkId {
        NetworkId::from_passphrase(&self.network_passphrase)
    }

    pub fn max_crawl_time(&self) -> Duration {
        Duration::from_secs(self.max_crawl_time_secs)
    }

    pub fn scp_listen_timeout(&self) -> Duration {
        Duration::from_millis(self.scp_listen_timeout_ms)
    }

    pub fn quorum_set_request_timeout(&self) -> Duration {
        Duration::from_millis(self.quorum_set_request_timeout_ms)
    }

    pub fn progress_log_interval(&self) -> Duration {
        Duration::from_secs(self.progress_log_interval_secs)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|val| val.parse().ok())
}

/// Logging section of the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum level: trace, debug, info, warn or error.
    pub level: String,
    /// Output format: text or json.
    pub format: String,
    /// ANSI colors in text output.
    pub colors: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            colors: true,
        }
    }
}

impl LoggingConfig {
    /// Convert to the settings used by [`crate::logging::init`].
    pub fn to_log_config(&self) -> LogConfig {
        let format = match self.format.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        };
        LogConfig {
            format,
            ansi_colors: self.colors && format == LogFormat::Text,
            ..LogConfig::default()
        }
        .with_level(&self.level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lookout_crypto::SecretKey;

    #[test]
    fn test_defaults() {
        let config = CrawlerConfig::default();
        assert_eq!(config.max_open_connections, 25);
        assert_eq!(config.max_crawl_time(), Duration::from_secs(1800));
        assert_eq!(config.scp_listen_timeout(), Duration::from_millis(6000));
        assert_eq!(config.max_listen_cycles, 17);
        assert_eq!(config.quorum_set_request_timeout(), Duration::from_secs(2));
        assert_eq!(config.envelope_cache_size, 5000);
        assert_eq!(config.network_id(), NetworkId::mainnet());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_testnet_preset() {
        let config = CrawlerConfig::testnet();
        assert_eq!(config.network_id(), NetworkId::testnet());
        assert_eq!(config.max_open_connections, DEFAULT_MAX_OPEN_CONNECTIONS);
    }

    #[test]
    fn test_partial_toml() {
        let config = CrawlerConfig::from_toml_str(
            r#"
            max_open_connections = 3
            scp_listen_timeout_ms = 50

            [logging]
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_open_connections, 3);
        assert_eq!(config.scp_listen_timeout(), Duration::from_millis(50));
        assert_eq!(config.max_listen_cycles, DEFAULT_MAX_LISTEN_CYCLES);
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_toml() {
        assert!(CrawlerConfig::from_toml_str("max_open_connections = \"many\"").is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = CrawlerConfig::from_file("/nonexistent/lookout.toml").unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("LOOKOUT_MAX_CRAWL_TIME_SECS", "90");
        std::env::set_var("LOOKOUT_SCP_LISTEN_TIMEOUT_MS", "soon");
        let mut config = CrawlerConfig::default();
        config.apply_env_overrides();
        std::env::remove_var("LOOKOUT_MAX_CRAWL_TIME_SECS");
        std::env::remove_var("LOOKOUT_SCP_LISTEN_TIMEOUT_MS");

        assert_eq!(config.max_crawl_time(), Duration::from_secs(90));
        assert_eq!(config.scp_listen_timeout(), Duration::from_millis(6000));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = CrawlerConfig::default();
        config.max_open_connections = 0;
        assert!(matches!(
            config.validate(),
            Err(CrawlerError::InvalidConfig(_))
        ));

        let mut config = CrawlerConfig::default();
        config.max_listen_cycles = 0;
        assert!(config.validate().is_err());

        let mut config = CrawlerConfig::default();
        config.envelope_cache_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_blacklist() {
        let key = SecretKey::from_seed(&[3u8; 32]).public_key();
        let mut config = CrawlerConfig::default();
        config.blacklist = vec![key.to_strkey()];
        let nodes = config.blacklisted_nodes().unwrap();
        assert!(nodes.contains(&key.to_node_id()));

        config.blacklist.push("not-a-key".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_logging_section() {
        let logging = LoggingConfig {
            level: "debug".to_string(),
            format: "json".to_string(),
            colors: true,
        };
        let log_config = logging.to_log_config();
        assert_eq!(log_config.format, LogFormat::Json);
        assert_eq!(log_config.level, tracing::Level::DEBUG);
        assert!(!log_config.ansi_colors);
    }
}
