//! Subscriber setup for programs that run crawls.
//!
//! The library itself only emits `tracing` events. A program embedding it
//! calls [`init`] once, usually with the `[logging]` section of its
//! [`CrawlerConfig`](crate::CrawlerConfig):
//!
//! ```no_run
//! use lookout_crawler::{logging, CrawlerConfig};
//!
//! let config = CrawlerConfig::from_file("lookout.toml")?;
//! logging::init(&config.logging.to_log_config())?;
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! `RUST_LOG`, when set, replaces the configured level so single modules
//! such as `lookout_crawler::quorum_set_manager` can be turned up.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    /// Text format only.
    pub ansi_colors: bool,
    pub with_source_location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Text,
            ansi_colors: true,
            with_source_location: false,
        }
    }
}

impl LogConfig {
    /// Set the level by name. `warning` is accepted; anything unknown
    /// leaves `info`.
    pub fn with_level(mut self, level: &str) -> Self {
        let name = match level.to_ascii_lowercase().as_str() {
            "warning" => "warn".to_string(),
            other => other.to_string(),
        };
        self.level = Level::from_str(&name).unwrap_or(Level::INFO);
        self
    }
}

/// Install the global subscriber.
///
/// # Errors
///
/// Fails when a global subscriber is already installed.
pub fn init(config: &LogConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));
    let registry = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(config.ansi_colors)
                    .with_file(config.with_source_location)
                    .with_line_number(config.with_source_location),
            )
            .try_init()?,
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_file(config.with_source_location)
                    .with_line_number(config.with_source_location),
            )
            .try_init()?,
    }
    Ok(())
}
