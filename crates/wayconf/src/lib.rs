//! Layered configuration for the waypost tracker and its CLI.
//!
//! Only serde, toml and directories are pulled in, so the store and the
//! tracker can both depend on it.
//!
//! # Sections
//!
//! - **Infrastructure** (`[paths]`, `[telemetry]`): where the durable store
//!   lives, log filters, OTLP export.
//! - **Tracking** (`[session]`, `[session.fingerprint]`, `[transport]`): the
//!   knobs of the session manager and the real-time transport.
//!
//! # Usage
//!
//! ```rust,no_run
//! use wayconf::WaypostConfig;
//!
//! let config = WaypostConfig::load().expect("Failed to load config");
//! println!("store: {}", config.paths.store_dir.display());
//! println!("session timeout: {}ms", config.session.timeout_ms);
//! ```
//!
//! # Precedence
//!
//! Lowest first; tables merge key by key:
//! 1. `/etc/waypost/config.toml` (system)
//! 2. `~/.config/waypost/config.toml` (user)
//! 3. `./waypost.toml` (local override, or the `--config` path)
//! 4. Environment variables (`WAYPOST_*`)
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! store_dir = "~/.local/share/waypost/store"
//!
//! [telemetry]
//! log_level = "info,waypost=debug"
//!
//! [session]
//! timeout_ms = 1800000
//!
//! [session.fingerprint]
//! canvas = false
//!
//! [transport]
//! url = "wss://collector.example.com/ws"
//! message_queue_size = 500
//! ```

pub mod infra;
pub mod loader;
pub mod tracking;

pub use infra::{PathsConfig, TelemetryConfig};
pub use loader::{config_files, ConfigSources};
pub use tracking::{FingerprintSettings, SessionSettings, TransportSettings};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// A config file that could not be read or deserialized.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config in {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete waypost configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WaypostConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub session: SessionSettings,

    #[serde(default)]
    pub transport: TransportSettings,
}

impl WaypostConfig {
    /// Search path plus environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration with an explicit file taking the place of `./waypost.toml`.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_sources_from(config_path).map(|(config, _)| config)
    }

    /// Like [`load_from`](Self::load_from), also reporting which files and
    /// variables were applied.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::config_files(config_path) {
            let table = loader::load_table(&path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let mut config = loader::from_table(merged, Path::new("<merged>"))?;
        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// The effective config as TOML, suitable for `waypost.toml`.
    pub fn to_toml(&self) -> String {
        let body = toml::to_string_pretty(self).unwrap_or_default();
        format!("# waypost configuration\n\n{}", body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_tracker_defaults() {
        let config = WaypostConfig::default();
        assert_eq!(config.session.timeout_ms, 30 * 60 * 1000);
        assert_eq!(config.transport.message_queue_size, 1000);
        assert!(config.transport.url.is_empty());
    }

    #[test]
    fn test_to_toml_round_trips() {
        let config = WaypostConfig::default();
        let rendered = config.to_toml();
        assert!(rendered.contains("[paths]"));
        assert!(rendered.contains("[transport]"));
        assert!(rendered.contains("[session.fingerprint]"));

        let parsed: WaypostConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waypost.toml");
        std::fs::write(
            &path,
            r#"
[transport]
url = "ws://127.0.0.1:9000/ws"
max_reconnect_attempts = 4
"#,
        )
        .unwrap();

        let (config, sources) = WaypostConfig::load_with_sources_from(Some(&path)).unwrap();
        assert!(sources.files.contains(&path));
        assert_eq!(config.transport.max_reconnect_attempts, 4);
        // Untouched sections keep their defaults
        assert_eq!(config.session, SessionSettings::default());
    }
}
