//! Infrastructure configuration - where state lives and how we log.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Filesystem paths for waypost state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory for the durable store (one file per key).
    /// Default: ~/.local/share/waypost/store
    #[serde(default = "PathsConfig::default_store_dir")]
    pub store_dir: PathBuf,
}

impl PathsConfig {
    fn default_store_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".local/share/waypost/store"))
            .unwrap_or_else(|| PathBuf::from(".local/share/waypost/store"))
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            store_dir: Self::default_store_dir(),
        }
    }
}

/// Log filtering and OTLP export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// OTLP gRPC endpoint for OpenTelemetry. Empty disables export.
    /// Default: "" (stderr logging only)
    #[serde(default)]
    pub otlp_endpoint: String,

    /// Log level / EnvFilter directive (trace, debug, info, warn, error).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }

    /// Whether OTLP export was requested.
    pub fn otlp_enabled(&self) -> bool {
        !self.otlp_endpoint.trim().is_empty()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: String::new(),
            log_level: Self::default_log_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths_are_not_tilde() {
        let paths = PathsConfig::default();
        assert!(!paths.store_dir.to_string_lossy().starts_with('~'));
        assert!(paths.store_dir.ends_with("waypost/store"));
    }

    #[test]
    fn otlp_disabled_by_default() {
        let telemetry = TelemetryConfig::default();
        assert!(!telemetry.otlp_enabled());
        assert_eq!(telemetry.log_level, "info");
    }
}
