//! Store configuration with environment variable loading.
//!
//! Environment variables:
//! - `WAYPOST_STORE_PATH`: Base path for the durable layer
//!
//! Default path: `~/.local/share/waypost/store`

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Configuration for the durable store layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Base path for durable storage.
    pub base_path: PathBuf,

    /// Subdirectory under `base_path`, so several sites/hosts can share a base.
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_path: default_store_path(),
            namespace: default_namespace(),
        }
    }
}

fn default_store_path() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".local/share/waypost/store"))
        .unwrap_or_else(|| PathBuf::from(".local/share/waypost/store"))
}

impl StoreConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let base_path = env::var("WAYPOST_STORE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_store_path());

        Self {
            base_path,
            namespace: default_namespace(),
        }
    }

    /// Create a config with a specific base path.
    pub fn with_base_path(path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: path.into(),
            namespace: default_namespace(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Directory holding the durable key files.
    pub fn entries_dir(&self) -> PathBuf {
        self.base_path.join(&self.namespace)
    }
}
