//! Layered key/value persistence for waypost.
//!
//! A [`PersistentStore`] stacks storage layers in priority order:
//! durable (files) → session-scoped (memory, one per browsing context) →
//! in-memory fallback. Entries carry an optional expiry and read as absent
//! once it passes.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use waystore::{PersistentStore, StoreConfig};
//! use std::time::Duration;
//!
//! let store = PersistentStore::open(&StoreConfig::from_env()).unwrap();
//! store.set_with_ttl("visitor", "v-123", Duration::from_secs(86_400)).unwrap();
//! let visitor: Option<String> = store.get("visitor").unwrap();
//! ```
//!
//! # Several contexts
//!
//! [`StorageBroker`] hands out one store per browsing context. They share the
//! durable layer and get a [`ChangeFeed`] of each other's writes, which is
//! what cross-tab session synchronization listens to.
//!
//! # Configuration
//!
//! Environment variables:
//! - `WAYPOST_STORE_PATH`: Base path for the durable layer

pub mod backend;
pub mod broker;
pub mod config;
pub mod entry;
pub mod store;

pub use backend::{FileBackend, MemoryBackend, StorageBackend};
pub use broker::{ChangeFeed, StorageBroker, StorageChange};
pub use config::StoreConfig;
pub use entry::StoredEntry;
pub use store::{LayerKind, PersistentStore, PersistentStoreBuilder};

use thiserror::Error;

/// Errors raised by storage layers.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{backend} backend I/O failed for {key}: {source}")]
    Io {
        backend: &'static str,
        key: String,
        source: std::io::Error,
    },

    #[error("failed to encode value for {key}: {source}")]
    Encode {
        key: String,
        source: serde_json::Error,
    },

    #[error("corrupt entry for {key}: {source}")]
    Corrupt {
        key: String,
        source: serde_json::Error,
    },

    #[error("{0} backend is unavailable")]
    Unavailable(&'static str),

    #[error("no storage layer accepted the write for {0}")]
    AllLayersFailed(String),
}
