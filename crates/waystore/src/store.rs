//! PersistentStore: ordered storage layers with per-key expiry.
//!
//! Writes land in the first layer that accepts them. Reads consult every
//! layer and keep the freshest live entry, so a value that fell through to a
//! lower layer while the durable layer was failing still wins over an older
//! durable copy.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{FileBackend, MemoryBackend, StorageBackend};
use crate::broker::{ChangeFeed, StorageChange};
use crate::config::StoreConfig;
use crate::entry::StoredEntry;
use crate::StoreError;

/// Which role a layer plays in the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    /// Survives restarts, shared by every context.
    Durable,
    /// Lives as long as one browsing context.
    Session,
    /// Last resort when everything else refuses writes.
    Memory,
}

impl LayerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerKind::Durable => "durable",
            LayerKind::Session => "session",
            LayerKind::Memory => "memory",
        }
    }
}

#[derive(Clone)]
struct Layer {
    kind: LayerKind,
    backend: Arc<dyn StorageBackend>,
}

/// Layered key/value store for one browsing context.
#[derive(Clone)]
pub struct PersistentStore {
    layers: Vec<Layer>,
    context_id: String,
    changes: Option<broadcast::Sender<StorageChange>>,
}

impl std::fmt::Debug for PersistentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentStore")
            .field(
                "layers",
                &self.layers.iter().map(|l| l.kind.as_str()).collect::<Vec<_>>(),
            )
            .field("context_id", &self.context_id)
            .finish()
    }
}

impl PersistentStore {
    pub fn builder() -> PersistentStoreBuilder {
        PersistentStoreBuilder::default()
    }

    /// A store with a single memory layer. Nothing survives the process.
    pub fn in_memory() -> Self {
        Self::builder()
            .layer(LayerKind::Memory, Arc::new(MemoryBackend::new()))
            .build()
    }

    /// Durable file layer + session memory layer + memory fallback.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let durable = FileBackend::new(config.entries_dir())?;
        Ok(Self::builder()
            .layer(LayerKind::Durable, Arc::new(durable))
            .layer(LayerKind::Session, Arc::new(MemoryBackend::new()))
            .layer(LayerKind::Memory, Arc::new(MemoryBackend::new()))
            .build())
    }

    /// Identifier of the browsing context this store writes on behalf of.
    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    /// Read the freshest live value for `key` as raw JSON.
    ///
    /// Expired entries are removed from their layer and treated as absent.
    /// A layer that errors is skipped; only if every layer errors does the
    /// read fail.
    pub fn get_raw(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let now = Utc::now();
        let mut best: Option<StoredEntry> = None;
        let mut last_error = None;
        let mut any_ok = false;

        for layer in &self.layers {
            let raw = match layer.backend.get(key) {
                Ok(raw) => {
                    any_ok = true;
                    raw
                }
                Err(e) => {
                    debug!("store: {} layer read failed for {}: {}", layer.kind.as_str(), key, e);
                    last_error = Some(e);
                    continue;
                }
            };
            let Some(raw) = raw else { continue };

            let entry: StoredEntry = match serde_json::from_str(&raw) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("store: dropping corrupt {} entry {}: {}", layer.kind.as_str(), key, e);
                    let _ = layer.backend.remove(key);
                    continue;
                }
            };

            if entry.is_expired_at(now) {
                debug!("store: {} entry {} expired", layer.kind.as_str(), key);
                let _ = layer.backend.remove(key);
                continue;
            }

            let fresher = best
                .as_ref()
                .map_or(true, |current| entry.stored_at > current.stored_at);
            if fresher {
                best = Some(entry);
            }
        }

        match (best, any_ok, last_error) {
            (Some(entry), _, _) => Ok(Some(entry.value)),
            (None, false, Some(e)) => Err(e),
            _ => Ok(None),
        }
    }

    /// Read and decode a typed value.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get_raw(key)? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|source| StoreError::Corrupt {
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    /// Store a value without expiry. Returns the layer that accepted it.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<LayerKind, StoreError> {
        self.write(key, value, None)
    }

    /// Store a value that reads as absent once `ttl` has elapsed.
    pub fn set_with_ttl<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<LayerKind, StoreError> {
        self.write(key, value, Some(ttl))
    }

    fn write<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<LayerKind, StoreError> {
        let value = serde_json::to_value(value).map_err(|source| StoreError::Encode {
            key: key.to_string(),
            source,
        })?;

        let now = Utc::now();
        let mut entry = StoredEntry::new(value, now);
        // A TTL past the representable range never expires
        let expiry = ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| now.checked_add_signed(ttl));
        if let Some(at) = expiry {
            entry = entry.expiring_at(at);
        }
        let encoded = serde_json::to_string(&entry).map_err(|source| StoreError::Encode {
            key: key.to_string(),
            source,
        })?;

        for layer in &self.layers {
            match layer.backend.set(key, &encoded) {
                Ok(()) => {
                    self.publish(key, Some(entry.value));
                    return Ok(layer.kind);
                }
                Err(e) => {
                    warn!(
                        "store: {} layer ({}) refused {}: {}, falling through",
                        layer.kind.as_str(),
                        layer.backend.name(),
                        key,
                        e
                    );
                }
            }
        }

        Err(StoreError::AllLayersFailed(key.to_string()))
    }

    /// Remove `key` from every layer.
    ///
    /// Succeeds if at least one layer confirmed the removal.
    pub fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut last_error = None;
        let mut any_ok = false;

        for layer in &self.layers {
            match layer.backend.remove(key) {
                Ok(()) => any_ok = true,
                Err(e) => last_error = Some(e),
            }
        }

        if any_ok {
            self.publish(key, None);
            Ok(())
        } else {
            Err(last_error.unwrap_or_else(|| StoreError::AllLayersFailed(key.to_string())))
        }
    }

    /// Subscribe to writes made by *other* contexts sharing this store's broker.
    ///
    /// Returns `None` for stores that were not created through a broker.
    pub fn changes(&self) -> Option<ChangeFeed> {
        self.changes
            .as_ref()
            .map(|tx| ChangeFeed::new(tx.subscribe(), self.context_id.clone()))
    }

    fn publish(&self, key: &str, value: Option<serde_json::Value>) {
        if let Some(tx) = &self.changes {
            // No receivers is fine
            let _ = tx.send(StorageChange {
                key: key.to_string(),
                value,
                origin: self.context_id.clone(),
            });
        }
    }
}

/// Builder for custom layer stacks (tests, hosts with their own backends).
#[derive(Default)]
pub struct PersistentStoreBuilder {
    layers: Vec<Layer>,
    context_id: Option<String>,
    changes: Option<broadcast::Sender<StorageChange>>,
}

impl PersistentStoreBuilder {
    /// Append a layer; earlier layers are preferred for writes.
    pub fn layer(mut self, kind: LayerKind, backend: Arc<dyn StorageBackend>) -> Self {
        self.layers.push(Layer { kind, backend });
        self
    }

    pub fn context_id(mut self, id: impl Into<String>) -> Self {
        self.context_id = Some(id.into());
        self
    }

    pub(crate) fn changes(mut self, tx: broadcast::Sender<StorageChange>) -> Self {
        self.changes = Some(tx);
        self
    }

    pub fn build(self) -> PersistentStore {
        PersistentStore {
            layers: self.layers,
            context_id: self
                .context_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            changes: self.changes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Visit {
        id: String,
        count: u32,
    }

    fn layered() -> (PersistentStore, Arc<MemoryBackend>, Arc<MemoryBackend>) {
        let durable = Arc::new(MemoryBackend::new());
        let fallback = Arc::new(MemoryBackend::new());
        let store = PersistentStore::builder()
            .layer(LayerKind::Durable, durable.clone())
            .layer(LayerKind::Memory, fallback.clone())
            .build();
        (store, durable, fallback)
    }

    #[test]
    fn test_typed_round_trip() -> Result<(), StoreError> {
        let store = PersistentStore::in_memory();
        let visit = Visit {
            id: "v-1".to_string(),
            count: 3,
        };

        store.set("visit", &visit)?;
        assert_eq!(store.get::<Visit>("visit")?, Some(visit));
        assert_eq!(store.get::<Visit>("missing")?, None);
        Ok(())
    }

    #[test]
    fn test_zero_ttl_reads_as_absent() -> Result<(), StoreError> {
        let (store, durable, _) = layered();

        store.set_with_ttl("flash", "gone", Duration::ZERO)?;
        assert_eq!(store.get_raw("flash")?, None);
        // Lazily removed from the layer on read
        assert!(durable.get("flash")?.is_none());
        Ok(())
    }

    #[test]
    fn test_long_ttl_is_readable() -> Result<(), StoreError> {
        let store = PersistentStore::in_memory();
        store.set_with_ttl("visitor", "abc", Duration::from_secs(3600))?;
        assert_eq!(store.get::<String>("visitor")?.as_deref(), Some("abc"));
        Ok(())
    }

    #[test]
    fn test_unrepresentable_ttl_never_expires() -> Result<(), StoreError> {
        let (store, durable, _) = layered();
        let million_years = Duration::from_secs(1_000_000 * 365 * 24 * 3600);

        store.set_with_ttl("forever", "kept", Duration::MAX)?;
        store.set_with_ttl("ages", "kept", million_years)?;

        for key in ["forever", "ages"] {
            assert_eq!(store.get::<String>(key)?.as_deref(), Some("kept"));
            let raw = durable.get(key)?.expect("entry in durable layer");
            let entry: StoredEntry = serde_json::from_str(&raw).expect("stored entry");
            assert_eq!(entry.expires_at, None);
        }
        Ok(())
    }

    #[test]
    fn test_failing_durable_falls_through() -> Result<(), StoreError> {
        let (store, durable, fallback) = layered();
        durable.set_failing(true);

        assert_eq!(store.set("k", &1)?, LayerKind::Memory);
        assert_eq!(fallback.len(), 1);
        assert_eq!(store.get::<i32>("k")?, Some(1));
        Ok(())
    }

    #[test]
    fn test_fresher_lower_layer_wins() -> Result<(), StoreError> {
        let (store, durable, _) = layered();

        let stale = StoredEntry::new(
            serde_json::json!("old"),
            Utc::now() - chrono::Duration::minutes(1),
        );
        durable.set("k", &serde_json::to_string(&stale).unwrap())?;

        durable.set_failing(true);
        store.set("k", &"new")?;
        durable.set_failing(false);

        assert_eq!(store.get::<String>("k")?.as_deref(), Some("new"));
        Ok(())
    }

    #[test]
    fn test_every_layer_failing_is_an_error() {
        let (store, durable, fallback) = layered();
        durable.set_failing(true);
        fallback.set_failing(true);

        assert!(matches!(store.set("k", &1), Err(StoreError::AllLayersFailed(_))));
        assert!(store.get_raw("k").is_err());
    }

    #[test]
    fn test_corrupt_entry_is_dropped() -> Result<(), StoreError> {
        let (store, durable, _) = layered();
        durable.set("k", "not json")?;

        assert_eq!(store.get_raw("k")?, None);
        assert!(durable.get("k")?.is_none());
        Ok(())
    }

    #[test]
    fn test_type_mismatch_is_corrupt() -> Result<(), StoreError> {
        let store = PersistentStore::in_memory();
        store.set("k", &"text")?;
        assert!(matches!(store.get::<u32>("k"), Err(StoreError::Corrupt { .. })));
        Ok(())
    }

    #[test]
    fn test_remove_clears_all_layers() -> Result<(), StoreError> {
        let (store, durable, fallback) = layered();
        store.set("k", &1)?;
        durable.set_failing(true);
        store.set("k", &2)?;
        durable.set_failing(false);

        store.remove("k")?;
        assert!(durable.is_empty());
        assert!(fallback.is_empty());
        Ok(())
    }

    #[test]
    fn test_open_persists_across_instances() -> Result<(), StoreError> {
        let temp = TempDir::new().unwrap();
        let config = StoreConfig::with_base_path(temp.path());

        PersistentStore::open(&config)?.set("visitor", "v-42")?;
        let reopened = PersistentStore::open(&config)?;
        assert_eq!(reopened.get::<String>("visitor")?.as_deref(), Some("v-42"));
        Ok(())
    }
}
