//! Local storage broker: shared durable storage plus change notifications.
//!
//! A browser gives every same-origin tab the same storage and fires a
//! "storage" event in the *other* tabs when one of them writes. The broker
//! reproduces that: every context built with [`StorageBroker::context`]
//! shares the durable backend, and every successful write or removal is
//! broadcast to all contexts. Feeds skip changes made by their own context.
//!
//! There is no locking. Two contexts writing the same key race and the last
//! write wins; the notification is how the loser finds out.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use crate::backend::{FileBackend, MemoryBackend, StorageBackend};
use crate::config::StoreConfig;
use crate::store::{LayerKind, PersistentStore};
use crate::StoreError;

/// Capacity of the change channel; slow feeds skip ahead past this.
const CHANGE_CAPACITY: usize = 256;

/// A write or removal observed in shared storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageChange {
    pub key: String,
    /// New value, `None` when the key was removed.
    pub value: Option<serde_json::Value>,
    /// Context id of the writer.
    pub origin: String,
}

/// Hands out per-context stores that share one durable backend.
#[derive(Clone)]
pub struct StorageBroker {
    durable: Arc<dyn StorageBackend>,
    tx: broadcast::Sender<StorageChange>,
}

impl StorageBroker {
    pub fn new(durable: Arc<dyn StorageBackend>) -> Self {
        let (tx, _) = broadcast::channel(CHANGE_CAPACITY);
        Self { durable, tx }
    }

    /// Broker over a file-backed durable layer.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        Ok(Self::new(Arc::new(FileBackend::new(config.entries_dir())?)))
    }

    /// Broker whose "durable" layer is shared memory (tests, ephemeral hosts).
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Create the store for a new browsing context.
    ///
    /// Layers: shared durable → private session memory → private fallback memory.
    pub fn context(&self) -> PersistentStore {
        PersistentStore::builder()
            .context_id(Uuid::new_v4().to_string())
            .layer(LayerKind::Durable, self.durable.clone())
            .layer(LayerKind::Session, Arc::new(MemoryBackend::new()))
            .layer(LayerKind::Memory, Arc::new(MemoryBackend::new()))
            .changes(self.tx.clone())
            .build()
    }

    /// Every change from every context, own writes included.
    pub fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.tx.subscribe()
    }
}

/// Changes made by other contexts, in broadcast order.
pub struct ChangeFeed {
    rx: broadcast::Receiver<StorageChange>,
    origin: String,
}

impl ChangeFeed {
    pub(crate) fn new(rx: broadcast::Receiver<StorageChange>, origin: String) -> Self {
        Self { rx, origin }
    }

    /// Wait for the next foreign change. `None` once every writer is gone.
    pub async fn recv(&mut self) -> Option<StorageChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) if change.origin == self.origin => continue,
                Ok(change) => return Some(change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("store: change feed lagged, skipped {} notifications", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant; `None` when nothing foreign is pending.
    pub fn try_recv(&mut self) -> Option<StorageChange> {
        loop {
            match self.rx.try_recv() {
                Ok(change) if change.origin == self.origin => continue,
                Ok(change) => return Some(change),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_other_context_sees_write() {
        let broker = StorageBroker::in_memory();
        let tab_a = broker.context();
        let tab_b = broker.context();
        let mut feed_b = tab_b.changes().unwrap();

        tab_a.set("wp.session", &serde_json::json!({"sessionId": "s-1"})).unwrap();

        let change = feed_b.recv().await.unwrap();
        assert_eq!(change.key, "wp.session");
        assert_eq!(change.origin, tab_a.context_id());
        assert_eq!(change.value.unwrap()["sessionId"], "s-1");

        // Shared durable layer: tab B reads tab A's write
        let seen: serde_json::Value = tab_b.get("wp.session").unwrap().unwrap();
        assert_eq!(seen["sessionId"], "s-1");
    }

    #[tokio::test]
    async fn test_own_writes_are_filtered() {
        let broker = StorageBroker::in_memory();
        let tab = broker.context();
        let mut feed = tab.changes().unwrap();

        tab.set("k", &1).unwrap();
        assert!(feed.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_removal_is_broadcast() {
        let broker = StorageBroker::in_memory();
        let tab_a = broker.context();
        let tab_b = broker.context();
        let mut feed_b = tab_b.changes().unwrap();

        tab_a.set("k", &1).unwrap();
        tab_a.remove("k").unwrap();

        assert!(feed_b.recv().await.unwrap().value.is_some());
        assert!(feed_b.recv().await.unwrap().value.is_none());
    }

    #[test]
    fn test_last_writer_wins() {
        let broker = StorageBroker::in_memory();
        let tab_a = broker.context();
        let tab_b = broker.context();

        tab_a.set("k", &"a").unwrap();
        tab_b.set("k", &"b").unwrap();

        assert_eq!(tab_a.get::<String>("k").unwrap().as_deref(), Some("b"));
    }
}
