//! Registry of live browsing contexts, kept in shared storage.
//!
//! Each tab rewrites its own entry on a heartbeat; any tab may prune entries
//! whose heartbeat went stale. Writers race and the last one wins, so a
//! freshly pruned tab can briefly reappear until its next sweep.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabEntry {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActiveTabRegistry {
    tabs: BTreeMap<String, TabEntry>,
}

impl ActiveTabRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh `tab_id`, keeping its original start time.
    pub fn heartbeat(&mut self, tab_id: &str, session_id: Option<String>, now: DateTime<Utc>) {
        self.tabs
            .entry(tab_id.to_string())
            .and_modify(|entry| {
                entry.last_heartbeat = now;
                entry.session_id = session_id.clone();
            })
            .or_insert_with(|| TabEntry {
                start_time: now,
                last_heartbeat: now,
                session_id,
            });
    }

    pub fn remove(&mut self, tab_id: &str) -> Option<TabEntry> {
        self.tabs.remove(tab_id)
    }

    /// Drop entries whose heartbeat is older than `stale_after`.
    /// Returns the removed tab ids.
    pub fn prune_stale(&mut self, now: DateTime<Utc>, stale_after: chrono::Duration) -> Vec<String> {
        let stale: Vec<String> = self
            .tabs
            .iter()
            .filter(|(_, entry)| now - entry.last_heartbeat > stale_after)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            self.tabs.remove(id);
        }
        stale
    }

    pub fn get(&self, tab_id: &str) -> Option<&TabEntry> {
        self.tabs.get(tab_id)
    }

    pub fn contains(&self, tab_id: &str) -> bool {
        self.tabs.contains_key(tab_id)
    }

    pub fn len(&self) -> usize {
        self.tabs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tabs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TabEntry)> {
        self.tabs.iter()
    }
}
