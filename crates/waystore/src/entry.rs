//! The envelope every layer stores: value plus bookkeeping for expiry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEntry {
    pub value: serde_json::Value,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub stored_at: DateTime<Utc>,

    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredEntry {
    pub fn new(value: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            value,
            stored_at: now,
            expires_at: None,
        }
    }

    pub fn expiring_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    /// An entry is dead from its expiry instant onwards.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if now >= at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_expiry_boundary() {
        let now = Utc::now();
        let entry = StoredEntry::new(serde_json::json!(1), now).expiring_at(now + Duration::seconds(5));

        assert!(!entry.is_expired_at(now));
        assert!(entry.is_expired_at(now + Duration::seconds(5)));
        assert!(entry.is_expired_at(now + Duration::seconds(6)));
    }

    #[test]
    fn test_no_expiry_never_expires() {
        let now = Utc::now();
        let entry = StoredEntry::new(serde_json::json!("x"), now);
        assert!(!entry.is_expired_at(now + Duration::days(10_000)));
    }

    #[test]
    fn test_wire_shape_is_camel_case_millis() {
        let now = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let entry = StoredEntry::new(serde_json::json!({"a": 1}), now);
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["storedAt"], 1_700_000_000_000i64);
        assert!(json["expiresAt"].is_null());
    }
}
