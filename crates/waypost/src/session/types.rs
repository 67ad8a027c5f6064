use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::fingerprint::{FingerprintElement, SessionFingerprint};

/// One visitor's bounded period of activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorSession {
    pub session_id: String,
    pub visitor_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_activity: DateTime<Utc>,
    pub page_views: u32,
    pub platform: String,
    pub user_agent: String,
    #[serde(default)]
    pub referrer: Option<String>,
    #[serde(default)]
    pub landing_page: Option<String>,
}

impl VisitorSession {
    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_activity
    }
}

/// Why a session failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "camelCase")]
pub enum InvalidReason {
    NoActiveSession,
    Timeout { idle_ms: i64, timeout_ms: i64 },
    FingerprintMismatch { elements: Vec<String> },
    Invalidated,
}

impl InvalidReason {
    pub(crate) fn mismatch(elements: &[FingerprintElement]) -> Self {
        InvalidReason::FingerprintMismatch {
            elements: elements.iter().map(|e| e.as_str().to_string()).collect(),
        }
    }
}

impl std::fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidReason::NoActiveSession => write!(f, "no active session"),
            InvalidReason::Timeout { idle_ms, timeout_ms } => {
                write!(f, "session timeout ({}ms idle, limit {}ms)", idle_ms, timeout_ms)
            }
            InvalidReason::FingerprintMismatch { elements } => {
                write!(f, "fingerprint mismatch: {}", elements.join(", "))
            }
            InvalidReason::Invalidated => write!(f, "session invalidated"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionValidation {
    pub is_valid: bool,
    pub reasons: Vec<InvalidReason>,
    #[serde(default)]
    pub fingerprint: Option<SessionFingerprint>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_validated: DateTime<Utc>,
}

/// What gets persisted under the session key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SessionRecord {
    #[serde(flatten)]
    pub session: VisitorSession,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<SessionFingerprint>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_is_flat_camel_case() {
        let t = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let record = SessionRecord {
            session: VisitorSession {
                session_id: "s-1".into(),
                visitor_id: "v-1".into(),
                start_time: t,
                last_activity: t,
                page_views: 3,
                platform: "linux".into(),
                user_agent: "ua".into(),
                referrer: None,
                landing_page: Some("/".into()),
            },
            fingerprint: None,
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["sessionId"], "s-1");
        assert_eq!(json["lastActivity"], 1_700_000_000_000i64);
        assert_eq!(json["pageViews"], 3);
        assert!(json.get("fingerprint").is_none());

        let back: SessionRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn reasons_read_like_sentences() {
        assert_eq!(InvalidReason::NoActiveSession.to_string(), "no active session");
        let timeout = InvalidReason::Timeout {
            idle_ms: 2_400_000,
            timeout_ms: 1_800_000,
        };
        assert!(timeout.to_string().starts_with("session timeout"));
    }
}
