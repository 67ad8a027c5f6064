use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connection lifecycle.
///
/// `Closed` is terminal and only reached through `destroy()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
    Closed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot returned by `connection_state()`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub url: Option<String>,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub disconnected_at: Option<DateTime<Utc>>,
    /// Smoothed heartbeat round trip in milliseconds.
    pub latency: Option<f64>,
}

/// Snapshot returned by `metrics()`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportMetrics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_queued: u64,
    pub messages_failed: u64,
    pub messages_dropped: u64,
    pub reconnections: u64,
    pub heartbeats_sent: u64,
    pub heartbeats_missed: u64,
    pub queue_size: usize,
    pub average_latency: Option<f64>,
    /// Milliseconds since the current connection opened, 0 when down.
    pub uptime: u64,
    pub status: ConnectionStatus,
}

/// Running counters behind [`TransportMetrics`].
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Counters {
    pub sent: u64,
    pub received: u64,
    pub queued: u64,
    pub failed: u64,
    pub dropped: u64,
    pub reconnections: u64,
    pub heartbeats_sent: u64,
    pub heartbeats_missed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(ConnectionStatus::Reconnecting).unwrap(),
            "reconnecting"
        );
        assert_eq!(ConnectionStatus::default(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn state_is_camel_case() {
        let state = ConnectionState {
            reconnect_attempts: 2,
            ..Default::default()
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["reconnectAttempts"], 2);
        assert!(json["connectedAt"].is_null());
    }
}
