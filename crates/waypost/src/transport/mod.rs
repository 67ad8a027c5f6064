//! Real-time link to the collector.
//!
//! [`TransportManager`] runs the connection state machine
//! (`disconnected → connecting → connected`, with `reconnecting` and `error`
//! on the side and `closed` after `destroy()`), queues what it can't send,
//! reconnects with backoff, probes liveness with heartbeats and hands off to
//! a [`FallbackTransport`] when reconnection is exhausted.
//!
//! Each open link is owned by a reactor task; the manager talks to it over a
//! channel and only `connect`/`reconnect` ever wait.

pub mod backoff;
pub mod connector;
pub mod events;
pub mod fallback;
pub mod heartbeat;
pub mod manager;
pub mod memory;
pub mod message;
pub mod queue;
pub mod state;
pub mod websocket;

pub use backoff::ReconnectPolicy;
pub use connector::{CloseInfo, Connection, Connector, Inbound};
pub use events::{TransportEvent, TransportEventKind};
pub use fallback::{FallbackTransport, HttpFallback};
pub use manager::{TransportManager, TransportManagerBuilder};
pub use memory::{ConnectMode, MemoryConnector, MemoryPeer};
pub use message::{OutboundMessage, Payload, Priority, WireMessage};
pub use queue::{MessageQueue, QueuedMessage};
pub use state::{ConnectionState, ConnectionStatus, TransportMetrics};
pub use websocket::WebSocketConnector;

use std::time::Duration;

use thiserror::Error;
use wayconf::TransportSettings;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("no connection URL configured or supplied")]
    UrlRequired,

    #[error("transport has been destroyed")]
    Destroyed,

    #[error("connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("codec error: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Codec(e.to_string())
    }
}

/// Runtime transport settings.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    pub url: Option<String>,
    pub fallback_url: Option<String>,
    pub connection_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub max_missed_heartbeats: u32,
    pub message_queue_size: usize,
    pub queue_process_interval: Duration,
    pub retry_delay: Duration,
}

impl TransportConfig {
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_queue_size(mut self, size: usize) -> Self {
        self.message_queue_size = size;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration, max_missed: u32) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self.max_missed_heartbeats = max_missed;
        self
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.trim().is_empty()).then(|| s.to_string())
}

impl From<&TransportSettings> for TransportConfig {
    fn from(settings: &TransportSettings) -> Self {
        Self {
            url: non_empty(&settings.url),
            fallback_url: non_empty(&settings.fallback_url),
            connection_timeout: Duration::from_millis(settings.connection_timeout_ms),
            reconnect: ReconnectPolicy {
                base: Duration::from_millis(settings.reconnect_interval_ms),
                max_delay: Duration::from_millis(settings.max_reconnect_delay_ms),
                max_attempts: settings.max_reconnect_attempts,
            },
            heartbeat_interval: Duration::from_millis(settings.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(settings.heartbeat_timeout_ms),
            max_missed_heartbeats: settings.max_missed_heartbeats,
            message_queue_size: settings.message_queue_size,
            queue_process_interval: Duration::from_millis(settings.queue_process_interval_ms),
            retry_delay: Duration::from_millis(settings.retry_delay_ms),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::from(&TransportSettings::default())
    }
}
