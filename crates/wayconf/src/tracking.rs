//! Session and transport settings.
//!
//! Durations are plain millisecond integers here so the TOML stays readable;
//! the runtime crates convert them into `Duration`s.

use serde::{Deserialize, Serialize};

/// Which environment probes feed the session fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintSettings {
    #[serde(default = "default_true")]
    pub screen: bool,
    #[serde(default = "default_true")]
    pub timezone: bool,
    #[serde(default = "default_true")]
    pub language: bool,
    #[serde(default = "default_true")]
    pub platform: bool,
    #[serde(default = "default_true")]
    pub browser: bool,
    #[serde(default = "default_true")]
    pub plugins: bool,
    /// Canvas probing is the noisiest element, off unless asked for.
    #[serde(default)]
    pub canvas: bool,
}

fn default_true() -> bool {
    true
}

impl Default for FingerprintSettings {
    fn default() -> Self {
        Self {
            screen: true,
            timezone: true,
            language: true,
            platform: true,
            browser: true,
            plugins: true,
            canvas: false,
        }
    }
}

/// Visitor/session identity settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Inactivity after which a session expires.
    /// Default: 30 minutes
    #[serde(default = "SessionSettings::default_timeout_ms")]
    pub timeout_ms: u64,

    /// Compute a fingerprint for new and restored sessions.
    #[serde(default = "default_true")]
    pub enable_fingerprinting: bool,

    /// Reject restored sessions whose critical fingerprint elements changed.
    #[serde(default = "default_true")]
    pub validate_fingerprint: bool,

    /// Keep an active-tab registry and follow session changes from other tabs.
    #[serde(default = "default_true")]
    pub cross_tab_sync: bool,

    /// How often this tab refreshes its registry entry.
    #[serde(default = "SessionSettings::default_tab_heartbeat_ms")]
    pub tab_heartbeat_ms: u64,

    /// How often stale registry entries are pruned.
    #[serde(default = "SessionSettings::default_tab_sweep_ms")]
    pub tab_sweep_ms: u64,

    /// Registry entries older than this are stale.
    #[serde(default = "SessionSettings::default_tab_stale_ms")]
    pub tab_stale_ms: u64,

    /// How long a visitor id survives without being rewritten.
    #[serde(default = "SessionSettings::default_visitor_ttl_days")]
    pub visitor_ttl_days: u32,

    /// Prefix for every storage key written by the session manager.
    #[serde(default = "SessionSettings::default_key_prefix")]
    pub key_prefix: String,

    #[serde(default)]
    pub fingerprint: FingerprintSettings,
}

impl SessionSettings {
    fn default_timeout_ms() -> u64 {
        30 * 60 * 1000
    }

    fn default_tab_heartbeat_ms() -> u64 {
        5_000
    }

    fn default_tab_sweep_ms() -> u64 {
        10_000
    }

    fn default_tab_stale_ms() -> u64 {
        15_000
    }

    fn default_visitor_ttl_days() -> u32 {
        365
    }

    fn default_key_prefix() -> String {
        "waypost".to_string()
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            timeout_ms: Self::default_timeout_ms(),
            enable_fingerprinting: true,
            validate_fingerprint: true,
            cross_tab_sync: true,
            tab_heartbeat_ms: Self::default_tab_heartbeat_ms(),
            tab_sweep_ms: Self::default_tab_sweep_ms(),
            tab_stale_ms: Self::default_tab_stale_ms(),
            visitor_ttl_days: Self::default_visitor_ttl_days(),
            key_prefix: Self::default_key_prefix(),
            fingerprint: FingerprintSettings::default(),
        }
    }
}

/// Real-time transport settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportSettings {
    /// Collector WebSocket URL. Empty means "supplied at connect time".
    #[serde(default)]
    pub url: String,

    /// HTTP endpoint used once reconnection is exhausted. Empty disables it.
    #[serde(default)]
    pub fallback_url: String,

    #[serde(default = "TransportSettings::default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Base reconnection delay; grows by 1.5x per attempt.
    #[serde(default = "TransportSettings::default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    /// Ceiling on a single reconnection delay.
    #[serde(default = "TransportSettings::default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,

    #[serde(default = "TransportSettings::default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "TransportSettings::default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "TransportSettings::default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    #[serde(default = "TransportSettings::default_max_missed_heartbeats")]
    pub max_missed_heartbeats: u32,

    #[serde(default = "TransportSettings::default_message_queue_size")]
    pub message_queue_size: usize,

    #[serde(default = "TransportSettings::default_queue_process_interval_ms")]
    pub queue_process_interval_ms: u64,

    /// Retry delay unit; the n-th failed attempt waits n times this.
    #[serde(default = "TransportSettings::default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl TransportSettings {
    fn default_connection_timeout_ms() -> u64 {
        10_000
    }

    fn default_reconnect_interval_ms() -> u64 {
        1_000
    }

    fn default_max_reconnect_delay_ms() -> u64 {
        60_000
    }

    fn default_max_reconnect_attempts() -> u32 {
        10
    }

    fn default_heartbeat_interval_ms() -> u64 {
        30_000
    }

    fn default_heartbeat_timeout_ms() -> u64 {
        10_000
    }

    fn default_max_missed_heartbeats() -> u32 {
        3
    }

    fn default_message_queue_size() -> usize {
        1_000
    }

    fn default_queue_process_interval_ms() -> u64 {
        1_000
    }

    fn default_retry_delay_ms() -> u64 {
        1_000
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            fallback_url: String::new(),
            connection_timeout_ms: Self::default_connection_timeout_ms(),
            reconnect_interval_ms: Self::default_reconnect_interval_ms(),
            max_reconnect_delay_ms: Self::default_max_reconnect_delay_ms(),
            max_reconnect_attempts: Self::default_max_reconnect_attempts(),
            heartbeat_interval_ms: Self::default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: Self::default_heartbeat_timeout_ms(),
            max_missed_heartbeats: Self::default_max_missed_heartbeats(),
            message_queue_size: Self::default_message_queue_size(),
            queue_process_interval_ms: Self::default_queue_process_interval_ms(),
            retry_delay_ms: Self::default_retry_delay_ms(),
        }
    }
}
