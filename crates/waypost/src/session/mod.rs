//! Visitor and session identity.
//!
//! The [`SessionManager`] restores or creates a session on startup, keeps its
//! activity timestamps current, validates it against an inactivity timeout
//! and an environment fingerprint, and follows session changes made by other
//! tabs sharing the same store.

pub mod environment;
pub mod events;
pub mod fingerprint;
pub mod manager;
pub mod tabs;
pub mod types;

pub use environment::{BrowserProfile, Environment, HostEnvironment, ProbeError};
pub use events::{SessionEvent, SessionEventKind};
pub use fingerprint::{FingerprintElement, SessionFingerprint};
pub use manager::SessionManager;
pub use tabs::{ActiveTabRegistry, TabEntry};
pub use types::{InvalidReason, SessionValidation, VisitorSession};

use std::time::Duration;

use wayconf::{FingerprintSettings, SessionSettings};

/// Runtime session settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub timeout: Duration,
    pub enable_fingerprinting: bool,
    pub validate_fingerprint: bool,
    pub cross_tab_sync: bool,
    pub tab_heartbeat_interval: Duration,
    pub tab_sweep_interval: Duration,
    pub tab_stale_after: Duration,
    pub visitor_ttl: Duration,
    pub key_prefix: String,
    pub fingerprint: FingerprintSettings,
}

impl SessionConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_fingerprinting(mut self, enabled: bool) -> Self {
        self.enable_fingerprinting = enabled;
        self
    }

    pub fn with_cross_tab_sync(mut self, enabled: bool) -> Self {
        self.cross_tab_sync = enabled;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub(crate) fn session_key(&self) -> String {
        format!("{}.session", self.key_prefix)
    }

    pub(crate) fn visitor_key(&self) -> String {
        format!("{}.visitor", self.key_prefix)
    }

    pub(crate) fn tabs_key(&self) -> String {
        format!("{}.tabs", self.key_prefix)
    }
}

impl From<&SessionSettings> for SessionConfig {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            timeout: Duration::from_millis(settings.timeout_ms),
            enable_fingerprinting: settings.enable_fingerprinting,
            validate_fingerprint: settings.validate_fingerprint,
            cross_tab_sync: settings.cross_tab_sync,
            tab_heartbeat_interval: Duration::from_millis(settings.tab_heartbeat_ms),
            tab_sweep_interval: Duration::from_millis(settings.tab_sweep_ms),
            tab_stale_after: Duration::from_millis(settings.tab_stale_ms),
            visitor_ttl: Duration::from_secs(u64::from(settings.visitor_ttl_days) * 86_400),
            key_prefix: settings.key_prefix.clone(),
            fingerprint: settings.fingerprint.clone(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&SessionSettings::default())
    }
}
