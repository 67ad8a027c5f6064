//! Session fingerprints.
//!
//! A fingerprint is a handful of environment probes plus a composite hash. It
//! is an anomaly signal for session reuse, not an identifier and not a
//! security primitive.

use serde::{Deserialize, Serialize};
use tracing::debug;
use wayconf::FingerprintSettings;

use super::environment::{Environment, ProbeError};

/// Value recorded for a probe the environment refused.
pub const BLOCKED: &str = "blocked";

/// Hash of the placeholder fingerprint used outside a browser.
pub const PLACEHOLDER_HASH: &str = "server";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FingerprintElement {
    ScreenResolution,
    Timezone,
    Language,
    Platform,
    Browser,
    Plugins,
    Canvas,
}

impl FingerprintElement {
    pub const ALL: [FingerprintElement; 7] = [
        FingerprintElement::ScreenResolution,
        FingerprintElement::Timezone,
        FingerprintElement::Language,
        FingerprintElement::Platform,
        FingerprintElement::Browser,
        FingerprintElement::Plugins,
        FingerprintElement::Canvas,
    ];

    /// A change in a critical element invalidates the session.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            FingerprintElement::Platform
                | FingerprintElement::Browser
                | FingerprintElement::ScreenResolution
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FingerprintElement::ScreenResolution => "screenResolution",
            FingerprintElement::Timezone => "timezone",
            FingerprintElement::Language => "language",
            FingerprintElement::Platform => "platform",
            FingerprintElement::Browser => "browser",
            FingerprintElement::Plugins => "plugins",
            FingerprintElement::Canvas => "canvas",
        }
    }
}

impl std::fmt::Display for FingerprintElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionFingerprint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugins: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canvas: Option<String>,
    pub hash: String,
}

impl SessionFingerprint {
    /// Fixed fingerprint for contexts without browser probes.
    pub fn placeholder() -> Self {
        Self {
            screen_resolution: None,
            timezone: None,
            language: None,
            platform: None,
            browser: None,
            plugins: None,
            canvas: None,
            hash: PLACEHOLDER_HASH.to_string(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.hash == PLACEHOLDER_HASH
    }

    pub fn value(&self, element: FingerprintElement) -> Option<&str> {
        match element {
            FingerprintElement::ScreenResolution => self.screen_resolution.as_deref(),
            FingerprintElement::Timezone => self.timezone.as_deref(),
            FingerprintElement::Language => self.language.as_deref(),
            FingerprintElement::Platform => self.platform.as_deref(),
            FingerprintElement::Browser => self.browser.as_deref(),
            FingerprintElement::Plugins => self.plugins.as_deref(),
            FingerprintElement::Canvas => self.canvas.as_deref(),
        }
    }

    /// Elements present in both fingerprints whose values differ.
    ///
    /// An element missing on either side was not probed there and is not
    /// counted as a change.
    pub fn changed_elements(&self, other: &SessionFingerprint) -> Vec<FingerprintElement> {
        FingerprintElement::ALL
            .into_iter()
            .filter(|&element| match (self.value(element), other.value(element)) {
                (Some(a), Some(b)) => a != b,
                _ => false,
            })
            .collect()
    }

    /// The subset of [`changed_elements`](Self::changed_elements) that invalidates.
    pub fn critical_changes(&self, other: &SessionFingerprint) -> Vec<FingerprintElement> {
        self.changed_elements(other)
            .into_iter()
            .filter(FingerprintElement::is_critical)
            .collect()
    }
}

/// Probe `env` for every element enabled in `settings`.
pub fn generate(settings: &FingerprintSettings, env: &dyn Environment) -> SessionFingerprint {
    if !env.is_browser() {
        return SessionFingerprint::placeholder();
    }

    let mut fingerprint = SessionFingerprint {
        screen_resolution: probe(settings.screen, "screen", || env.screen_resolution()),
        timezone: probe(settings.timezone, "timezone", || {
            env.timezone_offset_minutes().map(|m| m.to_string())
        }),
        language: probe(settings.language, "language", || env.language()),
        platform: probe(settings.platform, "platform", || Ok(env.platform())),
        browser: probe(settings.browser, "browser", || env.browser_family()),
        plugins: probe(settings.plugins, "plugins", || {
            env.plugins().map(|names| rolling_hash(&names.join(",")))
        }),
        canvas: probe(settings.canvas, "canvas", || {
            env.canvas_data().map(|data| rolling_hash(&data))
        }),
        hash: String::new(),
    };
    fingerprint.hash = composite_hash(&fingerprint);
    fingerprint
}

fn probe<F>(enabled: bool, name: &str, f: F) -> Option<String>
where
    F: FnOnce() -> Result<String, ProbeError>,
{
    if !enabled {
        return None;
    }
    Some(f().unwrap_or_else(|e| {
        debug!("fingerprint: {} probe failed: {}", name, e);
        BLOCKED.to_string()
    }))
}

fn composite_hash(fingerprint: &SessionFingerprint) -> String {
    let joined = FingerprintElement::ALL
        .into_iter()
        .filter_map(|element| fingerprint.value(element))
        .collect::<Vec<_>>()
        .join("|");
    rolling_hash(&joined)
}

/// `hash = hash * 31 + c` over UTF-16 code units, wrapping at i32.
pub fn rolling_hash(input: &str) -> String {
    let hash = input.encode_utf16().fold(0i32, |hash, unit| {
        hash.wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(i32::from(unit))
    });
    format!("{:08x}", hash as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::environment::{BrowserProfile, HostEnvironment};

    #[test]
    fn rolling_hash_matches_times_31() {
        // "ab" = 97 * 31 + 98
        assert_eq!(rolling_hash("ab"), format!("{:08x}", 97 * 31 + 98));
        assert_eq!(rolling_hash(""), "00000000");
    }

    #[test]
    fn rolling_hash_wraps() {
        let long = "z".repeat(64);
        // Must not panic in debug builds
        let _ = rolling_hash(&long);
    }

    #[test]
    fn identical_environments_hash_identically() {
        let settings = FingerprintSettings::default();
        let a = generate(&settings, &BrowserProfile::default());
        let b = generate(&settings, &BrowserProfile::default());
        assert_eq!(a, b);
        assert_eq!(a.browser.as_deref(), Some("chrome"));
        assert_eq!(a.screen_resolution.as_deref(), Some("1920x1080"));
    }

    #[test]
    fn hash_covers_only_enabled_elements() {
        let mut settings = FingerprintSettings::default();
        settings.language = false;

        let en = generate(&settings, &BrowserProfile::default());
        let fr = generate(&settings, &BrowserProfile::default().with_language("fr-FR"));
        assert_eq!(en.language, None);
        assert_eq!(en.hash, fr.hash);

        settings.language = true;
        let en = generate(&settings, &BrowserProfile::default());
        let fr = generate(&settings, &BrowserProfile::default().with_language("fr-FR"));
        assert_ne!(en.hash, fr.hash);
    }

    #[test]
    fn blocked_probe_is_recorded() {
        let mut settings = FingerprintSettings::default();
        settings.canvas = true;
        let fp = generate(&settings, &BrowserProfile::default());
        assert_eq!(fp.canvas.as_deref(), Some(BLOCKED));
    }

    #[test]
    fn native_process_gets_placeholder() {
        let fp = generate(&FingerprintSettings::default(), &HostEnvironment::new());
        assert!(fp.is_placeholder());
        assert_eq!(fp, SessionFingerprint::placeholder());
    }

    #[test]
    fn only_critical_changes_count() {
        let settings = FingerprintSettings::default();
        let base = generate(&settings, &BrowserProfile::default());

        let drifted = generate(&settings, &BrowserProfile::default().with_language("de-DE"));
        assert_eq!(base.changed_elements(&drifted), vec![FingerprintElement::Language]);
        assert!(base.critical_changes(&drifted).is_empty());

        let moved = generate(&settings, &BrowserProfile::default().with_platform("MacIntel"));
        assert_eq!(base.critical_changes(&moved), vec![FingerprintElement::Platform]);
    }

    #[test]
    fn placeholder_never_conflicts() {
        let browser = generate(&FingerprintSettings::default(), &BrowserProfile::default());
        assert!(browser
            .changed_elements(&SessionFingerprint::placeholder())
            .is_empty());
    }
}
