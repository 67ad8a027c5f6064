//! Where fingerprint probes and session metadata come from.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("{0} probe is blocked")]
    Blocked(&'static str),

    #[error("{0} probe is unavailable")]
    Unavailable(&'static str),
}

/// The browsing context a session lives in.
///
/// Probes return `Err` when the context refuses to answer (privacy settings,
/// sandboxing); the fingerprint records those as `"blocked"`.
pub trait Environment: Send + Sync {
    /// False for native processes; they get a placeholder fingerprint.
    fn is_browser(&self) -> bool;

    fn user_agent(&self) -> String;

    fn platform(&self) -> String;

    fn referrer(&self) -> Option<String> {
        None
    }

    fn landing_page(&self) -> Option<String> {
        None
    }

    fn screen_resolution(&self) -> Result<String, ProbeError>;

    /// Minutes to add to local time to get UTC, so UTC-5 is `300`.
    fn timezone_offset_minutes(&self) -> Result<i32, ProbeError>;

    fn language(&self) -> Result<String, ProbeError>;

    fn browser_family(&self) -> Result<String, ProbeError>;

    fn plugins(&self) -> Result<Vec<String>, ProbeError>;

    fn canvas_data(&self) -> Result<String, ProbeError>;
}

/// The native process this library runs in.
#[derive(Debug, Clone, Default)]
pub struct HostEnvironment {
    landing_page: Option<String>,
}

impl HostEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_landing_page(mut self, page: impl Into<String>) -> Self {
        self.landing_page = Some(page.into());
        self
    }
}

impl Environment for HostEnvironment {
    fn is_browser(&self) -> bool {
        false
    }

    fn user_agent(&self) -> String {
        format!(
            "waypost/{} ({}; {})",
            env!("CARGO_PKG_VERSION"),
            std::env::consts::OS,
            std::env::consts::ARCH
        )
    }

    fn platform(&self) -> String {
        std::env::consts::OS.to_string()
    }

    fn landing_page(&self) -> Option<String> {
        self.landing_page.clone()
    }

    fn screen_resolution(&self) -> Result<String, ProbeError> {
        Err(ProbeError::Unavailable("screen"))
    }

    fn timezone_offset_minutes(&self) -> Result<i32, ProbeError> {
        let east_of_utc = chrono::Local::now().offset().local_minus_utc();
        Ok(-east_of_utc / 60)
    }

    fn language(&self) -> Result<String, ProbeError> {
        std::env::var("LANG")
            .ok()
            .and_then(|lang| lang.split('.').next().map(|l| l.replace('_', "-")))
            .filter(|l| !l.is_empty())
            .ok_or(ProbeError::Unavailable("language"))
    }

    fn browser_family(&self) -> Result<String, ProbeError> {
        Err(ProbeError::Unavailable("browser"))
    }

    fn plugins(&self) -> Result<Vec<String>, ProbeError> {
        Ok(Vec::new())
    }

    fn canvas_data(&self) -> Result<String, ProbeError> {
        Err(ProbeError::Unavailable("canvas"))
    }
}

/// An explicit description of a browser, for hosts that relay browser
/// sessions and for tests.
#[derive(Debug, Clone, PartialEq)]
pub struct BrowserProfile {
    pub user_agent: String,
    pub platform: String,
    pub screen_width: u32,
    pub screen_height: u32,
    pub timezone_offset_minutes: i32,
    pub language: String,
    pub plugins: Vec<String>,
    /// `None` models a browser that blocks canvas readback.
    pub canvas: Option<String>,
    pub referrer: Option<String>,
    pub landing_page: Option<String>,
}

impl BrowserProfile {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            ..Self::default()
        }
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    pub fn with_screen(mut self, width: u32, height: u32) -> Self {
        self.screen_width = width;
        self.screen_height = height;
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_timezone_offset(mut self, minutes: i32) -> Self {
        self.timezone_offset_minutes = minutes;
        self
    }

    pub fn with_referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = Some(referrer.into());
        self
    }

    pub fn with_landing_page(mut self, page: impl Into<String>) -> Self {
        self.landing_page = Some(page.into());
        self
    }
}

impl Default for BrowserProfile {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36".to_string(),
            platform: "Linux x86_64".to_string(),
            screen_width: 1920,
            screen_height: 1080,
            timezone_offset_minutes: 0,
            language: "en-US".to_string(),
            plugins: Vec::new(),
            canvas: None,
            referrer: None,
            landing_page: None,
        }
    }
}

impl Environment for BrowserProfile {
    fn is_browser(&self) -> bool {
        true
    }

    fn user_agent(&self) -> String {
        self.user_agent.clone()
    }

    fn platform(&self) -> String {
        self.platform.clone()
    }

    fn referrer(&self) -> Option<String> {
        self.referrer.clone()
    }

    fn landing_page(&self) -> Option<String> {
        self.landing_page.clone()
    }

    fn screen_resolution(&self) -> Result<String, ProbeError> {
        Ok(format!("{}x{}", self.screen_width, self.screen_height))
    }

    fn timezone_offset_minutes(&self) -> Result<i32, ProbeError> {
        Ok(self.timezone_offset_minutes)
    }

    fn language(&self) -> Result<String, ProbeError> {
        Ok(self.language.clone())
    }

    fn browser_family(&self) -> Result<String, ProbeError> {
        Ok(detect_browser_family(&self.user_agent).to_string())
    }

    fn plugins(&self) -> Result<Vec<String>, ProbeError> {
        Ok(self.plugins.clone())
    }

    fn canvas_data(&self) -> Result<String, ProbeError> {
        self.canvas.clone().ok_or(ProbeError::Blocked("canvas"))
    }
}

/// Coarse browser family from a user agent string.
///
/// Order matters: Edge and Opera also advertise Chrome, Chrome advertises Safari.
pub fn detect_browser_family(user_agent: &str) -> &'static str {
    let ua = user_agent;
    if ua.contains("Edg/") || ua.contains("Edge/") {
        "edge"
    } else if ua.contains("OPR/") || ua.contains("Opera") {
        "opera"
    } else if ua.contains("Firefox/") {
        "firefox"
    } else if ua.contains("Chrome/") || ua.contains("CriOS/") {
        "chrome"
    } else if ua.contains("Safari/") {
        "safari"
    } else {
        "unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn browser_family_detection() {
        assert_eq!(detect_browser_family(&BrowserProfile::default().user_agent), "chrome");
        assert_eq!(
            detect_browser_family("Mozilla/5.0 (Windows NT 10.0) Chrome/120.0 Safari/537.36 Edg/120.0"),
            "edge"
        );
        assert_eq!(
            detect_browser_family("Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0"),
            "firefox"
        );
        assert_eq!(
            detect_browser_family("Mozilla/5.0 (Macintosh) AppleWebKit/605.1.15 Version/17.0 Safari/605.1.15"),
            "safari"
        );
        assert_eq!(detect_browser_family("curl/8.0"), "unknown");
    }

    #[test]
    fn blocked_canvas_is_an_error() {
        let profile = BrowserProfile::default();
        assert_eq!(profile.canvas_data(), Err(ProbeError::Blocked("canvas")));
    }

    #[test]
    fn host_is_not_a_browser() {
        let host = HostEnvironment::new();
        assert!(!host.is_browser());
        assert!(host.user_agent().starts_with("waypost/"));
    }
}
