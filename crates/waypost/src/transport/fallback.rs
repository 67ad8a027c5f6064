//! Where messages go once the primary link has given up.

use tracing::{trace, warn};

use super::message::WireMessage;

pub trait FallbackTransport: Send + Sync {
    fn name(&self) -> &str;

    /// Hand one message over. Must not block; true if it was accepted.
    fn send(&self, message: &WireMessage) -> bool;
}

/// Best-effort JSON POST per message.
#[derive(Debug, Clone)]
pub struct HttpFallback {
    client: reqwest::Client,
    url: String,
}

impl HttpFallback {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl FallbackTransport for HttpFallback {
    fn name(&self) -> &str {
        "http"
    }

    fn send(&self, message: &WireMessage) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("fallback: no runtime, dropping {}", message.id);
            return false;
        };

        let request = self.client.post(&self.url).json(message);
        let id = message.id.clone();
        runtime.spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    trace!("fallback: delivered {}", id);
                }
                Ok(response) => {
                    warn!("fallback: collector answered {} for {}", response.status(), id);
                }
                Err(e) => {
                    warn!("fallback: POST failed for {}: {}", id, e);
                }
            }
        });
        true
    }
}
