//! Wires a [`SessionManager`] to a [`TransportManager`].
//!
//! The tracker keeps the transport's session context in step with the
//! session (created, restored, synchronized from another tab, identified) and
//! offers the two calls a page integration needs: `page_view` and `track`.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};
use wayconf::WaypostConfig;
use waystore::PersistentStore;

use crate::events::SubscriptionId;
use crate::session::{Environment, SessionConfig, SessionEvent, SessionManager, VisitorSession};
use crate::transport::{TransportConfig, TransportManager};

pub struct Tracker {
    session: SessionManager,
    transport: TransportManager,
    context_subscription: SubscriptionId,
}

impl Tracker {
    pub fn new(session: SessionManager, transport: TransportManager) -> Self {
        let context_transport = transport.clone();
        let context_subscription = session.on_any(move |event| match event {
            SessionEvent::Created(s)
            | SessionEvent::Restored(s)
            | SessionEvent::Synchronized { session: s, .. } => {
                context_transport.set_session_context(s.session_id.clone(), s.visitor_id.clone());
            }
            SessionEvent::Invalid { .. } => {}
        });

        Self {
            session,
            transport,
            context_subscription,
        }
    }

    /// Build both managers from loaded configuration.
    pub fn from_config(
        config: &WaypostConfig,
        store: PersistentStore,
        env: Arc<dyn Environment>,
    ) -> Self {
        let session = SessionManager::new(SessionConfig::from(&config.session), store, env);
        let transport = TransportManager::builder(TransportConfig::from(&config.transport)).build();
        Self::new(session, transport)
    }

    /// Initialize the session, start cross-tab sync and connect if a collector
    /// URL is configured. A failed connect is logged, not returned; messages
    /// queue until a link comes up.
    pub async fn start(&self) -> VisitorSession {
        let session = self.session.initialize_session();
        self.transport
            .set_session_context(session.session_id.clone(), session.visitor_id.clone());
        self.session.start_sync();

        if self.transport.config().url.is_some() {
            match self.transport.connect(None).await {
                Ok(()) => info!("tracker: collector link up"),
                Err(e) => warn!("tracker: collector unavailable, queueing: {}", e),
            }
        }
        session
    }

    /// Count a page view and report it.
    pub fn page_view(&self, url: &str) -> bool {
        let Some(session) = self.session.update_activity() else {
            warn!("tracker: page view before start, ignored");
            return false;
        };
        self.transport.send_event(
            "page_view",
            Some(json!({ "url": url, "pageViews": session.page_views })),
            None,
        )
    }

    pub fn track(&self, name: &str, data: Option<serde_json::Value>) -> bool {
        self.transport.send_event(name, data, None)
    }

    pub fn identify(&self, visitor_id: &str) -> Option<VisitorSession> {
        let session = self.session.identify(visitor_id)?;
        self.transport
            .set_session_context(session.session_id.clone(), session.visitor_id.clone());
        Some(session)
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn transport(&self) -> &TransportManager {
        &self.transport
    }

    pub fn shutdown(&self) {
        self.session.off(self.context_subscription);
        self.session.shutdown();
        self.transport.destroy();
    }
}
