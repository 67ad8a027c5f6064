//! Session manager: restore-or-create, activity, validation, cross-tab sync.
//!
//! All state sits behind one short-lived `parking_lot` lock. Events are
//! emitted after the lock is released. Storage failures are logged and never
//! reach callers; a session that could not be persisted is marked ephemeral
//! and lives in memory only.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use waystore::{ChangeFeed, PersistentStore, StorageChange};

use crate::clock::{Clock, SystemClock};
use crate::events::{EventBus, SubscriptionId};

use super::environment::Environment;
use super::events::{SessionEvent, SessionEventKind};
use super::fingerprint::{self, SessionFingerprint};
use super::tabs::ActiveTabRegistry;
use super::types::{InvalidReason, SessionRecord, SessionValidation, VisitorSession};
use super::SessionConfig;

#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

struct Shared {
    config: SessionConfig,
    store: PersistentStore,
    env: Arc<dyn Environment>,
    clock: Arc<dyn Clock>,
    tab_id: String,
    events: EventBus<SessionEvent>,
    state: Mutex<SessionState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Default)]
struct SessionState {
    session: Option<VisitorSession>,
    fingerprint: Option<SessionFingerprint>,
    ephemeral: bool,
}

impl SessionManager {
    pub fn new(config: SessionConfig, store: PersistentStore, env: Arc<dyn Environment>) -> Self {
        Self::with_clock(config, store, env, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: SessionConfig,
        store: PersistentStore,
        env: Arc<dyn Environment>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                store,
                env,
                clock,
                tab_id: Uuid::new_v4().to_string(),
                events: EventBus::new(),
                state: Mutex::new(SessionState::default()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Random id of this browsing context.
    pub fn tab_id(&self) -> &str {
        &self.shared.tab_id
    }

    /// Restore the stored session if it is still valid, otherwise start a new
    /// one. Emits `restored` or `created`. Never fails.
    pub fn initialize_session(&self) -> VisitorSession {
        let shared = &self.shared;
        let now = shared.clock.now();

        match shared.store.get::<SessionRecord>(&shared.config.session_key()) {
            Ok(Some(record)) => {
                let validation =
                    shared.validate_record(&record.session, record.fingerprint.as_ref(), now);
                if validation.is_valid {
                    return shared.adopt(record, validation.fingerprint);
                }
                info!(
                    "session: discarding stored session {}: {}",
                    record.session.session_id,
                    join_reasons(&validation.reasons)
                );
            }
            Ok(None) => debug!("session: no stored session"),
            Err(e) => {
                warn!("session: cannot read stored session, running ephemeral: {}", e);
                return shared.create(now, false);
            }
        }

        shared.create(now, true)
    }

    pub fn current_session(&self) -> Option<VisitorSession> {
        self.shared.state.lock().session.clone()
    }

    /// True when the current session could not be persisted.
    pub fn is_ephemeral(&self) -> bool {
        self.shared.state.lock().ephemeral
    }

    /// Record a page view: bump `pageViews`, move `lastActivity` forward.
    ///
    /// Returns the updated session, or `None` before initialization.
    pub fn update_activity(&self) -> Option<VisitorSession> {
        let shared = &self.shared;
        let now = shared.clock.now();

        let (session, fingerprint, ephemeral) = {
            let mut guard = shared.state.lock();
            let state = &mut *guard;
            let session = state.session.as_mut()?;
            if now > session.last_activity {
                session.last_activity = now;
            }
            session.page_views = session.page_views.saturating_add(1);
            (session.clone(), state.fingerprint.clone(), state.ephemeral)
        };

        if !ephemeral {
            shared.persist_session(&session, fingerprint.as_ref());
        }
        Some(session)
    }

    pub fn validate_session(&self) -> SessionValidation {
        let shared = &self.shared;
        let now = shared.clock.now();
        let (session, stored) = {
            let state = shared.state.lock();
            (state.session.clone(), state.fingerprint.clone())
        };

        match session {
            Some(session) => shared.validate_record(&session, stored.as_ref(), now),
            None => SessionValidation {
                is_valid: false,
                reasons: vec![InvalidReason::NoActiveSession],
                fingerprint: None,
                last_validated: now,
            },
        }
    }

    /// Drop the session from memory and storage. Emits `invalid`.
    pub fn invalidate_session(&self) {
        let shared = &self.shared;
        let discarded = {
            let mut state = shared.state.lock();
            state.fingerprint = None;
            state.session.take()
        };

        if let Err(e) = shared.store.remove(&shared.config.session_key()) {
            warn!("session: failed to remove stored session: {}", e);
        }

        if let Some(session) = discarded {
            info!("session: invalidated {}", session.session_id);
            shared.events.emit(&SessionEvent::Invalid {
                session,
                reasons: vec![InvalidReason::Invalidated],
            });
        }
    }

    /// Fingerprint of the environment as it is right now.
    pub fn fingerprint(&self) -> SessionFingerprint {
        fingerprint::generate(&self.shared.config.fingerprint, self.shared.env.as_ref())
    }

    /// Replace the visitor id, for hosts that learn who the visitor is.
    pub fn identify(&self, visitor_id: impl Into<String>) -> Option<VisitorSession> {
        let shared = &self.shared;
        let visitor_id = visitor_id.into();

        let (session, fingerprint, ephemeral) = {
            let mut guard = shared.state.lock();
            let state = &mut *guard;
            if let Some(session) = state.session.as_mut() {
                session.visitor_id = visitor_id.clone();
            }
            (state.session.clone(), state.fingerprint.clone(), state.ephemeral)
        };

        if !ephemeral {
            shared.persist_visitor(&visitor_id);
            if let Some(session) = &session {
                shared.persist_session(session, fingerprint.as_ref());
            }
        }
        info!("session: identified visitor {}", visitor_id);
        session
    }

    /// Start the tab heartbeat, the stale-tab sweep and the change listener.
    ///
    /// Does nothing if sync is disabled or already running. Outside a tokio
    /// runtime it logs a warning and leaves this tab unsynchronized.
    pub fn start_sync(&self) {
        let shared = &self.shared;
        if !shared.config.cross_tab_sync {
            debug!("session: cross-tab sync disabled");
            return;
        }
        if !shared.tasks.lock().is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("session: no tokio runtime, tab {} will not sync", shared.tab_id);
            return;
        };

        shared.tab_heartbeat();

        let weak = Arc::downgrade(shared);
        let mut handles = vec![
            runtime.spawn(heartbeat_loop(
                weak.clone(),
                shared.config.tab_heartbeat_interval,
            )),
            runtime.spawn(sweep_loop(weak.clone(), shared.config.tab_sweep_interval)),
        ];
        match shared.store.changes() {
            Some(feed) => handles.push(runtime.spawn(listen_loop(weak, feed))),
            None => debug!("session: store has no change feed, other tabs won't be followed"),
        }

        shared.tasks.lock().extend(handles);
        info!("session: tab {} syncing", shared.tab_id);
    }

    /// Snapshot of the shared registry.
    pub fn active_tabs(&self) -> ActiveTabRegistry {
        self.shared.read_registry()
    }

    /// Stop sync tasks and remove this tab from the registry.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        let tasks = std::mem::take(&mut *shared.tasks.lock());
        let was_syncing = !tasks.is_empty();
        for task in tasks {
            task.abort();
        }

        if was_syncing {
            let mut registry = shared.read_registry();
            if registry.remove(&shared.tab_id).is_some() {
                shared.write_registry(&registry);
            }
            debug!("session: tab {} left", shared.tab_id);
        }
    }

    pub fn on<F>(&self, kind: SessionEventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.shared.events.on(kind, handler)
    }

    pub fn on_any<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.shared.events.on_any(handler)
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        self.shared.events.off(id)
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("tab_id", &self.shared.tab_id)
            .field("store", &self.shared.store)
            .finish()
    }
}

impl Shared {
    fn adopt(
        &self,
        record: SessionRecord,
        current: Option<SessionFingerprint>,
    ) -> VisitorSession {
        let session = record.session;
        {
            let mut state = self.state.lock();
            state.session = Some(session.clone());
            state.fingerprint = record.fingerprint.or(current);
            state.ephemeral = false;
        }
        info!(
            "session: restored {} for visitor {}",
            session.session_id, session.visitor_id
        );
        self.events.emit(&SessionEvent::Restored(session.clone()));
        session
    }

    fn create(&self, now: DateTime<Utc>, persist: bool) -> VisitorSession {
        let visitor_id = if persist {
            match self.store.get::<String>(&self.config.visitor_key()) {
                Ok(Some(id)) => id,
                Ok(None) => new_id(),
                Err(e) => {
                    warn!("session: cannot read visitor id, issuing a new one: {}", e);
                    new_id()
                }
            }
        } else {
            new_id()
        };

        let fingerprint = self
            .config
            .enable_fingerprinting
            .then(|| fingerprint::generate(&self.config.fingerprint, self.env.as_ref()));

        let session = VisitorSession {
            session_id: new_id(),
            visitor_id,
            start_time: now,
            last_activity: now,
            page_views: 0,
            platform: self.env.platform(),
            user_agent: self.env.user_agent(),
            referrer: self.env.referrer(),
            landing_page: self.env.landing_page(),
        };

        let persisted = persist
            && self.persist_visitor(&session.visitor_id)
            && self.persist_session(&session, fingerprint.as_ref());

        {
            let mut state = self.state.lock();
            state.session = Some(session.clone());
            state.fingerprint = fingerprint;
            state.ephemeral = !persisted;
        }

        info!(
            "session: created {} for visitor {}{}",
            session.session_id,
            session.visitor_id,
            if persisted { "" } else { " (ephemeral)" }
        );
        self.events.emit(&SessionEvent::Created(session.clone()));
        session
    }

    fn validate_record(
        &self,
        session: &VisitorSession,
        stored: Option<&SessionFingerprint>,
        now: DateTime<Utc>,
    ) -> SessionValidation {
        let mut reasons = Vec::new();

        let timeout = chrono::Duration::from_std(self.config.timeout).unwrap_or(chrono::Duration::MAX);
        let idle = session.idle_for(now);
        if idle > timeout {
            reasons.push(InvalidReason::Timeout {
                idle_ms: idle.num_milliseconds(),
                timeout_ms: timeout.num_milliseconds(),
            });
        }

        let fingerprint = if self.config.enable_fingerprinting {
            let current = fingerprint::generate(&self.config.fingerprint, self.env.as_ref());
            if let (true, Some(stored)) = (self.config.validate_fingerprint, stored) {
                let critical = stored.critical_changes(&current);
                if !critical.is_empty() {
                    reasons.push(InvalidReason::mismatch(&critical));
                } else if !stored.changed_elements(&current).is_empty() {
                    debug!(
                        "session: tolerating non-critical fingerprint drift on {}",
                        session.session_id
                    );
                }
            }
            Some(current)
        } else {
            None
        };

        SessionValidation {
            is_valid: reasons.is_empty(),
            reasons,
            fingerprint,
            last_validated: now,
        }
    }

    fn persist_session(&self, session: &VisitorSession, fingerprint: Option<&SessionFingerprint>) -> bool {
        let record = SessionRecord {
            session: session.clone(),
            fingerprint: fingerprint.cloned(),
        };
        match self.store.set(&self.config.session_key(), &record) {
            Ok(_) => true,
            Err(e) => {
                warn!("session: failed to persist session {}: {}", session.session_id, e);
                false
            }
        }
    }

    fn persist_visitor(&self, visitor_id: &str) -> bool {
        match self
            .store
            .set_with_ttl(&self.config.visitor_key(), visitor_id, self.config.visitor_ttl)
        {
            Ok(_) => true,
            Err(e) => {
                warn!("session: failed to persist visitor id: {}", e);
                false
            }
        }
    }

    /// Follow a session record written by another tab.
    fn apply_remote_change(&self, change: StorageChange) {
        if change.key != self.config.session_key() {
            return;
        }
        let Some(value) = change.value else {
            debug!("session: tab {} removed the shared session", change.origin);
            return;
        };
        let record: SessionRecord = match serde_json::from_value(value) {
            Ok(record) => record,
            Err(e) => {
                warn!("session: ignoring unreadable session from tab {}: {}", change.origin, e);
                return;
            }
        };

        let replaced = {
            let mut state = self.state.lock();
            let previous = state.session.as_ref().map(|s| s.session_id.clone());
            if previous.as_deref() == Some(record.session.session_id.as_str()) {
                if let Some(current) = state.session.as_mut() {
                    if record.session.last_activity > current.last_activity {
                        current.last_activity = record.session.last_activity;
                    }
                    current.page_views = current.page_views.max(record.session.page_views);
                }
                None
            } else {
                state.session = Some(record.session.clone());
                state.fingerprint = record.fingerprint;
                state.ephemeral = false;
                Some(previous)
            }
        };

        if let Some(previous_session_id) = replaced {
            info!(
                "session: tab {} switched session to {}",
                change.origin, record.session.session_id
            );
            self.events.emit(&SessionEvent::Synchronized {
                previous_session_id,
                session: record.session,
            });
        }
    }

    fn read_registry(&self) -> ActiveTabRegistry {
        match self.store.get::<ActiveTabRegistry>(&self.config.tabs_key()) {
            Ok(registry) => registry.unwrap_or_default(),
            Err(e) => {
                debug!("session: unreadable tab registry, starting fresh: {}", e);
                ActiveTabRegistry::default()
            }
        }
    }

    fn write_registry(&self, registry: &ActiveTabRegistry) {
        if let Err(e) = self.store.set(&self.config.tabs_key(), registry) {
            warn!("session: failed to write tab registry: {}", e);
        }
    }

    fn tab_heartbeat(&self) {
        let now = self.clock.now();
        let session_id = self
            .state
            .lock()
            .session
            .as_ref()
            .map(|s| s.session_id.clone());

        let mut registry = self.read_registry();
        registry.heartbeat(&self.tab_id, session_id, now);
        self.write_registry(&registry);
    }

    fn sweep_tabs(&self) {
        let now = self.clock.now();
        let stale_after =
            chrono::Duration::from_std(self.config.tab_stale_after).unwrap_or(chrono::Duration::MAX);

        let mut registry = self.read_registry();
        let removed = registry.prune_stale(now, stale_after);
        if !removed.is_empty() {
            debug!("session: pruned stale tabs {:?}", removed);
            self.write_registry(&registry);
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn join_reasons(reasons: &[InvalidReason]) -> String {
    reasons
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval
}

async fn heartbeat_loop(shared: Weak<Shared>, period: Duration) {
    let mut interval = ticker(period);
    // First tick is immediate; start_sync already registered the tab
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(shared) = shared.upgrade() else { break };
        shared.tab_heartbeat();
    }
}

async fn sweep_loop(shared: Weak<Shared>, period: Duration) {
    let mut interval = ticker(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(shared) = shared.upgrade() else { break };
        shared.sweep_tabs();
    }
}

async fn listen_loop(shared: Weak<Shared>, mut feed: ChangeFeed) {
    while let Some(change) = feed.recv().await {
        let Some(shared) = shared.upgrade() else { break };
        shared.apply_remote_change(change);
    }
}
