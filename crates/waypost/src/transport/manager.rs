//! The transport manager and its link reactor.
//!
//! Architecture:
//! - Each open link is owned by a reactor task (`run_link`)
//! - The manager writes through an unbounded channel, so `send` never waits
//! - Inbound frames and closes come back as calls tagged with the link's
//!   generation; anything from an older generation is ignored
//! - A message counts as sent once the reactor has written it; a failed write
//!   goes back on the queue and spends one attempt of its retry budget
//! - Heartbeat, queue sweep, ping timeouts and backoff are tokio tasks whose
//!   handles are aborted on teardown
//!
//! Every public call takes the core lock briefly, never across an `.await`,
//! and emits events only after releasing it.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::events::{EventBus, SubscriptionId};

use super::connector::{CloseInfo, Connection, Connector, Inbound, CLOSE_NORMAL};
use super::events::{TransportEvent, TransportEventKind};
use super::fallback::{FallbackTransport, HttpFallback};
use super::heartbeat::HeartbeatTracker;
use super::message::{HeartbeatPayload, OutboundMessage, Payload, Priority, WireMessage};
use super::queue::{MessageQueue, QueuedMessage};
use super::state::{ConnectionState, ConnectionStatus, Counters, TransportMetrics};
use super::websocket::WebSocketConnector;
use super::{TransportConfig, TransportError};

/// Close code for a frame that arrived without one.
const CLOSE_NO_STATUS: u16 = 1005;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenMode {
    /// Caller asked to connect.
    Connect,
    /// Caller (or a heartbeat failure) asked to reconnect.
    Reconnect,
    /// A scheduled backoff attempt.
    Retry,
}

enum LinkCommand {
    Send { entry: QueuedMessage, text: String },
    Close { code: u16, reason: String },
}

/// Why a reactor stopped.
enum LinkExit {
    /// The connection failed or the peer closed it.
    Lost(CloseInfo),
    /// The manager closed or dropped the link.
    Released,
}

struct Link {
    generation: u64,
    tx: mpsc::UnboundedSender<LinkCommand>,
}

impl Link {
    /// Queue `entry` for the reactor to write. False if the reactor is gone.
    fn transmit(&self, entry: &QueuedMessage) -> bool {
        let text = match entry.frame().encode() {
            Ok(text) => text,
            Err(e) => {
                warn!("transport: cannot encode {}: {}", entry.message.id, e);
                return false;
            }
        };
        self.tx
            .send(LinkCommand::Send {
                entry: entry.clone(),
                text,
            })
            .is_ok()
    }

    fn close(self, code: u16, reason: &str) {
        // Reactor may already be gone
        let _ = self.tx.send(LinkCommand::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

#[derive(Default)]
struct Timers {
    heartbeat: Option<JoinHandle<()>>,
    queue: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl Timers {
    fn stop_link_timers(&mut self) {
        abort(&mut self.heartbeat);
        abort(&mut self.queue);
    }

    fn stop_all(&mut self) {
        self.stop_link_timers();
        abort(&mut self.reconnect);
    }
}

fn abort(slot: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = slot.take() {
        handle.abort();
    }
}

struct Core {
    status: ConnectionStatus,
    url: Option<String>,
    reconnect_attempts: u32,
    last_error: Option<String>,
    connected_at: Option<chrono::DateTime<Utc>>,
    disconnected_at: Option<chrono::DateTime<Utc>>,
    up_since: Option<Instant>,
    generation: u64,
    link: Option<Link>,
    manual_close: bool,
    destroyed: bool,
    fallback_active: bool,
    session_id: Option<String>,
    visitor_id: Option<String>,
    queue: MessageQueue,
    heartbeat: HeartbeatTracker,
    counters: Counters,
    timers: Timers,
}

impl Core {
    fn new(queue_size: usize) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            url: None,
            reconnect_attempts: 0,
            last_error: None,
            connected_at: None,
            disconnected_at: None,
            up_since: None,
            generation: 0,
            link: None,
            manual_close: false,
            destroyed: false,
            fallback_active: false,
            session_id: None,
            visitor_id: None,
            queue: MessageQueue::new(queue_size),
            heartbeat: HeartbeatTracker::new(),
            counters: Counters::default(),
            timers: Timers::default(),
        }
    }

    fn stamp(&self, message: OutboundMessage) -> WireMessage {
        WireMessage {
            id: Uuid::new_v4().to_string(),
            payload: message.payload,
            timestamp: Utc::now(),
            session_id: self.session_id.clone(),
            visitor_id: self.visitor_id.clone(),
            priority: message.priority,
            retry: false,
        }
    }

    fn enqueue(&mut self, message: WireMessage, events: &mut Vec<TransportEvent>) {
        self.requeue(QueuedMessage::new(message, Instant::now()), events);
    }

    /// Queue `entry` unless its retry budget is spent, evicting the oldest
    /// entry when full.
    fn requeue(&mut self, entry: QueuedMessage, events: &mut Vec<TransportEvent>) {
        if entry.is_exhausted() {
            self.counters.failed += 1;
            events.push(TransportEvent::MessageFailed {
                attempts: entry.attempts,
                message: entry.message,
            });
            return;
        }
        let message = entry.message.clone();
        self.counters.queued += 1;
        if let Some(evicted) = self.queue.push(entry) {
            self.counters.dropped += 1;
            events.push(TransportEvent::QueueFull {
                dropped: evicted.message,
            });
        }
        events.push(TransportEvent::MessageQueued(message));
    }

    /// Detach the current link and stop everything that runs per link.
    fn teardown_link(&mut self) -> Option<Link> {
        self.timers.stop_link_timers();
        self.heartbeat.clear();
        self.up_since = None;
        self.link.take()
    }

    fn latency_ms(&self) -> Option<f64> {
        self.heartbeat.latency().map(|d| d.as_secs_f64() * 1000.0)
    }
}

struct Inner {
    config: TransportConfig,
    connector: Arc<dyn Connector>,
    fallback: Option<Arc<dyn FallbackTransport>>,
    events: EventBus<TransportEvent>,
    core: Mutex<Core>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.core.get_mut().timers.stop_all();
    }
}

pub struct TransportManagerBuilder {
    config: TransportConfig,
    connector: Option<Arc<dyn Connector>>,
    fallback: Option<Arc<dyn FallbackTransport>>,
}

impl TransportManagerBuilder {
    /// Defaults to [`WebSocketConnector`].
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Defaults to an [`HttpFallback`] when `fallback_url` is configured.
    pub fn fallback(mut self, fallback: Arc<dyn FallbackTransport>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn build(self) -> TransportManager {
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WebSocketConnector));
        let fallback = self.fallback.or_else(|| {
            self.config
                .fallback_url
                .as_ref()
                .map(|url| Arc::new(HttpFallback::new(url.clone())) as Arc<dyn FallbackTransport>)
        });
        let core = Core::new(self.config.message_queue_size);

        TransportManager {
            inner: Arc::new(Inner {
                config: self.config,
                connector,
                fallback,
                events: EventBus::new(),
                core: Mutex::new(core),
            }),
        }
    }
}

#[derive(Clone)]
pub struct TransportManager {
    inner: Arc<Inner>,
}

impl TransportManager {
    pub fn builder(config: TransportConfig) -> TransportManagerBuilder {
        TransportManagerBuilder {
            config,
            connector: None,
            fallback: None,
        }
    }

    pub fn new(config: TransportConfig, connector: Arc<dyn Connector>) -> Self {
        Self::builder(config).connector(connector).build()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Open a link to `url`, or to the last/configured URL.
    ///
    /// Already connected to the same URL is a no-op. Any other open link is
    /// torn down first.
    pub async fn connect(&self, url: Option<&str>) -> Result<(), TransportError> {
        let url = {
            let core = self.inner.core.lock();
            if core.destroyed {
                return Err(TransportError::Destroyed);
            }
            let url = url
                .map(str::to_string)
                .or_else(|| core.url.clone())
                .or_else(|| self.inner.config.url.clone());
            let Some(url) = url else {
                return Err(TransportError::UrlRequired);
            };
            if core.status == ConnectionStatus::Connected && core.url.as_deref() == Some(url.as_str()) {
                debug!("transport: already connected to {}", url);
                return Ok(());
            }
            url
        };
        self.open(url, OpenMode::Connect).await
    }

    /// Close the link with code 1000 and stop all timers. Idempotent.
    pub fn disconnect(&self) {
        let closed = {
            let mut core = self.inner.core.lock();
            if core.destroyed {
                return;
            }
            core.manual_close = true;
            core.reconnect_attempts = 0;
            abort(&mut core.timers.reconnect);

            let link = core.teardown_link();
            let in_flight = matches!(
                core.status,
                ConnectionStatus::Connecting | ConnectionStatus::Reconnecting
            );
            if link.is_some() || in_flight {
                // Late connect results must not resurrect the link
                core.generation += 1;
            }
            if core.status != ConnectionStatus::Disconnected {
                core.status = ConnectionStatus::Disconnected;
                core.disconnected_at = Some(Utc::now());
            }
            link.map(|link| link.close(CLOSE_NORMAL, "client disconnect"))
                .is_some()
        };

        if closed {
            info!("transport: disconnected");
            self.inner.events.emit(&TransportEvent::ConnectionClose {
                code: CLOSE_NORMAL,
                reason: "client disconnect".to_string(),
                clean: true,
            });
        }
    }

    /// Tear down the current link and connect to the last URL.
    pub async fn reconnect(&self) -> Result<(), TransportError> {
        let url = {
            let core = self.inner.core.lock();
            if core.destroyed {
                return Err(TransportError::Destroyed);
            }
            core.url.clone().or_else(|| self.inner.config.url.clone())
        };
        let url = url.ok_or(TransportError::UrlRequired)?;
        self.open(url, OpenMode::Reconnect).await
    }

    /// Stamp and transmit `message`.
    ///
    /// Returns true if it was handed to the open link (or accepted by an
    /// active fallback). Otherwise it is queued and false is returned. Never
    /// waits; `message:sent` follows once the link has written it.
    pub fn send(&self, message: impl Into<OutboundMessage>) -> bool {
        let message = message.into();
        let mut events = Vec::new();

        let (transmitted, handoff) = {
            let mut guard = self.inner.core.lock();
            let core = &mut *guard;
            if core.destroyed {
                debug!("transport: send after destroy ignored");
                return false;
            }

            let entry = QueuedMessage::new(core.stamp(message), Instant::now());
            let connected = core.status == ConnectionStatus::Connected;
            if connected && core.link.as_ref().is_some_and(|link| link.transmit(&entry)) {
                (true, None)
            } else if !connected && core.fallback_active && self.inner.fallback.is_some() {
                (false, Some(entry.message))
            } else {
                core.enqueue(entry.message, &mut events);
                (false, None)
            }
        };

        let sent = match (handoff, &self.inner.fallback) {
            (Some(wire), Some(fallback)) => {
                let accepted = fallback.send(&wire);
                trace!("transport: {} handed to {} fallback: {}", wire.id, fallback.name(), accepted);
                accepted
            }
            _ => transmitted,
        };

        for event in &events {
            self.inner.events.emit(event);
        }
        sent
    }

    pub fn send_event(
        &self,
        name: impl Into<String>,
        data: Option<serde_json::Value>,
        priority: Option<Priority>,
    ) -> bool {
        self.send(OutboundMessage::event(name, data).with_priority(priority.unwrap_or_default()))
    }

    /// Send one ping now. False when not connected; pings are never queued.
    pub fn send_heartbeat(&self) -> bool {
        let ping_id = {
            let mut guard = self.inner.core.lock();
            let core = &mut *guard;
            if core.destroyed || core.status != ConnectionStatus::Connected {
                return false;
            }
            let Some(link) = core.link.as_ref() else {
                return false;
            };

            let ping_id = Uuid::new_v4().to_string();
            let mut wire = core.stamp(
                OutboundMessage::new(Payload::Heartbeat(HeartbeatPayload {
                    ping_id: Some(ping_id.clone()),
                }))
                .with_priority(Priority::High),
            );
            wire.id = ping_id.clone();
            if !link.transmit(&QueuedMessage::new(wire, Instant::now())) {
                return false;
            }

            let timeout = self.spawn_ping_timeout(core.generation, ping_id.clone());
            core.heartbeat.record_ping(ping_id.clone(), Instant::now(), timeout);
            core.counters.heartbeats_sent += 1;
            ping_id
        };

        trace!("transport: ping {}", ping_id);
        self.inner
            .events
            .emit(&TransportEvent::HeartbeatSent { ping_id });
        true
    }

    pub fn connection_state(&self) -> ConnectionState {
        let core = self.inner.core.lock();
        ConnectionState {
            status: core.status,
            url: core.url.clone(),
            reconnect_attempts: core.reconnect_attempts,
            last_error: core.last_error.clone(),
            connected_at: core.connected_at,
            disconnected_at: core.disconnected_at,
            latency: core.latency_ms(),
        }
    }

    pub fn metrics(&self) -> TransportMetrics {
        let core = self.inner.core.lock();
        let c = core.counters;
        TransportMetrics {
            messages_sent: c.sent,
            messages_received: c.received,
            messages_queued: c.queued,
            messages_failed: c.failed,
            messages_dropped: c.dropped,
            reconnections: c.reconnections,
            heartbeats_sent: c.heartbeats_sent,
            heartbeats_missed: c.heartbeats_missed,
            queue_size: core.queue.len(),
            average_latency: core.latency_ms(),
            uptime: core
                .up_since
                .map(|t| u64::try_from(t.elapsed().as_millis()).unwrap_or(u64::MAX))
                .unwrap_or(0),
            status: core.status,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.core.lock().status == ConnectionStatus::Connected
    }

    pub fn queue_len(&self) -> usize {
        self.inner.core.lock().queue.len()
    }

    /// Drop every queued message. Returns how many there were.
    pub fn clear_queue(&self) -> usize {
        let cleared = self.inner.core.lock().queue.clear();
        debug!("transport: cleared {} queued messages", cleared);
        cleared
    }

    /// Ids stamped onto every outgoing message from now on.
    pub fn set_session_context(&self, session_id: impl Into<String>, visitor_id: impl Into<String>) {
        let mut core = self.inner.core.lock();
        core.session_id = Some(session_id.into());
        core.visitor_id = Some(visitor_id.into());
    }

    /// Shut everything down for good. Idempotent.
    ///
    /// Later `connect`/`reconnect` fail with [`TransportError::Destroyed`] and
    /// `send` returns false without queueing.
    pub fn destroy(&self) {
        let had_link = {
            let mut core = self.inner.core.lock();
            if core.destroyed {
                return;
            }
            core.destroyed = true;
            core.manual_close = true;
            core.generation += 1;
            core.timers.stop_all();
            let link = core.teardown_link();
            core.queue.clear();
            core.status = ConnectionStatus::Closed;
            core.disconnected_at = Some(Utc::now());
            link.map(|link| link.close(CLOSE_NORMAL, "destroyed")).is_some()
        };

        info!("transport: destroyed");
        if had_link {
            self.inner.events.emit(&TransportEvent::ConnectionClose {
                code: CLOSE_NORMAL,
                reason: "destroyed".to_string(),
                clean: true,
            });
        }
        self.inner.events.clear();
    }

    pub fn on<F>(&self, kind: TransportEventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, handler)
    }

    pub fn on_any<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.inner.events.on_any(handler)
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        self.inner.events.off(id)
    }

    async fn open(&self, url: String, mode: OpenMode) -> Result<(), TransportError> {
        let generation = {
            let mut core = self.inner.core.lock();
            if core.destroyed {
                return Err(TransportError::Destroyed);
            }
            if let Some(old) = core.teardown_link() {
                old.close(CLOSE_NORMAL, "reconnecting");
            }
            if mode != OpenMode::Retry {
                abort(&mut core.timers.reconnect);
            }
            core.generation += 1;
            core.status = ConnectionStatus::Connecting;
            core.url = Some(url.clone());
            core.manual_close = false;
            core.generation
        };

        debug!("transport: connecting to {} ({:?})", url, mode);
        let timeout = self.inner.config.connection_timeout;
        let outcome = match tokio::time::timeout(timeout, self.inner.connector.connect(&url)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        };

        match outcome {
            Ok(connection) => self.establish(generation, url, mode, connection).await,
            Err(e) => self.connect_failed(generation, mode, e),
        }
    }

    async fn establish(
        &self,
        generation: u64,
        url: String,
        mode: OpenMode,
        connection: Box<dyn Connection>,
    ) -> Result<(), TransportError> {
        let mut connection = Some(connection);

        let attempts = {
            let mut guard = self.inner.core.lock();
            let core = &mut *guard;
            if core.destroyed || core.generation != generation {
                None
            } else {
                let (tx, rx) = mpsc::unbounded_channel();
                if let Some(connection) = connection.take() {
                    tokio::spawn(run_link(Arc::downgrade(&self.inner), generation, connection, rx));
                }
                core.link = Some(Link { generation, tx });
                core.status = ConnectionStatus::Connected;
                core.connected_at = Some(Utc::now());
                core.up_since = Some(Instant::now());
                core.last_error = None;
                core.fallback_active = false;

                let attempts = core.reconnect_attempts;
                core.reconnect_attempts = 0;
                if mode != OpenMode::Connect {
                    core.counters.reconnections += 1;
                }
                self.start_link_timers(core);
                Some(attempts)
            }
        };

        let Some(attempts) = attempts else {
            if let Some(mut connection) = connection {
                let _ = connection.close(CLOSE_NORMAL, "superseded").await;
            }
            let destroyed = self.inner.core.lock().destroyed;
            return Err(if destroyed {
                TransportError::Destroyed
            } else {
                TransportError::Closed("superseded by a newer connection".to_string())
            });
        };

        info!("transport: connected to {}", url);
        self.inner
            .events
            .emit(&TransportEvent::ConnectionOpen { url: url.clone() });
        if mode != OpenMode::Connect {
            self.inner
                .events
                .emit(&TransportEvent::ConnectionReconnected { url, attempts });
        }

        self.process_queue(true);
        Ok(())
    }

    fn start_link_timers(&self, core: &mut Core) {
        let config = &self.inner.config;
        if !config.heartbeat_interval.is_zero() {
            core.timers.heartbeat = Some(tokio::spawn(heartbeat_loop(
                Arc::downgrade(&self.inner),
                config.heartbeat_interval,
            )));
        }
        if !config.queue_process_interval.is_zero() {
            core.timers.queue = Some(tokio::spawn(queue_loop(
                Arc::downgrade(&self.inner),
                config.queue_process_interval,
            )));
        }
    }

    fn connect_failed(
        &self,
        generation: u64,
        mode: OpenMode,
        error: TransportError,
    ) -> Result<(), TransportError> {
        let current = {
            let mut core = self.inner.core.lock();
            if core.destroyed || core.generation != generation {
                false
            } else {
                core.last_error = Some(error.to_string());
                core.disconnected_at = Some(Utc::now());
                core.status = match mode {
                    OpenMode::Retry => ConnectionStatus::Reconnecting,
                    _ => ConnectionStatus::Error,
                };
                true
            }
        };
        if !current {
            return Err(error);
        }

        match mode {
            OpenMode::Connect => {
                warn!("transport: connect failed: {}", error);
                self.emit_error(&error);
            }
            OpenMode::Reconnect => {
                warn!("transport: reconnect failed: {}", error);
                self.emit_error(&error);
                self.schedule_reconnect();
            }
            OpenMode::Retry => {
                debug!("transport: reconnection attempt failed: {}", error);
                self.schedule_reconnect();
            }
        }
        Err(error)
    }

    fn emit_error(&self, error: &TransportError) {
        self.inner.events.emit(&TransportEvent::ConnectionError {
            error: error.to_string(),
        });
    }

    /// Schedule the next backoff attempt, or give up once attempts run out.
    fn schedule_reconnect(&self) {
        enum Next {
            Idle,
            Retry { attempt: u32, delay: Duration },
            Fallback {
                fallback: Arc<dyn FallbackTransport>,
                drained: Vec<QueuedMessage>,
            },
            GiveUp { attempts: u32 },
        }

        let policy = self.inner.config.reconnect;
        let next = {
            let mut guard = self.inner.core.lock();
            let core = &mut *guard;
            if core.destroyed || core.manual_close || core.fallback_active {
                Next::Idle
            } else if policy.is_exhausted(core.reconnect_attempts) {
                core.timers.reconnect = None;
                match &self.inner.fallback {
                    Some(fallback) => {
                        core.fallback_active = true;
                        core.status = ConnectionStatus::Disconnected;
                        Next::Fallback {
                            fallback: fallback.clone(),
                            drained: core.queue.drain(),
                        }
                    }
                    None => {
                        let attempts = core.reconnect_attempts;
                        core.status = ConnectionStatus::Error;
                        core.last_error =
                            Some(format!("gave up after {} reconnection attempts", attempts));
                        Next::GiveUp { attempts }
                    }
                }
            } else {
                let delay = policy.delay_for_attempt(core.reconnect_attempts);
                core.reconnect_attempts += 1;
                core.status = ConnectionStatus::Reconnecting;

                let weak = Arc::downgrade(&self.inner);
                abort(&mut core.timers.reconnect);
                core.timers.reconnect = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(inner) = weak.upgrade() {
                        TransportManager { inner }.retry().await;
                    }
                }));
                Next::Retry {
                    attempt: core.reconnect_attempts,
                    delay,
                }
            }
        };

        match next {
            Next::Idle => {}
            Next::Retry { attempt, delay } => {
                info!("transport: reconnecting in {:?} (attempt {})", delay, attempt);
                self.inner
                    .events
                    .emit(&TransportEvent::ConnectionReconnecting { attempt, delay });
            }
            Next::Fallback { fallback, drained } => {
                warn!(
                    "transport: reconnection exhausted, switching to {} fallback with {} queued",
                    fallback.name(),
                    drained.len()
                );
                let mut events = Vec::new();
                let mut handed_over = 0;
                for entry in drained {
                    if fallback.send(&entry.message) {
                        handed_over += 1;
                    } else {
                        events.push(TransportEvent::MessageFailed {
                            attempts: entry.attempts,
                            message: entry.message,
                        });
                    }
                }
                {
                    let mut core = self.inner.core.lock();
                    core.counters.sent += handed_over as u64;
                    core.counters.failed += events.len() as u64;
                }
                self.inner.events.emit(&TransportEvent::FallbackActivated {
                    fallback: fallback.name().to_string(),
                    handed_over,
                });
                for event in &events {
                    self.inner.events.emit(event);
                }
            }
            Next::GiveUp { attempts } => {
                warn!("transport: giving up after {} reconnection attempts", attempts);
                self.inner.events.emit(&TransportEvent::ConnectionError {
                    error: format!("gave up after {} reconnection attempts", attempts),
                });
            }
        }
    }

    /// Body of a backoff timer.
    async fn retry(&self) {
        let url = {
            let mut core = self.inner.core.lock();
            // Detach our own handle so open() doesn't abort us
            core.timers.reconnect = None;
            if core.destroyed || core.manual_close {
                return;
            }
            core.url.clone().or_else(|| self.inner.config.url.clone())
        };
        let Some(url) = url else { return };
        let _ = self.open(url, OpenMode::Retry).await;
    }

    /// Retry due queue entries in insertion order. `force` ignores `next_retry`.
    fn process_queue(&self, force: bool) {
        let retry_delay = self.inner.config.retry_delay;
        let mut events = Vec::new();
        let mut handed = 0usize;
        {
            let mut guard = self.inner.core.lock();
            let core = &mut *guard;
            if core.status != ConnectionStatus::Connected || core.queue.is_empty() {
                return;
            }
            let Some(link) = core.link.as_ref() else {
                return;
            };
            let counters = &mut core.counters;
            let now = Instant::now();

            core.queue.retain_mut(|entry| {
                if !force && !entry.is_due(now) {
                    return true;
                }
                if link.transmit(entry) {
                    handed += 1;
                    return false;
                }
                entry.record_failure(now, retry_delay);
                if entry.is_exhausted() {
                    counters.failed += 1;
                    events.push(TransportEvent::MessageFailed {
                        message: entry.message.clone(),
                        attempts: entry.attempts,
                    });
                    false
                } else {
                    true
                }
            });
        }

        if handed > 0 || !events.is_empty() {
            debug!(
                "transport: queue sweep handed {} to the link, {} failed",
                handed,
                events.len()
            );
        }
        for event in &events {
            self.inner.events.emit(event);
        }
    }

    fn spawn_ping_timeout(&self, generation: u64, ping_id: String) -> Option<JoinHandle<()>> {
        let after = self.inner.config.heartbeat_timeout;
        if after.is_zero() {
            return None;
        }
        let weak = Arc::downgrade(&self.inner);
        Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(inner) = weak.upgrade() {
                TransportManager { inner }.on_ping_timeout(generation, &ping_id);
            }
        }))
    }

    fn on_ping_timeout(&self, generation: u64, ping_id: &str) {
        let max_missed = self.inner.config.max_missed_heartbeats;
        let forced = {
            let mut core = self.inner.core.lock();
            if core.generation != generation {
                return;
            }
            let Some(missed) = core.heartbeat.expire(ping_id) else {
                return;
            };
            core.counters.heartbeats_missed += 1;
            debug!("transport: ping {} unanswered ({} in a row)", ping_id, missed);
            if missed >= max_missed {
                // Outstanding pings must not trigger a second reconnect
                core.heartbeat.clear();
                true
            } else {
                false
            }
        };

        if forced {
            warn!("transport: {} heartbeats missed, forcing reconnect", max_missed);
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.reconnect().await {
                    debug!("transport: forced reconnect failed: {}", e);
                }
            });
        }
    }

    fn on_frame(&self, generation: u64, text: &str) {
        let message = match WireMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("transport: ignoring malformed frame: {}", e);
                return;
            }
        };

        let reply = {
            let mut core = self.inner.core.lock();
            if core.generation != generation {
                return;
            }
            core.counters.received += 1;
            message
                .ping_reference()
                .and_then(|id| {
                    core.heartbeat
                        .acknowledge(id, Instant::now())
                        .map(|rtt| (id.to_string(), rtt))
                })
        };

        match reply {
            Some((ping_id, rtt)) => {
                trace!("transport: pong {} after {:?}", ping_id, rtt);
                self.inner
                    .events
                    .emit(&TransportEvent::HeartbeatReceived { ping_id, rtt });
            }
            None => {
                trace!("transport: received {} {}", message.payload.message_type(), message.id);
                self.inner.events.emit(&TransportEvent::MessageReceived(message));
            }
        }
    }

    fn on_written(&self, frame: WireMessage) {
        if matches!(frame.payload, Payload::Heartbeat(_)) {
            return;
        }
        {
            let mut core = self.inner.core.lock();
            if core.destroyed {
                return;
            }
            core.counters.sent += 1;
        }
        self.inner.events.emit(&TransportEvent::MessageSent(frame));
    }

    /// The write of `entry` was attempted and failed.
    fn on_write_failed(&self, mut entry: QueuedMessage) {
        if matches!(entry.message.payload, Payload::Heartbeat(_)) {
            return;
        }
        entry.record_failure(Instant::now(), self.inner.config.retry_delay);
        self.requeue(vec![entry]);
    }

    /// Put entries whose write did not happen back on the queue.
    fn requeue(&self, entries: Vec<QueuedMessage>) {
        let mut events = Vec::new();
        {
            let mut core = self.inner.core.lock();
            if core.destroyed {
                return;
            }
            for entry in entries {
                if matches!(entry.message.payload, Payload::Heartbeat(_)) {
                    continue;
                }
                core.requeue(entry, &mut events);
            }
        }
        for event in &events {
            self.inner.events.emit(event);
        }
    }

    fn on_link_closed(&self, generation: u64, info: CloseInfo) {
        let reconnect = {
            let mut core = self.inner.core.lock();
            let current = core.link.as_ref().map(|l| l.generation) == Some(generation);
            if !current {
                return;
            }
            core.teardown_link();
            core.status = ConnectionStatus::Disconnected;
            core.disconnected_at = Some(Utc::now());
            !core.manual_close && !core.destroyed
        };

        if info.is_clean() {
            info!("transport: connection closed by peer: {}", info.reason);
        } else {
            warn!("transport: connection lost ({}): {}", info.code, info.reason);
        }
        self.inner.events.emit(&TransportEvent::ConnectionClose {
            code: info.code,
            clean: info.is_clean(),
            reason: info.reason,
        });

        if reconnect {
            self.schedule_reconnect();
        }
    }
}

impl std::fmt::Debug for TransportManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.inner.core.lock();
        f.debug_struct("TransportManager")
            .field("status", &core.status)
            .field("url", &core.url)
            .field("queued", &core.queue.len())
            .finish()
    }
}

fn with_manager(inner: &Weak<Inner>, f: impl FnOnce(TransportManager)) {
    if let Some(inner) = inner.upgrade() {
        f(TransportManager { inner });
    }
}

/// Reactor for one link: owns the connection, interleaves outbound writes
/// with inbound frames.
async fn run_link(
    inner: Weak<Inner>,
    generation: u64,
    mut connection: Box<dyn Connection>,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
) {
    trace!("transport: link {} reactor started", generation);

    let exit = loop {
        tokio::select! {
            biased;

            command = commands.recv() => match command {
                Some(LinkCommand::Send { entry, text }) => match connection.send_text(text).await {
                    Ok(()) => with_manager(&inner, |m| m.on_written(entry.frame())),
                    Err(e) => {
                        warn!("transport: write failed for {}: {}", entry.message.id, e);
                        with_manager(&inner, |m| m.on_write_failed(entry));
                        break LinkExit::Lost(CloseInfo::abnormal(e.to_string()));
                    }
                },
                Some(LinkCommand::Close { code, reason }) => {
                    if let Err(e) = connection.close(code, &reason).await {
                        debug!("transport: close handshake failed: {}", e);
                    }
                    trace!("transport: link {} closed by client", generation);
                    break LinkExit::Released;
                }
                None => {
                    let _ = connection.close(CLOSE_NORMAL, "client dropped").await;
                    break LinkExit::Released;
                }
            },

            inbound = connection.recv() => match inbound {
                Some(Ok(Inbound::Text(text))) => {
                    with_manager(&inner, |m| m.on_frame(generation, &text));
                }
                Some(Ok(Inbound::Binary(bytes))) => {
                    debug!("transport: ignoring {} byte binary frame", bytes.len());
                }
                Some(Ok(Inbound::Close(info))) => {
                    break LinkExit::Lost(info.unwrap_or_else(|| CloseInfo::new(CLOSE_NO_STATUS, "")));
                }
                Some(Err(e)) => break LinkExit::Lost(CloseInfo::abnormal(e.to_string())),
                None => break LinkExit::Lost(CloseInfo::abnormal("connection lost")),
            },
        }
    };

    commands.close();
    let mut unsent = Vec::new();
    while let Ok(command) = commands.try_recv() {
        if let LinkCommand::Send { entry, .. } = command {
            unsent.push(entry);
        }
    }

    with_manager(&inner, |m| {
        if !unsent.is_empty() {
            debug!("transport: link {} left {} writes pending", generation, unsent.len());
            m.requeue(unsent);
        }
        if let LinkExit::Lost(info) = exit {
            m.on_link_closed(generation, info);
        }
    });
    trace!("transport: link {} reactor exiting", generation);
}

async fn heartbeat_loop(inner: Weak<Inner>, period: Duration) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else { break };
        TransportManager { inner }.send_heartbeat();
    }
}

async fn queue_loop(inner: Weak<Inner>, period: Duration) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else { break };
        TransportManager { inner }.process_queue(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryConnector;

    fn manager(config: TransportConfig) -> (TransportManager, MemoryConnector) {
        let connector = MemoryConnector::new();
        let manager = TransportManager::new(config, Arc::new(connector.clone()));
        (manager, connector)
    }

    #[tokio::test(start_paused = true)]
    async fn stale_generation_frames_are_ignored() {
        let (transport, _connector) = manager(TransportConfig::default());
        transport.connect(Some("mem://a")).await.unwrap();

        let generation = transport.inner.core.lock().generation;
        transport.on_frame(generation - 1, r#"{"type":"command","data":{"name":"x"}}"#);
        assert_eq!(transport.metrics().messages_received, 0);

        transport.on_frame(generation, r#"{"type":"command","data":{"name":"x"}}"#);
        assert_eq!(transport.metrics().messages_received, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_close_does_not_disconnect() {
        let (transport, _connector) = manager(TransportConfig::default());
        transport.connect(Some("mem://a")).await.unwrap();

        let generation = transport.inner.core.lock().generation;
        transport.on_link_closed(generation - 1, CloseInfo::abnormal("old link"));
        assert!(transport.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn queue_retries_with_growing_delay() {
        let config = TransportConfig {
            retry_delay: Duration::from_secs(1),
            ..TransportConfig::default()
        };
        let (transport, _connector) = manager(config);
        transport.connect(Some("mem://a")).await.unwrap();

        // Fake a dead reactor channel while still "connected"
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let generation = transport.inner.core.lock().generation;
        transport.inner.core.lock().link = Some(Link { generation, tx });

        assert!(!transport.send_event("e", None, None));
        transport.process_queue(true);

        let core = transport.inner.core.lock();
        let entry = core.queue.iter().next().unwrap();
        assert_eq!(entry.attempts, 1);
        assert!(entry.next_retry > Instant::now());
    }
}
