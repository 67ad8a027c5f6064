//! Typed publish/subscribe shared by the session manager and the transport.
//!
//! Every event enum names its variants through a `Kind` enum whose
//! `as_str()` is the external event name ("connection:open", "created", ...),
//! so subscribers can filter by kind and hosts can map names from config.
//!
//! Handlers run on the emitting thread, after internal locks are released,
//! so they may call back into the component that emitted.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

/// An event that can travel on an [`EventBus`].
pub trait BusEvent: Send + Sync + 'static {
    type Kind: Copy + Eq + std::fmt::Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

/// Handle returned by `on`/`on_any`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Subscription<E: BusEvent> {
    id: SubscriptionId,
    kind: Option<E::Kind>,
    handler: Handler<E>,
}

pub struct EventBus<E: BusEvent> {
    subscriptions: Mutex<Vec<Subscription<E>>>,
    next_id: AtomicU64,
}

impl<E: BusEvent> EventBus<E> {
    pub fn new() -> Self {
        Self {
            subscriptions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to one kind of event.
    pub fn on<F>(&self, kind: E::Kind, handler: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.subscribe(Some(kind), Arc::new(handler))
    }

    /// Subscribe to every event.
    pub fn on_any<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.subscribe(None, Arc::new(handler))
    }

    fn subscribe(&self, kind: Option<E::Kind>, handler: Handler<E>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions
            .lock()
            .push(Subscription { id, kind, handler });
        id
    }

    /// Returns false if the subscription was already gone.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.lock();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    /// Deliver `event` to every matching handler, in subscription order.
    ///
    /// A panicking handler is logged and does not stop delivery to the rest.
    pub fn emit(&self, event: &E) {
        let kind = event.kind();
        let handlers: Vec<Handler<E>> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|s| s.kind.map_or(true, |k| k == kind))
            .map(|s| s.handler.clone())
            .collect();

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                warn!("event handler for {:?} panicked", kind);
            }
        }
    }

    pub fn clear(&self) {
        self.subscriptions.lock().clear();
    }

    pub fn listener_count(&self) -> usize {
        self.subscriptions.lock().len()
    }
}

impl<E: BusEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Error for event names that don't map to a kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event name: {0}")]
pub struct UnknownEvent(pub String);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum PingKind {
        Ping,
        Pong,
    }

    #[derive(Debug)]
    enum Ping {
        Ping(u32),
        Pong,
    }

    impl BusEvent for Ping {
        type Kind = PingKind;

        fn kind(&self) -> PingKind {
            match self {
                Ping::Ping(_) => PingKind::Ping,
                Ping::Pong => PingKind::Pong,
            }
        }
    }

    #[test]
    fn kind_filter_and_any() {
        let bus = EventBus::<Ping>::new();
        let pings = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));

        let p = pings.clone();
        bus.on(PingKind::Ping, move |e| {
            if let Ping::Ping(n) = e {
                p.fetch_add(*n as usize, Ordering::SeqCst);
            }
        });
        let a = all.clone();
        bus.on_any(move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&Ping::Ping(2));
        bus.emit(&Ping::Pong);

        assert_eq!(pings.load(Ordering::SeqCst), 2);
        assert_eq!(all.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn off_stops_delivery() {
        let bus = EventBus::<Ping>::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = bus.on_any(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&Ping::Pong);
        assert!(bus.off(id));
        assert!(!bus.off(id));
        bus.emit(&Ping::Pong);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn panicking_handler_does_not_stop_others() {
        let bus = EventBus::<Ping>::new();
        let count = Arc::new(AtomicUsize::new(0));

        bus.on_any(|_| panic!("boom"));
        let c = count.clone();
        bus.on_any(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&Ping::Pong);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_may_subscribe_during_emit() {
        let bus = Arc::new(EventBus::<Ping>::new());
        let inner = bus.clone();
        bus.on(PingKind::Ping, move |_| {
            inner.on_any(|_| {});
        });

        bus.emit(&Ping::Ping(1));
        assert_eq!(bus.listener_count(), 2);
    }
}
