//! waypost - visitor session identity and a real-time collector link
//!
//! This library provides:
//! - `session`: restore-or-create sessions, fingerprint validation, cross-tab sync
//! - `transport`: reconnecting WebSocket link with queueing, heartbeats and fallback
//! - `host`: a `Tracker` that wires the two together
//! - `events`: typed publish/subscribe shared by both managers
//! - `telemetry`: tracing + optional OTLP export
//!
//! Persistence lives in `waystore`, configuration in `wayconf`.

pub mod clock;
pub mod events;
pub mod host;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use events::{BusEvent, EventBus, SubscriptionId, UnknownEvent};
pub use host::Tracker;
pub use session::{SessionConfig, SessionEvent, SessionEventKind, SessionManager, VisitorSession};
pub use transport::{
    ConnectionStatus, TransportConfig, TransportError, TransportEvent, TransportEventKind,
    TransportManager,
};
