use std::str::FromStr;
use std::time::Duration;

use crate::events::{BusEvent, UnknownEvent};

use super::message::WireMessage;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    ConnectionOpen {
        url: String,
    },
    ConnectionClose {
        code: u16,
        reason: String,
        clean: bool,
    },
    ConnectionError {
        error: String,
    },
    ConnectionReconnecting {
        attempt: u32,
        delay: Duration,
    },
    ConnectionReconnected {
        url: String,
        attempts: u32,
    },
    MessageSent(WireMessage),
    MessageReceived(WireMessage),
    MessageQueued(WireMessage),
    MessageFailed {
        message: WireMessage,
        attempts: u32,
    },
    HeartbeatSent {
        ping_id: String,
    },
    HeartbeatReceived {
        ping_id: String,
        rtt: Duration,
    },
    /// The queue was full and `dropped` (its oldest entry) was evicted.
    QueueFull {
        dropped: WireMessage,
    },
    FallbackActivated {
        fallback: String,
        handed_over: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportEventKind {
    ConnectionOpen,
    ConnectionClose,
    ConnectionError,
    ConnectionReconnecting,
    ConnectionReconnected,
    MessageSent,
    MessageReceived,
    MessageQueued,
    MessageFailed,
    HeartbeatSent,
    HeartbeatReceived,
    QueueFull,
    FallbackActivated,
}

impl TransportEventKind {
    pub const ALL: [TransportEventKind; 13] = [
        TransportEventKind::ConnectionOpen,
        TransportEventKind::ConnectionClose,
        TransportEventKind::ConnectionError,
        TransportEventKind::ConnectionReconnecting,
        TransportEventKind::ConnectionReconnected,
        TransportEventKind::MessageSent,
        TransportEventKind::MessageReceived,
        TransportEventKind::MessageQueued,
        TransportEventKind::MessageFailed,
        TransportEventKind::HeartbeatSent,
        TransportEventKind::HeartbeatReceived,
        TransportEventKind::QueueFull,
        TransportEventKind::FallbackActivated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportEventKind::ConnectionOpen => "connection:open",
            TransportEventKind::ConnectionClose => "connection:close",
            TransportEventKind::ConnectionError => "connection:error",
            TransportEventKind::ConnectionReconnecting => "connection:reconnecting",
            TransportEventKind::ConnectionReconnected => "connection:reconnected",
            TransportEventKind::MessageSent => "message:sent",
            TransportEventKind::MessageReceived => "message:received",
            TransportEventKind::MessageQueued => "message:queued",
            TransportEventKind::MessageFailed => "message:failed",
            TransportEventKind::HeartbeatSent => "heartbeat:sent",
            TransportEventKind::HeartbeatReceived => "heartbeat:received",
            TransportEventKind::QueueFull => "queue:full",
            TransportEventKind::FallbackActivated => "fallback:activated",
        }
    }
}

impl std::fmt::Display for TransportEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportEventKind {
    type Err = UnknownEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownEvent(s.to_string()))
    }
}

impl BusEvent for TransportEvent {
    type Kind = TransportEventKind;

    fn kind(&self) -> TransportEventKind {
        match self {
            TransportEvent::ConnectionOpen { .. } => TransportEventKind::ConnectionOpen,
            TransportEvent::ConnectionClose { .. } => TransportEventKind::ConnectionClose,
            TransportEvent::ConnectionError { .. } => TransportEventKind::ConnectionError,
            TransportEvent::ConnectionReconnecting { .. } => TransportEventKind::ConnectionReconnecting,
            TransportEvent::ConnectionReconnected { .. } => TransportEventKind::ConnectionReconnected,
            TransportEvent::MessageSent(_) => TransportEventKind::MessageSent,
            TransportEvent::MessageReceived(_) => TransportEventKind::MessageReceived,
            TransportEvent::MessageQueued(_) => TransportEventKind::MessageQueued,
            TransportEvent::MessageFailed { .. } => TransportEventKind::MessageFailed,
            TransportEvent::HeartbeatSent { .. } => TransportEventKind::HeartbeatSent,
            TransportEvent::HeartbeatReceived { .. } => TransportEventKind::HeartbeatReceived,
            TransportEvent::QueueFull { .. } => TransportEventKind::QueueFull,
            TransportEvent::FallbackActivated { .. } => TransportEventKind::FallbackActivated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for kind in TransportEventKind::ALL {
            assert_eq!(kind.as_str().parse::<TransportEventKind>(), Ok(kind));
        }
        assert!("connection:lost".parse::<TransportEventKind>().is_err());
    }
}
