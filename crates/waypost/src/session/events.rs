use std::str::FromStr;

use crate::events::{BusEvent, UnknownEvent};

use super::types::{InvalidReason, VisitorSession};

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Created(VisitorSession),
    Restored(VisitorSession),
    Invalid {
        session: VisitorSession,
        reasons: Vec<InvalidReason>,
    },
    /// Another tab replaced the shared session record.
    Synchronized {
        previous_session_id: Option<String>,
        session: VisitorSession,
    },
}

impl SessionEvent {
    pub fn session(&self) -> &VisitorSession {
        match self {
            SessionEvent::Created(s) | SessionEvent::Restored(s) => s,
            SessionEvent::Invalid { session, .. } | SessionEvent::Synchronized { session, .. } => {
                session
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEventKind {
    Created,
    Restored,
    Invalid,
    Synchronized,
}

impl SessionEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEventKind::Created => "created",
            SessionEventKind::Restored => "restored",
            SessionEventKind::Invalid => "invalid",
            SessionEventKind::Synchronized => "synchronized",
        }
    }
}

impl std::fmt::Display for SessionEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionEventKind {
    type Err = UnknownEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(SessionEventKind::Created),
            "restored" => Ok(SessionEventKind::Restored),
            "invalid" => Ok(SessionEventKind::Invalid),
            "synchronized" => Ok(SessionEventKind::Synchronized),
            other => Err(UnknownEvent(other.to_string())),
        }
    }
}

impl BusEvent for SessionEvent {
    type Kind = SessionEventKind;

    fn kind(&self) -> SessionEventKind {
        match self {
            SessionEvent::Created(_) => SessionEventKind::Created,
            SessionEvent::Restored(_) => SessionEventKind::Restored,
            SessionEvent::Invalid { .. } => SessionEventKind::Invalid,
            SessionEvent::Synchronized { .. } => SessionEventKind::Synchronized,
        }
    }
}
