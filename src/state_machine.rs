use std::fmt;

/// Externally visible health of the live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Start,
    OpenAck,
    Stop,
    Fault,
}

impl SessionStatus {
    /// `Error` is terminal until a fresh start, and starts like `Disconnected`.
    pub fn can_start(self) -> bool {
        matches!(self, SessionStatus::Disconnected | SessionStatus::Error)
    }

    pub fn is_active(self) -> bool {
        matches!(self, SessionStatus::Connecting | SessionStatus::Connected)
    }

    /// Transition table. `None` means the event does not apply in this state.
    pub fn next(self, event: SessionEvent) -> Option<SessionStatus> {
        use SessionEvent::*;
        use SessionStatus::*;
        match (self, event) {
            (Disconnected | Error, Start) => Some(Connecting),
            (Connecting, OpenAck) => Some(Connected),
            (Connecting | Connected, Fault) => Some(Error),
            (_, Stop) => Some(Disconnected),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Connected => "connected",
            SessionStatus::Error => "error",
        };
        f.write_str(s)
    }
}
