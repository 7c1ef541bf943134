use std::fmt;
use uuid::Uuid;

/// Unique identifier for one live connection
///
/// A user may hold several at once (one per device). Removal is keyed on
/// this id so closing one device never evicts another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Connection lifecycle. `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

impl ConnectionState {
    /// Apply a socket close or error. Returns `true` on the first transition only.
    pub fn disconnect(&mut self) -> bool {
        match self {
            ConnectionState::Connected => {
                *self = ConnectionState::Disconnected;
                true
            }
            ConnectionState::Disconnected => false,
        }
    }
}
