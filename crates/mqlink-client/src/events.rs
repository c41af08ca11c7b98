//! Connection lifecycle state.

use std::fmt;

/// Connection state.
///
/// ```text
/// Disconnected -> Connecting -> Handshaking -> Connected -> Disconnected
/// ```
///
/// Any failure along the way returns to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// Opening the socket.
    Connecting,
    /// CONNECT sent, waiting for CONNACK.
    Handshaking,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}
