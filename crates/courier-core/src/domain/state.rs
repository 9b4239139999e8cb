//! Connection lifecycle states.

use serde::{Deserialize, Serialize};

/// State of the single logical broker connection.
///
/// State transitions:
/// - Disconnected -> Connecting -> Connected
/// - Connected -> Disconnected (unexpected close) -> Connecting -> ...
/// - any -> Closing -> Closed (explicit shutdown only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }

    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}
