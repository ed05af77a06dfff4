use serde::{Deserialize, Serialize};

/// Physical link used to reach the OBD-II adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Bluetooth Low Energy adapter (requires discovery).
    Ble,
    /// Wi-Fi adapter reachable over a TCP socket.
    Wifi,
}

impl TransportKind {
    /// Whether the adapter has to be discovered before connecting.
    pub fn requires_discovery(self) -> bool {
        matches!(self, TransportKind::Ble)
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Ble => f.write_str("Bluetooth LE"),
            TransportKind::Wifi => f.write_str("Wi-Fi"),
        }
    }
}

/// Connection lifecycle of a diagnostic session.
///
/// Exactly one value is active at a time. Observers render it directly;
/// `Error` carries a message meant for display as-is.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Scanning,
    Connecting,
    Initializing,
    ConnectedToAdapter,
    ConnectedToVehicle,
    Error(String),
}

impl ConnectionState {
    /// Polling and diagnostic commands are only allowed in this state.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::ConnectedToVehicle)
    }

    /// A connect or discovery attempt is in flight.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            ConnectionState::Scanning
                | ConnectionState::Connecting
                | ConnectionState::Initializing
                | ConnectionState::ConnectedToAdapter
        )
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            ConnectionState::Error(message) => Some(message),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("Disconnected"),
            ConnectionState::Scanning => f.write_str("Scanning for adapters"),
            ConnectionState::Connecting => f.write_str("Connecting"),
            ConnectionState::Initializing => f.write_str("Initializing adapter"),
            ConnectionState::ConnectedToAdapter => f.write_str("Connected to adapter"),
            ConnectionState::ConnectedToVehicle => f.write_str("Connected to vehicle"),
            ConnectionState::Error(message) => write!(f, "Error: {message}"),
        }
    }
}
