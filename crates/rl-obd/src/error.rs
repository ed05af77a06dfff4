//! OBD adapter error types.

use rl_protocol::TransportKind;
use thiserror::Error;

/// Errors that can occur while talking to an OBD-II adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObdError {
    #[error("no OBD-II adapter found")]
    AdapterNotFound,

    #[error("vehicle not responding")]
    VehicleNotResponding,

    #[error("transport connect failed: {0}")]
    TransportConnect(String),

    #[error("adapter scan failed: {0}")]
    ScanFailed(String),

    #[error("clearing trouble codes failed: {0}")]
    ClearFailed(String),

    #[error("command {command} failed: {cause}")]
    CommandFailed { command: String, cause: String },

    #[error("response timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("no data for {0}")]
    NoData(String),

    #[error("PID 0x{pid:02X} is not supported by the decoder")]
    UnsupportedPid { pid: u8 },

    #[error("frame decode error: {0}")]
    Decode(String),

    #[error("link closed by adapter")]
    LinkClosed,

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ObdError {
    fn from(err: std::io::Error) -> Self {
        ObdError::Io(err.to_string())
    }
}

/// Convenience alias for adapter results.
pub type ObdResult<T> = Result<T, ObdError>;

impl ObdError {
    /// Errors that only affect a single value or cycle.
    ///
    /// The poller logs and skips these; everything else ends polling.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ObdError::NoData(_) | ObdError::UnsupportedPid { .. } | ObdError::Decode(_)
        )
    }

    /// Human-readable message for `ConnectionState::Error`, worded for the
    /// transport the user is on.
    pub fn user_message(&self, kind: TransportKind) -> String {
        match (self, kind) {
            (ObdError::AdapterNotFound, TransportKind::Ble) => {
                "No OBD-II adapter found. Plug the adapter into the diagnostic port, \
                 make sure Bluetooth is turned on, and keep the phone close to the vehicle."
                    .to_string()
            }
            (ObdError::AdapterNotFound, TransportKind::Wifi) => {
                "No OBD-II adapter found. Join the adapter's Wi-Fi network \
                 (often named \"WiFi_OBDII\") in your device settings, then try again."
                    .to_string()
            }
            (ObdError::VehicleNotResponding, _) => {
                "The adapter is connected but the vehicle is not responding. \
                 Turn the ignition on (engine running or key in ON position) and try again."
                    .to_string()
            }
            (ObdError::TransportConnect(cause), TransportKind::Ble) => format!(
                "Could not connect to the Bluetooth adapter ({cause}). \
                 Unplug and re-plug the adapter, then try again."
            ),
            (ObdError::TransportConnect(cause), TransportKind::Wifi) => format!(
                "Could not reach the Wi-Fi adapter ({cause}). \
                 Check that you are still joined to the adapter's network."
            ),
            (ObdError::ScanFailed(cause), TransportKind::Ble) => format!(
                "Bluetooth scan failed ({cause}). Check that Bluetooth permission is granted."
            ),
            (ObdError::ScanFailed(cause), TransportKind::Wifi) => {
                format!("Looking for the Wi-Fi adapter failed ({cause}).")
            }
            (ObdError::ClearFailed(cause), _) => format!(
                "Trouble codes could not be cleared ({cause}). \
                 Some vehicles only allow clearing with the engine off and ignition on."
            ),
            (ObdError::CommandFailed { command, cause }, _) => {
                format!("The adapter rejected command {command} ({cause}).")
            }
            (ObdError::Timeout { timeout_ms }, _) => format!(
                "The adapter stopped answering (no response within {timeout_ms} ms)."
            ),
            (ObdError::LinkClosed, TransportKind::Ble) => {
                "The Bluetooth connection to the adapter was lost.".to_string()
            }
            (ObdError::LinkClosed, TransportKind::Wifi) => {
                "The Wi-Fi connection to the adapter was lost.".to_string()
            }
            (other, _) => format!("Diagnostic session error: {other}."),
        }
    }
}
