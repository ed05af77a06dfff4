//! Session manager errors and connect-failure classification.

use rl_obd::ObdError;
use rl_protocol::ConnectionState;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("no vehicle connected (state: {state})")]
    NotConnected { state: ConnectionState },

    #[error("session is busy (state: {state})")]
    Busy { state: ConnectionState },

    #[error(transparent)]
    Obd(#[from] ObdError),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Fold a negotiation failure into the connect taxonomy: adapter not found,
/// vehicle not responding, transport connect, scan, or command failure.
pub fn classify_connect_error(err: ObdError) -> ObdError {
    match err {
        ObdError::NoData(_) => ObdError::VehicleNotResponding,
        ObdError::Io(cause) => ObdError::TransportConnect(cause),
        ObdError::LinkClosed => ObdError::TransportConnect("link closed by adapter".into()),
        ObdError::Timeout { timeout_ms } => {
            ObdError::TransportConnect(format!("adapter silent for {timeout_ms}ms"))
        }
        ObdError::Decode(cause) => ObdError::CommandFailed {
            command: "0100".into(),
            cause,
        },
        ObdError::UnsupportedPid { pid } => ObdError::CommandFailed {
            command: format!("01{pid:02X}"),
            cause: "unsupported by decoder".into(),
        },
        other => other,
    }
}

/// Discovery failures are always reported as not-found or scan-failed.
pub fn classify_scan_error(err: ObdError) -> ObdError {
    match err {
        ObdError::AdapterNotFound | ObdError::ScanFailed(_) => err,
        other => ObdError::ScanFailed(other.to_string()),
    }
}
