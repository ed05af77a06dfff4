use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::connection::TransportKind;
use crate::parameter::ParameterRequest;

/// Identifier of one connected-adapter session, used to correlate logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Vehicle-derived fields of the active session.
///
/// Filled on connect (and lazily for the VIN); cleared on disconnect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleInfo {
    /// Session this information belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    /// Transport the session runs over.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportKind>,
    /// 17-character Vehicle Identification Number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vin: Option<String>,
    /// Negotiated OBD protocol description (e.g., "ISO 15765-4 (CAN 11/500)").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// Parameters the vehicle reported as supported.
    #[serde(default)]
    pub supported_pids: Vec<ParameterRequest>,
}

impl VehicleInfo {
    pub fn is_empty(&self) -> bool {
        self.session_id.is_none()
            && self.transport.is_none()
            && self.vin.is_none()
            && self.protocol.is_none()
            && self.supported_pids.is_empty()
    }
}
