//! Transport adapter abstraction.
//!
//! `Transport` is the command/response seam between the session manager and
//! an OBD-II adapter. Two impls:
//! - `ElmTransport`: ELM327 text protocol over a byte `Link` (in `elm.rs`)
//! - `MockTransport`: scripted results and a call journal (in `mock.rs`)
//!
//! Implementations take `&self` and serialize access internally, so a boxed
//! transport can be shared between the poller and ad-hoc commands.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use rl_protocol::{ParameterRequest, TransportKind};

use crate::error::ObdResult;
use crate::types::{Measurement, UnitSystem};

/// A discovered (or configured) adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHandle {
    /// Transport-specific address: BLE peripheral ID or `host:port`.
    pub id: String,
    /// Advertised name.
    pub name: String,
    pub kind: TransportKind,
}

/// What the adapter learned about the vehicle while negotiating.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    pub vin: Option<String>,
    pub protocol: Option<String>,
    pub supported_pids: Vec<ParameterRequest>,
}

/// A stored code as reported by one ECU, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTroubleCode {
    pub code: String,
    /// Adapter-supplied text; ELM327 adapters never send one.
    pub description: Option<String>,
}

impl RawTroubleCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: None,
        }
    }
}

/// Negotiation milestones reported through the `connect` progress callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStage {
    /// The byte link is open; adapter configuration is running.
    Initializing,
    /// The adapter answered its configuration; the vehicle is being probed.
    AdapterReady,
}

/// Per-request outcome of one `request_parameters` call.
pub type ParameterResponses = HashMap<ParameterRequest, ObdResult<Measurement>>;

/// Progress sink passed into `Transport::connect`.
pub type ConnectProgress<'a> = &'a (dyn Fn(ConnectStage) + Send + Sync);

/// Trait for OBD-II adapter transports.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Physical transport this handle speaks over.
    fn kind(&self) -> TransportKind;

    /// Discover reachable adapters.
    async fn scan(&self) -> ObdResult<Vec<DeviceHandle>>;

    /// Open the link and negotiate with adapter and vehicle.
    ///
    /// `device` is required for transports that need discovery; others fall
    /// back to their configured endpoint. `timeout` bounds opening the link.
    async fn connect(
        &self,
        device: Option<DeviceHandle>,
        timeout: Duration,
        progress: ConnectProgress<'_>,
    ) -> ObdResult<SessionInfo>;

    /// Send one command and return the raw response text.
    ///
    /// Response timeouts are retried `retries` more times.
    async fn send_raw(&self, command: &str, retries: u32) -> ObdResult<String>;

    /// Request a set of parameters, batching where the adapter allows.
    ///
    /// Per-parameter failures land in the map; `Err` means the link itself
    /// failed.
    async fn request_parameters(
        &self,
        requests: &[ParameterRequest],
        units: UnitSystem,
    ) -> ObdResult<ParameterResponses>;

    /// Stored codes keyed by ECU name.
    async fn scan_trouble_codes(&self) -> ObdResult<HashMap<String, Vec<RawTroubleCode>>>;

    /// Clear stored codes on every ECU.
    async fn clear_trouble_codes(&self) -> ObdResult<()>;

    /// Close the link. Safe to call on a handle that never connected.
    async fn disconnect(&self) -> ObdResult<()>;
}

/// Builds fresh transport handles. The session manager never reuses one.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, kind: TransportKind) -> ObdResult<Box<dyn Transport>>;
}
