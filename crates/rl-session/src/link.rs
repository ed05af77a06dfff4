//! Single-writer access to a transport handle.
//!
//! The OBD link is half-duplex: one command/response exchange at a time.
//! Every round trip from the poller, trouble-code scans and ad-hoc commands
//! goes through the same `SerialLink`, which holds its mutex for the full
//! exchange. Once disconnected the handle is gone and every call fails with
//! `LinkClosed`.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;

use rl_obd::{
    ConnectProgress, DeviceHandle, ObdError, ObdResult, ParameterResponses, RawTroubleCode, SessionInfo,
    Transport, UnitSystem,
};
use rl_protocol::{ParameterRequest, TransportKind};

pub struct SerialLink {
    kind: TransportKind,
    transport: Mutex<Option<Box<dyn Transport>>>,
}

fn open(transport: &Option<Box<dyn Transport>>) -> ObdResult<&dyn Transport> {
    transport.as_deref().ok_or(ObdError::LinkClosed)
}

impl SerialLink {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            kind: transport.kind(),
            transport: Mutex::new(Some(transport)),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub async fn is_closed(&self) -> bool {
        self.transport.lock().await.is_none()
    }

    pub async fn scan(&self) -> ObdResult<Vec<DeviceHandle>> {
        let guard = self.transport.lock().await;
        open(&guard)?.scan().await
    }

    pub async fn connect(
        &self,
        device: Option<DeviceHandle>,
        timeout: Duration,
        progress: ConnectProgress<'_>,
    ) -> ObdResult<SessionInfo> {
        let guard = self.transport.lock().await;
        open(&guard)?.connect(device, timeout, progress).await
    }

    pub async fn send_raw(&self, command: &str, retries: u32) -> ObdResult<String> {
        let guard = self.transport.lock().await;
        open(&guard)?.send_raw(command, retries).await
    }

    pub async fn request_parameters(
        &self,
        requests: &[ParameterRequest],
        units: UnitSystem,
    ) -> ObdResult<ParameterResponses> {
        let guard = self.transport.lock().await;
        open(&guard)?.request_parameters(requests, units).await
    }

    pub async fn scan_trouble_codes(&self) -> ObdResult<HashMap<String, Vec<RawTroubleCode>>> {
        let guard = self.transport.lock().await;
        open(&guard)?.scan_trouble_codes().await
    }

    pub async fn clear_trouble_codes(&self) -> ObdResult<()> {
        let guard = self.transport.lock().await;
        open(&guard)?.clear_trouble_codes().await
    }

    /// Close and drop the transport. Later calls are no-ops.
    pub async fn disconnect(&self) -> ObdResult<()> {
        let mut guard = self.transport.lock().await;
        match guard.take() {
            Some(transport) => transport.disconnect().await,
            None => Ok(()),
        }
    }
}
