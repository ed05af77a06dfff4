//! Diagnostic session manager.
//!
//! Owns the transport handle, the connection state machine, the polling
//! task and every observable the UI reads. Constructed explicitly by the
//! application and shared behind an `Arc`; there is no global instance.
//!
//! Every entry point checks demo mode first and branches to the simulator,
//! so callers never need to know which mode is active.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, watch};
use tokio::time;

use rl_obd::types::{MODE_VEHICLE_INFO, PID_VIN};
use rl_obd::{codec, ConnectStage, DeviceHandle, ObdError, SessionInfo, TransportFactory};
use rl_protocol::{
    ConnectionState, LiveTelemetry, ParameterRequest, SessionId, TransportKind, TroubleCode,
    VehicleInfo,
};

use crate::codes::build_trouble_codes;
use crate::config::SessionConfig;
use crate::error::{classify_connect_error, classify_scan_error, SessionError, SessionResult};
use crate::link::SerialLink;
use crate::observe::Published;
use crate::poller::{self, PollPlan, PollerContext, PollerHandle};
use crate::simulator::{self, Simulator};

#[derive(Default)]
struct Inner {
    link: Option<Arc<SerialLink>>,
    poller: Option<PollerHandle>,
    /// Cancels an in-flight `connect` negotiation.
    attempt: Option<watch::Sender<bool>>,
}

pub struct SessionManager {
    factory: Arc<dyn TransportFactory>,
    config: SessionConfig,
    published: Arc<Published>,
    inner: Mutex<Inner>,
}

impl SessionManager {
    pub fn new(factory: Arc<dyn TransportFactory>, config: SessionConfig) -> Self {
        Self {
            factory,
            config,
            published: Arc::new(Published::new()),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // ── Observables ─────────────────────────────────────────────

    pub fn connection_state(&self) -> ConnectionState {
        self.published.state()
    }

    pub fn telemetry(&self) -> LiveTelemetry {
        self.published.telemetry()
    }

    pub fn trouble_codes(&self) -> Vec<TroubleCode> {
        self.published.trouble_codes()
    }

    pub fn vehicle(&self) -> VehicleInfo {
        self.published.vehicle()
    }

    pub fn vin(&self) -> Option<String> {
        self.published.vehicle().vin
    }

    pub fn protocol_description(&self) -> Option<String> {
        self.published.vehicle().protocol
    }

    pub fn supported_pids(&self) -> Vec<ParameterRequest> {
        self.published.vehicle().supported_pids
    }

    pub fn is_polling(&self) -> bool {
        self.published.is_polling()
    }

    pub fn is_demo_mode(&self) -> bool {
        self.published.is_demo()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.published.subscribe_state()
    }

    pub fn subscribe_telemetry(&self) -> watch::Receiver<LiveTelemetry> {
        self.published.subscribe_telemetry()
    }

    pub fn subscribe_trouble_codes(&self) -> watch::Receiver<Vec<TroubleCode>> {
        self.published.subscribe_trouble_codes()
    }

    pub fn subscribe_vehicle(&self) -> watch::Receiver<VehicleInfo> {
        self.published.subscribe_vehicle()
    }

    pub fn subscribe_polling(&self) -> watch::Receiver<bool> {
        self.published.subscribe_polling()
    }

    pub fn subscribe_demo_mode(&self) -> watch::Receiver<bool> {
        self.published.subscribe_demo()
    }

    // ── Discovery ───────────────────────────────────────────────

    /// List reachable adapters using a short-lived transport handle.
    ///
    /// Only allowed while idle; the state returns to `Disconnected` either way.
    pub async fn start_scanning(&self, kind: TransportKind) -> SessionResult<Vec<DeviceHandle>> {
        if self.is_demo_mode() {
            return Ok(vec![DeviceHandle {
                id: "demo".into(),
                name: "Demo adapter".into(),
                kind,
            }]);
        }

        let _inner = self.inner.lock().await;
        let state = self.published.state();
        if state.is_busy() || state.is_connected() {
            return Err(SessionError::Busy { state });
        }

        self.published.set_state(ConnectionState::Scanning);
        let result = async {
            let transport = self.factory.create(kind).await?;
            let devices = transport.scan().await;
            if let Err(e) = transport.disconnect().await {
                tracing::debug!(error = %e, "closing scan handle failed");
            }
            devices
        }
        .await
        .map_err(classify_scan_error);
        self.published.set_state(ConnectionState::Disconnected);

        let devices = result?;
        tracing::info!(transport = %kind, found = devices.len(), "adapter scan finished");
        Ok(devices)
    }

    // ── Connection lifecycle ────────────────────────────────────

    /// Replace any existing session with a fresh one over `kind`.
    ///
    /// Never fails past this boundary: the outcome is the returned (and
    /// published) connection state.
    pub async fn connect(&self, kind: TransportKind) -> ConnectionState {
        if self.is_demo_mode() {
            if !self.published.state().is_connected() {
                self.enter_demo_session();
            }
            return self.published.state();
        }

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let link = {
            let mut inner = self.inner.lock().await;
            self.teardown(&mut inner).await;
            self.published.set_state(ConnectionState::Connecting);
            match self.factory.create(kind).await {
                Ok(transport) => {
                    tracing::info!(transport = %kind, "transport handle created");
                    let link = Arc::new(SerialLink::new(transport));
                    inner.link = Some(Arc::clone(&link));
                    inner.attempt = Some(cancel_tx);
                    link
                }
                Err(e) => {
                    let e = classify_connect_error(e);
                    self.published.set_state(ConnectionState::Error(e.user_message(kind)));
                    return self.published.state();
                }
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel_rx.changed() => {
                tracing::info!(transport = %kind, "connect attempt cancelled");
                // Whoever cancelled holds the lock until its teardown is done.
                let _inner = self.inner.lock().await;
                return self.published.state();
            }
            outcome = self.negotiate(&link, kind) => outcome,
        };

        let mut inner = self.inner.lock().await;
        let current = inner.link.as_ref().is_some_and(|l| Arc::ptr_eq(l, &link));
        if !current {
            // Superseded by a disconnect or a newer connect.
            return self.published.state();
        }
        inner.attempt = None;

        match outcome {
            Ok(info) => {
                self.publish_session(kind, info);
                self.published.set_state(ConnectionState::ConnectedToVehicle);
            }
            Err(e) => {
                tracing::warn!(transport = %kind, error = %e, "connect failed");
                self.published.set_state(ConnectionState::Error(e.user_message(kind)));
            }
        }
        self.published.state()
    }

    /// Discovery (when needed) plus negotiation, bounded by the connect timeout.
    async fn negotiate(&self, link: &SerialLink, kind: TransportKind) -> Result<SessionInfo, ObdError> {
        let timeout = self.config.connect_timeout();
        let reached_adapter = AtomicBool::new(false);
        let published = &self.published;
        let progress = |stage: ConnectStage| match stage {
            ConnectStage::Initializing => published.set_state(ConnectionState::Initializing),
            ConnectStage::AdapterReady => {
                reached_adapter.store(true, Ordering::SeqCst);
                published.set_state(ConnectionState::ConnectedToAdapter);
            }
        };

        let attempt = async {
            let device = if kind.requires_discovery() {
                published.set_state(ConnectionState::Scanning);
                let devices = link.scan().await.map_err(classify_scan_error)?;
                let device = devices.into_iter().next().ok_or(ObdError::AdapterNotFound)?;
                tracing::info!(device = %device.name, id = %device.id, "adapter selected");
                published.set_state(ConnectionState::Connecting);
                Some(device)
            } else {
                None
            };
            link.connect(device, timeout, &progress)
                .await
                .map_err(classify_connect_error)
        };

        match time::timeout(timeout, attempt).await {
            Ok(result) => result,
            Err(_) if reached_adapter.load(Ordering::SeqCst) => Err(ObdError::VehicleNotResponding),
            Err(_) => Err(ObdError::TransportConnect(format!(
                "no answer within {}s",
                timeout.as_secs()
            ))),
        }
    }

    fn publish_session(&self, kind: TransportKind, info: SessionInfo) {
        let session_id = SessionId::new();
        tracing::info!(
            session = %session_id,
            transport = %kind,
            vin = info.vin.as_deref().unwrap_or("-"),
            protocol = info.protocol.as_deref().unwrap_or("-"),
            supported = info.supported_pids.len(),
            "vehicle session established"
        );
        self.published.set_vehicle(VehicleInfo {
            session_id: Some(session_id),
            transport: Some(kind),
            vin: info.vin,
            protocol: info.protocol,
            supported_pids: info.supported_pids,
        });
    }

    /// Stop everything and return to `Disconnected`. Safe from any state.
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        if self.is_demo_mode() {
            tracing::debug!("ending demo session");
        }
        self.teardown(&mut inner).await;
    }

    /// Cancel negotiation, stop the poller, close the handle, clear state.
    async fn teardown(&self, inner: &mut Inner) {
        if let Some(cancel) = inner.attempt.take() {
            cancel.send_replace(true);
        }
        if let Some(poller) = inner.poller.take() {
            poller.stop().await;
        }
        if let Some(link) = inner.link.take() {
            if let Err(e) = link.disconnect().await {
                tracing::warn!(error = %e, "closing transport failed");
            }
        }
        self.published.reset_session();
    }

    // ── Polling ─────────────────────────────────────────────────

    /// Start the background poller. A no-op if it is already running.
    ///
    /// Requires a connected vehicle. After a fatal link error the session is
    /// gone, so this reports `NotConnected` until `connect` succeeds again.
    pub async fn start_polling(&self) -> SessionResult<()> {
        let mut inner = self.inner.lock().await;
        let state = self.published.state();
        if !state.is_connected() {
            return Err(SessionError::NotConnected { state });
        }
        if inner.poller.as_ref().is_some_and(|p| !p.is_finished()) {
            return Ok(());
        }

        if self.is_demo_mode() {
            let simulator = Simulator::new(self.config.demo_seed, self.config.units);
            self.published.set_polling(true);
            inner.poller = Some(simulator::spawn(
                Arc::clone(&self.published),
                simulator,
                self.config.demo_interval(),
            ));
            return Ok(());
        }

        let link = inner
            .link
            .clone()
            .ok_or(SessionError::NotConnected { state })?;
        self.spawn_poller(&mut inner, link);
        Ok(())
    }

    fn spawn_poller(&self, inner: &mut Inner, link: Arc<SerialLink>) {
        let plan = PollPlan::for_vehicle(
            &self.published.vehicle().supported_pids,
            self.config.slow_cycle_every(),
        );
        self.published.set_polling(true);
        inner.poller = Some(poller::spawn(PollerContext {
            link,
            published: Arc::clone(&self.published),
            plan,
            interval: self.config.poll_interval(),
            retries: self.config.command_retries(),
            units: self.config.units,
        }));
    }

    /// Stop the poller and wait for its cleanup. Idempotent.
    pub async fn stop_polling(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(poller) = inner.poller.take() {
            poller.stop().await;
        }
    }

    /// Stop polling for a diagnostic command; reports whether it was active.
    async fn suspend_polling(&self, inner: &mut Inner) -> bool {
        match inner.poller.take() {
            Some(poller) => {
                let active = !poller.is_finished();
                poller.stop().await;
                active
            }
            None => false,
        }
    }

    fn resume_polling(&self, inner: &mut Inner, link: Arc<SerialLink>) {
        if self.published.state().is_connected() {
            tracing::debug!("resuming polling");
            self.spawn_poller(inner, link);
        }
    }

    fn connected_link(&self, inner: &Inner) -> SessionResult<Arc<SerialLink>> {
        let state = self.published.state();
        match (&inner.link, state.is_connected()) {
            (Some(link), true) => Ok(Arc::clone(link)),
            _ => Err(SessionError::NotConnected { state }),
        }
    }

    // ── Trouble codes ───────────────────────────────────────────

    /// Scan every ECU and publish the classified list, most severe first.
    pub async fn read_trouble_codes(&self) -> SessionResult<Vec<TroubleCode>> {
        if self.is_demo_mode() {
            let state = self.published.state();
            if !state.is_connected() {
                return Err(SessionError::NotConnected { state });
            }
            let codes = simulator::demo_trouble_codes();
            self.published.set_trouble_codes(codes.clone());
            return Ok(codes);
        }

        let mut inner = self.inner.lock().await;
        let link = self.connected_link(&inner)?;
        let resume = self.suspend_polling(&mut inner).await;

        match link.scan_trouble_codes().await {
            Ok(raw) => {
                let codes = build_trouble_codes(raw);
                tracing::info!(count = codes.len(), "trouble codes read");
                self.published.set_trouble_codes(codes.clone());
                if resume {
                    self.resume_polling(&mut inner, link);
                }
                Ok(codes)
            }
            Err(e) => {
                tracing::warn!(error = %e, "trouble code scan failed");
                self.published
                    .set_state(ConnectionState::Error(e.user_message(link.kind())));
                Err(e.into())
            }
        }
    }

    /// Clear stored codes. The published list only empties on success.
    pub async fn clear_trouble_codes(&self) -> SessionResult<()> {
        if self.is_demo_mode() {
            let state = self.published.state();
            if !state.is_connected() {
                return Err(SessionError::NotConnected { state });
            }
            self.published.set_trouble_codes(Vec::new());
            return Ok(());
        }

        let mut inner = self.inner.lock().await;
        let link = self.connected_link(&inner)?;
        let resume = self.suspend_polling(&mut inner).await;

        match link.clear_trouble_codes().await {
            Ok(()) => {
                tracing::info!("trouble codes cleared");
                self.published.set_trouble_codes(Vec::new());
                if resume {
                    self.resume_polling(&mut inner, link);
                }
                Ok(())
            }
            Err(e) => {
                let e = match e {
                    ObdError::ClearFailed(_) => e,
                    other => ObdError::ClearFailed(other.to_string()),
                };
                tracing::warn!(error = %e, "clearing trouble codes failed");
                self.published
                    .set_state(ConnectionState::Error(e.user_message(link.kind())));
                Err(e.into())
            }
        }
    }

    // ── Vehicle identity ────────────────────────────────────────

    /// The VIN, read from the vehicle on first use and cached in the session.
    ///
    /// `Ok(None)` means the vehicle does not report one.
    pub async fn read_vin(&self) -> SessionResult<Option<String>> {
        if self.is_demo_mode() {
            return Ok(Some(simulator::DEMO_VIN.to_string()));
        }
        if let Some(vin) = self.vin() {
            return Ok(Some(vin));
        }

        let link = {
            let inner = self.inner.lock().await;
            self.connected_link(&inner)?
        };
        let command = format!("{MODE_VEHICLE_INFO:02X}{PID_VIN:02X}");
        let result = async {
            let text = link.send_raw(&command, self.config.command_retries()).await?;
            let frames = codec::parse_response(&command, &text)?;
            codec::decode_vin(&frames)
        }
        .await;

        match result {
            Ok(vin) => {
                tracing::info!(vin = %vin, "VIN read");
                self.published.update_vehicle(|v| v.vin = Some(vin.clone()));
                Ok(Some(vin))
            }
            Err(e) if e.is_recoverable() => {
                tracing::debug!(error = %e, "vehicle did not report a VIN");
                Ok(None)
            }
            Err(e) => {
                self.published
                    .set_state(ConnectionState::Error(e.user_message(link.kind())));
                Err(e.into())
            }
        }
    }

    // ── Demo mode ───────────────────────────────────────────────

    /// Replace any real session with simulated data. No transport is touched.
    pub async fn start_demo_mode(&self) {
        let mut inner = self.inner.lock().await;
        self.teardown(&mut inner).await;
        self.published.set_demo(true);
        self.enter_demo_session();
        tracing::info!("demo mode started");
    }

    fn enter_demo_session(&self) {
        self.published.set_vehicle(simulator::demo_vehicle());
        self.published.set_state(ConnectionState::ConnectedToVehicle);
    }

    pub async fn stop_demo_mode(&self) {
        let mut inner = self.inner.lock().await;
        if !self.is_demo_mode() {
            return;
        }
        self.teardown(&mut inner).await;
        self.published.set_demo(false);
        tracing::info!("demo mode stopped");
    }
}
