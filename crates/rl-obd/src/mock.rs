//! Mock transport for testing.
//!
//! Results come from a `MockScript`; every call is recorded into a journal
//! shared by all handles of one `MockTransportFactory`, so tests can check
//! handle replacement order and command serialization without an adapter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use rl_protocol::{ParameterRequest, TransportKind, FAST_PARAMETERS, SLOW_PARAMETERS};

use crate::codec;
use crate::error::{ObdError, ObdResult};
use crate::transport::{
    ConnectProgress, ConnectStage, DeviceHandle, ParameterResponses, RawTroubleCode, SessionInfo,
    Transport, TransportFactory,
};
use crate::types::{Measurement, UnitSystem};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted behavior for mock transports.
#[derive(Debug, Clone)]
pub struct MockScript {
    /// Returned by `TransportFactory::create` instead of a handle.
    pub create_error: Option<ObdError>,
    pub devices: Vec<DeviceHandle>,
    pub scan_error: Option<ObdError>,
    pub session: SessionInfo,
    pub connect_error: Option<ObdError>,
    /// Pause inside `connect` after both progress stages were reported.
    pub connect_delay: Duration,
    /// Metric raw values per parameter; anything else answers `NoData`.
    pub parameters: HashMap<ParameterRequest, ObdResult<f64>>,
    /// After this many successful `request_parameters` calls, fail with the error.
    pub fail_polls_after: Option<(usize, ObdError)>,
    /// Simulated round-trip time of `request_parameters`.
    pub poll_delay: Duration,
    pub trouble_codes: HashMap<String, Vec<RawTroubleCode>>,
    pub scan_codes_error: Option<ObdError>,
    pub clear_error: Option<ObdError>,
    /// Replies for `send_raw`; unknown commands answer `OK`.
    pub raw_responses: HashMap<String, ObdResult<String>>,
}

impl MockScript {
    /// A vehicle that answers everything the poller asks for.
    pub fn healthy() -> Self {
        let parameters = [
            (ParameterRequest::VEHICLE_SPEED, 50.0),
            (ParameterRequest::ENGINE_RPM, 1726.0),
            (ParameterRequest::THROTTLE_POSITION, 57.5),
            (ParameterRequest::ENGINE_LOAD, 32.5),
            (ParameterRequest::COOLANT_TEMP, 88.0),
            (ParameterRequest::INTAKE_AIR_TEMP, 24.0),
            (ParameterRequest::CONTROL_MODULE_VOLTAGE, 14.1),
            (ParameterRequest::OIL_TEMP, 95.0),
            (ParameterRequest::FUEL_RATE, 2.5),
            (ParameterRequest::FUEL_LEVEL, 63.0),
        ]
        .into_iter()
        .map(|(request, value)| (request, Ok(value)))
        .collect();

        let mut raw_responses = HashMap::new();
        raw_responses.insert(
            "0902".to_string(),
            Ok("014\r0:490201314847\r1:434D3832363333\r2:41303034333532\r\r>".to_string()),
        );

        Self {
            create_error: None,
            devices: vec![DeviceHandle {
                id: "mock-adapter".into(),
                name: "Mock OBD-II".into(),
                kind: TransportKind::Ble,
            }],
            scan_error: None,
            session: SessionInfo {
                vin: None,
                protocol: Some("ISO 15765-4 (CAN 11/500)".into()),
                supported_pids: FAST_PARAMETERS.iter().chain(SLOW_PARAMETERS.iter()).copied().collect(),
            },
            connect_error: None,
            connect_delay: Duration::ZERO,
            parameters,
            fail_polls_after: None,
            poll_delay: Duration::ZERO,
            trouble_codes: HashMap::new(),
            scan_codes_error: None,
            clear_error: None,
            raw_responses,
        }
    }
}

impl Default for MockScript {
    fn default() -> Self {
        Self::healthy()
    }
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Create(TransportKind),
    Scan,
    Connect,
    SendRaw(String),
    RequestParameters(Vec<ParameterRequest>),
    ScanTroubleCodes,
    ClearTroubleCodes,
    Disconnect,
}

/// A call and the handle it was made on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockEvent {
    pub handle: usize,
    pub call: MockCall,
}

#[derive(Default)]
struct JournalInner {
    events: Mutex<Vec<MockEvent>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Shared, append-only call log.
#[derive(Clone, Default)]
pub struct MockJournal {
    inner: Arc<JournalInner>,
}

impl MockJournal {
    fn record(&self, handle: usize, call: MockCall) {
        lock(&self.inner.events).push(MockEvent { handle, call });
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(self)
    }

    pub fn events(&self) -> Vec<MockEvent> {
        lock(&self.inner.events).clone()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.events().into_iter().map(|e| e.call).collect()
    }

    pub fn count(&self, pred: impl Fn(&MockCall) -> bool) -> usize {
        lock(&self.inner.events).iter().filter(|e| pred(&e.call)).count()
    }

    /// All `request_parameters` batches, in order.
    pub fn parameter_requests(&self) -> Vec<Vec<ParameterRequest>> {
        lock(&self.inner.events)
            .iter()
            .filter_map(|e| match &e.call {
                MockCall::RequestParameters(requests) => Some(requests.clone()),
                _ => None,
            })
            .collect()
    }

    /// `send_raw` commands, in order.
    pub fn raw_commands(&self) -> Vec<String> {
        lock(&self.inner.events)
            .iter()
            .filter_map(|e| match &e.call {
                MockCall::SendRaw(command) => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    /// Highest number of calls that were ever running at once.
    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        lock(&self.inner.events).clear();
    }
}

struct InFlight<'a>(&'a MockJournal);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Scripted transport handle.
pub struct MockTransport {
    kind: TransportKind,
    handle: usize,
    script: MockScript,
    journal: MockJournal,
    polls: AtomicUsize,
}

impl MockTransport {
    pub fn new(kind: TransportKind, script: MockScript) -> Self {
        Self::with_journal(kind, 0, script, MockJournal::default())
    }

    fn with_journal(kind: TransportKind, handle: usize, script: MockScript, journal: MockJournal) -> Self {
        Self {
            kind,
            handle,
            script,
            journal,
            polls: AtomicUsize::new(0),
        }
    }

    pub fn journal(&self) -> MockJournal {
        self.journal.clone()
    }

    fn record(&self, call: MockCall) {
        self.journal.record(self.handle, call);
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn scan(&self) -> ObdResult<Vec<DeviceHandle>> {
        let _guard = self.journal.enter();
        self.record(MockCall::Scan);
        match &self.script.scan_error {
            Some(err) => Err(err.clone()),
            None => Ok(self.script.devices.clone()),
        }
    }

    async fn connect(
        &self,
        _device: Option<DeviceHandle>,
        _timeout: Duration,
        progress: ConnectProgress<'_>,
    ) -> ObdResult<SessionInfo> {
        let _guard = self.journal.enter();
        self.record(MockCall::Connect);
        if let Some(err) = &self.script.connect_error {
            return Err(err.clone());
        }
        progress(ConnectStage::Initializing);
        progress(ConnectStage::AdapterReady);
        if !self.script.connect_delay.is_zero() {
            tokio::time::sleep(self.script.connect_delay).await;
        }
        Ok(self.script.session.clone())
    }

    async fn send_raw(&self, command: &str, _retries: u32) -> ObdResult<String> {
        let _guard = self.journal.enter();
        self.record(MockCall::SendRaw(command.to_string()));
        self.script
            .raw_responses
            .get(command)
            .cloned()
            .unwrap_or_else(|| Ok("OK\r\r>".to_string()))
    }

    async fn request_parameters(
        &self,
        requests: &[ParameterRequest],
        units: UnitSystem,
    ) -> ObdResult<ParameterResponses> {
        let _guard = self.journal.enter();
        self.record(MockCall::RequestParameters(requests.to_vec()));
        if !self.script.poll_delay.is_zero() {
            tokio::time::sleep(self.script.poll_delay).await;
        }

        let done = self.polls.fetch_add(1, Ordering::SeqCst);
        if let Some((after, err)) = &self.script.fail_polls_after {
            if done >= *after {
                return Err(err.clone());
            }
        }

        Ok(requests
            .iter()
            .map(|request| {
                let value = match self.script.parameters.get(request) {
                    Some(Ok(value)) => measurement(*request, *value).map(|m| m.in_units(units)),
                    Some(Err(err)) => Err(err.clone()),
                    None => Err(ObdError::NoData(request.to_string())),
                };
                (*request, value)
            })
            .collect())
    }

    async fn scan_trouble_codes(&self) -> ObdResult<HashMap<String, Vec<RawTroubleCode>>> {
        let _guard = self.journal.enter();
        self.record(MockCall::ScanTroubleCodes);
        match &self.script.scan_codes_error {
            Some(err) => Err(err.clone()),
            None => Ok(self.script.trouble_codes.clone()),
        }
    }

    async fn clear_trouble_codes(&self) -> ObdResult<()> {
        let _guard = self.journal.enter();
        self.record(MockCall::ClearTroubleCodes);
        match &self.script.clear_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn disconnect(&self) -> ObdResult<()> {
        let _guard = self.journal.enter();
        self.record(MockCall::Disconnect);
        Ok(())
    }
}

/// Build a measurement with the decoder's name and unit for `request`.
fn measurement(request: ParameterRequest, value: f64) -> ObdResult<Measurement> {
    // Decode a zero byte string only to borrow the PID's name and unit.
    let template = codec::decode(request, &[0, 0])?;
    Ok(Measurement { value, ..template })
}

/// Factory handing out `MockTransport`s that share one journal.
pub struct MockTransportFactory {
    script: Mutex<MockScript>,
    journal: MockJournal,
    next_handle: AtomicUsize,
}

impl MockTransportFactory {
    pub fn new(script: MockScript) -> Self {
        Self {
            script: Mutex::new(script),
            journal: MockJournal::default(),
            next_handle: AtomicUsize::new(1),
        }
    }

    /// Script used by handles created from now on.
    pub fn set_script(&self, script: MockScript) {
        *lock(&self.script) = script;
    }

    pub fn update_script(&self, f: impl FnOnce(&mut MockScript)) {
        f(&mut lock(&self.script));
    }

    pub fn journal(&self) -> MockJournal {
        self.journal.clone()
    }
}

impl Default for MockTransportFactory {
    fn default() -> Self {
        Self::new(MockScript::healthy())
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(&self, kind: TransportKind) -> ObdResult<Box<dyn Transport>> {
        let script = lock(&self.script).clone();
        if let Some(err) = script.create_error.clone() {
            return Err(err);
        }
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.journal.record(handle, MockCall::Create(kind));
        Ok(Box::new(MockTransport::with_journal(
            kind,
            handle,
            script,
            self.journal.clone(),
        )))
    }
}
