//! ELM327 text transport.
//!
//! `ElmTransport` speaks the ELM327 AT/OBD command set over any byte
//! `Link`. Each command is written with a trailing `\r` and the response is
//! read until the `>` prompt. Input left over from an earlier exchange is
//! discarded before the next write. `TcpConnector` provides the Wi-Fi link;
//! a Bluetooth LE `LinkConnector` is supplied by the host platform.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{self, Instant};

use rl_protocol::{ParameterRequest, TransportKind};

use crate::codec::{self, CanAddressing};
use crate::error::{ObdError, ObdResult};
use crate::transport::{
    ConnectProgress, ConnectStage, DeviceHandle, ParameterResponses, RawTroubleCode, SessionInfo,
    Transport, TransportFactory,
};
use crate::types::*;

/// Default per-command response deadline.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Retries for configuration commands issued during `connect`.
const INIT_RETRIES: u32 = 1;

/// Highest supported-PID bitmap that is followed (`01C0`).
const LAST_BITMAP_BASE: u8 = 0xC0;

// ── Byte links ──────────────────────────────────────────────────

/// A bidirectional byte channel to an adapter.
#[async_trait]
pub trait Link: Send {
    async fn write_all(&mut self, bytes: &[u8]) -> ObdResult<()>;

    /// Read whatever is available. `Ok(0)` means the peer closed the link.
    async fn read_chunk(&mut self, buf: &mut [u8]) -> ObdResult<usize>;

    async fn close(&mut self) -> ObdResult<()>;
}

/// Discovers and opens links of one transport kind.
#[async_trait]
pub trait LinkConnector: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Endpoint used when `connect` is called without a device.
    fn default_device(&self) -> Option<DeviceHandle>;

    async fn discover(&self) -> ObdResult<Vec<DeviceHandle>>;

    async fn open(&self, device: &DeviceHandle, timeout: Duration) -> ObdResult<Box<dyn Link>>;
}

/// Wi-Fi adapters: a plain TCP socket on the adapter's access point.
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    /// Address used by nearly every Wi-Fi ELM327 clone.
    pub const DEFAULT_ADDR: &'static str = "192.168.0.10:35000";

    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    fn device(&self) -> DeviceHandle {
        DeviceHandle {
            id: self.addr.clone(),
            name: "Wi-Fi OBD-II adapter".to_string(),
            kind: TransportKind::Wifi,
        }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Self::DEFAULT_ADDR)
    }
}

#[async_trait]
impl LinkConnector for TcpConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Wifi
    }

    fn default_device(&self) -> Option<DeviceHandle> {
        Some(self.device())
    }

    async fn discover(&self) -> ObdResult<Vec<DeviceHandle>> {
        match time::timeout(DEFAULT_COMMAND_TIMEOUT, TcpStream::connect(&self.addr)).await {
            Ok(Ok(_probe)) => Ok(vec![self.device()]),
            Ok(Err(e)) => {
                tracing::debug!(addr = %self.addr, error = %e, "Wi-Fi adapter not reachable");
                Ok(Vec::new())
            }
            Err(_) => Ok(Vec::new()),
        }
    }

    async fn open(&self, device: &DeviceHandle, timeout: Duration) -> ObdResult<Box<dyn Link>> {
        let stream = match time::timeout(timeout, TcpStream::connect(&device.id)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ObdError::TransportConnect(format!("{}: {e}", device.id)));
            }
            Err(_) => {
                return Err(ObdError::TransportConnect(format!(
                    "{}: timed out after {}ms",
                    device.id,
                    timeout.as_millis()
                )));
            }
        };
        stream.set_nodelay(true)?;
        Ok(Box::new(TcpLink { stream }))
    }
}

struct TcpLink {
    stream: TcpStream,
}

#[async_trait]
impl Link for TcpLink {
    async fn write_all(&mut self, bytes: &[u8]) -> ObdResult<()> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    async fn read_chunk(&mut self, buf: &mut [u8]) -> ObdResult<usize> {
        Ok(self.stream.read(buf).await?)
    }

    async fn close(&mut self) -> ObdResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

// ── ELM327 transport ────────────────────────────────────────────

/// An open link plus what is known about its read side.
struct Channel {
    link: Box<dyn Link>,
    /// A command timed out and its reply may still arrive.
    reply_outstanding: bool,
}

impl Channel {
    fn new(link: Box<dyn Link>) -> Self {
        Self {
            link,
            reply_outstanding: false,
        }
    }

    /// Return the adapter to an idle prompt before the next command.
    ///
    /// A late reply to a timed-out command gets up to `grace` to finish;
    /// anything else already buffered is dropped.
    async fn settle(&mut self, grace: Duration) -> ObdResult<()> {
        if std::mem::take(&mut self.reply_outstanding) {
            match read_until_prompt(&mut *self.link, grace).await {
                Ok(late) => tracing::debug!(
                    late = %String::from_utf8_lossy(&late).escape_debug(),
                    "discarded late reply"
                ),
                Err(ObdError::Timeout { .. }) => tracing::debug!("late reply never arrived"),
                Err(e) => return Err(e),
            }
        }
        let dropped = drain_pending(&mut *self.link).await?;
        if dropped > 0 {
            tracing::debug!(dropped, "discarded stale adapter bytes");
        }
        Ok(())
    }
}

/// Read until the `>` prompt. Bytes after the prompt are dropped.
async fn read_until_prompt(link: &mut dyn Link, timeout: Duration) -> ObdResult<Vec<u8>> {
    let timeout_ms = timeout.as_millis() as u64;
    let deadline = Instant::now() + timeout;
    let mut response = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let n = match time::timeout(remaining, link.read_chunk(&mut buf)).await {
            Ok(read) => read?,
            Err(_) => return Err(ObdError::Timeout { timeout_ms }),
        };
        if n == 0 {
            return Err(ObdError::LinkClosed);
        }
        response.extend_from_slice(&buf[..n]);
        if let Some(end) = response.iter().position(|&b| b == b'>') {
            response.truncate(end + 1);
            return Ok(response);
        }
    }
}

/// Consume whatever is already readable without waiting for more.
async fn drain_pending(link: &mut dyn Link) -> ObdResult<usize> {
    let mut buf = [0u8; 256];
    let mut dropped = 0;
    loop {
        match time::timeout(Duration::ZERO, link.read_chunk(&mut buf)).await {
            Ok(Ok(0)) => return Err(ObdError::LinkClosed),
            Ok(Ok(n)) => dropped += n,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Ok(dropped),
        }
    }
}

/// `Transport` over an ELM327-compatible adapter.
pub struct ElmTransport {
    connector: Arc<dyn LinkConnector>,
    link: Mutex<Option<Channel>>,
    /// CAN ID width of the negotiated protocol; `None` scans headers off.
    addressing: Mutex<Option<CanAddressing>>,
    command_timeout: Duration,
}

impl ElmTransport {
    pub fn new(connector: Arc<dyn LinkConnector>) -> Self {
        Self {
            connector,
            link: Mutex::new(None),
            addressing: Mutex::new(None),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// One write + read-until-prompt exchange.
    async fn exchange(&self, command: &str) -> ObdResult<String> {
        let mut guard = self.link.lock().await;
        let channel = guard.as_mut().ok_or(ObdError::LinkClosed)?;

        channel.settle(self.command_timeout).await?;
        channel
            .link
            .write_all(format!("{command}\r").as_bytes())
            .await?;

        let response = match read_until_prompt(&mut *channel.link, self.command_timeout).await {
            Ok(response) => response,
            Err(e) => {
                if matches!(e, ObdError::Timeout { .. }) {
                    channel.reply_outstanding = true;
                }
                return Err(e);
            }
        };

        let text = String::from_utf8_lossy(&response).into_owned();
        tracing::trace!(command, response = %text.escape_debug(), "ELM exchange");
        Ok(text)
    }

    /// Send a configuration command and require `OK`.
    async fn configure(&self, command: &str) -> ObdResult<()> {
        let text = self.send_raw(command, INIT_RETRIES).await?;
        let lines = codec::response_lines(command, &text);
        if lines.iter().any(|l| l.eq_ignore_ascii_case("OK")) {
            return Ok(());
        }
        if let Some(err) = lines.iter().find_map(|l| codec::adapter_error(command, l)) {
            return Err(err);
        }
        Err(ObdError::CommandFailed {
            command: command.to_string(),
            cause: format!("unexpected reply {:?}", lines.join(" ")),
        })
    }

    /// Send an OBD request and parse the headers-off response.
    async fn query(&self, command: &str) -> ObdResult<Vec<Vec<u8>>> {
        let text = self.send_raw(command, INIT_RETRIES).await?;
        codec::parse_response(command, &text)
    }

    async fn supported_bitmap(&self, base: u8) -> ObdResult<Vec<ParameterRequest>> {
        let request = ParameterRequest::current(base);
        let frames = self.query(&codec::encode_request(request)).await?;
        let mut split = codec::split_parameters(&frames, &[request]);
        let bytes = split
            .remove(&request)
            .unwrap_or_else(|| Err(ObdError::NoData(request.to_string())))?;
        codec::decode_supported_pids(base, &bytes)
    }

    /// Probe the vehicle and walk the supported-PID bitmap chain.
    async fn supported_pids(&self) -> ObdResult<Vec<ParameterRequest>> {
        let mut supported = match self.supported_bitmap(0x00).await {
            Ok(pids) => pids,
            Err(ObdError::NoData(_)) => return Err(ObdError::VehicleNotResponding),
            Err(e) => return Err(e),
        };

        let mut base = 0x20u8;
        while base <= LAST_BITMAP_BASE && supported.contains(&ParameterRequest::current(base)) {
            match self.supported_bitmap(base).await {
                Ok(more) => supported.extend(more),
                Err(e) if e.is_recoverable() => break,
                Err(e) => return Err(e),
            }
            base += 0x20;
        }

        supported.retain(|p| p.pid % 0x20 != 0);
        Ok(supported)
    }

    async fn describe_protocol(&self) -> ObdResult<Option<String>> {
        let text = self.send_raw(AT_DESCRIBE_PROTOCOL, INIT_RETRIES).await?;
        Ok(codec::response_lines(AT_DESCRIBE_PROTOCOL, &text)
            .into_iter()
            .next()
            .map(|line| line.trim_start_matches("AUTO, ").to_string()))
    }

    async fn read_vin(&self) -> ObdResult<String> {
        let command = format!("{MODE_VEHICLE_INFO:02X}{PID_VIN:02X}");
        let frames = self.query(&command).await?;
        codec::decode_vin(&frames)
    }

    /// CAN ID width from `ATDPN`; `None` when the protocol is not CAN.
    async fn can_addressing(&self) -> ObdResult<Option<CanAddressing>> {
        let text = self.send_raw(AT_DESCRIBE_PROTOCOL_NUMBER, INIT_RETRIES).await?;
        let reply = codec::response_lines(AT_DESCRIBE_PROTOCOL_NUMBER, &text)
            .into_iter()
            .next()
            .unwrap_or_default();
        let addressing = CanAddressing::from_protocol_number(&reply);
        tracing::debug!(protocol = %reply, ?addressing, "protocol number");
        Ok(addressing)
    }

    /// Mode 03 with headers on, grouped by responding ECU.
    async fn read_stored_codes(
        &self,
        addressing: CanAddressing,
    ) -> ObdResult<HashMap<String, Vec<RawTroubleCode>>> {
        let command = format!("{MODE_STORED_DTCS:02X}");
        let text = self.send_raw(&command, INIT_RETRIES).await?;
        let frames = match codec::parse_headed_response(&command, &text, addressing) {
            Ok(frames) => frames,
            Err(ObdError::NoData(_)) => return Ok(HashMap::new()),
            Err(e) => return Err(e),
        };

        let mut by_ecu: HashMap<String, Vec<RawTroubleCode>> = HashMap::new();
        for frame in frames {
            if !codec::is_obd_response_id(frame.id) {
                continue;
            }
            let codes = codec::decode_dtc_payload(&frame.payload)?;
            by_ecu
                .entry(codec::ecu_name(frame.id))
                .or_default()
                .extend(codes.into_iter().map(RawTroubleCode::new));
        }
        Ok(by_ecu)
    }

    /// Mode 03 with headers off. Responders cannot be told apart, so every
    /// code is attributed to the engine ECU.
    async fn read_stored_codes_unheaded(&self) -> ObdResult<HashMap<String, Vec<RawTroubleCode>>> {
        let command = format!("{MODE_STORED_DTCS:02X}");
        let text = self.send_raw(&command, INIT_RETRIES).await?;
        let frames = match codec::parse_response(&command, &text) {
            Ok(frames) => frames,
            Err(ObdError::NoData(_)) => return Ok(HashMap::new()),
            Err(e) => return Err(e),
        };

        let mut codes = Vec::new();
        for frame in &frames {
            codes.extend(codec::decode_dtc_payload(frame)?.into_iter().map(RawTroubleCode::new));
        }
        Ok(HashMap::from([(codec::ecu_name(OBD_RESPONSE_ID_MIN), codes)]))
    }
}

#[async_trait]
impl Transport for ElmTransport {
    fn kind(&self) -> TransportKind {
        self.connector.kind()
    }

    async fn scan(&self) -> ObdResult<Vec<DeviceHandle>> {
        self.connector.discover().await.map_err(|e| match e {
            ObdError::ScanFailed(_) | ObdError::AdapterNotFound => e,
            other => ObdError::ScanFailed(other.to_string()),
        })
    }

    async fn connect(
        &self,
        device: Option<DeviceHandle>,
        timeout: Duration,
        progress: ConnectProgress<'_>,
    ) -> ObdResult<SessionInfo> {
        let device = device
            .or_else(|| self.connector.default_device())
            .ok_or(ObdError::AdapterNotFound)?;

        let link = self.connector.open(&device, timeout).await?;
        *self.link.lock().await = Some(Channel::new(link));
        *self.addressing.lock().await = None;
        tracing::info!(device = %device.name, id = %device.id, "adapter link open");
        progress(ConnectStage::Initializing);

        let banner = self.send_raw(AT_RESET, INIT_RETRIES).await?;
        tracing::debug!(banner = %codec::response_lines(AT_RESET, &banner).join(" "), "adapter reset");
        for command in [
            AT_ECHO_OFF,
            AT_LINEFEEDS_OFF,
            AT_SPACES_OFF,
            AT_HEADERS_OFF,
            AT_PROTOCOL_AUTO,
        ] {
            self.configure(command).await?;
        }
        progress(ConnectStage::AdapterReady);

        let supported_pids = self.supported_pids().await?;
        let protocol = self.describe_protocol().await?;
        let addressing = self.can_addressing().await?;
        *self.addressing.lock().await = addressing;
        let vin = match self.read_vin().await {
            Ok(vin) => Some(vin),
            Err(e) if e.is_recoverable() => {
                tracing::debug!(error = %e, "VIN not advertised");
                None
            }
            Err(e) => return Err(e),
        };

        Ok(SessionInfo {
            vin,
            protocol,
            supported_pids,
        })
    }

    async fn send_raw(&self, command: &str, retries: u32) -> ObdResult<String> {
        let mut attempt = 0;
        loop {
            match self.exchange(command).await {
                Err(ObdError::Timeout { timeout_ms }) if attempt < retries => {
                    attempt += 1;
                    tracing::debug!(command, attempt, timeout_ms, "retrying after timeout");
                }
                result => return result,
            }
        }
    }

    async fn request_parameters(
        &self,
        requests: &[ParameterRequest],
        units: UnitSystem,
    ) -> ObdResult<ParameterResponses> {
        let mut out = ParameterResponses::new();
        for batch in codec::batch_requests(requests) {
            let command = batch.command();
            let frames = match self.query(&command).await {
                Ok(frames) => frames,
                Err(e) if e.is_recoverable() => {
                    for request in batch.requests {
                        out.insert(request, Err(e.clone()));
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };
            for (request, bytes) in codec::split_parameters(&frames, &batch.requests) {
                let value = bytes
                    .and_then(|b| codec::decode(request, &b))
                    .map(|m| m.in_units(units));
                out.insert(request, value);
            }
        }
        Ok(out)
    }

    async fn scan_trouble_codes(&self) -> ObdResult<HashMap<String, Vec<RawTroubleCode>>> {
        let addressing = *self.addressing.lock().await;
        let Some(addressing) = addressing else {
            return self.read_stored_codes_unheaded().await;
        };
        self.configure(AT_HEADERS_ON).await?;
        let result = self.read_stored_codes(addressing).await;
        let restored = self.configure(AT_HEADERS_OFF).await;
        let codes = result?;
        restored?;
        Ok(codes)
    }

    async fn clear_trouble_codes(&self) -> ObdResult<()> {
        let command = format!("{MODE_CLEAR_DTCS:02X}");
        let text = self
            .send_raw(&command, INIT_RETRIES)
            .await
            .map_err(|e| ObdError::ClearFailed(e.to_string()))?;
        let frames =
            codec::parse_response(&command, &text).map_err(|e| ObdError::ClearFailed(e.to_string()))?;
        let positive = MODE_CLEAR_DTCS + RESPONSE_SID_OFFSET;
        if frames.iter().any(|f| f.first() == Some(&positive)) {
            Ok(())
        } else {
            Err(ObdError::ClearFailed(format!(
                "no positive response (0x{positive:02X})"
            )))
        }
    }

    async fn disconnect(&self) -> ObdResult<()> {
        let channel = self.link.lock().await.take();
        if let Some(mut channel) = channel {
            channel.link.close().await?;
            tracing::info!(kind = %self.kind(), "adapter link closed");
        }
        Ok(())
    }
}

/// Builds `ElmTransport`s: Wi-Fi over TCP, BLE over an injected connector.
pub struct ElmTransportFactory {
    wifi: Arc<dyn LinkConnector>,
    ble: Option<Arc<dyn LinkConnector>>,
    command_timeout: Duration,
}

impl ElmTransportFactory {
    pub fn new(wifi: Arc<dyn LinkConnector>) -> Self {
        Self {
            wifi,
            ble: None,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_ble(mut self, ble: Arc<dyn LinkConnector>) -> Self {
        self.ble = Some(ble);
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }
}

#[async_trait]
impl TransportFactory for ElmTransportFactory {
    async fn create(&self, kind: TransportKind) -> ObdResult<Box<dyn Transport>> {
        let connector = match kind {
            TransportKind::Wifi => Arc::clone(&self.wifi),
            TransportKind::Ble => self.ble.clone().ok_or_else(|| {
                ObdError::TransportConnect("no Bluetooth LE link available on this host".into())
            })?,
        };
        Ok(Box::new(
            ElmTransport::new(connector).with_command_timeout(self.command_timeout),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Answers each command from a table; unknown commands get `?`.
    /// Commands listed in `late` are answered only after that delay.
    struct ScriptedLink {
        script: HashMap<String, String>,
        late: HashMap<String, Duration>,
        pending: VecDeque<u8>,
        ready_at: Instant,
        sent: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl Link for ScriptedLink {
        async fn write_all(&mut self, bytes: &[u8]) -> ObdResult<()> {
            let command = String::from_utf8_lossy(bytes).trim().to_string();
            let reply = self
                .script
                .get(&command)
                .cloned()
                .unwrap_or_else(|| "?\r\r>".to_string());
            let delay = self.late.get(&command).copied().unwrap_or_default();
            self.ready_at = Instant::now() + delay;
            self.sent.lock().unwrap().push(command);
            self.pending.extend(reply.bytes());
            Ok(())
        }

        async fn read_chunk(&mut self, buf: &mut [u8]) -> ObdResult<usize> {
            if self.pending.is_empty() {
                std::future::pending::<()>().await;
            }
            time::sleep_until(self.ready_at).await;
            // Dribble a few bytes at a time like a real serial bridge.
            let n = buf.len().min(self.pending.len()).min(7);
            for slot in buf.iter_mut().take(n) {
                *slot = self.pending.pop_front().unwrap();
            }
            Ok(n)
        }

        async fn close(&mut self) -> ObdResult<()> {
            Ok(())
        }
    }

    struct ScriptedConnector {
        script: HashMap<String, String>,
        late: HashMap<String, Duration>,
        sent: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl LinkConnector for ScriptedConnector {
        fn kind(&self) -> TransportKind {
            TransportKind::Wifi
        }

        fn default_device(&self) -> Option<DeviceHandle> {
            Some(DeviceHandle {
                id: "scripted".into(),
                name: "Scripted ELM327".into(),
                kind: TransportKind::Wifi,
            })
        }

        async fn discover(&self) -> ObdResult<Vec<DeviceHandle>> {
            Ok(self.default_device().into_iter().collect())
        }

        async fn open(&self, _device: &DeviceHandle, _timeout: Duration) -> ObdResult<Box<dyn Link>> {
            Ok(Box::new(ScriptedLink {
                script: self.script.clone(),
                late: self.late.clone(),
                pending: VecDeque::new(),
                ready_at: Instant::now(),
                sent: Arc::clone(&self.sent),
            }))
        }
    }

    fn healthy_script() -> HashMap<String, String> {
        let mut s = HashMap::new();
        s.insert("ATZ".into(), "\r\rELM327 v1.5\r\r>".into());
        for cmd in ["ATE0", "ATL0", "ATS0", "ATH0", "ATH1", "ATSP0", "ATSH7E0", "ATSH7DF", "ATST19"] {
            s.insert(cmd.into(), "OK\r\r>".into());
        }
        s.insert("ATDP".into(), "AUTO, ISO 15765-4 (CAN 11/500)\r\r>".into());
        s.insert("ATDPN".into(), "A6\r\r>".into());
        // 0x0C, 0x0D and the 0x20 bitmap; 0x40 bitmap; then 0x42.
        s.insert("0100".into(), "4100 00180001\r\r>".into());
        s.insert("0120".into(), "4120 00000001\r\r>".into());
        s.insert("0140".into(), "4140 40000000\r\r>".into());
        s.insert(
            "0902".into(),
            "014\r0:490201314847\r1:434D3832363333\r2:41303034333532\r\r>".into(),
        );
        s.insert("010C0D".into(), "410C1AF80D32\r\r>".into());
        s.insert("03".into(), "7E806430203000171\r7E9024300\r\r>".into());
        s.insert("04".into(), "44\r\r>".into());
        s
    }

    fn transport(script: HashMap<String, String>) -> (ElmTransport, Arc<StdMutex<Vec<String>>>) {
        late_transport(script, HashMap::new())
    }

    fn late_transport(
        script: HashMap<String, String>,
        late: HashMap<String, Duration>,
    ) -> (ElmTransport, Arc<StdMutex<Vec<String>>>) {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let connector = ScriptedConnector {
            script,
            late,
            sent: Arc::clone(&sent),
        };
        let transport = ElmTransport::new(Arc::new(connector))
            .with_command_timeout(Duration::from_millis(200));
        (transport, sent)
    }

    async fn connected(script: HashMap<String, String>) -> (ElmTransport, Arc<StdMutex<Vec<String>>>) {
        let (t, sent) = transport(script);
        t.connect(None, Duration::from_secs(1), &|_| {}).await.unwrap();
        (t, sent)
    }

    #[tokio::test]
    async fn connect_negotiates_vehicle() {
        let (t, sent) = transport(healthy_script());
        let stages = StdMutex::new(Vec::new());
        let info = t
            .connect(None, Duration::from_secs(1), &|stage| stages.lock().unwrap().push(stage))
            .await
            .unwrap();

        assert_eq!(info.vin.as_deref(), Some("1HGCM82633A004352"));
        assert_eq!(info.protocol.as_deref(), Some("ISO 15765-4 (CAN 11/500)"));
        assert_eq!(
            info.supported_pids,
            vec![
                ParameterRequest::ENGINE_RPM,
                ParameterRequest::VEHICLE_SPEED,
                ParameterRequest::CONTROL_MODULE_VOLTAGE
            ]
        );
        assert_eq!(
            *stages.lock().unwrap(),
            vec![ConnectStage::Initializing, ConnectStage::AdapterReady]
        );
        let sent = sent.lock().unwrap();
        assert_eq!(&sent[..6], ["ATZ", "ATE0", "ATL0", "ATS0", "ATH0", "ATSP0"]);
    }

    #[tokio::test]
    async fn silent_vehicle_is_reported() {
        let mut script = healthy_script();
        script.insert("0100".into(), "SEARCHING...\rUNABLE TO CONNECT\r\r>".into());
        let (t, _) = transport(script);
        let err = t.connect(None, Duration::from_secs(1), &|_| {}).await.unwrap_err();
        assert_eq!(err, ObdError::VehicleNotResponding);
    }

    #[tokio::test]
    async fn no_data_probe_is_vehicle_not_responding() {
        let mut script = healthy_script();
        script.insert("0100".into(), "NO DATA\r\r>".into());
        let (t, _) = transport(script);
        let err = t.connect(None, Duration::from_secs(1), &|_| {}).await.unwrap_err();
        assert_eq!(err, ObdError::VehicleNotResponding);
    }

    #[tokio::test]
    async fn rejected_configuration_names_command() {
        let mut script = healthy_script();
        script.insert("ATSP0".into(), "?\r\r>".into());
        let (t, _) = transport(script);
        let err = t.connect(None, Duration::from_secs(1), &|_| {}).await.unwrap_err();
        assert!(matches!(err, ObdError::CommandFailed { ref command, .. } if command == "ATSP0"));
    }

    #[tokio::test]
    async fn missing_vin_is_not_fatal() {
        let mut script = healthy_script();
        script.insert("0902".into(), "NO DATA\r\r>".into());
        let (t, _) = transport(script);
        let info = t.connect(None, Duration::from_secs(1), &|_| {}).await.unwrap();
        assert_eq!(info.vin, None);
        assert!(info.protocol.is_some());
    }

    #[tokio::test]
    async fn send_raw_before_connect_is_link_closed() {
        let (t, _) = transport(healthy_script());
        assert_eq!(t.send_raw("ATZ", 1).await.unwrap_err(), ObdError::LinkClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn send_raw_retries_timeouts() {
        // An empty reply never reaches the prompt.
        let mut script = healthy_script();
        script.insert("ATMA".into(), String::new());
        let (t, sent) = connected(script).await;
        let err = t.send_raw("ATMA", 2).await.unwrap_err();
        assert!(matches!(err, ObdError::Timeout { .. }));
        let attempts = sent.lock().unwrap().iter().filter(|c| *c == "ATMA").count();
        assert_eq!(attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_does_not_answer_next_command() {
        // 0100 answers 300 ms after the 200 ms command timeout starts.
        let late = HashMap::from([("0100".to_string(), Duration::from_millis(300))]);
        let (t, sent) = late_transport(healthy_script(), late);
        // Open the link directly: connect would probe 0100 itself.
        let device = t.connector.default_device().unwrap();
        let link = t.connector.open(&device, Duration::from_secs(1)).await.unwrap();
        *t.link.lock().await = Some(Channel::new(link));

        let err = t.send_raw("0100", 0).await.unwrap_err();
        assert!(matches!(err, ObdError::Timeout { .. }));

        let text = t.send_raw("010C0D", 0).await.unwrap();
        assert_eq!(text, "410C1AF80D32\r\r>");
        assert_eq!(*sent.lock().unwrap(), ["0100", "010C0D"]);
    }

    #[tokio::test]
    async fn bytes_after_prompt_are_discarded() {
        let mut script = healthy_script();
        // A chatty clone that repeats its last answer.
        script.insert("ATI".into(), "ELM327 v1.5\r\r>4100 00180001\r\r>".into());
        let (t, _) = connected(script).await;

        let banner = t.send_raw("ATI", 0).await.unwrap();
        assert_eq!(banner, "ELM327 v1.5\r\r>");
        let text = t.send_raw("010C0D", 0).await.unwrap();
        assert_eq!(text, "410C1AF80D32\r\r>");
    }

    #[tokio::test]
    async fn batched_parameters_decode() {
        let (t, _) = connected(healthy_script()).await;
        let out = t
            .request_parameters(
                &[ParameterRequest::ENGINE_RPM, ParameterRequest::VEHICLE_SPEED],
                UnitSystem::Metric,
            )
            .await
            .unwrap();
        let rpm = out[&ParameterRequest::ENGINE_RPM].as_ref().unwrap();
        assert!((rpm.value - 1726.0).abs() < 0.01);
        let speed = out[&ParameterRequest::VEHICLE_SPEED].as_ref().unwrap();
        assert!((speed.value - 50.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn imperial_units_convert() {
        let (t, _) = connected(healthy_script()).await;
        let out = t
            .request_parameters(
                &[ParameterRequest::ENGINE_RPM, ParameterRequest::VEHICLE_SPEED],
                UnitSystem::Imperial,
            )
            .await
            .unwrap();
        let speed = out[&ParameterRequest::VEHICLE_SPEED].as_ref().unwrap();
        assert_eq!(speed.unit, "mph");
    }

    #[tokio::test]
    async fn no_data_batch_is_per_field() {
        let mut script = healthy_script();
        script.insert("010C0D".into(), "NO DATA\r\r>".into());
        let (t, _) = connected(script).await;
        let out = t
            .request_parameters(
                &[ParameterRequest::ENGINE_RPM, ParameterRequest::VEHICLE_SPEED],
                UnitSystem::Metric,
            )
            .await
            .unwrap();
        assert!(matches!(out[&ParameterRequest::ENGINE_RPM], Err(ObdError::NoData(_))));
        assert!(matches!(out[&ParameterRequest::VEHICLE_SPEED], Err(ObdError::NoData(_))));
    }

    #[tokio::test]
    async fn trouble_codes_by_ecu_and_headers_restored() {
        let (t, sent) = connected(healthy_script()).await;
        let codes = t.scan_trouble_codes().await.unwrap();
        assert_eq!(
            codes["Engine"],
            vec![RawTroubleCode::new("P0300"), RawTroubleCode::new("P0171")]
        );
        assert!(codes["Transmission"].is_empty());

        let sent = sent.lock().unwrap();
        let tail: Vec<&str> = sent.iter().rev().take(3).map(String::as_str).collect();
        assert_eq!(tail, vec!["ATH0", "03", "ATH1"]);
    }

    #[tokio::test]
    async fn trouble_codes_on_29bit_can() {
        let mut script = healthy_script();
        script.insert("ATDPN".into(), "A7\r\r>".into());
        script.insert("03".into(), "18DAF11006430203000171\r18DAF118024300\r\r>".into());
        let (t, _) = connected(script).await;

        let codes = t.scan_trouble_codes().await.unwrap();
        assert_eq!(
            codes["Engine"],
            vec![RawTroubleCode::new("P0300"), RawTroubleCode::new("P0171")]
        );
        assert!(codes["Transmission"].is_empty());
    }

    #[tokio::test]
    async fn trouble_codes_on_legacy_protocol_scan_headers_off() {
        let mut script = healthy_script();
        script.insert("ATDP".into(), "AUTO, ISO 9141-2\r\r>".into());
        script.insert("ATDPN".into(), "A3\r\r>".into());
        // Two responders, three code slots per line.
        script.insert("03".into(), "43017103000000\r43042000000000\r\r>".into());
        let (t, sent) = connected(script).await;

        let codes = t.scan_trouble_codes().await.unwrap();
        assert_eq!(codes.len(), 1);
        assert_eq!(
            codes["Engine"],
            vec![
                RawTroubleCode::new("P0171"),
                RawTroubleCode::new("P0300"),
                RawTroubleCode::new("P0420")
            ]
        );
        assert!(!sent.lock().unwrap().iter().any(|c| c == "ATH1"));
    }

    #[tokio::test]
    async fn unknown_protocol_number_scans_headers_off() {
        let mut script = healthy_script();
        script.remove("ATDPN");
        script.insert("03".into(), "430203000171\r\r>".into());
        let (t, sent) = connected(script).await;

        let codes = t.scan_trouble_codes().await.unwrap();
        assert_eq!(
            codes["Engine"],
            vec![RawTroubleCode::new("P0300"), RawTroubleCode::new("P0171")]
        );
        assert_eq!(sent.lock().unwrap().last().map(String::as_str), Some("03"));
    }

    #[tokio::test]
    async fn no_stored_codes() {
        let mut script = healthy_script();
        script.insert("03".into(), "NO DATA\r\r>".into());
        let (t, _) = connected(script).await;
        assert!(t.scan_trouble_codes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clear_codes() {
        let (t, _) = connected(healthy_script()).await;
        t.clear_trouble_codes().await.unwrap();
    }

    #[tokio::test]
    async fn clear_refused() {
        let mut script = healthy_script();
        script.insert("04".into(), "7F0422\r\r>".into());
        let (t, _) = connected(script).await;
        assert!(matches!(
            t.clear_trouble_codes().await.unwrap_err(),
            ObdError::ClearFailed(_)
        ));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (t, _) = connected(healthy_script()).await;
        t.disconnect().await.unwrap();
        t.disconnect().await.unwrap();
        assert_eq!(t.send_raw("ATZ", 0).await.unwrap_err(), ObdError::LinkClosed);
    }

    #[tokio::test]
    async fn factory_without_ble_refuses() {
        let factory = ElmTransportFactory::new(Arc::new(TcpConnector::default()));
        let err = factory.create(TransportKind::Ble).await.err().unwrap();
        assert!(matches!(err, ObdError::TransportConnect(_)));
        let wifi = factory.create(TransportKind::Wifi).await.unwrap();
        assert_eq!(wifi.kind(), TransportKind::Wifi);
    }
}
