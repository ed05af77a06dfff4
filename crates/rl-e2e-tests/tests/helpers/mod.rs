//! Shared test harness for E2E integration tests.
//!
//! Wires a `SessionManager` to either the scripted `MockTransportFactory`
//! or a real `ElmTransportFactory` talking to an in-process ELM327
//! emulator over TCP.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use rl_obd::elm::{ElmTransportFactory, TcpConnector};
use rl_obd::mock::{MockJournal, MockScript, MockTransportFactory};
use rl_protocol::ConnectionState;
use rl_session::{SessionConfig, SessionManager};

/// Session settings with a fixed demo seed.
pub fn test_config() -> SessionConfig {
    SessionConfig {
        demo_seed: Some(42),
        ..Default::default()
    }
}

/// Session manager over scripted mock transports.
pub struct MockHarness {
    pub manager: Arc<SessionManager>,
    pub factory: Arc<MockTransportFactory>,
}

impl MockHarness {
    pub fn new(script: MockScript) -> Self {
        Self::with_config(script, test_config())
    }

    pub fn with_config(script: MockScript, config: SessionConfig) -> Self {
        let factory = Arc::new(MockTransportFactory::new(script));
        let manager = Arc::new(SessionManager::new(factory.clone(), config));
        Self { manager, factory }
    }

    pub fn healthy() -> Self {
        Self::new(MockScript::healthy())
    }

    pub fn journal(&self) -> MockJournal {
        self.factory.journal()
    }
}

/// Wait until the published state satisfies `pred`, or panic after `limit`.
pub async fn wait_for_state(
    rx: &mut watch::Receiver<ConnectionState>,
    limit: Duration,
    pred: impl Fn(&ConnectionState) -> bool,
) -> ConnectionState {
    let reached = tokio::time::timeout(limit, rx.wait_for(|s| pred(s)))
        .await
        .map(|r| r.map(|state| state.clone()));
    match reached {
        Ok(Ok(state)) => state,
        Ok(Err(_)) => panic!("state channel closed"),
        Err(_) => panic!("state not reached within {limit:?}; last: {}", *rx.borrow()),
    }
}

// ── ELM327 emulator ─────────────────────────────────────────────

/// Mode 01 data bytes (hex) per PID for the emulated vehicle.
pub fn default_pid_data() -> HashMap<u8, String> {
    HashMap::from([
        (0x0C, "1AF8".to_string()), // 1726 rpm
        (0x0D, "32".to_string()),   // 50 km/h
        (0x42, "3A98".to_string()), // 15.0 V
    ])
}

/// Exact-match replies; everything else falls through to generic handling.
pub fn default_replies() -> HashMap<String, String> {
    HashMap::from([
        ("ATZ".to_string(), "\r\rELM327 v1.5\r\r>".to_string()),
        ("ATDP".to_string(), "AUTO, ISO 15765-4 (CAN 11/500)\r\r>".to_string()),
        ("ATDPN".to_string(), "A6\r\r>".to_string()),
        // 0C, 0D and the 20 bitmap; 40 bitmap; 42.
        ("0100".to_string(), "4100 00180001\r\r>".to_string()),
        ("0120".to_string(), "4120 00000001\r\r>".to_string()),
        ("0140".to_string(), "4140 40000000\r\r>".to_string()),
        (
            "0902".to_string(),
            "014\r0:490201314847\r1:434D3832363333\r2:41303034333532\r\r>".to_string(),
        ),
        ("03".to_string(), "7E806430203000171\r7E9024300\r\r>".to_string()),
        ("04".to_string(), "44\r\r>".to_string()),
    ])
}

/// Emulated Wi-Fi ELM327 adapter listening on a loopback port.
pub struct ElmServer {
    pub addr: String,
    commands: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl ElmServer {
    pub async fn start() -> Self {
        Self::with_script(default_replies(), default_pid_data()).await
    }

    pub async fn with_script(replies: HashMap<String, String>, pids: HashMap<u8, String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let commands = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&commands);
        let replies = Arc::new(replies);
        let pids = Arc::new(pids);

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let log = Arc::clone(&log);
                let replies = Arc::clone(&replies);
                let pids = Arc::clone(&pids);
                tokio::spawn(serve(stream, log, replies, pids));
            }
        });

        Self {
            addr,
            commands,
            task,
        }
    }

    /// Session manager whose Wi-Fi transport points at this emulator.
    pub fn manager(&self, config: SessionConfig) -> Arc<SessionManager> {
        let factory = ElmTransportFactory::new(Arc::new(TcpConnector::new(self.addr.clone())))
            .with_command_timeout(Duration::from_millis(500));
        Arc::new(SessionManager::new(Arc::new(factory), config))
    }

    /// Every command received so far, across connections.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.commands().iter().filter(|c| *c == command).count()
    }
}

impl Drop for ElmServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    mut stream: TcpStream,
    log: Arc<Mutex<Vec<String>>>,
    replies: Arc<HashMap<String, String>>,
    pids: Arc<HashMap<u8, String>>,
) {
    let mut pending = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        pending.extend_from_slice(&buf[..n]);
        while let Some(end) = pending.iter().position(|b| *b == b'\r') {
            let line: Vec<u8> = pending.drain(..=end).collect();
            let command = String::from_utf8_lossy(&line).trim().to_uppercase();
            if command.is_empty() {
                continue;
            }
            log.lock().unwrap().push(command.clone());
            let reply = respond(&command, &replies, &pids);
            if stream.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

fn respond(command: &str, replies: &HashMap<String, String>, pids: &HashMap<u8, String>) -> String {
    if let Some(reply) = replies.get(command) {
        return reply.clone();
    }
    if command.starts_with("AT") {
        return "OK\r\r>".to_string();
    }
    if let Some(requested) = command.strip_prefix("01") {
        let mut body = String::from("41");
        let mut answered = false;
        for i in (0..requested.len()).step_by(2) {
            let Ok(pid) = u8::from_str_radix(&requested[i..(i + 2).min(requested.len())], 16) else {
                return "?\r\r>".to_string();
            };
            if let Some(data) = pids.get(&pid) {
                body.push_str(&format!("{pid:02X}{data}"));
                answered = true;
            }
        }
        if answered {
            return format!("{body}\r\r>");
        }
        return "NO DATA\r\r>".to_string();
    }
    "?\r\r>".to_string()
}
