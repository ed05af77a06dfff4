//! Agent configuration, loadable from TOML.

use std::time::Duration;

use serde::Deserialize;

use rl_obd::elm::{TcpConnector, DEFAULT_COMMAND_TIMEOUT};
use rl_protocol::TransportKind;
use rl_session::SessionConfig;

/// Top-level configuration for the diagnostic agent.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Link to the adapter. Only Wi-Fi has a built-in link on this host.
    #[serde(default = "default_transport")]
    pub transport: TransportKind,
    /// `host:port` of the Wi-Fi adapter.
    #[serde(default = "default_wifi_addr")]
    pub wifi_addr: String,
    /// Run against the simulator instead of an adapter.
    #[serde(default)]
    pub demo: bool,
    /// Start polling as soon as the vehicle is connected.
    #[serde(default = "default_true")]
    pub auto_poll: bool,
    /// Read trouble codes (and the VIN) once after connecting.
    #[serde(default = "default_true")]
    pub read_codes_on_connect: bool,
    /// Telemetry snapshot log interval in seconds.
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
    /// Per-command response timeout of the ELM327 link, in milliseconds.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
    /// Session manager tuning.
    #[serde(default)]
    pub session: SessionConfig,
}

fn default_transport() -> TransportKind {
    TransportKind::Wifi
}

fn default_wifi_addr() -> String {
    TcpConnector::DEFAULT_ADDR.to_string()
}

fn default_true() -> bool {
    true
}

fn default_report_interval() -> u64 {
    5
}

fn default_command_timeout() -> u64 {
    DEFAULT_COMMAND_TIMEOUT.as_millis() as u64
}

impl AgentConfig {
    /// Load config from a TOML file path.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs.max(1))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms.max(1))
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            wifi_addr: default_wifi_addr(),
            demo: false,
            auto_poll: true,
            read_codes_on_connect: true,
            report_interval_secs: default_report_interval(),
            command_timeout_ms: default_command_timeout(),
            session: SessionConfig::default(),
        }
    }
}
