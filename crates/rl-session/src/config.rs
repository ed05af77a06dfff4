//! Session tuning, embeddable in a host's TOML configuration.

use std::time::Duration;

use rl_obd::UnitSystem;
use serde::{Deserialize, Serialize};

/// Timeouts, cadence and unit settings for a `SessionManager`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Upper bound for discovery plus negotiation, in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Pause between poll cycles, in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Slow parameters are requested when `cycle % slow_cycle_every == 0`.
    #[serde(default = "default_slow_cycle_every")]
    pub slow_cycle_every: u64,
    /// Retries for link configuration commands (at least 1).
    #[serde(default = "default_command_retries")]
    pub command_retries: u32,
    #[serde(default)]
    pub units: UnitSystem,
    /// Demo-mode sample interval, in milliseconds.
    #[serde(default = "default_demo_interval")]
    pub demo_interval_ms: u64,
    /// Fixed seed for reproducible demo data. Random when absent.
    #[serde(default)]
    pub demo_seed: Option<u64>,
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_poll_interval() -> u64 {
    50
}

fn default_slow_cycle_every() -> u64 {
    5
}

fn default_command_retries() -> u32 {
    1
}

fn default_demo_interval() -> u64 {
    500
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            poll_interval_ms: default_poll_interval(),
            slow_cycle_every: default_slow_cycle_every(),
            command_retries: default_command_retries(),
            units: UnitSystem::default(),
            demo_interval_ms: default_demo_interval(),
            demo_seed: None,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn demo_interval(&self) -> Duration {
        Duration::from_millis(self.demo_interval_ms.max(1))
    }

    pub fn slow_cycle_every(&self) -> u64 {
        self.slow_cycle_every.max(1)
    }

    pub fn command_retries(&self) -> u32 {
        self.command_retries.max(1)
    }
}
