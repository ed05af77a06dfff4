//! OBD-II constants, AT command strings, and decoded measurement types.

use serde::{Deserialize, Serialize};

use rl_protocol::{ParameterRequest, TransportKind};

// ── OBD-II Modes ────────────────────────────────────────────────

pub use rl_protocol::MODE_CURRENT_DATA;

/// Mode 03: Show stored DTCs.
pub const MODE_STORED_DTCS: u8 = 0x03;

/// Mode 04: Clear DTCs and stored values.
pub const MODE_CLEAR_DTCS: u8 = 0x04;

/// Mode 09: Request vehicle information (VIN, etc.).
pub const MODE_VEHICLE_INFO: u8 = 0x09;

/// Mode 09 PID carrying the VIN.
pub const PID_VIN: u8 = 0x02;

/// Offset added to request mode to get response SID.
pub const RESPONSE_SID_OFFSET: u8 = 0x40;

/// ELM327 accepts at most six PIDs in one Mode 01 request.
pub const MAX_PIDS_PER_REQUEST: usize = 6;

// ── CAN addressing ──────────────────────────────────────────────

/// First OBD-II response CAN ID (ECU #1, engine).
pub const OBD_RESPONSE_ID_MIN: u32 = 0x7E8;

/// Last OBD-II response CAN ID (ECU #8).
pub const OBD_RESPONSE_ID_MAX: u32 = 0x7EF;

/// 29-bit physical response IDs to the tester: `18DAF1xx`, `xx` = ECU.
pub const OBD_EXTENDED_RESPONSE_PREFIX: u32 = 0x18DA_F100;

// ── AT commands ─────────────────────────────────────────────────

/// Physical addressing: send requests to the engine ECU only.
pub const AT_PHYSICAL_ENGINE: &str = "ATSH7E0";

/// Functional (broadcast) addressing: every ECU sees the request.
pub const AT_BROADCAST: &str = "ATSH7DF";

pub const AT_RESET: &str = "ATZ";
pub const AT_ECHO_OFF: &str = "ATE0";
pub const AT_LINEFEEDS_OFF: &str = "ATL0";
pub const AT_SPACES_OFF: &str = "ATS0";
pub const AT_HEADERS_OFF: &str = "ATH0";
pub const AT_HEADERS_ON: &str = "ATH1";
pub const AT_PROTOCOL_AUTO: &str = "ATSP0";
pub const AT_DESCRIBE_PROTOCOL: &str = "ATDP";
pub const AT_DESCRIBE_PROTOCOL_NUMBER: &str = "ATDPN";

/// `ATST` response timeout for polling, in milliseconds.
///
/// BLE adapters forward frames noticeably slower than Wi-Fi ones.
pub fn poll_response_timeout_ms(kind: TransportKind) -> u32 {
    match kind {
        TransportKind::Ble => 100,
        TransportKind::Wifi => 64,
    }
}

/// `ATSTxx` command for the poll response timeout (units of 4 ms).
pub fn poll_timeout_command(kind: TransportKind) -> String {
    let units = (poll_response_timeout_ms(kind) / 4).clamp(1, 0xFF);
    format!("ATST{units:02X}")
}

// ── Units and measurements ──────────────────────────────────────

/// Physical unit system for decoded values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitSystem {
    #[default]
    Metric,
    Imperial,
}

/// A decoded parameter value.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub request: ParameterRequest,
    pub name: &'static str,
    pub value: f64,
    pub unit: &'static str,
}

impl Measurement {
    /// Convert a metric measurement into `units`.
    pub fn in_units(self, units: UnitSystem) -> Self {
        if units == UnitSystem::Metric {
            return self;
        }
        match self.unit {
            "km/h" => Self {
                value: self.value * 0.621_371,
                unit: "mph",
                ..self
            },
            "°C" => Self {
                value: self.value * 9.0 / 5.0 + 32.0,
                unit: "°F",
                ..self
            },
            "L/h" => Self {
                value: self.value * 0.264_172,
                unit: "gal/h",
                ..self
            },
            _ => self,
        }
    }
}
