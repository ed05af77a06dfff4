use serde::{Deserialize, Serialize};

use crate::telemetry::TelemetryField;

/// Mode 01: Show current data (live PIDs).
pub const MODE_CURRENT_DATA: u8 = 0x01;

/// A logical measurement request: OBD-II mode + PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParameterRequest {
    pub mode: u8,
    pub pid: u8,
}

impl ParameterRequest {
    pub const ENGINE_LOAD: Self = Self::current(0x04);
    pub const COOLANT_TEMP: Self = Self::current(0x05);
    pub const ENGINE_RPM: Self = Self::current(0x0C);
    pub const VEHICLE_SPEED: Self = Self::current(0x0D);
    pub const INTAKE_AIR_TEMP: Self = Self::current(0x0F);
    /// Absolute throttle position; carries the pedal sensor idle baseline.
    pub const THROTTLE_POSITION: Self = Self::current(0x11);
    pub const FUEL_LEVEL: Self = Self::current(0x2F);
    pub const CONTROL_MODULE_VOLTAGE: Self = Self::current(0x42);
    /// Relative throttle position; already referenced to closed throttle.
    pub const RELATIVE_THROTTLE_POSITION: Self = Self::current(0x45);
    pub const OIL_TEMP: Self = Self::current(0x5C);
    pub const FUEL_RATE: Self = Self::current(0x5E);

    /// A Mode 01 (current data) request for `pid`.
    pub const fn current(pid: u8) -> Self {
        Self {
            mode: MODE_CURRENT_DATA,
            pid,
        }
    }

    /// Telemetry field this request feeds, if any.
    pub fn field(&self) -> Option<TelemetryField> {
        if self.mode != MODE_CURRENT_DATA {
            return None;
        }
        match self.pid {
            0x04 => Some(TelemetryField::EngineLoad),
            0x05 => Some(TelemetryField::CoolantTemp),
            0x0C => Some(TelemetryField::EngineRpm),
            0x0D => Some(TelemetryField::VehicleSpeed),
            0x0F => Some(TelemetryField::IntakeAirTemp),
            0x11 | 0x45 => Some(TelemetryField::ThrottlePosition),
            0x2F => Some(TelemetryField::FuelLevel),
            0x42 => Some(TelemetryField::BatteryVoltage),
            0x5C => Some(TelemetryField::OilTemp),
            0x5E => Some(TelemetryField::FuelRate),
            _ => None,
        }
    }
}

impl std::fmt::Display for ParameterRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02X}{:02X}", self.mode, self.pid)
    }
}

/// Sampled on every poll cycle.
pub const FAST_PARAMETERS: [ParameterRequest; 4] = [
    ParameterRequest::VEHICLE_SPEED,
    ParameterRequest::ENGINE_RPM,
    ParameterRequest::THROTTLE_POSITION,
    ParameterRequest::ENGINE_LOAD,
];

/// Sampled every Nth poll cycle.
pub const SLOW_PARAMETERS: [ParameterRequest; 6] = [
    ParameterRequest::COOLANT_TEMP,
    ParameterRequest::INTAKE_AIR_TEMP,
    ParameterRequest::CONTROL_MODULE_VOLTAGE,
    ParameterRequest::OIL_TEMP,
    ParameterRequest::FUEL_RATE,
    ParameterRequest::FUEL_LEVEL,
];
