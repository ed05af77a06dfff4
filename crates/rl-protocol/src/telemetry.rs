use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of live vehicle telemetry.
///
/// Every field is independently optional: `None` means the vehicle or
/// adapter has not reported that value, and must render as "no data",
/// never as zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveTelemetry {
    /// Engine speed in rpm.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_rpm: Option<f64>,
    /// Vehicle speed (km/h or mph depending on unit system).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle_speed: Option<f64>,
    /// Engine coolant temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coolant_temp: Option<f64>,
    /// Fuel tank level in percent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fuel_level: Option<f64>,
    /// Calculated engine load in percent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_load: Option<f64>,
    /// Throttle position in percent (idle baseline removed).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throttle_position: Option<f64>,
    /// Intake air temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intake_air_temp: Option<f64>,
    /// Control module (battery) voltage in volts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_voltage: Option<f64>,
    /// Engine oil temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oil_temp: Option<f64>,
    /// Engine fuel rate (L/h or gal/h).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fuel_rate: Option<f64>,
    /// When the snapshot was last merged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Names one field of [`LiveTelemetry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryField {
    EngineRpm,
    VehicleSpeed,
    CoolantTemp,
    FuelLevel,
    EngineLoad,
    ThrottlePosition,
    IntakeAirTemp,
    BatteryVoltage,
    OilTemp,
    FuelRate,
}

impl TelemetryField {
    pub const ALL: [TelemetryField; 10] = [
        TelemetryField::EngineRpm,
        TelemetryField::VehicleSpeed,
        TelemetryField::CoolantTemp,
        TelemetryField::FuelLevel,
        TelemetryField::EngineLoad,
        TelemetryField::ThrottlePosition,
        TelemetryField::IntakeAirTemp,
        TelemetryField::BatteryVoltage,
        TelemetryField::OilTemp,
        TelemetryField::FuelRate,
    ];
}

impl LiveTelemetry {
    pub fn get(&self, field: TelemetryField) -> Option<f64> {
        match field {
            TelemetryField::EngineRpm => self.engine_rpm,
            TelemetryField::VehicleSpeed => self.vehicle_speed,
            TelemetryField::CoolantTemp => self.coolant_temp,
            TelemetryField::FuelLevel => self.fuel_level,
            TelemetryField::EngineLoad => self.engine_load,
            TelemetryField::ThrottlePosition => self.throttle_position,
            TelemetryField::IntakeAirTemp => self.intake_air_temp,
            TelemetryField::BatteryVoltage => self.battery_voltage,
            TelemetryField::OilTemp => self.oil_temp,
            TelemetryField::FuelRate => self.fuel_rate,
        }
    }

    /// Overwrite a single field. Other fields keep their previous value.
    pub fn set(&mut self, field: TelemetryField, value: f64) {
        let slot = match field {
            TelemetryField::EngineRpm => &mut self.engine_rpm,
            TelemetryField::VehicleSpeed => &mut self.vehicle_speed,
            TelemetryField::CoolantTemp => &mut self.coolant_temp,
            TelemetryField::FuelLevel => &mut self.fuel_level,
            TelemetryField::EngineLoad => &mut self.engine_load,
            TelemetryField::ThrottlePosition => &mut self.throttle_position,
            TelemetryField::IntakeAirTemp => &mut self.intake_air_temp,
            TelemetryField::BatteryVoltage => &mut self.battery_voltage,
            TelemetryField::OilTemp => &mut self.oil_temp,
            TelemetryField::FuelRate => &mut self.fuel_rate,
        };
        *slot = Some(value);
    }

    /// True when no field has ever been reported.
    pub fn is_empty(&self) -> bool {
        TelemetryField::ALL.iter().all(|f| self.get(*f).is_none())
    }
}
