use serde::{Deserialize, Serialize};

/// A stored Diagnostic Trouble Code as published to observers.
///
/// Immutable once built; a scan replaces the whole list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TroubleCode {
    /// Standard five-character code (e.g., "P0301", "U0100").
    pub code: String,
    /// Human-readable description (adapter text or catalog).
    pub description: String,
    /// Severity classification.
    pub severity: DtcSeverity,
    /// Name of the ECU that reported the code.
    pub ecu: String,
}

impl TroubleCode {
    /// Category derived from the first character of the code.
    pub fn category(&self) -> DtcCategory {
        DtcCategory::from_code(&self.code)
    }
}

/// DTC category based on first character of code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DtcCategory {
    /// P: Powertrain (engine, transmission).
    Powertrain,
    /// C: Chassis (ABS, steering).
    Chassis,
    /// B: Body (airbags, AC, lighting).
    Body,
    /// U: Network/Communication (CAN bus errors).
    Network,
}

impl DtcCategory {
    pub fn from_code(code: &str) -> Self {
        match code.chars().next() {
            Some('C' | 'c') => DtcCategory::Chassis,
            Some('B' | 'b') => DtcCategory::Body,
            Some('U' | 'u') => DtcCategory::Network,
            // SAE J2012 treats anything else as powertrain
            _ => DtcCategory::Powertrain,
        }
    }
}

/// Severity classification of a DTC, ordered `Info < Warning < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DtcSeverity {
    /// Informational: no immediate action needed.
    Info,
    /// Warning: schedule maintenance.
    Warning,
    /// Critical: immediate attention required.
    Critical,
}

impl std::fmt::Display for DtcSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DtcSeverity::Info => f.write_str("info"),
            DtcSeverity::Warning => f.write_str("warning"),
            DtcSeverity::Critical => f.write_str("critical"),
        }
    }
}
