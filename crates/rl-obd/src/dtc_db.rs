//! Static DTC catalog and severity classifier.
//!
//! Descriptions come from a sorted table searched by binary search.
//! Severity is rule-based and never depends on catalog membership or on
//! which ECU reported the code.

use rl_protocol::dtc::DtcSeverity;

/// Catalog entries, sorted by code.
static CATALOG: &[(&str, &str)] = &[
    ("B0100", "Electronic Frontal Sensor 1 Malfunction"),
    ("B0101", "Electronic Frontal Sensor 2 Malfunction"),
    ("B1000", "ECU Malfunction (Internal)"),
    ("B1200", "Climate Control Push Button Circuit"),
    ("B1318", "Battery Voltage Low"),
    ("B1325", "Battery Voltage Out Of Range"),
    ("B1342", "ECU Malfunction"),
    ("B1601", "PATS Received Incorrect Key Code"),
    ("B2799", "Engine Immobilizer System Malfunction"),
    ("C0035", "Left Front Wheel Speed Sensor Circuit"),
    ("C0040", "Right Front Wheel Speed Sensor Circuit"),
    ("C0045", "Left Rear Wheel Speed Sensor Circuit"),
    ("C0050", "Right Rear Wheel Speed Sensor Circuit"),
    ("C0241", "PCM Indicated Requested Torque Malfunction"),
    ("C0242", "PCM Indicated TCS Malfunction"),
    ("C0300", "Rear Speed Sensor Malfunction"),
    ("P0100", "Mass or Volume Air Flow Circuit Malfunction"),
    ("P0101", "Mass or Volume Air Flow Circuit Range/Performance"),
    ("P0102", "Mass or Volume Air Flow Circuit Low Input"),
    ("P0103", "Mass or Volume Air Flow Circuit High Input"),
    ("P0104", "Mass or Volume Air Flow Circuit Intermittent"),
    ("P0110", "Intake Air Temperature Circuit Malfunction"),
    ("P0115", "Engine Coolant Temperature Circuit Malfunction"),
    ("P0116", "Engine Coolant Temperature Circuit Range/Performance"),
    ("P0117", "Engine Coolant Temperature Circuit Low Input"),
    ("P0118", "Engine Coolant Temperature Circuit High Input"),
    ("P0120", "Throttle Position Sensor Circuit Malfunction"),
    ("P0121", "Throttle Position Sensor Circuit Range/Performance"),
    ("P0122", "Throttle Position Sensor Circuit Low Input"),
    ("P0123", "Throttle Position Sensor Circuit High Input"),
    ("P0130", "O2 Sensor Circuit Malfunction (Bank 1, Sensor 1)"),
    ("P0131", "O2 Sensor Circuit Low Voltage (Bank 1, Sensor 1)"),
    ("P0133", "O2 Sensor Circuit Slow Response (Bank 1, Sensor 1)"),
    ("P0135", "O2 Sensor Heater Circuit Malfunction (Bank 1, Sensor 1)"),
    ("P0141", "O2 Sensor Heater Circuit Malfunction (Bank 1, Sensor 2)"),
    ("P0150", "O2 Sensor Circuit Malfunction (Bank 2, Sensor 1)"),
    ("P0170", "Fuel Trim Malfunction (Bank 1)"),
    ("P0171", "System Too Lean (Bank 1)"),
    ("P0172", "System Too Rich (Bank 1)"),
    ("P0174", "System Too Lean (Bank 2)"),
    ("P0175", "System Too Rich (Bank 2)"),
    ("P0217", "Engine Overtemperature Condition"),
    ("P0219", "Engine Overspeed Condition"),
    ("P0300", "Random/Multiple Cylinder Misfire Detected"),
    ("P0301", "Cylinder 1 Misfire Detected"),
    ("P0302", "Cylinder 2 Misfire Detected"),
    ("P0303", "Cylinder 3 Misfire Detected"),
    ("P0304", "Cylinder 4 Misfire Detected"),
    ("P0305", "Cylinder 5 Misfire Detected"),
    ("P0306", "Cylinder 6 Misfire Detected"),
    ("P0307", "Cylinder 7 Misfire Detected"),
    ("P0308", "Cylinder 8 Misfire Detected"),
    ("P0335", "Crankshaft Position Sensor A Circuit Malfunction"),
    ("P0336", "Crankshaft Position Sensor A Circuit Range/Performance"),
    ("P0340", "Camshaft Position Sensor Circuit Malfunction"),
    ("P0400", "Exhaust Gas Recirculation Flow Malfunction"),
    ("P0401", "Exhaust Gas Recirculation Flow Insufficient Detected"),
    ("P0420", "Catalyst System Efficiency Below Threshold (Bank 1)"),
    ("P0421", "Warm Up Catalyst Efficiency Below Threshold (Bank 1)"),
    ("P0430", "Catalyst System Efficiency Below Threshold (Bank 2)"),
    ("P0440", "Evaporative Emission Control System Malfunction"),
    ("P0441", "Evaporative Emission Control System Incorrect Purge Flow"),
    ("P0442", "Evaporative Emission Control System Leak Detected (small leak)"),
    ("P0443", "Evaporative Emission Control System Purge Control Valve Circuit"),
    ("P0446", "Evaporative Emission Control System Vent Control Circuit"),
    ("P0455", "Evaporative Emission Control System Leak Detected (large leak)"),
    ("P0500", "Vehicle Speed Sensor Malfunction"),
    ("P0505", "Idle Control System Malfunction"),
    ("P0506", "Idle Control System RPM Lower Than Expected"),
    ("P0507", "Idle Control System RPM Higher Than Expected"),
    ("P0562", "System Voltage Low"),
    ("P0700", "Transmission Control System Malfunction"),
    ("P0705", "Transmission Range Sensor Circuit Malfunction"),
    ("P0715", "Input/Turbine Speed Sensor Circuit Malfunction"),
    ("P0720", "Output Speed Sensor Circuit Malfunction"),
    ("P0730", "Incorrect Gear Ratio"),
    ("P0740", "Torque Converter Clutch Circuit Malfunction"),
    ("P0750", "Shift Solenoid A Malfunction"),
    ("P0755", "Shift Solenoid B Malfunction"),
    ("U0001", "High Speed CAN Communication Bus"),
    ("U0073", "Control Module Communication Bus Off"),
    ("U0100", "Lost Communication With ECM/PCM"),
    ("U0101", "Lost Communication With TCM"),
    ("U0121", "Lost Communication With ABS"),
    ("U0140", "Lost Communication With Body Control Module"),
    ("U0155", "Lost Communication With Instrument Panel Cluster"),
    ("U0164", "Lost Communication With HVAC"),
    ("U0401", "Invalid Data Received From ECM/PCM"),
];

/// Fallback description when neither adapter nor catalog knows the code.
pub const UNKNOWN_DESCRIPTION: &str = "Unknown trouble code";

// ── Severity rules ──────────────────────────────────────────────

/// Misfire (`30`) and catalyst (`42`, `43`) families.
const CRITICAL_FAMILIES: &[&str] = &["30", "42", "43"];

/// Oxygen sensor circuits (`13`–`16`) and evaporative emissions (`44`–`46`).
const INFO_FAMILIES: &[&str] = &["13", "14", "15", "16", "44", "45", "46"];

/// Individual codes that are critical regardless of family.
const CRITICAL_CODES: &[&str] = &[
    "P0100", "P0101", "P0102", "P0103", "P0104", // mass air flow
    "P0171", "P0172", "P0174", "P0175", // fuel trim lean/rich
    "P0217", "P0219", // over-temperature, over-speed
    "P0300", "P0301", "P0302", "P0303", "P0304", "P0305", "P0306", "P0307", "P0308",
    "P0309", "P0310", "P0311", "P0312", // misfire
    "P0420", "P0430", // catalyst efficiency
];

/// Look up a catalog description. Case-insensitive.
pub fn lookup(code: &str) -> Option<&'static str> {
    let code = code.trim().to_ascii_uppercase();
    CATALOG
        .binary_search_by(|(entry, _)| (*entry).cmp(code.as_str()))
        .ok()
        .map(|idx| CATALOG[idx].1)
}

/// Two-digit family of a code: the characters after the system letter and
/// the generic/manufacturer digit (`P0301` → `30`).
fn family(code: &str) -> Option<&str> {
    code.get(2..4)
}

/// Classify a code's severity.
pub fn classify(code: &str) -> DtcSeverity {
    let code = code.trim().to_ascii_uppercase();
    let powertrain = code.starts_with('P');
    let family = family(&code).filter(|_| powertrain);

    if family.is_some_and(|f| CRITICAL_FAMILIES.contains(&f)) {
        return DtcSeverity::Critical;
    }
    if CRITICAL_CODES.contains(&code.as_str()) {
        return DtcSeverity::Critical;
    }
    if family.is_some_and(|f| INFO_FAMILIES.contains(&f)) {
        return DtcSeverity::Info;
    }
    if code.starts_with('B') || code.starts_with('U') {
        return DtcSeverity::Info;
    }
    DtcSeverity::Warning
}

/// Description for a code: adapter text when non-empty, then catalog,
/// then [`UNKNOWN_DESCRIPTION`].
pub fn describe(code: &str, adapter_text: Option<&str>) -> String {
    match adapter_text.map(str::trim) {
        Some(text) if !text.is_empty() => text.to_string(),
        _ => lookup(code).unwrap_or(UNKNOWN_DESCRIPTION).to_string(),
    }
}
