//! Builds the published trouble-code list from raw per-ECU scan results.

use std::collections::HashMap;

use rl_obd::RawTroubleCode;
use rl_obd::dtc_db;
use rl_protocol::TroubleCode;

/// Describe, classify and order raw codes: most severe first, then by code
/// and ECU. Duplicate reports of one code by one ECU collapse.
pub fn build_trouble_codes(raw: HashMap<String, Vec<RawTroubleCode>>) -> Vec<TroubleCode> {
    let mut codes: Vec<TroubleCode> = raw
        .into_iter()
        .flat_map(|(ecu, reported)| {
            reported.into_iter().map(move |r| {
                let code = r.code.trim().to_ascii_uppercase();
                TroubleCode {
                    description: dtc_db::describe(&code, r.description.as_deref()),
                    severity: dtc_db::classify(&code),
                    code,
                    ecu: ecu.clone(),
                }
            })
        })
        .collect();

    codes.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| a.code.cmp(&b.code))
            .then_with(|| a.ecu.cmp(&b.ecu))
    });
    codes.dedup_by(|a, b| a.code == b.code && a.ecu == b.ecu);
    codes
}
