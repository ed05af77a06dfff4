//! Demo-mode data source.
//!
//! Satisfies the same observable contract as a real session without any
//! transport: a fixed vehicle identity, a canned trouble-code list, and
//! telemetry that wanders around realistic baselines.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tokio::time;

use rl_obd::{Measurement, RawTroubleCode, UnitSystem};
use rl_protocol::{
    LiveTelemetry, ParameterRequest, SessionId, TroubleCode, VehicleInfo, FAST_PARAMETERS,
    SLOW_PARAMETERS,
};

use crate::codes::build_trouble_codes;
use crate::observe::Published;
use crate::poller::PollerHandle;

pub const DEMO_VIN: &str = "1HGCM82633A004352";
pub const DEMO_PROTOCOL: &str = "ISO 15765-4 (CAN 11/500)";

/// Pull toward the baseline applied each step, as a fraction of the offset.
const REVERSION: f64 = 0.15;

/// Vehicle identity published while in demo mode.
pub fn demo_vehicle() -> VehicleInfo {
    VehicleInfo {
        session_id: Some(SessionId::new()),
        transport: None,
        vin: Some(DEMO_VIN.to_string()),
        protocol: Some(DEMO_PROTOCOL.to_string()),
        supported_pids: FAST_PARAMETERS
            .iter()
            .chain(SLOW_PARAMETERS.iter())
            .copied()
            .collect(),
    }
}

/// Illustrative stored codes across several ECUs.
pub fn demo_trouble_codes() -> Vec<TroubleCode> {
    let mut raw: HashMap<String, Vec<RawTroubleCode>> = HashMap::new();
    for (ecu, code) in [
        ("Engine", "P0301"),
        ("Engine", "P0420"),
        ("Engine", "P0442"),
        ("ABS", "C0241"),
        ("Transmission", "U0100"),
    ] {
        raw.entry(ecu.to_string())
            .or_default()
            .push(RawTroubleCode::new(code));
    }
    build_trouble_codes(raw)
}

struct Channel {
    request: ParameterRequest,
    unit: &'static str,
    baseline: f64,
    step: f64,
    min: f64,
    max: f64,
}

/// Metric baselines: a warm engine idling through light city traffic.
const CHANNELS: [Channel; 10] = [
    Channel { request: ParameterRequest::ENGINE_RPM, unit: "rpm", baseline: 850.0, step: 45.0, min: 650.0, max: 3500.0 },
    Channel { request: ParameterRequest::VEHICLE_SPEED, unit: "km/h", baseline: 35.0, step: 3.0, min: 0.0, max: 130.0 },
    Channel { request: ParameterRequest::COOLANT_TEMP, unit: "°C", baseline: 85.0, step: 0.5, min: 70.0, max: 105.0 },
    Channel { request: ParameterRequest::FUEL_LEVEL, unit: "%", baseline: 62.0, step: 0.1, min: 0.0, max: 100.0 },
    Channel { request: ParameterRequest::ENGINE_LOAD, unit: "%", baseline: 28.0, step: 2.5, min: 5.0, max: 90.0 },
    Channel { request: ParameterRequest::THROTTLE_POSITION, unit: "%", baseline: 12.0, step: 2.0, min: 0.0, max: 100.0 },
    Channel { request: ParameterRequest::INTAKE_AIR_TEMP, unit: "°C", baseline: 24.0, step: 0.4, min: -20.0, max: 60.0 },
    Channel { request: ParameterRequest::CONTROL_MODULE_VOLTAGE, unit: "V", baseline: 14.2, step: 0.05, min: 12.4, max: 14.8 },
    Channel { request: ParameterRequest::OIL_TEMP, unit: "°C", baseline: 92.0, step: 0.4, min: 70.0, max: 130.0 },
    Channel { request: ParameterRequest::FUEL_RATE, unit: "L/h", baseline: 2.4, step: 0.2, min: 0.4, max: 15.0 },
];

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Mean-reverting random walk over every telemetry field.
pub struct Simulator {
    rng: StdRng,
    units: UnitSystem,
    /// Current metric values, indexed like `CHANNELS`.
    values: [f64; CHANNELS.len()],
}

impl Simulator {
    pub fn new(seed: Option<u64>, units: UnitSystem) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            units,
            values: CHANNELS.map(|c| c.baseline),
        }
    }

    /// Advance every channel one step and return the resulting snapshot.
    pub fn next_sample(&mut self, now: DateTime<Utc>) -> LiveTelemetry {
        let mut telemetry = LiveTelemetry::default();
        for (channel, value) in CHANNELS.iter().zip(self.values.iter_mut()) {
            let pull = (channel.baseline - *value) * REVERSION;
            let noise = self.rng.gen_range(-channel.step..=channel.step);
            *value = (*value + pull + noise).clamp(channel.min, channel.max);

            let displayed = Measurement {
                request: channel.request,
                name: "",
                value: *value,
                unit: channel.unit,
            }
            .in_units(self.units);
            if let Some(field) = channel.request.field() {
                telemetry.set(field, round2(displayed.value));
            }
        }
        telemetry.updated_at = Some(now);
        telemetry
    }
}

/// Publish a fresh sample every `interval` until stopped.
pub fn spawn(published: Arc<Published>, mut simulator: Simulator, interval: Duration) -> PollerHandle {
    let (kill_tx, mut kill_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        let mut samples: u64 = 0;
        tracing::info!(interval_ms = interval.as_millis() as u64, "demo telemetry started");
        loop {
            tokio::select! {
                biased;
                changed = kill_rx.changed() => {
                    if changed.is_err() || *kill_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    published.set_telemetry(simulator.next_sample(Utc::now()));
                    samples += 1;
                    tracing::debug!(samples, "demo sample");
                }
            }
        }
        published.set_polling(false);
        tracing::info!(samples, "demo telemetry stopped");
    });
    PollerHandle::new(kill_tx, task)
}
