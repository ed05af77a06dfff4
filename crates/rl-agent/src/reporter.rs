//! Periodic session snapshot logger.
//!
//! Emits one structured `session snapshot` event per interval carrying the
//! connection state and the latest telemetry as JSON, so a headless agent
//! leaves a usable trace in its log sink.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time;

use rl_protocol::{ConnectionState, LiveTelemetry};
use rl_session::SessionManager;

/// What the reporter logs each interval.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub polling: bool,
    pub demo: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vin: Option<String>,
    pub telemetry: LiveTelemetry,
    pub trouble_codes: usize,
    pub timestamp: DateTime<Utc>,
}

impl SessionSnapshot {
    pub fn capture(manager: &SessionManager) -> Self {
        Self {
            state: manager.connection_state(),
            polling: manager.is_polling(),
            demo: manager.is_demo_mode(),
            vin: manager.vin(),
            telemetry: manager.telemetry(),
            trouble_codes: manager.trouble_codes().len(),
            timestamp: Utc::now(),
        }
    }
}

/// Run the snapshot loop, logging at `interval`.
///
/// Runs until the task is cancelled.
pub async fn run(manager: &SessionManager, interval: Duration) {
    let mut ticker = time::interval(interval);
    // Skip the first tick (fires immediately).
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let snapshot = SessionSnapshot::capture(manager);
        match serde_json::to_string(&snapshot.telemetry) {
            Ok(telemetry) => tracing::info!(
                state = %snapshot.state,
                polling = snapshot.polling,
                demo = snapshot.demo,
                trouble_codes = snapshot.trouble_codes,
                telemetry = %telemetry,
                "session snapshot"
            ),
            Err(e) => tracing::warn!(error = %e, "failed to serialize telemetry"),
        }
    }
}
