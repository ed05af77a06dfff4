//! Observable session state.
//!
//! Each observable lives in its own `watch` channel. The session manager
//! and its background tasks are the only writers; any number of observers
//! hold receivers and see the latest value.

use tokio::sync::watch;

use rl_protocol::{ConnectionState, LiveTelemetry, TroubleCode, VehicleInfo};

pub struct Published {
    state: watch::Sender<ConnectionState>,
    telemetry: watch::Sender<LiveTelemetry>,
    codes: watch::Sender<Vec<TroubleCode>>,
    vehicle: watch::Sender<VehicleInfo>,
    polling: watch::Sender<bool>,
    demo: watch::Sender<bool>,
}

impl Published {
    pub fn new() -> Self {
        Self {
            state: watch::channel(ConnectionState::Disconnected).0,
            telemetry: watch::channel(LiveTelemetry::default()).0,
            codes: watch::channel(Vec::new()).0,
            vehicle: watch::channel(VehicleInfo::default()).0,
            polling: watch::channel(false).0,
            demo: watch::channel(false).0,
        }
    }

    // ── Writers ─────────────────────────────────────────────────

    pub fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next.clone());
        if prev != next {
            match &next {
                ConnectionState::Error(message) => {
                    tracing::warn!(from = %prev, error = %message, "connection state changed")
                }
                _ => tracing::info!(from = %prev, to = %next, "connection state changed"),
            }
        }
    }

    pub fn update_telemetry(&self, f: impl FnOnce(&mut LiveTelemetry)) {
        self.telemetry.send_modify(f);
    }

    pub fn set_telemetry(&self, telemetry: LiveTelemetry) {
        self.telemetry.send_replace(telemetry);
    }

    /// Replace the whole trouble-code list.
    pub fn set_trouble_codes(&self, codes: Vec<TroubleCode>) {
        self.codes.send_replace(codes);
    }

    pub fn set_vehicle(&self, vehicle: VehicleInfo) {
        self.vehicle.send_replace(vehicle);
    }

    pub fn update_vehicle(&self, f: impl FnOnce(&mut VehicleInfo)) {
        self.vehicle.send_modify(f);
    }

    pub fn set_polling(&self, polling: bool) {
        self.polling.send_if_modified(|current| {
            let changed = *current != polling;
            *current = polling;
            changed
        });
    }

    pub fn set_demo(&self, demo: bool) {
        self.demo.send_replace(demo);
    }

    /// Clear every session-derived value and return to `Disconnected`.
    pub fn reset_session(&self) {
        self.end_session(ConnectionState::Disconnected);
    }

    /// Clear every session-derived value and settle on `next`.
    pub fn end_session(&self, next: ConnectionState) {
        self.set_polling(false);
        self.telemetry.send_replace(LiveTelemetry::default());
        self.codes.send_replace(Vec::new());
        self.vehicle.send_replace(VehicleInfo::default());
        self.set_state(next);
    }

    // ── Readers ─────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn telemetry(&self) -> LiveTelemetry {
        self.telemetry.borrow().clone()
    }

    pub fn trouble_codes(&self) -> Vec<TroubleCode> {
        self.codes.borrow().clone()
    }

    pub fn vehicle(&self) -> VehicleInfo {
        self.vehicle.borrow().clone()
    }

    pub fn is_polling(&self) -> bool {
        *self.polling.borrow()
    }

    pub fn is_demo(&self) -> bool {
        *self.demo.borrow()
    }

    // ── Subscriptions ───────────────────────────────────────────

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn subscribe_telemetry(&self) -> watch::Receiver<LiveTelemetry> {
        self.telemetry.subscribe()
    }

    pub fn subscribe_trouble_codes(&self) -> watch::Receiver<Vec<TroubleCode>> {
        self.codes.subscribe()
    }

    pub fn subscribe_vehicle(&self) -> watch::Receiver<VehicleInfo> {
        self.vehicle.subscribe()
    }

    pub fn subscribe_polling(&self) -> watch::Receiver<bool> {
        self.polling.subscribe()
    }

    pub fn subscribe_demo(&self) -> watch::Receiver<bool> {
        self.demo.subscribe()
    }
}

impl Default for Published {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rl_protocol::TelemetryField;

    #[tokio::test]
    async fn subscribers_see_state_changes() {
        let published = Published::new();
        let mut rx = published.subscribe_state();
        published.set_state(ConnectionState::Connecting);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectionState::Connecting);
    }

    #[test]
    fn telemetry_updates_merge() {
        let published = Published::new();
        published.update_telemetry(|t| t.set(TelemetryField::EngineRpm, 900.0));
        published.update_telemetry(|t| t.set(TelemetryField::VehicleSpeed, 12.0));
        let t = published.telemetry();
        assert_eq!(t.engine_rpm, Some(900.0));
        assert_eq!(t.vehicle_speed, Some(12.0));
    }

    #[test]
    fn reset_clears_everything_but_demo() {
        let published = Published::new();
        published.set_demo(true);
        published.set_polling(true);
        published.update_telemetry(|t| t.set(TelemetryField::EngineRpm, 900.0));
        published.update_vehicle(|v| v.vin = Some("1HGCM82633A004352".into()));
        published.set_state(ConnectionState::ConnectedToVehicle);

        published.reset_session();

        assert_eq!(published.state(), ConnectionState::Disconnected);
        assert!(published.telemetry().is_empty());
        assert!(published.vehicle().is_empty());
        assert!(published.trouble_codes().is_empty());
        assert!(!published.is_polling());
        assert!(published.is_demo());
    }

    #[test]
    fn ending_with_error_keeps_the_message() {
        let published = Published::new();
        published.update_vehicle(|v| v.protocol = Some("ISO 15765-4 (CAN 11/500)".into()));
        published.set_state(ConnectionState::ConnectedToVehicle);
        let mut rx = published.subscribe_state();

        published.end_session(ConnectionState::Error("link lost".into()));

        // One transition, straight to the error.
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Error("link lost".into()));
        assert!(published.vehicle().is_empty());
    }

    #[test]
    fn polling_flag_only_notifies_on_change() {
        let published = Published::new();
        let rx = published.subscribe_polling();
        published.set_polling(false);
        assert!(!rx.has_changed().unwrap());
        published.set_polling(true);
        assert!(rx.has_changed().unwrap());
    }
}
