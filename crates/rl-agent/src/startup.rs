//! Session bring-up: connect (or enter demo mode), identify the vehicle,
//! read stored codes, start polling.

use rl_protocol::ConnectionState;
use rl_session::SessionManager;

use crate::config::AgentConfig;

/// Bring the session up as configured.
///
/// Returns the resulting connection state. A failed connect is not an
/// error here: the state already carries a user-facing message.
pub async fn bring_up(manager: &SessionManager, config: &AgentConfig) -> anyhow::Result<ConnectionState> {
    if config.demo {
        manager.start_demo_mode().await;
    } else {
        tracing::info!(transport = %config.transport, "connecting to adapter");
        let state = manager.connect(config.transport).await;
        if let Some(message) = state.error_message() {
            tracing::error!(%message, "connect failed");
            return Ok(state);
        }
    }

    if config.read_codes_on_connect {
        match manager.read_vin().await {
            Ok(Some(vin)) => tracing::info!(%vin, "vehicle identified"),
            Ok(None) => tracing::info!("vehicle does not report a VIN"),
            Err(e) => tracing::warn!(error = %e, "VIN read failed"),
        }
        match manager.read_trouble_codes().await {
            Ok(codes) => {
                for code in &codes {
                    tracing::info!(
                        code = %code.code,
                        severity = %code.severity,
                        ecu = %code.ecu,
                        description = %code.description,
                        "stored trouble code"
                    );
                }
                tracing::info!(count = codes.len(), "trouble code scan complete");
            }
            Err(e) => tracing::warn!(error = %e, "trouble code scan failed"),
        }
    }

    if config.auto_poll && manager.connection_state().is_connected() {
        manager.start_polling().await?;
    }
    Ok(manager.connection_state())
}
