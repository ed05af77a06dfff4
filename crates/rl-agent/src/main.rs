//! Revline agent: headless OBD-II diagnostic session.
//!
//! Connects to one adapter (or the simulator), logs the vehicle's stored
//! codes, and polls live telemetry until interrupted.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use rl_agent::config::AgentConfig;
use rl_agent::{reporter, startup};
use rl_obd::elm::{ElmTransportFactory, TcpConnector};
use rl_session::SessionManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rl-agent starting");

    // ── Load config ─────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/revline/agent.toml".to_string());

    let config = AgentConfig::from_file(&config_path)?;
    tracing::info!(
        transport = %config.transport,
        wifi_addr = %config.wifi_addr,
        demo = config.demo,
        "config loaded"
    );

    // ── Session manager ─────────────────────────────────────────
    let factory = ElmTransportFactory::new(Arc::new(TcpConnector::new(config.wifi_addr.clone())))
        .with_command_timeout(config.command_timeout());
    let manager = SessionManager::new(Arc::new(factory), config.session.clone());

    let state = startup::bring_up(&manager, &config).await?;
    tracing::info!(state = %state, "rl-agent ready");

    tokio::select! {
        () = reporter::run(&manager, config.report_interval()) => {
            tracing::error!("reporter loop exited unexpectedly");
        }
        // Graceful shutdown on SIGINT/SIGTERM
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    manager.disconnect().await;
    tracing::info!("rl-agent stopped");
    Ok(())
}
