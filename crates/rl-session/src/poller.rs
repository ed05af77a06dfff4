//! Adaptive telemetry poller.
//!
//! One background task per polling session. It narrows addressing to the
//! engine ECU, then requests the fast parameters every cycle and the slow
//! ones every Nth cycle, merging whatever comes back into `LiveTelemetry`.
//! A `watch` kill switch stops it before the next round trip; broadcast
//! addressing is restored exactly once on the way out. A non-recoverable
//! link error closes the transport and clears the session, leaving only
//! `ConnectionState::Error`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use rl_obd::codec::{self, correct_throttle};
use rl_obd::types::{poll_timeout_command, AT_BROADCAST, AT_PHYSICAL_ENGINE};
use rl_obd::{ObdError, ObdResult, ParameterResponses, UnitSystem};
use rl_protocol::{
    ConnectionState, LiveTelemetry, ParameterRequest, FAST_PARAMETERS, SLOW_PARAMETERS,
};

use crate::link::SerialLink;
use crate::observe::Published;

// ── Schedule ────────────────────────────────────────────────────

/// Which parameters each cycle requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollPlan {
    fast: Vec<ParameterRequest>,
    slow: Vec<ParameterRequest>,
    slow_every: u64,
}

impl PollPlan {
    pub fn standard(slow_every: u64) -> Self {
        Self {
            fast: FAST_PARAMETERS.to_vec(),
            slow: SLOW_PARAMETERS.to_vec(),
            slow_every: slow_every.max(1),
        }
    }

    /// Restrict the standard plan to what the vehicle reported.
    ///
    /// Absolute throttle falls back to relative throttle when only the
    /// latter is supported. An empty or unhelpful report keeps the
    /// standard plan.
    pub fn for_vehicle(supported: &[ParameterRequest], slow_every: u64) -> Self {
        let standard = Self::standard(slow_every);
        if supported.is_empty() {
            return standard;
        }

        let fast: Vec<ParameterRequest> = FAST_PARAMETERS
            .iter()
            .filter_map(|request| {
                if supported.contains(request) {
                    Some(*request)
                } else if *request == ParameterRequest::THROTTLE_POSITION
                    && supported.contains(&ParameterRequest::RELATIVE_THROTTLE_POSITION)
                {
                    Some(ParameterRequest::RELATIVE_THROTTLE_POSITION)
                } else {
                    None
                }
            })
            .collect();
        let slow: Vec<ParameterRequest> = SLOW_PARAMETERS
            .iter()
            .filter(|request| supported.contains(request))
            .copied()
            .collect();

        if fast.is_empty() && slow.is_empty() {
            return standard;
        }
        Self {
            fast,
            slow,
            slow_every: standard.slow_every,
        }
    }

    pub fn is_slow_cycle(&self, cycle: u64) -> bool {
        cycle % self.slow_every == 0
    }

    pub fn requests_for_cycle(&self, cycle: u64) -> Vec<ParameterRequest> {
        let mut requests = self.fast.clone();
        if self.is_slow_cycle(cycle) {
            requests.extend_from_slice(&self.slow);
        }
        requests
    }
}

/// Merge one cycle's responses into `telemetry` and stamp it.
///
/// Failed parameters keep their previous value. Absolute throttle is
/// rescaled from its idle baseline. Returns how many fields were updated.
pub fn merge_responses(
    telemetry: &mut LiveTelemetry,
    responses: &ParameterResponses,
    now: DateTime<Utc>,
) -> usize {
    let mut updated = 0;
    for (request, result) in responses {
        match result {
            Ok(measurement) => {
                let Some(field) = request.field() else {
                    continue;
                };
                let value = if *request == ParameterRequest::THROTTLE_POSITION {
                    correct_throttle(measurement.value)
                } else {
                    measurement.value
                };
                telemetry.set(field, value);
                updated += 1;
            }
            Err(e) => tracing::trace!(parameter = %request, error = %e, "no value this cycle"),
        }
    }
    telemetry.updated_at = Some(now);
    updated
}

// ── Task ────────────────────────────────────────────────────────

/// Running background task plus its kill switch.
pub struct PollerHandle {
    kill: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    pub(crate) fn new(kill: watch::Sender<bool>, task: JoinHandle<()>) -> Self {
        Self { kill, task }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the task and wait until it has exited (cleanup included).
    pub async fn stop(self) {
        self.kill.send_replace(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "poller task ended abnormally");
        }
    }
}

pub struct PollerContext {
    pub link: Arc<SerialLink>,
    pub published: Arc<Published>,
    pub plan: PollPlan,
    pub interval: Duration,
    pub retries: u32,
    pub units: UnitSystem,
}

pub fn spawn(ctx: PollerContext) -> PollerHandle {
    let (kill_tx, kill_rx) = watch::channel(false);
    let task = tokio::spawn(run(ctx, kill_rx));
    PollerHandle::new(kill_tx, task)
}

async fn run(ctx: PollerContext, mut kill: watch::Receiver<bool>) {
    let kind = ctx.link.kind();
    tracing::info!(transport = %kind, "polling started");

    let outcome = poll_loop(&ctx, &mut kill).await;

    if let Err(e) = ctx.link.send_raw(AT_BROADCAST, ctx.retries).await {
        tracing::warn!(error = %e, "failed to restore broadcast addressing");
    }
    ctx.published.set_polling(false);

    match outcome {
        Ok(cycles) => tracing::info!(cycles, "polling stopped"),
        Err(e) => {
            tracing::warn!(error = %e, "polling ended by link failure");
            // A fatal link error ends the session, not just polling.
            if let Err(e) = ctx.link.disconnect().await {
                tracing::debug!(error = %e, "closing failed transport");
            }
            ctx.published
                .end_session(ConnectionState::Error(e.user_message(kind)));
        }
    }
}

fn stop_requested(kill: &watch::Receiver<bool>) -> bool {
    *kill.borrow()
}

async fn configure(ctx: &PollerContext, command: &str) -> ObdResult<()> {
    let text = ctx.link.send_raw(command, ctx.retries).await?;
    let lines = codec::response_lines(command, &text);
    if lines.iter().any(|l| l.eq_ignore_ascii_case("OK")) {
        return Ok(());
    }
    Err(lines
        .iter()
        .find_map(|l| codec::adapter_error(command, l))
        .unwrap_or_else(|| ObdError::CommandFailed {
            command: command.to_string(),
            cause: format!("unexpected reply {:?}", lines.join(" ")),
        }))
}

/// Returns the number of completed cycles when stopped by the kill switch.
async fn poll_loop(ctx: &PollerContext, kill: &mut watch::Receiver<bool>) -> ObdResult<u64> {
    let timeout_command = poll_timeout_command(ctx.link.kind());
    for command in [AT_PHYSICAL_ENGINE, timeout_command.as_str()] {
        if stop_requested(kill) {
            return Ok(0);
        }
        configure(ctx, command).await?;
    }

    let mut ticker = time::interval(ctx.interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cycle: u64 = 0;

    loop {
        tokio::select! {
            biased;
            changed = kill.changed() => {
                if changed.is_err() || stop_requested(kill) {
                    return Ok(cycle);
                }
                continue;
            }
            _ = ticker.tick() => {}
        }
        if stop_requested(kill) {
            return Ok(cycle);
        }

        let requests = ctx.plan.requests_for_cycle(cycle);
        match ctx.link.request_parameters(&requests, ctx.units).await {
            Ok(responses) => {
                let mut updated = 0;
                ctx.published.update_telemetry(|t| {
                    updated = merge_responses(t, &responses, Utc::now());
                });
                tracing::debug!(
                    cycle,
                    slow = ctx.plan.is_slow_cycle(cycle),
                    requested = requests.len(),
                    updated,
                    "poll cycle"
                );
            }
            Err(e) if e.is_recoverable() => {
                tracing::warn!(cycle, error = %e, "poll cycle skipped");
            }
            Err(e) => return Err(e),
        }
        cycle += 1;
    }
}
