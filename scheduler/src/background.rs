//! Periodic scheduler tasks: validation rounds and the timeout/expiry sweeps.

use crate::state::AppState;
use common::now_secs;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Nodes silent for this many sweep intervals are marked offline.
const STALE_SWEEP_INTERVALS: u64 = 3;

/// Start a validation round every `validation_interval_secs`. Each round
/// closes the previous one, so rounds never overlap.
pub async fn validation_loop(state: Arc<AppState>) {
    let period = Duration::from_secs(state.config.validation_interval_secs.max(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately; give nodes one period to announce.
    interval.tick().await;

    loop {
        interval.tick().await;
        match state.validation.tick().await {
            Ok(Some(round)) => debug!(round = %round.round_id, "Validation tick"),
            Ok(None) => {}
            Err(e) => error!(error = %e, "Validation round failed to start"),
        }
    }
}

/// Force overdue cache tasks to TimedOut, drop expired archives and mark
/// silent nodes offline.
pub async fn sweep_loop(state: Arc<AppState>) {
    let secs = state.config.sweep_interval_secs.max(1);
    let mut interval = tokio::time::interval(Duration::from_secs(secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let now = now_secs();

        let timed_out = state.replication.sweep_timeouts(now).await;
        let expired = match state.replication.remove_expired(now).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(error = %e, "Expiry sweep failed");
                0
            }
        };

        let stale = state.directory.mark_stale(now, secs * STALE_SWEEP_INTERVALS);
        if stale > 0 {
            warn!(count = stale, "Nodes marked offline after missed heartbeats");
        }
        debug!(
            timed_out,
            expired,
            archives = state.replication.record_count(),
            nodes = state.directory.len(),
            "Sweep complete"
        );
    }
}
