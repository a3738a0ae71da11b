//! Background sweeper
//!
//! Expires clients that waited too long for a pairing partner and evicts
//! records that have gone without a connection for too long. Both are
//! optional; with neither configured the task exits immediately.

use crate::state::ServerState;
use std::time::Instant;
use tokio::time::interval;

/// Run one sweep at `now`. Returns (expired waiters, evicted records).
pub fn sweep(state: &ServerState, now: Instant) -> (usize, usize) {
    let settings = state.settings();

    let expired = settings
        .pairing_timeout
        .map(|timeout| state.matcher().expire_waiting(state.registry(), timeout, now))
        .unwrap_or_default();
    for identity in &expired {
        tracing::info!(identity = %identity, "pairing wait expired");
    }

    let evicted = settings
        .idle_record_ttl
        .map(|ttl| state.registry().evict_idle(ttl, now))
        .unwrap_or_default();
    for identity in &evicted {
        // an evicted identity can no longer be waiting for a partner
        state.matcher().on_disconnected(state.registry(), *identity);
    }
    if !evicted.is_empty() {
        tracing::info!("evicted {} idle records", evicted.len());
    }

    (expired.len(), evicted.len())
}

/// Spawn the background cleanup task.
///
/// Returns a handle that can be used to abort the task.
pub fn spawn_cleanup_task(state: ServerState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let settings = state.settings().clone();
        if settings.pairing_timeout.is_none() && settings.idle_record_ttl.is_none() {
            tracing::debug!("Cleanup task disabled");
            return;
        }

        tracing::info!("Cleanup task started (interval: {:?})", settings.sweep_interval);
        let mut timer = interval(settings.sweep_interval);
        loop {
            timer.tick().await;
            sweep(&state, Instant::now());
        }
    })
}
