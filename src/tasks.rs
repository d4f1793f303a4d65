// src/tasks.rs

//! Background loops: the autosave flusher and the expiry sweeper.
//! Both stop when the shutdown channel flips to `true`.

use std::time::Instant;

use chrono::Utc;
use tokio::{sync::watch, task::JoinHandle, time};

use crate::{
    services::attempts::{flush_attempt, persist_batch, sweep_expired},
    state::AppState,
};

/// Persists staged answers once they are idle for the debounce interval or
/// older than the maximum delay.
pub fn spawn_autosave_flusher(state: AppState, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(state.config.autosave_tick);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            let due = state.autosave.due_ids(
                Instant::now(),
                state.config.autosave_debounce,
                state.config.autosave_max_delay,
            );

            for assignment_id in due {
                match flush_attempt(&state.pool, &state.autosave, assignment_id).await {
                    Ok(0) => {}
                    Ok(saved) => tracing::debug!(assignment_id, saved, "Autosave flushed"),
                    Err(e) => tracing::error!(assignment_id, "Autosave flush failed: {}", e),
                }
            }
        }

        tracing::info!("Autosave flusher stopped");
    })
}

/// Auto-submits attempts whose deadline and grace window have passed, even
/// when the student's client has gone away.
pub fn spawn_expiry_sweeper(state: AppState, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(state.config.expiry_sweep_interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            match sweep_expired(&state, Utc::now()).await {
                Ok(0) => {}
                Ok(expired) => tracing::info!(expired, "Expired attempts submitted"),
                Err(e) => tracing::error!("Expiry sweep failed: {}", e),
            }
        }

        tracing::info!("Expiry sweeper stopped");
    })
}

/// Writes out everything still staged. Called once the server has stopped.
pub async fn flush_all(state: &AppState) -> usize {
    tracing::info!(pending = state.autosave.pending_len(), "Flushing staged answers");
    let mut saved = 0;
    for (assignment_id, drafts) in state.autosave.drain() {
        match persist_batch(&state.pool, assignment_id, &drafts).await {
            Ok(count) => saved += count,
            Err(e) => tracing::error!(
                assignment_id,
                lost = drafts.len(),
                "Final autosave flush failed: {}",
                e
            ),
        }
    }
    saved
}
