//! Background sync task

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::SyncEngine;

/// Handle to a running background sync task
pub struct SyncHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Signal the task and wait for it to finish its current cycle
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Background sync task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Run [`SyncEngine::background_pass`] every `period` until shut down.
///
/// The first cycle starts one period after spawning. A cycle that overruns
/// the period delays the next one instead of queueing extra cycles.
pub fn spawn_background_sync(engine: Arc<SyncEngine>, period: Duration) -> SyncHandle {
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(run(engine, period, shutdown_rx));
    SyncHandle { shutdown, task }
}

async fn run(engine: Arc<SyncEngine>, period: Duration, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(interval_secs = period.as_secs(), "Background sync started");

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                // A dropped sender also means shutdown
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            _ = ticker.tick() => {
                let report = engine.background_pass().await;
                if report.failures.is_empty() {
                    tracing::debug!(
                        agents = report.agents_synced.len(),
                        processed = report.total_memories_processed,
                        conflicts = report.total_conflicts,
                        duration_ms = report.duration_ms,
                        "Background sync cycle completed"
                    );
                } else {
                    tracing::warn!(
                        agents = report.agents_synced.len(),
                        failures = ?report.failures,
                        "Background sync cycle had failures"
                    );
                }
            }
        }
    }

    let snapshot = engine.metrics().snapshot();
    tracing::info!(
        cycles = snapshot.background_cycles,
        total_syncs = snapshot.total_syncs,
        failed_syncs = snapshot.failed_syncs,
        "Background sync stopped"
    );
}
