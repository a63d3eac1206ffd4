use std::{path::PathBuf, time::Duration};

use etran_tokio::{notify_once::NotifyOnce, task::Task};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info_span};

/// Touch the liveness file on an interval. The external watchdog only looks
/// at the file's mtime: if it falls behind by more than ~2 intervals the
/// service gets restarted, so this task must never be starved by the
/// pipeline (file writes go through the blocking pool, not the runtime).
pub fn spawn(
    path: PathBuf,
    period: Duration,
    mut shutdown: NotifyOnce,
) -> Task<()> {
    const SPAN_NAME: &str = "(heartbeat)";
    Task::spawn_with_span(SPAN_NAME, info_span!(SPAN_NAME), async move {
        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = shutdown.recv() => return,
                _ = timer.tick() => {
                    // Truncating to zero bytes is enough; only the mtime
                    // matters.
                    match tokio::fs::write(&path, b"").await {
                        Ok(()) => debug!("Heartbeat written"),
                        Err(e) => error!("Failed to write heartbeat: {e:#}"),
                    }
                }
            }
        }
    })
}
