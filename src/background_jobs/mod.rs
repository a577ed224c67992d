//! Interval-driven maintenance tasks.
//!
//! Each job declares its cadence and gets its own tokio task that ticks,
//! runs, and exits promptly on cancellation. Job failures are logged and the
//! ticker keeps going; a broken run must not kill the schedule.

mod geocode_backfill;
mod session_cleanup;

pub use geocode_backfill::GeocodeBackfillJob;
pub use session_cleanup::SessionCleanupJob;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[async_trait]
pub trait BackgroundJob: Send + Sync {
    fn id(&self) -> &'static str;

    /// Time between runs. The first run happens one interval after startup.
    fn interval(&self) -> Duration;

    async fn run(&self, cancel: &CancellationToken) -> anyhow::Result<()>;
}

/// Spawn one ticking task per job.
pub fn spawn_jobs(jobs: Vec<Arc<dyn BackgroundJob>>, cancel: CancellationToken) {
    for job in jobs {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(job.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // Consume the immediate first tick.
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(job = job.id(), "background job stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = job.run(&cancel).await {
                            warn!(job = job.id(), %err, "background job run failed");
                        }
                    }
                }
            }
        });
    }
}
