//! Periodic sweep of expired sessions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::BackgroundJob;
use crate::store::VaultStore;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);

pub struct SessionCleanupJob {
    store: Arc<dyn VaultStore>,
}

impl SessionCleanupJob {
    pub fn new(store: Arc<dyn VaultStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BackgroundJob for SessionCleanupJob {
    fn id(&self) -> &'static str {
        "session_cleanup"
    }

    fn interval(&self) -> Duration {
        SWEEP_INTERVAL
    }

    async fn run(&self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        let removed = self.store.delete_expired_sessions()?;
        if removed > 0 {
            debug!(removed, "expired sessions removed");
        }
        Ok(())
    }
}
