//! Retention manager pruning old samples.
//!
//! Only the sample journal is pruned. Downtime intervals are the audit
//! record and are kept forever.

use crate::clock::Clock;
use crate::db::{window_start, Store};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const RETENTION_PERIOD: Duration = Duration::from_secs(3600);

pub struct RetentionManager {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    retention: Duration,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>, retention: Duration) -> Self {
        Self {
            store,
            clock,
            retention,
        }
    }

    /// Start the background task; it runs once right away, then hourly.
    pub fn start(self, mut stop: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RETENTION_PERIOD);

            loop {
                tokio::select! {
                    _ = stop.recv() => break,
                    _ = interval.tick() => {
                        self.process_retention();
                    }
                }
            }
        })
    }

    fn process_retention(&self) -> usize {
        let cutoff = window_start(self.clock.now(), self.retention);
        match self.store.delete_samples_before(cutoff) {
            Ok(0) => 0,
            Ok(removed) => {
                tracing::info!("RetentionManager: Deleted {} samples older than {}", removed, cutoff);
                removed
            }
            Err(e) => {
                tracing::error!("RetentionManager: Failed to delete samples: {}", e);
                0
            }
        }
    }
}
