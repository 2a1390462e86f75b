use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::queue::PendingQueue;
use crate::store::{Operation, Payload, RecordStore};

/// Outcome of one drain pass over the pending-change queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub applied: usize,
    pub failed: usize,
}

/// Applies mutations to the record store, falling back to the durable queue
/// when the store cannot be reached, and reconciles the queue on drain.
pub struct SyncEngine {
    store: Arc<dyn RecordStore>,
    queue: PendingQueue,
    draining: AtomicBool,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn RecordStore>, queue: PendingQueue) -> Self {
        Self {
            store,
            queue,
            draining: AtomicBool::new(false),
        }
    }

    pub fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    /// Issue a mutation: applied directly when the store is reachable,
    /// otherwise queued. Returns true when it was applied immediately.
    pub async fn apply_change(
        &self,
        table: &str,
        record_id: &str,
        operation: Operation,
        payload: &Payload,
    ) -> Result<bool> {
        if self.store.is_reachable().await {
            match self.store.apply(operation, table, record_id, payload).await {
                Ok(()) => return Ok(true),
                Err(e) => {
                    warn!(
                        "direct {} on {table}/{record_id} failed, queueing: {e:#}",
                        operation.as_str()
                    );
                }
            }
        }

        self.queue.enqueue(table, record_id, operation, payload).await?;
        Ok(false)
    }

    /// Drain the queue FIFO against the record store. At most one drain runs
    /// at a time: a racing request observes the guard and returns None.
    ///
    /// A per-item failure does not abort the pass; the item stays queued for
    /// the next drain and the pass moves on.
    pub async fn drain(&self) -> Result<Option<DrainReport>> {
        if self.draining.swap(true, Ordering::SeqCst) {
            debug!("drain already in progress, skipping");
            return Ok(None);
        }

        let result = self.drain_locked().await;
        self.draining.store(false, Ordering::SeqCst);
        result.map(Some)
    }

    async fn drain_locked(&self) -> Result<DrainReport> {
        let changes = self.queue.fetch_all().await?;
        if changes.is_empty() {
            return Ok(DrainReport::default());
        }

        let mut report = DrainReport::default();
        for change in changes {
            let applied = self
                .store
                .apply(
                    change.operation,
                    &change.table_name,
                    &change.record_id,
                    &change.payload,
                )
                .await;

            match applied {
                Ok(()) => {
                    self.queue.remove(change.id).await?;
                    report.applied += 1;
                }
                Err(e) => {
                    warn!(
                        "pending {} on {}/{} failed, keeping for next drain: {e:#}",
                        change.operation.as_str(),
                        change.table_name,
                        change.record_id
                    );
                    report.failed += 1;
                }
            }
        }

        info!(
            "drain finished: {} applied, {} failed",
            report.applied, report.failed
        );
        Ok(report)
    }
}
