//! Periodic snapshots of the in-memory store
//!
//! Trades up to one interval of durability for not paying a disk write on
//! every operation. Snapshots go through the [`StoreQueue`] like any other
//! store access.

use super::queue::StoreQueue;
use crate::error::Result;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Handle to the background snapshot task
pub struct SnapshotHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
    queue: StoreQueue,
}

/// Start snapshotting every `interval` while the store is dirty.
pub fn spawn_snapshot_task(queue: StoreQueue, interval: Duration) -> SnapshotHandle {
    let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();
    let task_queue = queue.clone();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
        // the first tick fires immediately; skip it
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = snapshot_now(&task_queue).await {
                        tracing::warn!(error = %e, "Periodic snapshot failed");
                    }
                }
                _ = &mut shutdown_rx => break,
            }
        }
    });

    SnapshotHandle {
        shutdown,
        task,
        queue,
    }
}

/// Write a snapshot immediately if anything changed.
pub async fn snapshot_now(queue: &StoreQueue) -> Result<bool> {
    queue.execute("snapshot", |db| db.snapshot()).await
}

impl SnapshotHandle {
    /// Stop the timer and write a final snapshot.
    pub async fn shutdown(self) -> Result<bool> {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Snapshot task ended abnormally");
        }
        let written = snapshot_now(&self.queue).await?;
        tracing::info!(written, "Final snapshot complete");
        Ok(written)
    }
}
