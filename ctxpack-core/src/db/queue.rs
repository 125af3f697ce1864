//! Bounded, timeout-guarded access to the embedded store
//!
//! Every store operation is enqueued with an id and a timestamp. A single
//! dispatcher task drains the queue in FIFO order and runs at most
//! `max_concurrent_operations` of them at once (a semaphore), each on the
//! blocking pool and each under its own deadline.
//!
//! ```text
//!  execute() ──► mpsc ──► dispatcher ──► acquire permit ──► spawn_blocking(op)
//!                                                             │
//!          ◄──────────── oneshot (result | StoreTimeout) ◄────┘
//! ```
//!
//! A timed-out operation is answered with [`Error::StoreTimeout`] and its
//! permit is released, so the queue keeps moving. The blocking closure itself
//! cannot be interrupted; it finishes in the background and its late result
//! is discarded. Operations are never retried.
//!
//! Writes go through [`StoreQueue::execute_write`] and must call
//! [`Cancellation::claim`] right before their change becomes durable. Whichever
//! comes first wins: a claim made before the deadline makes the dispatcher
//! wait for the result, and a deadline reached before the claim makes the
//! claim fail so the write rolls back.

use crate::config::StoreConfig;
use crate::db::Database;
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Semaphore};

/// Queue observability counters.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    /// Operations enqueued
    pub total: u64,
    /// Operations that returned `Ok`
    pub succeeded: u64,
    /// Operations that returned an error or panicked
    pub failed: u64,
    /// Operations abandoned at their deadline
    pub timed_out: u64,
    started: u64,
    total_wait: Duration,
}

impl QueueStats {
    /// Mean time between enqueue and start of execution
    pub fn average_wait(&self) -> Duration {
        if self.started == 0 {
            Duration::ZERO
        } else {
            self.total_wait / self.started as u32
        }
    }

    /// Operations enqueued but not yet finished
    pub fn in_flight(&self) -> u64 {
        self.total
            .saturating_sub(self.succeeded + self.failed + self.timed_out)
    }
}

const ACTIVE: u8 = 0;
const CLAIMED: u8 = 1;
const EXPIRED: u8 = 2;

/// Race between a write's commit and its deadline.
#[derive(Debug, Clone)]
pub struct Cancellation {
    operation: &'static str,
    state: Arc<AtomicU8>,
}

impl Cancellation {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            state: Arc::new(AtomicU8::new(ACTIVE)),
        }
    }

    /// Reserve the right to commit.
    ///
    /// Fails with [`Error::Abandoned`] once the deadline has passed; the
    /// caller must then drop its transaction without committing.
    pub fn claim(&self) -> Result<()> {
        match self
            .state
            .compare_exchange(ACTIVE, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(CLAIMED) => Ok(()),
            Err(_) => Err(Error::Abandoned(self.operation.to_string())),
        }
    }

    /// Mark the deadline as passed. Returns false if a commit was already
    /// claimed.
    pub(crate) fn expire(&self) -> bool {
        match self
            .state
            .compare_exchange(ACTIVE, EXPIRED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(state) => state == EXPIRED,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.state.load(Ordering::Acquire) == EXPIRED
    }
}

type SharedStats = Arc<Mutex<QueueStats>>;

fn with_stats(stats: &SharedStats, f: impl FnOnce(&mut QueueStats)) {
    if let Ok(mut guard) = stats.lock() {
        f(&mut guard);
    }
}

/// One queued operation with its result channel erased.
struct Job {
    id: u64,
    operation: &'static str,
    enqueued_at: Instant,
    cancel: Cancellation,
    /// Runs the operation and answers the caller; returns whether it succeeded
    run: Box<dyn FnOnce(&Database) -> bool + Send>,
    /// Answers the caller with an error if `run` has not already
    expire: Box<dyn FnOnce(Error) + Send>,
}

/// Handle to the store queue. Cheap to clone; all clones share one dispatcher.
#[derive(Clone)]
pub struct StoreQueue {
    sender: mpsc::UnboundedSender<Job>,
    db: Arc<Database>,
    stats: SharedStats,
    next_id: Arc<AtomicU64>,
}

impl StoreQueue {
    /// Start the dispatcher for `db`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(db: Arc<Database>, config: &StoreConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let stats = SharedStats::default();
        let max_concurrent = config.max_concurrent_operations.max(1);

        tokio::spawn(dispatch(
            receiver,
            Arc::clone(&db),
            Arc::new(Semaphore::new(max_concurrent)),
            Arc::clone(&stats),
            config.operation_timeout(),
        ));

        tracing::debug!(
            max_concurrent,
            timeout_ms = config.operation_timeout_ms,
            "Store queue started"
        );

        Self {
            sender,
            db,
            stats,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Run `op` against the store once a slot frees up.
    ///
    /// `operation` names the call in logs and timeout errors.
    pub async fn execute<T, F>(&self, operation: &'static str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        self.submit(operation, move |db, _| op(db)).await
    }

    /// Run a write that must not land once its caller has seen a timeout.
    ///
    /// `op` calls [`Cancellation::claim`] immediately before committing.
    pub async fn execute_write<T, F>(&self, operation: &'static str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database, &Cancellation) -> Result<T> + Send + 'static,
    {
        self.submit(operation, op).await
    }

    async fn submit<T, F>(&self, operation: &'static str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database, &Cancellation) -> Result<T> + Send + 'static,
    {
        let cancel = Cancellation::new(operation);
        let run_cancel = cancel.clone();
        let (tx, rx) = oneshot::channel::<Result<T>>();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let run_slot = Arc::clone(&slot);

        let take_sender = |slot: &Mutex<Option<oneshot::Sender<Result<T>>>>| {
            slot.lock().ok().and_then(|mut s| s.take())
        };

        let job = Job {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            operation,
            enqueued_at: Instant::now(),
            cancel,
            run: Box::new(move |db| {
                let result = op(db, &run_cancel);
                let ok = result.is_ok();
                if let Some(tx) = take_sender(&run_slot) {
                    let _ = tx.send(result);
                }
                ok
            }),
            expire: Box::new(move |err| {
                if let Some(tx) = take_sender(&slot) {
                    let _ = tx.send(Err(err));
                }
            }),
        };

        with_stats(&self.stats, |s| s.total += 1);
        self.sender.send(job).map_err(|_| Error::QueueClosed)?;
        rx.await.map_err(|_| Error::QueueClosed)?
    }

    /// Snapshot of the queue counters
    pub fn stats(&self) -> QueueStats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// The database behind this queue
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }
}

async fn dispatch(
    mut receiver: mpsc::UnboundedReceiver<Job>,
    db: Arc<Database>,
    permits: Arc<Semaphore>,
    stats: SharedStats,
    timeout: Duration,
) {
    while let Some(job) = receiver.recv().await {
        // Permits are granted in acquisition order, which keeps start order FIFO.
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };

        let db = Arc::clone(&db);
        let stats = Arc::clone(&stats);

        tokio::spawn(async move {
            let _permit = permit;
            let Job {
                id,
                operation,
                enqueued_at,
                cancel,
                run,
                expire,
            } = job;

            let waited = enqueued_at.elapsed();
            with_stats(&stats, |s| {
                s.started += 1;
                s.total_wait += waited;
            });
            tracing::trace!(id, operation, waited_ms = waited.as_millis() as u64, "Store operation started");

            let mut handle = tokio::task::spawn_blocking(move || run(&db));

            let finished = match tokio::time::timeout(timeout, &mut handle).await {
                Ok(finished) => finished,
                Err(_) if !cancel.expire() => {
                    tracing::debug!(id, operation, "Store write committing past its deadline");
                    handle.await
                }
                Err(_) => {
                    let timeout_ms = timeout.as_millis() as u64;
                    tracing::warn!(id, operation, timeout_ms, "Store operation timed out");
                    with_stats(&stats, |s| s.timed_out += 1);
                    expire(Error::StoreTimeout {
                        operation: operation.to_string(),
                        timeout_ms,
                    });
                    return;
                }
            };

            match finished {
                Ok(true) => with_stats(&stats, |s| s.succeeded += 1),
                Ok(false) => with_stats(&stats, |s| s.failed += 1),
                Err(join_err) => {
                    tracing::error!(id, operation, error = %join_err, "Store operation panicked");
                    with_stats(&stats, |s| s.failed += 1);
                    expire(Error::Poisoned);
                }
            }
        });
    }

    tracing::debug!("Store queue dispatcher stopped");
}
