//! Database layer for ctxpack
//!
//! This module provides the storage layer using SQLite with:
//! - Schema migrations
//! - Repository pattern for queries
//! - A bounded, timeout-guarded operation queue
//! - Periodic snapshots of the in-memory working copy

pub mod queue;
pub mod repo;
pub mod schema;
pub mod snapshot;

pub use queue::{Cancellation, QueueStats, StoreQueue};
pub use repo::{AppliedOutcome, Database, LearningStats};
pub use snapshot::{snapshot_now, spawn_snapshot_task, SnapshotHandle};
