//! Relevance record store
//!
//! Async facade over [`StoreQueue`]: every read and write of learned
//! relevance, file relationships and context sessions goes through the
//! queue, so nothing touches the connection outside its concurrency bound.
//! Writes claim their commit through the queue's [`crate::db::Cancellation`],
//! so a write reported as timed out never lands.

use crate::db::{AppliedOutcome, LearningStats, QueueStats, StoreQueue};
use crate::error::{Error, Result};
use crate::types::{ContextSession, FileRelationship, NewContextSession, RelevanceRecord, TaskMode};
use std::collections::HashMap;

#[derive(Clone)]
pub struct RelevanceStore {
    queue: StoreQueue,
}

impl RelevanceStore {
    pub fn new(queue: StoreQueue) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &StoreQueue {
        &self.queue
    }

    /// Learned record for one key, or the neutral (0.5, 0.5) default
    pub async fn relevance(
        &self,
        file_path: &str,
        task_type: &str,
        task_mode: TaskMode,
    ) -> Result<RelevanceRecord> {
        let (path, task) = (file_path.to_string(), task_type.to_string());
        self.queue
            .execute("get_relevance", move |db| {
                Ok(db
                    .get_relevance(&path, &task, task_mode)?
                    .unwrap_or_else(|| RelevanceRecord::neutral(&path, &task, task_mode)))
            })
            .await
    }

    /// Learned records for a batch of files; unlearned files are absent
    pub async fn relevance_for(
        &self,
        file_paths: Vec<String>,
        task_type: &str,
        task_mode: TaskMode,
    ) -> Result<HashMap<String, RelevanceRecord>> {
        let task = task_type.to_string();
        self.queue
            .execute("get_relevance_batch", move |db| {
                db.get_relevance_batch(&file_paths, &task, task_mode)
            })
            .await
    }

    /// Relationships touching `path`, keyed by the other file
    pub async fn relationships_for(&self, path: &str) -> Result<HashMap<String, FileRelationship>> {
        let path = path.to_string();
        self.queue
            .execute("relationships_for", move |db| {
                let relationships = db.relationships_for(&path)?;
                Ok(relationships
                    .into_iter()
                    .filter_map(|rel| rel.other(&path).map(|o| (o.to_string(), rel.clone())))
                    .collect())
            })
            .await
    }

    /// Record the git co-change count for a pair (git-analysis collaborator feed)
    pub async fn record_relationship(
        &self,
        file_a: &str,
        file_b: &str,
        git_co_change_count: i64,
    ) -> Result<FileRelationship> {
        let (a, b) = (file_a.to_string(), file_b.to_string());
        self.queue
            .execute_write("record_relationship", move |db, cancel| {
                cancel.claim()?;
                db.record_git_co_changes(&a, &b, git_co_change_count)
            })
            .await
    }

    pub async fn create_session(&self, session: NewContextSession) -> Result<ContextSession> {
        self.queue
            .execute_write("insert_session", move |db, cancel| {
                cancel.claim()?;
                db.insert_session(&session)
            })
            .await
    }

    /// Load a session, failing with `SessionNotFound` if it does not exist
    pub async fn get_session(&self, id: i64) -> Result<ContextSession> {
        self.queue
            .execute("get_session", move |db| {
                db.get_session(id)?.ok_or(Error::SessionNotFound(id))
            })
            .await
    }

    pub async fn recent_sessions(&self, limit: usize) -> Result<Vec<ContextSession>> {
        self.queue
            .execute("recent_sessions", move |db| db.recent_sessions(limit))
            .await
    }

    /// Apply an outcome atomically; see [`crate::db::Database::apply_outcome`]
    pub async fn apply_outcome<F>(
        &self,
        session_id: i64,
        was_successful: bool,
        files_actually_used: Vec<String>,
        update: F,
    ) -> Result<AppliedOutcome>
    where
        F: FnMut(&mut RelevanceRecord, bool) + Send + 'static,
    {
        self.queue
            .execute_write("apply_outcome", move |db, cancel| {
                db.apply_outcome(session_id, was_successful, &files_actually_used, cancel, update)
            })
            .await
    }

    pub async fn stats(&self) -> Result<LearningStats> {
        self.queue
            .execute("learning_stats", |db| db.learning_stats())
            .await
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::db::Database;
    use std::sync::Arc;

    fn store() -> RelevanceStore {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        RelevanceStore::new(StoreQueue::new(Arc::new(db), &StoreConfig::default()))
    }

    #[tokio::test]
    async fn test_unknown_relevance_is_neutral() {
        let store = store();
        let record = store.relevance("a.js", "fix", TaskMode::Debug).await.unwrap();
        assert_eq!(record.relevance_score, 0.5);
        assert_eq!(record.confidence, 0.5);
        assert_eq!(record.total_count, 0);

        let batch = store
            .relevance_for(vec!["a.js".to_string()], "fix", TaskMode::Debug)
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_relationships_keyed_by_other_file() {
        let store = store();
        store.record_relationship("src/a.rs", "src/b.rs", 6).await.unwrap();
        store.record_relationship("src/c.rs", "src/a.rs", 2).await.unwrap();

        let related = store.relationships_for("src/a.rs").await.unwrap();
        assert_eq!(related.len(), 2);
        assert_eq!(related["src/b.rs"].git_co_change_count, 6);
        assert_eq!(related["src/c.rs"].git_co_change_count, 2);
    }

    #[tokio::test]
    async fn test_missing_session_surfaces_verbatim() {
        let store = store();
        let err = store.get_session(12).await.unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(12)));
    }
}
