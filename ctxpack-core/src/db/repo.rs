//! Database repository layer
//!
//! Provides query and insert operations for sessions, learned relevance and
//! file relationships. All methods are synchronous; async callers reach them
//! through [`super::queue::StoreQueue`].
//!
//! The working copy lives in an in-memory SQLite connection. When opened with
//! a path, the file is restored on open and written back by [`Database::snapshot`],
//! so a crash loses at most one snapshot interval of writes.

use crate::db::queue::Cancellation;
use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, Utc};
use rusqlite::backup::Progress;
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, Row, Transaction};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Aggregate numbers over recorded sessions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LearningStats {
    /// Total context sessions persisted
    pub total_sessions: i64,
    /// Sessions that received an outcome report
    pub sessions_with_outcome: i64,
    /// Sessions reported as successful
    pub successful_sessions: i64,
    /// Distinct (file, task type, task mode) records learned
    pub relevance_records: i64,
    /// File pairs with a recorded relationship
    pub relationships: i64,
}

impl LearningStats {
    /// Fraction of reported sessions that succeeded, if any were reported.
    pub fn success_rate(&self) -> Option<f64> {
        if self.sessions_with_outcome == 0 {
            None
        } else {
            Some(self.successful_sessions as f64 / self.sessions_with_outcome as f64)
        }
    }
}

/// Result of applying one outcome report.
#[derive(Debug, Clone)]
pub struct AppliedOutcome {
    pub session_id: i64,
    /// Relevance records after the update, in included-file order
    pub records: Vec<RelevanceRecord>,
    /// Relationship pairs whose co-occurrence count was bumped
    pub pairs_reinforced: usize,
}

/// Database handle: a single in-memory connection plus an optional snapshot file
pub struct Database {
    conn: Mutex<Connection>,
    snapshot_path: Option<PathBuf>,
    dirty: AtomicBool,
}

fn parse_ts(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_mode(value: &str) -> TaskMode {
    value.parse().unwrap_or(TaskMode::General)
}

impl Database {
    /// Open the database backed by the snapshot file at `path`
    ///
    /// An existing snapshot is restored into memory; a missing one starts empty.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open_in_memory()?;
        if path.exists() {
            conn.restore(DatabaseName::Main, path, None::<fn(Progress)>)?;
            tracing::info!(path = %path.display(), "Restored database snapshot");
        }
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        Ok(Self {
            conn: Mutex::new(conn),
            snapshot_path: Some(path.to_path_buf()),
            dirty: AtomicBool::new(false),
        })
    }

    /// Open an in-memory database with no snapshot target (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
            snapshot_path: None,
            dirty: AtomicBool::new(false),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        super::schema::run_migrations(&conn)?;
        self.mark_dirty();
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::Poisoned)
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Whether writes happened since the last snapshot
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Where snapshots are written, if anywhere
    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    /// Write the in-memory database to its snapshot file.
    ///
    /// Writes to a sibling temp file and renames it into place so a crash
    /// mid-backup never leaves a truncated snapshot. Returns `false` when
    /// there is no snapshot target or nothing changed.
    pub fn snapshot(&self) -> Result<bool> {
        let Some(path) = self.snapshot_path.as_deref() else {
            return Ok(false);
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }

        let tmp = path.with_extension("db.tmp");
        let result = self
            .conn()
            .and_then(|conn| Ok(conn.backup(DatabaseName::Main, &tmp, None)?))
            .and_then(|_| Ok(std::fs::rename(&tmp, path)?));

        if let Err(e) = result {
            // keep the data flagged so the next tick retries
            self.mark_dirty();
            return Err(e);
        }

        tracing::debug!(path = %path.display(), "Wrote database snapshot");
        Ok(true)
    }

    // ============================================
    // Relevance operations
    // ============================================

    /// Get the learned record for a key, if one exists
    pub fn get_relevance(
        &self,
        file_path: &str,
        task_type: &str,
        task_mode: TaskMode,
    ) -> Result<Option<RelevanceRecord>> {
        let conn = self.conn()?;
        Self::load_relevance(&conn, file_path, task_type, task_mode)
    }

    /// Get learned records for many files under one (task type, task mode)
    ///
    /// Files without a record are simply absent from the map.
    pub fn get_relevance_batch(
        &self,
        file_paths: &[String],
        task_type: &str,
        task_mode: TaskMode,
    ) -> Result<HashMap<String, RelevanceRecord>> {
        let wanted: HashSet<&str> = file_paths.iter().map(String::as_str).collect();
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM file_relevance WHERE task_type = ?1 AND task_mode = ?2",
        )?;
        let rows = stmt.query_map(params![task_type, task_mode.as_str()], Self::row_to_relevance)?;

        let mut records = HashMap::new();
        for row in rows {
            let record = row?;
            if wanted.contains(record.file_path.as_str()) {
                records.insert(record.file_path.clone(), record);
            }
        }
        Ok(records)
    }

    fn load_relevance(
        conn: &Connection,
        file_path: &str,
        task_type: &str,
        task_mode: TaskMode,
    ) -> Result<Option<RelevanceRecord>> {
        conn.query_row(
            "SELECT * FROM file_relevance WHERE file_path = ?1 AND task_type = ?2 AND task_mode = ?3",
            params![file_path, task_type, task_mode.as_str()],
            Self::row_to_relevance,
        )
        .optional()
        .map_err(Error::from)
    }

    fn upsert_relevance(tx: &Transaction<'_>, record: &RelevanceRecord) -> Result<()> {
        tx.execute(
            r#"
            INSERT INTO file_relevance
                (file_path, task_type, task_mode, relevance_score, confidence,
                 success_count, total_count, last_updated)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(file_path, task_type, task_mode) DO UPDATE SET
                relevance_score = excluded.relevance_score,
                confidence = excluded.confidence,
                success_count = excluded.success_count,
                total_count = excluded.total_count,
                last_updated = excluded.last_updated
            "#,
            params![
                record.file_path,
                record.task_type,
                record.task_mode.as_str(),
                clamp_unit(record.relevance_score),
                clamp_unit(record.confidence),
                record.success_count,
                record.total_count,
                record.last_updated.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn row_to_relevance(row: &Row) -> rusqlite::Result<RelevanceRecord> {
        let mode: String = row.get("task_mode")?;
        let last_updated: String = row.get("last_updated")?;
        Ok(RelevanceRecord {
            file_path: row.get("file_path")?,
            task_type: row.get("task_type")?,
            task_mode: parse_mode(&mode),
            relevance_score: row.get("relevance_score")?,
            confidence: row.get("confidence")?,
            success_count: row.get("success_count")?,
            total_count: row.get("total_count")?,
            last_updated: parse_ts(&last_updated),
        })
    }

    // ============================================
    // Relationship operations
    // ============================================

    /// Get the relationship for an unordered pair
    pub fn get_relationship(&self, a: &str, b: &str) -> Result<Option<FileRelationship>> {
        let (file_a, file_b) = FileRelationship::normalize_pair(a, b);
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM file_relationships WHERE file_a = ?1 AND file_b = ?2",
            params![file_a, file_b],
            Self::row_to_relationship,
        )
        .optional()
        .map_err(Error::from)
    }

    /// All relationships touching `path`
    pub fn relationships_for(&self, path: &str) -> Result<Vec<FileRelationship>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM file_relationships WHERE file_a = ?1 OR file_b = ?1
             ORDER BY strength DESC",
        )?;
        let rows = stmt.query_map([path], Self::row_to_relationship)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    /// Set the git co-change count for a pair, as reported by history mining
    pub fn record_git_co_changes(
        &self,
        a: &str,
        b: &str,
        git_co_change_count: i64,
    ) -> Result<FileRelationship> {
        if a == b {
            return Err(Error::Validation(
                "a file cannot be related to itself".to_string(),
            ));
        }
        let (file_a, file_b) = FileRelationship::normalize_pair(a, b);
        let count = git_co_change_count.max(0);

        let conn = self.conn()?;
        let existing_cooc: i64 = conn
            .query_row(
                "SELECT co_occurrence_count FROM file_relationships WHERE file_a = ?1 AND file_b = ?2",
                params![file_a, file_b],
                |r| r.get(0),
            )
            .optional()?
            .unwrap_or(0);

        let relationship = FileRelationship {
            file_a: file_a.to_string(),
            file_b: file_b.to_string(),
            co_occurrence_count: existing_cooc,
            git_co_change_count: count,
            strength: FileRelationship::compute_strength(count, existing_cooc),
        };
        Self::upsert_relationship(&conn, &relationship)?;
        self.mark_dirty();
        Ok(relationship)
    }

    fn upsert_relationship(conn: &Connection, rel: &FileRelationship) -> Result<()> {
        conn.execute(
            r#"
            INSERT INTO file_relationships
                (file_a, file_b, co_occurrence_count, git_co_change_count, strength)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(file_a, file_b) DO UPDATE SET
                co_occurrence_count = excluded.co_occurrence_count,
                git_co_change_count = excluded.git_co_change_count,
                strength = excluded.strength
            "#,
            params![
                rel.file_a,
                rel.file_b,
                rel.co_occurrence_count,
                rel.git_co_change_count,
                rel.strength,
            ],
        )?;
        Ok(())
    }

    fn reinforce_pair(tx: &Transaction<'_>, a: &str, b: &str) -> Result<()> {
        let (file_a, file_b) = FileRelationship::normalize_pair(a, b);
        let existing = tx
            .query_row(
                "SELECT * FROM file_relationships WHERE file_a = ?1 AND file_b = ?2",
                params![file_a, file_b],
                Self::row_to_relationship,
            )
            .optional()?;

        let mut rel = existing.unwrap_or_else(|| FileRelationship {
            file_a: file_a.to_string(),
            file_b: file_b.to_string(),
            co_occurrence_count: 0,
            git_co_change_count: 0,
            strength: 0.0,
        });
        rel.co_occurrence_count += 1;
        rel.strength =
            FileRelationship::compute_strength(rel.git_co_change_count, rel.co_occurrence_count);
        Self::upsert_relationship(tx, &rel)
    }

    fn row_to_relationship(row: &Row) -> rusqlite::Result<FileRelationship> {
        Ok(FileRelationship {
            file_a: row.get("file_a")?,
            file_b: row.get("file_b")?,
            co_occurrence_count: row.get("co_occurrence_count")?,
            git_co_change_count: row.get("git_co_change_count")?,
            strength: row.get("strength")?,
        })
    }

    // ============================================
    // Session operations
    // ============================================

    /// Persist a ranking decision and return it with its assigned id
    pub fn insert_session(&self, session: &NewContextSession) -> Result<ContextSession> {
        let timestamp = Utc::now();
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO context_sessions
                (conversation_id, task_type, task_mode, task_description,
                 included_files, confidence_scores, outcome_success,
                 files_actually_used, total_tokens, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL, ?7, ?8)
            "#,
            params![
                session.conversation_id,
                session.task_type,
                session.task_mode.as_str(),
                session.task_description,
                serde_json::to_string(&session.included_files)?,
                serde_json::to_string(&session.confidence_scores)?,
                session.total_tokens,
                timestamp.to_rfc3339(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        self.mark_dirty();

        Ok(ContextSession {
            id,
            conversation_id: session.conversation_id.clone(),
            task_type: session.task_type.clone(),
            task_mode: session.task_mode,
            task_description: session.task_description.clone(),
            included_files: session.included_files.clone(),
            confidence_scores: session.confidence_scores.clone(),
            outcome_success: None,
            files_actually_used: Vec::new(),
            total_tokens: session.total_tokens,
            timestamp,
        })
    }

    /// Get a session by id
    pub fn get_session(&self, id: i64) -> Result<Option<ContextSession>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM context_sessions WHERE id = ?",
            [id],
            Self::row_to_session,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Most recent sessions first
    pub fn recent_sessions(&self, limit: usize) -> Result<Vec<ContextSession>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT * FROM context_sessions ORDER BY id DESC LIMIT ?")?;
        let rows = stmt.query_map([limit as i64], Self::row_to_session)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    fn row_to_session(row: &Row) -> rusqlite::Result<ContextSession> {
        let mode: String = row.get("task_mode")?;
        let included: String = row.get("included_files")?;
        let confidences: String = row.get("confidence_scores")?;
        let used: Option<String> = row.get("files_actually_used")?;
        let outcome: Option<i64> = row.get("outcome_success")?;
        let timestamp: String = row.get("timestamp")?;

        Ok(ContextSession {
            id: row.get("id")?,
            conversation_id: row.get("conversation_id")?,
            task_type: row.get("task_type")?,
            task_mode: parse_mode(&mode),
            task_description: row.get("task_description")?,
            included_files: serde_json::from_str(&included).unwrap_or_default(),
            confidence_scores: serde_json::from_str::<BTreeMap<String, f64>>(&confidences)
                .unwrap_or_default(),
            outcome_success: outcome.map(|v| v != 0),
            files_actually_used: used
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default(),
            total_tokens: row.get("total_tokens")?,
            timestamp: parse_ts(&timestamp),
        })
    }

    /// Apply an outcome report as a single transaction
    ///
    /// `update` receives each included file's current record (or the neutral
    /// default) and whether the file was actually used, and mutates it in
    /// place. The session's outcome columns are written in the same
    /// transaction, so either every change is visible or none is. A session
    /// that already has an outcome is rejected before anything is touched.
    /// Nothing commits unless `cancel` can still be claimed.
    pub fn apply_outcome<F>(
        &self,
        session_id: i64,
        was_successful: bool,
        files_actually_used: &[String],
        cancel: &Cancellation,
        mut update: F,
    ) -> Result<AppliedOutcome>
    where
        F: FnMut(&mut RelevanceRecord, bool),
    {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let session = tx
            .query_row(
                "SELECT * FROM context_sessions WHERE id = ?",
                [session_id],
                Self::row_to_session,
            )
            .optional()?
            .ok_or(Error::SessionNotFound(session_id))?;

        if session.has_outcome() {
            return Err(Error::OutcomeAlreadyRecorded(session_id));
        }

        let used: HashSet<&str> = files_actually_used.iter().map(String::as_str).collect();
        let mut records = Vec::with_capacity(session.included_files.len());

        for path in &session.included_files {
            let mut record =
                Self::load_relevance(&tx, path, &session.task_type, session.task_mode)?
                    .unwrap_or_else(|| {
                        RelevanceRecord::neutral(path, &session.task_type, session.task_mode)
                    });
            update(&mut record, used.contains(path.as_str()));
            record.last_updated = Utc::now();
            Self::upsert_relevance(&tx, &record)?;
            records.push(record);
        }

        let mut pairs_reinforced = 0;
        if was_successful {
            let mut used_files: Vec<&str> = used.iter().copied().collect();
            used_files.sort_unstable();
            for (i, a) in used_files.iter().enumerate() {
                for b in &used_files[i + 1..] {
                    Self::reinforce_pair(&tx, a, b)?;
                    pairs_reinforced += 1;
                }
            }
        }

        let updated = tx.execute(
            "UPDATE context_sessions SET outcome_success = ?1, files_actually_used = ?2
             WHERE id = ?3 AND outcome_success IS NULL",
            params![
                was_successful as i64,
                serde_json::to_string(files_actually_used)?,
                session_id
            ],
        )?;
        if updated != 1 {
            return Err(Error::OutcomeAlreadyRecorded(session_id));
        }

        cancel.claim()?;
        tx.commit()?;
        self.mark_dirty();

        Ok(AppliedOutcome {
            session_id,
            records,
            pairs_reinforced,
        })
    }

    // ============================================
    // Stats
    // ============================================

    /// Aggregate counts across all tables
    pub fn learning_stats(&self) -> Result<LearningStats> {
        let conn = self.conn()?;
        let (total_sessions, sessions_with_outcome, successful_sessions): (i64, i64, i64) = conn.query_row(
            r#"
            SELECT COUNT(*),
                   COUNT(outcome_success),
                   COALESCE(SUM(CASE WHEN outcome_success = 1 THEN 1 ELSE 0 END), 0)
            FROM context_sessions
            "#,
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )?;
        let relevance_records: i64 =
            conn.query_row("SELECT COUNT(*) FROM file_relevance", [], |r| r.get(0))?;
        let relationships: i64 =
            conn.query_row("SELECT COUNT(*) FROM file_relationships", [], |r| r.get(0))?;

        Ok(LearningStats {
            total_sessions,
            sessions_with_outcome,
            successful_sessions,
            relevance_records,
            relationships,
        })
    }
}
