//! Learning feedback loop
//!
//! Outcome reports adjust the learned relevance of every file a session
//! included. The adjustment for one file depends only on whether the task
//! succeeded and whether the file was actually used:
//!
//! | outcome | used | Δscore (defaults) |
//! |---------|------|-------------------|
//! | success | yes  | +0.15 |
//! | success | no   | −0.05 |
//! | failure | yes  | +0.05 |
//! | failure | no   | −0.10 |
//!
//! Confidence rises by a fixed step on every report. The whole report is
//! applied in one store transaction; a second report for the same session is
//! rejected with [`Error::OutcomeAlreadyRecorded`](crate::Error::OutcomeAlreadyRecorded).

use crate::config::LearningConfig;
use crate::db::AppliedOutcome;
use crate::error::Result;
use crate::store::RelevanceStore;
use crate::types::{clamp_unit, RelevanceRecord};

pub struct LearningLoop {
    store: RelevanceStore,
    config: LearningConfig,
}

impl LearningLoop {
    pub fn new(store: RelevanceStore, config: LearningConfig) -> Self {
        Self { store, config }
    }

    /// Apply an outcome report for `session_id`.
    pub async fn record_outcome(
        &self,
        session_id: i64,
        was_successful: bool,
        files_actually_used: Vec<String>,
    ) -> Result<AppliedOutcome> {
        let config = self.config.clone();
        let used_count = files_actually_used.len();

        let applied = self
            .store
            .apply_outcome(session_id, was_successful, files_actually_used, move |record, used| {
                adjust(&config, record, was_successful, used)
            })
            .await?;

        tracing::info!(
            session_id,
            was_successful,
            used = used_count,
            updated = applied.records.len(),
            pairs_reinforced = applied.pairs_reinforced,
            "Outcome recorded"
        );
        Ok(applied)
    }
}

/// Score delta for one included file.
pub fn delta(config: &LearningConfig, was_successful: bool, used: bool) -> f64 {
    match (was_successful, used) {
        (true, true) => config.success_used_delta,
        (true, false) => config.success_unused_delta,
        (false, true) => config.failure_used_delta,
        (false, false) => config.failure_unused_delta,
    }
}

/// Apply one outcome to a record in place.
pub fn adjust(config: &LearningConfig, record: &mut RelevanceRecord, was_successful: bool, used: bool) {
    record.relevance_score = clamp_unit(record.relevance_score + delta(config, was_successful, used));
    record.confidence = clamp_unit(record.confidence + config.confidence_step);
    record.total_count += 1;
    if was_successful && used {
        record.success_count += 1;
    }
}
