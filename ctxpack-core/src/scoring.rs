//! Relevance scoring engine
//!
//! Turns a task's [`QueryAnalysis`] and a list of candidate [`FileRecord`]s
//! into a bounded [`ScoredFile`] per candidate. Each file starts at the base
//! score and accumulates weighted signals:
//!
//! | # | Signal | Contribution (defaults) |
//! |---|--------|-------------------------|
//! | 1 | Already viewed | dropped at level 1, score × 0.5 otherwise |
//! | 2 | Semantic similarity | `sim × 0.25`, confidence +0.1 |
//! | 3 | Learned relevance | `hist × 0.2` when above 0.5 |
//! | 4 | Task mode | debug +0.3 recent / +0.2 error path, feature +0.3, refactor +0.4 |
//! | 5 | Import relationship | +0.25 |
//! | 6 | Git co-change | `min(count / 10, 1) × 0.15` |
//! | 7 | Path similarity | `ratio × 0.1` when ratio > 0.5 |
//! | 8 | Progressive cutoff | level 1 drops running score < 0.6 |
//!
//! Every external lookup degrades to "absent" on failure; a scoring pass
//! never fails as a whole.

use crate::config::ScoringConfig;
use crate::signals::{guarded, RecencySource, SimilarityScorer};
use crate::store::RelevanceStore;
use crate::types::{
    clamp_unit, path_directories, path_stem, ConversationState, FileRecord, FileRelationship,
    ProgressiveLevel, QueryAnalysis, RelevanceRecord, ScoredFile, TaskMode,
};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Markers in a path that suggest error-handling code
const ERROR_PATH_MARKERS: &[&str] = &["error", "exception"];

/// Inputs for one scoring pass
#[derive(Debug, Clone, Copy)]
pub struct ScoringRequest<'a> {
    pub query: &'a QueryAnalysis,
    pub candidates: &'a [FileRecord],
    pub conversation: Option<&'a ConversationState>,
    pub current_file: Option<&'a str>,
    pub task_mode: TaskMode,
    pub level: ProgressiveLevel,
}

/// Store-backed context shared by every candidate in a pass
struct PassContext<'a> {
    task_type: String,
    learned: HashMap<String, RelevanceRecord>,
    related: HashMap<String, FileRelationship>,
    current: Option<&'a FileRecord>,
}

pub struct ScoringEngine {
    store: RelevanceStore,
    similarity: Arc<dyn SimilarityScorer>,
    recency: Arc<dyn RecencySource>,
    config: ScoringConfig,
}

impl ScoringEngine {
    pub fn new(
        store: RelevanceStore,
        similarity: Arc<dyn SimilarityScorer>,
        recency: Arc<dyn RecencySource>,
        config: ScoringConfig,
    ) -> Self {
        Self {
            store,
            similarity,
            recency,
            config,
        }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Score every candidate.
    ///
    /// The returned map keeps candidate discovery order; candidates removed by
    /// progressive level 1 are absent entirely.
    pub async fn score(&self, request: ScoringRequest<'_>) -> IndexMap<String, ScoredFile> {
        let ctx = self.prepare(&request).await;
        let mut scored = IndexMap::with_capacity(request.candidates.len());

        for file in request.candidates {
            if let Some(result) = self.score_file(&request, &ctx, file).await {
                scored.insert(file.path.clone(), result);
            }
        }

        tracing::debug!(
            candidates = request.candidates.len(),
            scored = scored.len(),
            task_mode = %request.task_mode,
            level = request.level.as_u8(),
            "Scoring pass complete"
        );
        scored
    }

    /// Batch the store reads the whole pass needs.
    async fn prepare<'a>(&self, request: &ScoringRequest<'a>) -> PassContext<'a> {
        let task_type = request.query.task_type();
        let paths: Vec<String> = request.candidates.iter().map(|f| f.path.clone()).collect();

        let learned = match self
            .store
            .relevance_for(paths, &task_type, request.task_mode)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "Learned relevance unavailable; using defaults");
                HashMap::new()
            }
        };

        let related = match request.current_file {
            Some(current) => match self.store.relationships_for(current).await {
                Ok(related) => related,
                Err(e) => {
                    tracing::warn!(error = %e, current, "Co-change lookup failed; signal absent");
                    HashMap::new()
                }
            },
            None => HashMap::new(),
        };

        let current = request
            .current_file
            .and_then(|c| request.candidates.iter().find(|f| f.path == c));

        PassContext {
            task_type,
            learned,
            related,
            current,
        }
    }

    async fn score_file(
        &self,
        request: &ScoringRequest<'_>,
        ctx: &PassContext<'_>,
        file: &FileRecord,
    ) -> Option<ScoredFile> {
        let cfg = &self.config;
        let mut score = cfg.base_score;
        let mut confidence = cfg.base_confidence;
        let mut reasons = Vec::new();

        // 1. already viewed
        let viewed = request
            .conversation
            .is_some_and(|c| c.has_viewed(&file.path));
        if viewed {
            if request.level == ProgressiveLevel::Immediate {
                return None;
            }
            score *= cfg.viewed_discount;
            reasons.push("Already viewed in this conversation".to_string());
        }

        // 2. semantic similarity
        let similarity = guarded(
            self.similarity.name(),
            &file.path,
            cfg.signal_timeout(),
            self.similarity.similarity(request.query, file),
        )
        .await
        .map(clamp_unit)
        .unwrap_or(0.0);
        if similarity > 0.0 {
            score += similarity * cfg.similarity_weight;
            confidence += cfg.similarity_confidence_boost;
            reasons.push(format!("Semantic match ({:.2})", similarity));
        }

        // 3. learned relevance
        if let Some(record) = ctx.learned.get(&file.path) {
            if record.relevance_score > cfg.history_threshold {
                score += record.relevance_score * cfg.history_weight;
                confidence = confidence.max(record.confidence);
                reasons.push(format!(
                    "Historically useful for {} tasks ({:.2})",
                    ctx.task_type, record.relevance_score
                ));
            }
        }

        let is_current = request.current_file == Some(file.path.as_str());
        let imports_related = !is_current && self.import_related(request, ctx, file);

        // 4. task mode
        match request.task_mode {
            TaskMode::Debug => {
                let recent = guarded(
                    self.recency.name(),
                    &file.path,
                    cfg.signal_timeout(),
                    self.recency
                        .has_recent_changes(file, cfg.recency_window_hours),
                )
                .await
                .unwrap_or(false);
                if recent {
                    score += cfg.debug_recent_boost;
                    reasons.push(format!(
                        "Modified within the last {}h",
                        cfg.recency_window_hours
                    ));
                }

                let lower = file.path.to_lowercase();
                if ERROR_PATH_MARKERS.iter().any(|m| lower.contains(m)) {
                    score += cfg.debug_error_path_boost;
                    reasons.push("Path suggests error handling".to_string());
                }
            }
            TaskMode::Feature => {
                let lower = file.path.to_lowercase();
                let concept = request
                    .query
                    .concepts
                    .iter()
                    .find(|c| !c.is_empty() && lower.contains(&c.to_lowercase()));
                if let Some(concept) = concept {
                    score += cfg.feature_concept_boost;
                    reasons.push(format!("Path matches concept '{}'", concept));
                }
            }
            TaskMode::Refactor => {
                if imports_related {
                    score += cfg.refactor_import_boost;
                    reasons.push("Direct dependency of the file being refactored".to_string());
                }
            }
            TaskMode::General => {}
        }

        // 5. import relationship
        if imports_related {
            score += cfg.import_weight;
            reasons.push("Imports or is imported by the current file".to_string());
        }

        // 6. git co-change
        if let Some(rel) = ctx.related.get(&file.path) {
            if rel.git_co_change_count > 0 {
                let normalized =
                    (rel.git_co_change_count as f64 / cfg.cochange_saturation).min(1.0);
                score += normalized * cfg.cochange_weight;
                reasons.push(format!(
                    "Changed together with the current file {} times",
                    rel.git_co_change_count
                ));
            }
        }

        // 7. path similarity
        if let Some(current) = request.current_file.filter(|_| !is_current) {
            let ratio = path_similarity(current, &file.path);
            if ratio > cfg.path_similarity_threshold {
                score += ratio * cfg.path_similarity_weight;
                reasons.push("Lives near the current file".to_string());
            }
        }

        // 8. progressive cutoff
        if request.level == ProgressiveLevel::Immediate && score < cfg.level_one_cutoff {
            tracing::trace!(path = %file.path, score, "Dropped by level-1 cutoff");
            return None;
        }

        let mut scored = ScoredFile::new(&file.path, score, confidence);
        scored.reasons = reasons;
        Some(scored)
    }

    /// Whether `file` imports, or is imported by, the current file.
    fn import_related(
        &self,
        request: &ScoringRequest<'_>,
        ctx: &PassContext<'_>,
        file: &FileRecord,
    ) -> bool {
        let Some(current_path) = request.current_file else {
            return false;
        };
        let current_stem = path_stem(current_path);

        let imports_current = file.imports.iter().any(|i| path_stem(i) == current_stem);
        let imported_by_current = ctx
            .current
            .is_some_and(|c| c.imports.iter().any(|i| path_stem(i) == file.stem()));

        imports_current || imported_by_current
    }
}

/// Shared leading directories divided by the longer directory depth.
pub fn path_similarity(a: &str, b: &str) -> f64 {
    let dirs_a = path_directories(a);
    let dirs_b = path_directories(b);
    let longest = dirs_a.len().max(dirs_b.len());
    if longest == 0 {
        return 0.0;
    }

    let shared = dirs_a
        .iter()
        .zip(dirs_b.iter())
        .take_while(|(x, y)| x == y)
        .count();
    shared as f64 / longest as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::db::{Database, StoreQueue};
    use crate::error::{Error, Result};
    use crate::signals::MtimeRecency;
    use async_trait::async_trait;

    /// Similarity source returning a fixed value per path
    struct FixedSimilarity(HashMap<String, f64>);

    #[async_trait]
    impl SimilarityScorer for FixedSimilarity {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn similarity(&self, _: &QueryAnalysis, file: &FileRecord) -> Result<f64> {
            Ok(self.0.get(&file.path).copied().unwrap_or(0.0))
        }
    }

    struct BrokenSimilarity;

    #[async_trait]
    impl SimilarityScorer for BrokenSimilarity {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn similarity(&self, _: &QueryAnalysis, _: &FileRecord) -> Result<f64> {
            Err(Error::SignalUnavailable {
                signal: "broken".to_string(),
                message: "offline".to_string(),
            })
        }
    }

    fn store() -> RelevanceStore {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        RelevanceStore::new(StoreQueue::new(Arc::new(db), &StoreConfig::default()))
    }

    fn engine_with(store: RelevanceStore, similarity: Arc<dyn SimilarityScorer>) -> ScoringEngine {
        ScoringEngine::new(
            store,
            similarity,
            Arc::new(MtimeRecency),
            ScoringConfig::default(),
        )
    }

    fn no_similarity() -> Arc<dyn SimilarityScorer> {
        Arc::new(FixedSimilarity(HashMap::new()))
    }

    fn request<'a>(
        query: &'a QueryAnalysis,
        candidates: &'a [FileRecord],
        mode: TaskMode,
        level: ProgressiveLevel,
    ) -> ScoringRequest<'a> {
        ScoringRequest {
            query,
            candidates,
            conversation: None,
            current_file: None,
            task_mode: mode,
            level,
        }
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    #[tokio::test]
    async fn test_base_score_and_order() {
        let engine = engine_with(store(), no_similarity());
        let query = QueryAnalysis::default();
        let files = vec![FileRecord::new("z.rs", 10), FileRecord::new("a.rs", 10)];

        let scored = engine
            .score(request(&query, &files, TaskMode::General, ProgressiveLevel::Expanded))
            .await;
        let keys: Vec<&String> = scored.keys().collect();
        assert_eq!(keys, vec!["z.rs", "a.rs"]);
        assert_close(scored["a.rs"].score, 0.1);
        assert_close(scored["a.rs"].confidence, 0.5);
        assert!(scored["a.rs"].reasons.is_empty());
    }

    #[tokio::test]
    async fn test_viewed_files_dropped_at_level_one_and_halved_otherwise() {
        let engine = engine_with(store(), no_similarity());
        let query = QueryAnalysis::default();
        let files = vec![FileRecord::new("seen.rs", 10)];
        let conversation = ConversationState::with_viewed(["seen.rs"]);

        let mut req = request(&query, &files, TaskMode::General, ProgressiveLevel::Immediate);
        req.conversation = Some(&conversation);
        assert!(engine.score(req).await.is_empty());

        req.level = ProgressiveLevel::Expanded;
        let scored = engine.score(req).await;
        assert_close(scored["seen.rs"].score, 0.05);
        assert_eq!(scored["seen.rs"].reasons.len(), 1);
    }

    #[tokio::test]
    async fn test_similarity_and_confidence() {
        let sims = HashMap::from([("a.rs".to_string(), 0.8)]);
        let engine = engine_with(store(), Arc::new(FixedSimilarity(sims)));
        let query = QueryAnalysis::default();
        let files = vec![FileRecord::new("a.rs", 10)];

        let scored = engine
            .score(request(&query, &files, TaskMode::General, ProgressiveLevel::Expanded))
            .await;
        assert_close(scored["a.rs"].score, 0.1 + 0.8 * 0.25);
        assert_close(scored["a.rs"].confidence, 0.6);
    }

    #[tokio::test]
    async fn test_failing_signal_is_absent() {
        let engine = engine_with(store(), Arc::new(BrokenSimilarity));
        let query = QueryAnalysis::default();
        let files = vec![FileRecord::new("a.rs", 10)];

        let scored = engine
            .score(request(&query, &files, TaskMode::General, ProgressiveLevel::Expanded))
            .await;
        assert_close(scored["a.rs"].score, 0.1);
    }

    #[tokio::test]
    async fn test_debug_mode_signals() {
        let engine = engine_with(store(), no_similarity());
        let query = QueryAnalysis::default();
        let mut old = FileRecord::new("lib/errors.js", 10);
        old.mtime = chrono::Utc::now() - chrono::Duration::hours(100);
        let files = vec![FileRecord::new("src/app.js", 10), old];

        let scored = engine
            .score(request(&query, &files, TaskMode::Debug, ProgressiveLevel::Expanded))
            .await;
        // recent, no marker
        assert_close(scored["src/app.js"].score, 0.4);
        // stale, error marker
        assert_close(scored["lib/errors.js"].score, 0.3);
    }

    #[tokio::test]
    async fn test_feature_mode_concept_match() {
        let engine = engine_with(store(), no_similarity());
        let query = QueryAnalysis {
            concepts: ["auth".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let files = vec![
            FileRecord::new("src/Auth/login.js", 10),
            FileRecord::new("src/db.js", 10),
        ];

        let scored = engine
            .score(request(&query, &files, TaskMode::Feature, ProgressiveLevel::Expanded))
            .await;
        assert_close(scored["src/Auth/login.js"].score, 0.4);
        assert_close(scored["src/db.js"].score, 0.1);
    }

    #[tokio::test]
    async fn test_import_relationship_and_refactor_boost() {
        let engine = engine_with(store(), no_similarity());
        let query = QueryAnalysis::default();

        let mut current = FileRecord::new("src/app.js", 10);
        current.imports.push("./utils/helper".to_string());
        let helper = FileRecord::new("lib/utils/helper.ts", 10);
        let mut consumer = FileRecord::new("test/consumer.js", 10);
        consumer.imports.push("../src/app.js".to_string());
        let mut wrong_case = FileRecord::new("other/x.js", 10);
        wrong_case.imports.push("./App".to_string());
        let files = vec![current, helper, consumer, wrong_case];

        let mut req = request(&query, &files, TaskMode::General, ProgressiveLevel::Expanded);
        req.current_file = Some("src/app.js");
        let scored = engine.score(req).await;
        assert_close(scored["lib/utils/helper.ts"].score, 0.35);
        assert_close(scored["test/consumer.js"].score, 0.35);
        assert_close(scored["other/x.js"].score, 0.1);
        // the current file is not related to itself
        assert_close(scored["src/app.js"].score, 0.1);

        req.task_mode = TaskMode::Refactor;
        let scored = engine.score(req).await;
        assert_close(scored["lib/utils/helper.ts"].score, 0.75);
    }

    #[tokio::test]
    async fn test_cochange_and_path_similarity() {
        let store = store();
        store.record_relationship("src/a/b/x.rs", "src/a/b/y.rs", 20).await.unwrap();
        store.record_relationship("src/a/b/x.rs", "docs/z.md", 5).await.unwrap();
        let engine = engine_with(store, no_similarity());
        let query = QueryAnalysis::default();
        let files = vec![
            FileRecord::new("src/a/b/x.rs", 10),
            FileRecord::new("src/a/b/y.rs", 10),
            FileRecord::new("docs/z.md", 10),
            FileRecord::new("src/a/c/w.rs", 10),
        ];

        let mut req = request(&query, &files, TaskMode::General, ProgressiveLevel::Expanded);
        req.current_file = Some("src/a/b/x.rs");
        let scored = engine.score(req).await;

        // saturated co-change plus identical directories
        assert_close(scored["src/a/b/y.rs"].score, 0.1 + 0.15 + 0.1);
        assert_close(scored["docs/z.md"].score, 0.1 + 0.5 * 0.15);
        // 2 of 3 shared segments
        assert_close(scored["src/a/c/w.rs"].score, 0.1 + (2.0 / 3.0) * 0.1);
    }

    #[tokio::test]
    async fn test_level_one_cutoff_and_bounds() {
        let sims = HashMap::from([("hot.rs".to_string(), 1.0)]);
        let store = store();
        let engine = engine_with(store, Arc::new(FixedSimilarity(sims)));
        let query = QueryAnalysis {
            concepts: ["hot".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let files = vec![FileRecord::new("hot.rs", 10), FileRecord::new("cold.rs", 10)];

        let scored = engine
            .score(request(&query, &files, TaskMode::Feature, ProgressiveLevel::Immediate))
            .await;
        assert!(scored.contains_key("hot.rs"));
        assert!(!scored.contains_key("cold.rs"));
        for file in scored.values() {
            assert!((0.0..=1.0).contains(&file.score));
            assert!((0.0..=1.0).contains(&file.confidence));
        }
    }

    #[test]
    fn test_path_similarity() {
        assert_close(path_similarity("src/a/x.rs", "src/a/y.rs"), 1.0);
        assert_close(path_similarity("src/a/x.rs", "src/b/y.rs"), 0.5);
        assert_close(path_similarity("x.rs", "y.rs"), 0.0);
        assert_close(path_similarity("src/x.rs", "lib/deep/y.rs"), 0.0);
    }
}
