//! Context engine: the operations exposed to protocol adapters
//!
//! [`ContextEngine::get_optimal_context`] runs the full ranking pipeline
//! (score → pack → persist session) and
//! [`ContextEngine::record_session_outcome`] closes the loop by feeding an
//! outcome back into the learned relevance.
//!
//! Ranking results are cached by request fingerprint. A cache hit skips
//! scoring and packing but still persists a fresh session, so every request
//! gets its own session id for outcome reporting. Any learning write clears
//! the cache.

use crate::assembler::{Assembly, ContextAssembler, ExcludedFile, ExclusionReason, IncludedFile};
use crate::cache::{CacheStats, ResultCache};
use crate::config::{AssemblyConfig, Config};
use crate::db::{
    spawn_snapshot_task, Database, LearningStats, QueueStats, SnapshotHandle, StoreQueue,
};
use crate::error::{Error, Result};
use crate::feedback::LearningLoop;
use crate::scoring::{ScoringEngine, ScoringRequest};
use crate::signals::{
    ByteSizeEstimator, KeywordSimilarity, MtimeRecency, RecencySource, SimilarityScorer,
    TokenEstimator,
};
use crate::store::RelevanceStore;
use crate::types::{
    ContextSession, ConversationState, FileRecord, FileRelationship, NewContextSession,
    ProgressiveLevel, QueryAnalysis, ScoredFile, TaskMode,
};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;

/// A ranking request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextRequest {
    /// Natural-language task description
    pub task: String,
    #[serde(default)]
    pub current_file: Option<String>,
    /// Token budget; the configured default when absent
    #[serde(default)]
    pub target_tokens: Option<usize>,
    #[serde(default)]
    pub project_files: Vec<FileRecord>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub conversation: Option<ConversationState>,
    #[serde(default)]
    pub progressive_level: ProgressiveLevel,
    /// Packing threshold; the configured default when absent
    #[serde(default)]
    pub min_relevance_score: Option<f64>,
    /// Pinned task mode; inferred from the query when absent
    #[serde(default)]
    pub task_mode: Option<TaskMode>,
    /// Pre-computed query analysis; derived from `task` when absent
    #[serde(default)]
    pub query: Option<QueryAnalysis>,
}

/// Response to a ranking request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimalContext {
    pub included: Vec<IncludedFile>,
    pub excluded: Vec<ExcludedFile>,
    pub total_tokens: usize,
    pub token_budget: usize,
    pub session_id: i64,
    pub task_mode: TaskMode,
    pub low_score_warning: bool,
    pub suggestions: Vec<String>,
}

/// Response to an outcome report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeSummary {
    pub success: bool,
    pub session_id: i64,
    pub files_updated: usize,
    pub pairs_reinforced: usize,
}

#[derive(Debug, Clone)]
pub struct EngineStats {
    pub learning: LearningStats,
    pub queue: QueueStats,
    pub cache: CacheStats,
}

/// External signal sources used by the engine.
#[derive(Clone)]
pub struct Signals {
    pub similarity: Arc<dyn SimilarityScorer>,
    pub recency: Arc<dyn RecencySource>,
    pub estimator: Arc<dyn TokenEstimator>,
}

impl Default for Signals {
    fn default() -> Self {
        Self {
            similarity: Arc::new(KeywordSimilarity),
            recency: Arc::new(MtimeRecency),
            estimator: Arc::new(ByteSizeEstimator::default()),
        }
    }
}

/// Everything a cache hit can reuse
#[derive(Debug, Clone)]
struct CachedRanking {
    assembly: Assembly,
    suggestions: Vec<String>,
}

pub struct ContextEngine {
    store: RelevanceStore,
    scoring: ScoringEngine,
    assembler: ContextAssembler,
    learning: LearningLoop,
    estimator: Arc<dyn TokenEstimator>,
    cache: ResultCache<u64, CachedRanking>,
    snapshots: tokio::sync::Mutex<Option<SnapshotHandle>>,
}

impl ContextEngine {
    pub fn new(store: RelevanceStore, config: &Config) -> Self {
        Self::with_signals(store, config, Signals::default())
    }

    pub fn with_signals(store: RelevanceStore, config: &Config, signals: Signals) -> Self {
        Self {
            scoring: ScoringEngine::new(
                store.clone(),
                signals.similarity,
                signals.recency,
                config.scoring.clone(),
            ),
            assembler: ContextAssembler::new(config.assembly.clone()),
            learning: LearningLoop::new(store.clone(), config.learning.clone()),
            estimator: signals.estimator,
            cache: ResultCache::from_config(&config.cache),
            snapshots: tokio::sync::Mutex::new(None),
            store,
        }
    }

    /// Open the store and start the engine.
    ///
    /// With a `database_path`, an existing snapshot is restored and periodic
    /// snapshots are written back to it; without one the store lives purely
    /// in memory. Must be called from within a tokio runtime.
    pub fn start(config: &Config, database_path: Option<&Path>, signals: Signals) -> Result<Self> {
        let db = match database_path {
            Some(path) => Database::open(path)?,
            None => Database::open_in_memory()?,
        };
        db.migrate()?;

        let queue = StoreQueue::new(Arc::new(db), &config.store);
        let snapshots = database_path
            .map(|_| spawn_snapshot_task(queue.clone(), config.store.snapshot_interval()));

        let mut engine = Self::with_signals(RelevanceStore::new(queue), config, signals);
        engine.snapshots = tokio::sync::Mutex::new(snapshots);

        tracing::info!(
            database = ?database_path,
            snapshot_interval_secs = config.store.snapshot_interval_secs,
            "Context engine started"
        );
        Ok(engine)
    }

    pub fn store(&self) -> &RelevanceStore {
        &self.store
    }

    pub fn assembly_config(&self) -> &AssemblyConfig {
        self.assembler.config()
    }

    /// Rank, pack and persist a context for `request`.
    pub async fn get_optimal_context(&self, request: ContextRequest) -> Result<OptimalContext> {
        let task = request.task.trim();
        if task.is_empty() {
            return Err(Error::Validation("task description is required".to_string()));
        }

        let config = self.assembler.config();
        let token_budget = request.target_tokens.unwrap_or(config.default_token_budget);
        let min_relevance_score = request
            .min_relevance_score
            .unwrap_or(config.min_relevance_score);
        if !(0.0..=1.0).contains(&min_relevance_score) {
            return Err(Error::Validation(format!(
                "min_relevance_score must be between 0 and 1, got {}",
                min_relevance_score
            )));
        }
        if let Some(file) = request.project_files.iter().find(|f| f.path.is_empty()) {
            return Err(Error::Validation(format!(
                "project file with empty path (size {})",
                file.size
            )));
        }

        let query = request
            .query
            .clone()
            .unwrap_or_else(|| QueryAnalysis::from_text(task));
        let task_mode = request.task_mode.unwrap_or_else(|| TaskMode::infer(&query));

        let key = fingerprint(&request, &query, task_mode, token_budget, min_relevance_score);
        let cached = key.and_then(|key| self.cache.get(&key));
        let ranking = match cached {
            Some(hit) => {
                tracing::debug!(key, "Ranking cache hit");
                hit
            }
            None => {
                let ranking = self
                    .rank(&request, &query, task_mode, token_budget, min_relevance_score)
                    .await;
                if let Some(key) = key {
                    self.cache.insert(key, ranking.clone());
                }
                ranking
            }
        };

        let assembly = ranking.assembly;
        let session = self
            .store
            .create_session(NewContextSession {
                conversation_id: request.conversation_id.clone(),
                task_type: query.task_type(),
                task_mode,
                task_description: task.to_string(),
                included_files: assembly.included_paths(),
                confidence_scores: assembly
                    .included
                    .iter()
                    .map(|f| (f.file.path.clone(), f.file.confidence))
                    .collect::<BTreeMap<_, _>>(),
                total_tokens: assembly.total_tokens as i64,
            })
            .await?;

        tracing::info!(
            session_id = session.id,
            task_mode = %task_mode,
            candidates = request.project_files.len(),
            included = assembly.included.len(),
            total_tokens = assembly.total_tokens,
            token_budget,
            "Context ranked"
        );

        Ok(OptimalContext {
            included: assembly.included,
            excluded: assembly.excluded,
            total_tokens: assembly.total_tokens,
            token_budget,
            session_id: session.id,
            task_mode,
            low_score_warning: assembly.low_score_warning,
            suggestions: ranking.suggestions,
        })
    }

    async fn rank(
        &self,
        request: &ContextRequest,
        query: &QueryAnalysis,
        task_mode: TaskMode,
        token_budget: usize,
        min_relevance_score: f64,
    ) -> CachedRanking {
        let current_file = request.current_file.as_deref();
        let mut scored = self
            .scoring
            .score(ScoringRequest {
                query,
                candidates: &request.project_files,
                conversation: request.conversation.as_ref(),
                current_file,
                task_mode,
                level: request.progressive_level,
            })
            .await;

        // The current file is never filtered out, even at level 1.
        if let Some(current) = current_file {
            let is_candidate = request.project_files.iter().any(|f| f.path == current);
            if is_candidate && !scored.contains_key(current) {
                let cfg = self.scoring.config();
                let mut file = ScoredFile::new(current, cfg.base_score, cfg.base_confidence);
                file.reasons.push("Current file".to_string());
                scored.insert(current.to_string(), file);
            }
        }

        let token_costs: HashMap<String, usize> = request
            .project_files
            .iter()
            .map(|f| f.path.clone())
            .zip(self.estimator.estimate_batch(&request.project_files))
            .collect();

        let assembly = self.assembler.assemble(
            &scored,
            &token_costs,
            token_budget,
            current_file,
            min_relevance_score,
        );
        let suggestions = suggestions(
            request,
            &assembly,
            scored.len(),
            token_budget,
            min_relevance_score,
        );

        CachedRanking {
            assembly,
            suggestions,
        }
    }

    /// Feed an outcome back into learned relevance.
    pub async fn record_session_outcome(
        &self,
        session_id: i64,
        was_successful: bool,
        files_actually_used: Vec<String>,
    ) -> Result<OutcomeSummary> {
        let applied = self
            .learning
            .record_outcome(session_id, was_successful, files_actually_used)
            .await?;
        self.cache.clear();

        Ok(OutcomeSummary {
            success: true,
            session_id,
            files_updated: applied.records.len(),
            pairs_reinforced: applied.pairs_reinforced,
        })
    }

    /// Record git co-change history for a file pair.
    pub async fn record_relationship(
        &self,
        file_a: &str,
        file_b: &str,
        git_co_change_count: i64,
    ) -> Result<FileRelationship> {
        let relationship = self
            .store
            .record_relationship(file_a, file_b, git_co_change_count)
            .await?;
        self.cache.clear();
        Ok(relationship)
    }

    pub async fn get_session(&self, session_id: i64) -> Result<ContextSession> {
        self.store.get_session(session_id).await
    }

    pub async fn recent_sessions(&self, limit: usize) -> Result<Vec<ContextSession>> {
        self.store.recent_sessions(limit).await
    }

    pub async fn stats(&self) -> Result<EngineStats> {
        Ok(EngineStats {
            learning: self.store.stats().await?,
            queue: self.store.queue_stats(),
            cache: self.cache.stats(),
        })
    }

    /// Stop periodic snapshots and write a final one.
    ///
    /// Returns whether a snapshot was written; an in-memory engine never writes.
    pub async fn shutdown(&self) -> Result<bool> {
        let handle = self.snapshots.lock().await.take();
        match handle {
            Some(handle) => handle.shutdown().await,
            None => Ok(false),
        }
    }
}

/// Cache key over everything that influences a ranking.
///
/// Candidates and the query are hashed through their JSON encoding so that
/// every field a signal can read is part of the key. `None` disables caching
/// for the request.
fn fingerprint(
    request: &ContextRequest,
    query: &QueryAnalysis,
    task_mode: TaskMode,
    token_budget: usize,
    min_relevance_score: f64,
) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    request.task.trim().hash(&mut hasher);
    request.current_file.hash(&mut hasher);
    token_budget.hash(&mut hasher);
    request.progressive_level.hash(&mut hasher);
    min_relevance_score.to_bits().hash(&mut hasher);
    task_mode.hash(&mut hasher);

    match serde_json::to_vec(query) {
        Ok(bytes) => bytes.hash(&mut hasher),
        Err(e) => {
            tracing::debug!(error = %e, "Query not hashable; skipping ranking cache");
            return None;
        }
    }
    match serde_json::to_vec(&request.project_files) {
        Ok(bytes) => bytes.hash(&mut hasher),
        Err(e) => {
            tracing::debug!(error = %e, "Candidates not hashable; skipping ranking cache");
            return None;
        }
    }

    if let Some(conversation) = &request.conversation {
        let mut viewed: Vec<&String> = conversation.files_viewed.iter().collect();
        viewed.sort();
        viewed.hash(&mut hasher);
    }
    Some(hasher.finish())
}

/// Human-readable hints about what the caller could change.
fn suggestions(
    request: &ContextRequest,
    assembly: &Assembly,
    scored_count: usize,
    token_budget: usize,
    min_relevance_score: f64,
) -> Vec<String> {
    let mut hints = Vec::new();

    if assembly.low_score_warning {
        hints.push(format!(
            "No file scored above {:.2}; the included files are the closest matches and may be only loosely related",
            min_relevance_score
        ));
    }

    if !request.project_files.is_empty() && assembly.included.is_empty() {
        hints.push(format!(
            "Nothing fit in the {}-token budget; raise the budget to include any files",
            token_budget
        ));
    }

    let over_budget = assembly.excluded_for(ExclusionReason::BudgetExceeded);
    if over_budget > 0 {
        hints.push(format!(
            "{} relevant file(s) did not fit in the {}-token budget",
            over_budget, token_budget
        ));
    }

    if request.progressive_level == ProgressiveLevel::Immediate {
        let hidden_viewed = request
            .conversation
            .as_ref()
            .map(|c| {
                request
                    .project_files
                    .iter()
                    .filter(|f| c.has_viewed(&f.path))
                    .filter(|f| request.current_file.as_deref() != Some(f.path.as_str()))
                    .count()
            })
            .unwrap_or(0);
        if hidden_viewed > 0 {
            hints.push(format!(
                "{} already-viewed file(s) were hidden; use progressive level 2 to revisit them",
                hidden_viewed
            ));
        }

        let filtered = request
            .project_files
            .len()
            .saturating_sub(scored_count + hidden_viewed);
        if filtered > 0 {
            hints.push(format!(
                "{} weaker candidate(s) were filtered at level 1; use level 2 or 3 for broader context",
                filtered
            ));
        }
    }

    hints
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn engine() -> ContextEngine {
        ContextEngine::start(&Config::default(), None, Signals::default()).unwrap()
    }

    fn request(task: &str, files: &[(&str, u64)]) -> ContextRequest {
        ContextRequest {
            task: task.to_string(),
            project_files: files.iter().map(|(p, s)| FileRecord::new(*p, *s)).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_empty_task_is_rejected() {
        let engine = engine().await;
        let err = engine
            .get_optimal_context(request("   ", &[("a.rs", 10)]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_each_request_gets_its_own_session() {
        let engine = engine().await;
        let req = request("explain the session storage", &[("src/session.rs", 400)]);

        let first = engine.get_optimal_context(req.clone()).await.unwrap();
        let second = engine.get_optimal_context(req).await.unwrap();
        assert_ne!(first.session_id, second.session_id);
        assert_eq!(
            first.included.iter().map(|f| &f.file.path).collect::<Vec<_>>(),
            second.included.iter().map(|f| &f.file.path).collect::<Vec<_>>()
        );
        assert_eq!(engine.stats().await.unwrap().cache.hits, 1);

        let session = engine.get_session(first.session_id).await.unwrap();
        assert_eq!(session.included_files, vec!["src/session.rs"]);
        assert_eq!(session.task_description, "explain the session storage");
    }

    #[tokio::test]
    async fn test_symbol_changes_miss_the_cache() {
        let engine = engine().await;
        let bare = request("explain token parsing", &[("src/lexer.rs", 400)]);
        let mut with_symbols = bare.clone();
        with_symbols.project_files[0].functions = vec!["parseToken".to_string()];

        let first = engine.get_optimal_context(bare).await.unwrap();
        let second = engine.get_optimal_context(with_symbols).await.unwrap();

        assert_eq!(engine.stats().await.unwrap().cache.hits, 0);
        assert!(second.included[0].file.score > first.included[0].file.score);
    }

    #[tokio::test]
    async fn test_outcome_clears_cache() {
        let engine = engine().await;
        let req = request("fix login crash", &[("src/login.rs", 400)]);
        let ctx = engine.get_optimal_context(req.clone()).await.unwrap();

        let summary = engine
            .record_session_outcome(ctx.session_id, true, vec!["src/login.rs".to_string()])
            .await
            .unwrap();
        assert!(summary.success);
        assert_eq!(summary.files_updated, 1);

        engine.get_optimal_context(req).await.unwrap();
        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.cache.hits, 0);
        assert_eq!(stats.learning.total_sessions, 2);
    }

    #[tokio::test]
    async fn test_task_mode_inferred_unless_pinned() {
        let engine = engine().await;
        let mut req = request("fix the crash in parser", &[("src/parser.rs", 10)]);
        let ctx = engine.get_optimal_context(req.clone()).await.unwrap();
        assert_eq!(ctx.task_mode, TaskMode::Debug);

        req.task_mode = Some(TaskMode::Refactor);
        let ctx = engine.get_optimal_context(req).await.unwrap();
        assert_eq!(ctx.task_mode, TaskMode::Refactor);
    }

    #[tokio::test]
    async fn test_level_one_keeps_current_file_and_suggests() {
        let engine = engine().await;
        let mut req = request("explain", &[("src/a.rs", 10), ("src/b.rs", 10)]);
        req.current_file = Some("src/a.rs".to_string());
        req.progressive_level = ProgressiveLevel::Immediate;
        req.conversation = Some(ConversationState::with_viewed(["src/a.rs", "src/b.rs"]));

        let ctx = engine.get_optimal_context(req).await.unwrap();
        let paths: Vec<&str> = ctx.included.iter().map(|f| f.file.path.as_str()).collect();
        assert_eq!(paths, vec!["src/a.rs"]);
        assert!(ctx.suggestions.iter().any(|s| s.contains("already-viewed")));
    }
}
