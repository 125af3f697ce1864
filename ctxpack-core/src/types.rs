//! Core domain types for ctxpack
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **FileRecord** | Scanner-supplied metadata for one candidate file |
//! | **QueryAnalysis** | Tokens, concepts and entities extracted from the task text |
//! | **Task mode** | Coarse intent (`debug`, `feature`, `refactor`, `general`) selecting which signals apply |
//! | **Task type** | Normalized intent string; part of the learned relevance key |
//! | **Progressive level** | Disclosure stage: 1 = strict, 2 = expanded, 3 = comprehensive |
//! | **Relevance record** | Learned score/confidence for a (file, task type, task mode) triple |
//! | **Context session** | One ranking decision, later closed by an outcome report |
//! | **Tier** | Display bucket derived purely from a file's final score |
//!
//! Request-side types (`FileRecord`, `QueryAnalysis`, `ConversationState`)
//! are produced by external collaborators and are immutable for the duration
//! of a request. Persisted types (`RelevanceRecord`, `FileRelationship`,
//! `ContextSession`) map one-to-one onto tables in [`crate::db::schema`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Clamp a score or confidence into `[0, 1]`.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

// ============================================
// Request inputs
// ============================================

/// Metadata for one candidate file, as produced by the file scanner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// Project-relative path, `/`-separated
    pub path: String,
    /// Size in bytes
    #[serde(default)]
    pub size: u64,
    /// Last modification time
    #[serde(default = "Utc::now")]
    pub mtime: DateTime<Utc>,
    /// Extension without the dot (e.g. "rs")
    #[serde(default)]
    pub extension: String,
    /// Module specifiers this file imports
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub exports: Vec<String>,
    #[serde(default)]
    pub functions: Vec<String>,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub has_tests: bool,
    /// Normalized complexity estimate in `[0, 1]`
    #[serde(default)]
    pub complexity: f64,
}

impl FileRecord {
    /// Create a record with only a path and size; used heavily in tests.
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        let path = path.into();
        let extension = path
            .rsplit('/')
            .next()
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.to_string())
            .unwrap_or_default();
        Self {
            path,
            size,
            mtime: Utc::now(),
            extension,
            imports: Vec::new(),
            exports: Vec::new(),
            functions: Vec::new(),
            classes: Vec::new(),
            has_tests: false,
            complexity: 0.0,
        }
    }

    /// File name without directories or extension.
    pub fn stem(&self) -> &str {
        path_stem(&self.path)
    }

    /// Directory segments leading to the file, excluding the file name.
    pub fn directories(&self) -> Vec<&str> {
        path_directories(&self.path)
    }
}

/// Stem of the last segment of a path or module specifier
/// (`./src/utils/helper.js` → `helper`).
pub fn path_stem(path: &str) -> &str {
    let name = path.rsplit(['/', '\\']).next().unwrap_or(path);
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    }
}

/// Directory segments of a path, skipping empty and `.` segments.
pub fn path_directories(path: &str) -> Vec<&str> {
    let mut segments: Vec<&str> = path
        .split(['/', '\\'])
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    segments.pop();
    segments
}

/// Named entities pulled out of the task text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryEntities {
    #[serde(default)]
    pub functions: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Output of the query-understanding collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryAnalysis {
    #[serde(default)]
    pub tokens: Vec<String>,
    /// Concepts are a set; iteration order is irrelevant to scoring
    #[serde(default)]
    pub concepts: BTreeSet<String>,
    #[serde(default)]
    pub intent: String,
    #[serde(default)]
    pub entities: QueryEntities,
    #[serde(default)]
    pub function_hints: Vec<String>,
    #[serde(default)]
    pub file_hints: Vec<String>,
}

/// Words too common to carry meaning in a task description
const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "into", "when", "where", "why", "how",
    "what", "are", "was", "its", "our", "all", "not", "but", "can", "should", "would", "please",
];

/// Leading verbs recognized as the request intent
const INTENT_VERBS: &[&str] = &[
    "fix", "debug", "add", "implement", "create", "build", "refactor", "rename", "cleanup",
    "understand", "explain", "test", "optimize", "update", "remove",
];

impl QueryAnalysis {
    /// Keyword-level analysis for callers that do not supply their own.
    ///
    /// Tokens are lowercased words; concepts are the non-stop-word tokens of
    /// four or more characters; the intent is the first recognized verb.
    /// File-like tokens (containing `.` or `/`) become file entities and
    /// `*Error` / `*Exception` words become error entities.
    pub fn from_text(text: &str) -> Self {
        let raw: Vec<&str> = text
            .split(|c: char| c.is_whitespace() || matches!(c, ',' | ';' | '(' | ')' | '"' | '\''))
            .map(|w| w.trim_matches(|c: char| matches!(c, '.' | ':' | '!' | '?')))
            .filter(|w| !w.is_empty())
            .collect();

        let mut analysis = QueryAnalysis::default();
        for word in raw {
            let lower = word.to_lowercase();

            if lower.contains('/') || (lower.contains('.') && !lower.ends_with('.')) {
                analysis.entities.files.push(word.to_string());
                analysis.file_hints.push(word.to_string());
            }
            if word.ends_with("Error") || word.ends_with("Exception") {
                analysis.entities.errors.push(word.to_string());
            }
            if word.ends_with("()") || word.contains("::") {
                analysis.function_hints.push(word.trim_end_matches("()").to_string());
            }

            if analysis.intent.is_empty() && INTENT_VERBS.contains(&lower.as_str()) {
                analysis.intent = lower.clone();
            }
            if lower.len() >= 4 && !STOP_WORDS.contains(&lower.as_str()) {
                analysis.concepts.insert(lower.clone());
            }
            if !STOP_WORDS.contains(&lower.as_str()) {
                analysis.tokens.push(lower);
            }
        }
        analysis
    }

    /// Normalized intent used as the `task_type` half of the learned key.
    pub fn task_type(&self) -> String {
        let intent = self.intent.trim().to_lowercase();
        if intent.is_empty() {
            "general".to_string()
        } else {
            intent
        }
    }
}

/// Conversation state owned by the conversation tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    #[serde(default)]
    pub files_viewed: HashSet<String>,
    #[serde(default)]
    pub current_task: Option<String>,
    #[serde(default)]
    pub task_progress: HashMap<String, serde_json::Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self {
            files_viewed: HashSet::new(),
            current_task: None,
            task_progress: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Conversation with the given files already viewed.
    pub fn with_viewed<I, S>(files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            files_viewed: files.into_iter().map(Into::into).collect(),
            ..Self::new()
        }
    }

    pub fn has_viewed(&self, path: &str) -> bool {
        self.files_viewed.contains(path)
    }
}

impl Default for ConversationState {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================
// Task mode and progressive level
// ============================================

/// Coarse request intent selecting the mode-specific scoring signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskMode {
    Debug,
    Feature,
    Refactor,
    General,
}

impl TaskMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskMode::Debug => "debug",
            TaskMode::Feature => "feature",
            TaskMode::Refactor => "refactor",
            TaskMode::General => "general",
        }
    }

    /// Infer a mode from the analyzed query when the caller did not pin one.
    ///
    /// Error entities always mean debugging; otherwise the intent keyword decides.
    pub fn infer(query: &QueryAnalysis) -> Self {
        if !query.entities.errors.is_empty() {
            return TaskMode::Debug;
        }

        let intent = query.intent.to_lowercase();
        let matches_any = |words: &[&str]| words.iter().any(|w| intent.contains(w));

        if matches_any(&["debug", "fix", "bug", "error", "crash"]) {
            TaskMode::Debug
        } else if matches_any(&["refactor", "restructure", "cleanup", "clean up", "rename"]) {
            TaskMode::Refactor
        } else if matches_any(&["feature", "add", "implement", "create", "build"]) {
            TaskMode::Feature
        } else {
            TaskMode::General
        }
    }
}

impl std::fmt::Display for TaskMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(TaskMode::Debug),
            "feature" => Ok(TaskMode::Feature),
            "refactor" => Ok(TaskMode::Refactor),
            "general" => Ok(TaskMode::General),
            _ => Err(format!("unknown task mode: {}", s)),
        }
    }
}

/// Progressive disclosure stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ProgressiveLevel {
    /// Strict: viewed files hidden, weak candidates pre-filtered
    Immediate,
    /// Viewed files discounted
    Expanded,
    Comprehensive,
}

impl ProgressiveLevel {
    pub fn as_u8(&self) -> u8 {
        match self {
            ProgressiveLevel::Immediate => 1,
            ProgressiveLevel::Expanded => 2,
            ProgressiveLevel::Comprehensive => 3,
        }
    }
}

impl TryFrom<u8> for ProgressiveLevel {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            1 => Ok(ProgressiveLevel::Immediate),
            2 => Ok(ProgressiveLevel::Expanded),
            3 => Ok(ProgressiveLevel::Comprehensive),
            _ => Err(format!("progressive level must be 1, 2 or 3, got {}", level)),
        }
    }
}

impl From<ProgressiveLevel> for u8 {
    fn from(level: ProgressiveLevel) -> Self {
        level.as_u8()
    }
}

impl Default for ProgressiveLevel {
    fn default() -> Self {
        ProgressiveLevel::Expanded
    }
}

// ============================================
// Scoring outputs
// ============================================

/// A candidate file after scoring. Created fresh per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredFile {
    pub path: String,
    /// Final relevance in `[0, 1]`
    pub score: f64,
    /// Confidence in the score, `[0, 1]`
    pub confidence: f64,
    /// Human-readable explanations, in signal order
    pub reasons: Vec<String>,
}

impl ScoredFile {
    pub fn new(path: impl Into<String>, score: f64, confidence: f64) -> Self {
        Self {
            path: path.into(),
            score: clamp_unit(score),
            confidence: clamp_unit(confidence),
            reasons: Vec::new(),
        }
    }
}

/// Display bucket for an included file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Essential,
    Recommended,
    Optional,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Essential => "essential",
            Tier::Recommended => "recommended",
            Tier::Optional => "optional",
        }
    }
}

// ============================================
// Persisted entities
// ============================================

/// Learned relevance for a (file, task type, task mode) triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelevanceRecord {
    pub file_path: String,
    pub task_type: String,
    pub task_mode: TaskMode,
    pub relevance_score: f64,
    pub confidence: f64,
    pub success_count: i64,
    pub total_count: i64,
    pub last_updated: DateTime<Utc>,
}

impl RelevanceRecord {
    pub const DEFAULT_SCORE: f64 = 0.5;
    pub const DEFAULT_CONFIDENCE: f64 = 0.5;

    /// The record assumed for a key that has never been learned.
    pub fn neutral(file_path: &str, task_type: &str, task_mode: TaskMode) -> Self {
        Self {
            file_path: file_path.to_string(),
            task_type: task_type.to_string(),
            task_mode,
            relevance_score: Self::DEFAULT_SCORE,
            confidence: Self::DEFAULT_CONFIDENCE,
            success_count: 0,
            total_count: 0,
            last_updated: Utc::now(),
        }
    }
}

/// Relatedness between two files. The pair is unordered; it is stored with
/// `file_a < file_b`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRelationship {
    pub file_a: String,
    pub file_b: String,
    pub co_occurrence_count: i64,
    pub git_co_change_count: i64,
    pub strength: f64,
}

impl FileRelationship {
    /// Order a pair so the unordered key has one canonical form.
    pub fn normalize_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    /// Combined strength from git co-changes and successful co-usage.
    pub fn compute_strength(git_co_change_count: i64, co_occurrence_count: i64) -> f64 {
        let git = (git_co_change_count.max(0) as f64 / 10.0).min(1.0);
        let usage = (co_occurrence_count.max(0) as f64 / 5.0).min(1.0);
        clamp_unit(0.7 * git + 0.3 * usage)
    }

    /// The other side of the pair, if `path` is part of it.
    pub fn other(&self, path: &str) -> Option<&str> {
        if self.file_a == path {
            Some(&self.file_b)
        } else if self.file_b == path {
            Some(&self.file_a)
        } else {
            None
        }
    }
}

/// Fields captured when a ranking decision is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewContextSession {
    pub conversation_id: Option<String>,
    pub task_type: String,
    pub task_mode: TaskMode,
    pub task_description: String,
    pub included_files: Vec<String>,
    pub confidence_scores: BTreeMap<String, f64>,
    pub total_tokens: i64,
}

/// A persisted ranking decision and, once reported, its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSession {
    /// Monotonic row id
    pub id: i64,
    pub conversation_id: Option<String>,
    pub task_type: String,
    pub task_mode: TaskMode,
    pub task_description: String,
    pub included_files: Vec<String>,
    pub confidence_scores: BTreeMap<String, f64>,
    /// `None` until an outcome is reported
    pub outcome_success: Option<bool>,
    pub files_actually_used: Vec<String>,
    pub total_tokens: i64,
    pub timestamp: DateTime<Utc>,
}

impl ContextSession {
    pub fn has_outcome(&self) -> bool {
        self.outcome_success.is_some()
    }
}
