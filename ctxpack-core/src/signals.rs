//! External signal sources consumed by the scoring engine
//!
//! Similarity, recency and token cost come from collaborators outside the
//! engine. Each sits behind a trait so callers can plug in embeddings, git
//! history or a real tokenizer; the defaults here work from `FileRecord`
//! metadata alone.
//!
//! Async signal calls are wrapped by [`guarded`]: a failure or a missed
//! deadline becomes "signal absent" plus a `warn` event, never an error.

use crate::error::{Error, Result};
use crate::types::{FileRecord, QueryAnalysis};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

/// Semantic similarity between a query and a file, in `[0, 1]`.
#[async_trait]
pub trait SimilarityScorer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn similarity(&self, query: &QueryAnalysis, file: &FileRecord) -> Result<f64>;
}

/// Whether a file changed within the last `window_hours`.
#[async_trait]
pub trait RecencySource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn has_recent_changes(&self, file: &FileRecord, window_hours: u32) -> Result<bool>;
}

/// Token cost of including a file.
pub trait TokenEstimator: Send + Sync {
    fn estimate_tokens(&self, file: &FileRecord) -> usize;

    fn estimate_batch(&self, files: &[FileRecord]) -> Vec<usize> {
        files.iter().map(|f| self.estimate_tokens(f)).collect()
    }
}

/// Await a signal under `timeout`, absorbing failures.
///
/// Returns `None` (signal absent) when the source errors or overruns.
pub async fn guarded<T, F>(signal: &'static str, path: &str, timeout: Duration, fut: F) -> Option<T>
where
    F: Future<Output = Result<T>>,
{
    let outcome = match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => return Some(value),
        Ok(Err(e)) => e,
        Err(_) => Error::SignalUnavailable {
            signal: signal.to_string(),
            message: format!("timed out after {}ms", timeout.as_millis()),
        },
    };

    tracing::warn!(signal, path, error = %outcome, "Signal unavailable; treating as absent");
    None
}

// ============================================
// Default sources
// ============================================

/// Split an identifier or path into lowercase words
/// (`src/userService.ts` → `src`, `user`, `service`, `ts`).
fn words(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;

    for c in text.chars() {
        if !c.is_alphanumeric() {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower && !current.is_empty() {
            out.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase() || c.is_ascii_digit();
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Keyword overlap between the query and the file's names.
///
/// Jaccard similarity of the query's tokens and concepts against the words in
/// the file's path, functions, classes and exports.
#[derive(Debug, Default, Clone)]
pub struct KeywordSimilarity;

impl KeywordSimilarity {
    pub fn overlap(query: &QueryAnalysis, file: &FileRecord) -> f64 {
        let query_terms: HashSet<String> = query
            .tokens
            .iter()
            .chain(query.concepts.iter())
            .flat_map(|t| words(t))
            .filter(|w| w.len() > 1)
            .collect();

        let file_terms: HashSet<String> = std::iter::once(file.path.as_str())
            .chain(file.functions.iter().map(String::as_str))
            .chain(file.classes.iter().map(String::as_str))
            .chain(file.exports.iter().map(String::as_str))
            .flat_map(words)
            .filter(|w| w.len() > 1)
            .collect();

        if query_terms.is_empty() || file_terms.is_empty() {
            return 0.0;
        }

        let intersection = query_terms.intersection(&file_terms).count();
        let union = query_terms.union(&file_terms).count();
        intersection as f64 / union as f64
    }
}

#[async_trait]
impl SimilarityScorer for KeywordSimilarity {
    fn name(&self) -> &'static str {
        "keyword_similarity"
    }

    async fn similarity(&self, query: &QueryAnalysis, file: &FileRecord) -> Result<f64> {
        Ok(Self::overlap(query, file))
    }
}

/// Recency from the scanner-reported modification time.
#[derive(Debug, Default, Clone)]
pub struct MtimeRecency;

#[async_trait]
impl RecencySource for MtimeRecency {
    fn name(&self) -> &'static str {
        "mtime_recency"
    }

    async fn has_recent_changes(&self, file: &FileRecord, window_hours: u32) -> Result<bool> {
        let cutoff = Utc::now() - ChronoDuration::hours(i64::from(window_hours));
        Ok(file.mtime >= cutoff)
    }
}

/// Size-based estimate: roughly four bytes per token.
#[derive(Debug, Clone)]
pub struct ByteSizeEstimator {
    bytes_per_token: u64,
}

impl ByteSizeEstimator {
    pub fn new(bytes_per_token: u64) -> Self {
        Self {
            bytes_per_token: bytes_per_token.max(1),
        }
    }
}

impl Default for ByteSizeEstimator {
    fn default() -> Self {
        Self::new(4)
    }
}

impl TokenEstimator for ByteSizeEstimator {
    fn estimate_tokens(&self, file: &FileRecord) -> usize {
        let tokens = file.size.saturating_add(self.bytes_per_token - 1) / self.bytes_per_token;
        tokens.max(1) as usize
    }
}
