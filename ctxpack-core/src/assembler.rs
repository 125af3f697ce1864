//! Token-budget packing of scored files
//!
//! Packing is greedy over a stable descending sort, so equal scores keep the
//! order the scanner discovered the files in and two runs over the same input
//! always produce the same split.

use crate::config::AssemblyConfig;
use crate::types::{ScoredFile, Tier};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Why a scored file was left out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExclusionReason {
    #[serde(rename = "Score below threshold")]
    BelowThreshold,
    #[serde(rename = "Token budget exceeded")]
    BudgetExceeded,
}

impl ExclusionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExclusionReason::BelowThreshold => "Score below threshold",
            ExclusionReason::BudgetExceeded => "Token budget exceeded",
        }
    }
}

impl std::fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file packed into the context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncludedFile {
    #[serde(flatten)]
    pub file: ScoredFile,
    pub tokens: usize,
    pub tier: Tier,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcludedFile {
    pub path: String,
    pub score: f64,
    pub reason: ExclusionReason,
}

/// Result of one packing pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Assembly {
    pub included: Vec<IncludedFile>,
    pub excluded: Vec<ExcludedFile>,
    pub total_tokens: usize,
    /// Set when nothing cleared the relevance threshold and the top files
    /// were forced in
    pub low_score_warning: bool,
}

impl Assembly {
    pub fn included_paths(&self) -> Vec<String> {
        self.included.iter().map(|f| f.file.path.clone()).collect()
    }

    pub fn excluded_for(&self, reason: ExclusionReason) -> usize {
        self.excluded.iter().filter(|e| e.reason == reason).count()
    }
}

/// Packs scored files into a token budget.
#[derive(Debug, Clone, Default)]
pub struct ContextAssembler {
    config: AssemblyConfig,
}

impl ContextAssembler {
    pub fn new(config: AssemblyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AssemblyConfig {
        &self.config
    }

    /// Display tier from the final score alone.
    pub fn tier_for(&self, score: f64) -> Tier {
        if score >= self.config.essential_threshold {
            Tier::Essential
        } else if score >= self.config.recommended_threshold {
            Tier::Recommended
        } else {
            Tier::Optional
        }
    }

    /// Pack `scored` into `token_budget`.
    ///
    /// `token_costs` maps each path to its estimated cost; a path missing from
    /// it costs nothing. The current file, when scored, is always included
    /// first and counts against the budget.
    pub fn assemble(
        &self,
        scored: &IndexMap<String, ScoredFile>,
        token_costs: &HashMap<String, usize>,
        token_budget: usize,
        current_file: Option<&str>,
        min_relevance_score: f64,
    ) -> Assembly {
        let cost_of = |path: &str| token_costs.get(path).copied().unwrap_or(0);

        let mut ranked: Vec<&ScoredFile> = scored.values().collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));

        let mut assembly = Assembly::default();

        let current = current_file.and_then(|c| scored.get(c));
        if let Some(file) = current {
            let tokens = cost_of(&file.path);
            assembly.total_tokens = assembly.total_tokens.saturating_add(tokens);
            assembly.included.push(self.include(file, tokens));
        }

        for file in ranked.iter().filter(|f| Some(f.path.as_str()) != current_file) {
            let tokens = cost_of(&file.path);
            let reason = if assembly.total_tokens.saturating_add(tokens) > token_budget {
                Some(ExclusionReason::BudgetExceeded)
            } else if file.score <= min_relevance_score {
                Some(ExclusionReason::BelowThreshold)
            } else {
                None
            };

            match reason {
                None => {
                    assembly.total_tokens = assembly.total_tokens.saturating_add(tokens);
                    assembly.included.push(self.include(file, tokens));
                }
                Some(reason) => assembly.excluded.push(ExcludedFile {
                    path: file.path.clone(),
                    score: file.score,
                    reason,
                }),
            }
        }

        if assembly.included.is_empty() && !ranked.is_empty() {
            self.fallback(&mut assembly, &ranked, &cost_of, token_budget);
        }

        tracing::debug!(
            included = assembly.included.len(),
            excluded = assembly.excluded.len(),
            total_tokens = assembly.total_tokens,
            token_budget,
            low_score_warning = assembly.low_score_warning,
            "Context assembled"
        );
        assembly
    }

    /// Force the top-scored files in, ignoring the threshold but not the budget.
    fn fallback(
        &self,
        assembly: &mut Assembly,
        ranked: &[&ScoredFile],
        cost_of: &dyn Fn(&str) -> usize,
        token_budget: usize,
    ) {
        assembly.low_score_warning = true;

        for file in ranked {
            if assembly.included.len() >= self.config.fallback_max_files {
                break;
            }
            let tokens = cost_of(&file.path);
            if assembly.total_tokens.saturating_add(tokens) > token_budget {
                continue;
            }
            assembly.total_tokens = assembly.total_tokens.saturating_add(tokens);
            assembly.included.push(self.include(file, tokens));
            assembly.excluded.retain(|e| e.path != file.path);
        }

        tracing::info!(
            forced = assembly.included.len(),
            "No file cleared the relevance threshold; using top-scored fallback"
        );
    }

    fn include(&self, file: &ScoredFile, tokens: usize) -> IncludedFile {
        IncludedFile {
            file: file.clone(),
            tokens,
            tier: self.tier_for(file.score),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(entries: &[(&str, f64)]) -> IndexMap<String, ScoredFile> {
        entries
            .iter()
            .map(|(path, score)| (path.to_string(), ScoredFile::new(*path, *score, 0.5)))
            .collect()
    }

    fn costs(entries: &[(&str, usize)]) -> HashMap<String, usize> {
        entries.iter().map(|(p, c)| (p.to_string(), *c)).collect()
    }

    #[test]
    fn test_sorted_by_score_with_stable_ties() {
        let assembler = ContextAssembler::default();
        let files = scored(&[("c.rs", 0.4), ("b.rs", 0.9), ("a.rs", 0.4), ("d.rs", 0.4)]);

        let assembly = assembler.assemble(&files, &HashMap::new(), 100, None, 0.15);
        assert_eq!(assembly.included_paths(), vec!["b.rs", "c.rs", "a.rs", "d.rs"]);
        assert!(!assembly.low_score_warning);

        let again = assembler.assemble(&files, &HashMap::new(), 100, None, 0.15);
        assert_eq!(assembly, again);
    }

    #[test]
    fn test_zero_budget_keeps_only_current_file() {
        let assembler = ContextAssembler::default();
        let files = scored(&[("b.js", 0.9), ("a.js", 0.2), ("c.js", 0.7), ("d.js", 0.1)]);
        let token_costs = costs(&[("a.js", 50), ("b.js", 10), ("c.js", 10), ("d.js", 10)]);

        let assembly = assembler.assemble(&files, &token_costs, 0, Some("a.js"), 0.15);
        assert_eq!(assembly.included_paths(), vec!["a.js"]);
        assert_eq!(assembly.total_tokens, 50);
        assert_eq!(assembly.excluded.len(), 3);
        assert!(assembly
            .excluded
            .iter()
            .all(|e| e.reason == ExclusionReason::BudgetExceeded));
        assert!(!assembly.low_score_warning);
    }

    #[test]
    fn test_distinguishes_exclusion_reasons() {
        let assembler = ContextAssembler::default();
        let files = scored(&[("big.rs", 0.9), ("small.rs", 0.6), ("weak.rs", 0.1)]);
        let token_costs = costs(&[("big.rs", 80), ("small.rs", 30), ("weak.rs", 1)]);

        let assembly = assembler.assemble(&files, &token_costs, 100, None, 0.15);
        assert_eq!(assembly.included_paths(), vec!["big.rs"]);
        assert_eq!(assembly.total_tokens, 80);
        assert_eq!(assembly.excluded_for(ExclusionReason::BudgetExceeded), 1);
        assert_eq!(assembly.excluded_for(ExclusionReason::BelowThreshold), 1);
        assert_eq!(assembly.excluded[0].reason.as_str(), "Token budget exceeded");
        assert_eq!(assembly.excluded[1].reason.as_str(), "Score below threshold");
    }

    #[test]
    fn test_huge_costs_do_not_overflow() {
        let assembler = ContextAssembler::default();
        let files = scored(&[("cur.rs", 0.9), ("a.rs", 0.8), ("b.rs", 0.7)]);
        let token_costs = costs(&[("cur.rs", usize::MAX), ("a.rs", usize::MAX), ("b.rs", 1)]);

        let assembly = assembler.assemble(&files, &token_costs, 100, Some("cur.rs"), 0.15);
        assert_eq!(assembly.included_paths(), vec!["cur.rs"]);
        assert_eq!(assembly.total_tokens, usize::MAX);
        assert_eq!(assembly.excluded_for(ExclusionReason::BudgetExceeded), 2);
    }

    #[test]
    fn test_threshold_is_strict() {
        let assembler = ContextAssembler::default();
        let files = scored(&[("edge.rs", 0.15), ("above.rs", 0.16)]);

        let assembly = assembler.assemble(&files, &HashMap::new(), 100, None, 0.15);
        assert_eq!(assembly.included_paths(), vec!["above.rs"]);
        assert_eq!(assembly.excluded[0].reason, ExclusionReason::BelowThreshold);
    }

    #[test]
    fn test_low_scores_trigger_fallback() {
        let assembler = ContextAssembler::default();
        let files = scored(&[
            ("a.rs", 0.05),
            ("b.rs", 0.05),
            ("c.rs", 0.05),
            ("d.rs", 0.05),
            ("e.rs", 0.05),
            ("f.rs", 0.05),
        ]);

        let assembly = assembler.assemble(&files, &HashMap::new(), 1000, None, 0.15);
        assert!(assembly.low_score_warning);
        assert_eq!(
            assembly.included_paths(),
            vec!["a.rs", "b.rs", "c.rs", "d.rs", "e.rs"]
        );
        assert_eq!(assembly.excluded.len(), 1);
        assert_eq!(assembly.excluded[0].path, "f.rs");
    }

    #[test]
    fn test_fallback_respects_budget_and_size() {
        let config = AssemblyConfig {
            fallback_max_files: 2,
            ..Default::default()
        };
        let assembler = ContextAssembler::new(config);
        let files = scored(&[("huge.rs", 0.1), ("a.rs", 0.08), ("b.rs", 0.07), ("c.rs", 0.06)]);
        let token_costs = costs(&[("huge.rs", 500), ("a.rs", 10), ("b.rs", 10), ("c.rs", 10)]);

        let assembly = assembler.assemble(&files, &token_costs, 100, None, 0.15);
        assert!(assembly.low_score_warning);
        assert_eq!(assembly.included_paths(), vec!["a.rs", "b.rs"]);
        assert!(assembly.total_tokens <= 100);
    }

    #[test]
    fn test_tiers() {
        let assembler = ContextAssembler::default();
        assert_eq!(assembler.tier_for(0.8), Tier::Essential);
        assert_eq!(assembler.tier_for(0.79), Tier::Recommended);
        assert_eq!(assembler.tier_for(0.5), Tier::Recommended);
        assert_eq!(assembler.tier_for(0.49), Tier::Optional);
    }

    #[test]
    fn test_exclusion_reason_serializes_as_message() {
        let json = serde_json::to_string(&ExclusionReason::BudgetExceeded).unwrap();
        assert_eq!(json, "\"Token budget exceeded\"");
    }
}
