//! # ctxpack-core
//!
//! Core library for ctxpack - a context relevance engine for AI coding
//! assistants.
//!
//! Given a task description and the files of a project, ctxpack ranks the
//! files by relevance, packs the best of them into a token budget, and learns
//! from reported outcomes which files actually helped.
//!
//! This library provides:
//! - Domain types for candidate files, scored files and context sessions
//! - A multi-signal relevance scorer and a token-budget assembler
//! - A learning feedback loop over a SQLite store
//! - A bounded, timeout-guarded store queue with periodic snapshots
//! - Configuration management and logging infrastructure
//!
//! ## Pipeline
//!
//! ```text
//! request ─► ScoringEngine ─► ContextAssembler ─► ContextSession (persisted) ─► response
//!                 ▲                                        │
//!                 │                                  outcome report
//!          RelevanceStore ◄────── LearningLoop ◄──────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use ctxpack_core::{Config, ContextEngine, ContextRequest, FileRecord, Signals};
//!
//! # async fn run() -> ctxpack_core::Result<()> {
//! let config = Config::load()?;
//! let engine = ContextEngine::start(&config, Some(&Config::database_path()), Signals::default())?;
//!
//! let context = engine
//!     .get_optimal_context(ContextRequest {
//!         task: "fix the login crash".to_string(),
//!         project_files: vec![FileRecord::new("src/login.rs", 2048)],
//!         ..Default::default()
//!     })
//!     .await?;
//!
//! engine
//!     .record_session_outcome(context.session_id, true, vec!["src/login.rs".to_string()])
//!     .await?;
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use assembler::{Assembly, ContextAssembler, ExcludedFile, ExclusionReason, IncludedFile};
pub use config::Config;
pub use db::{Database, StoreQueue};
pub use engine::{ContextEngine, ContextRequest, OptimalContext, OutcomeSummary, Signals};
pub use error::{Error, Result};
pub use store::RelevanceStore;
pub use types::*;

// Public modules
pub mod assembler;
pub mod cache;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod feedback;
pub mod logging;
pub mod scoring;
pub mod signals;
pub mod store;
pub mod types;
