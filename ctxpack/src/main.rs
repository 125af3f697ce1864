//! ctxpack - rank and pack project files into a token budget
//!
//! Thin command-line adapter over `ctxpack_core::ContextEngine`. State lives
//! in `$XDG_DATA_HOME/ctxpack/context.db` and is snapshotted on exit,
//! including on Ctrl-C and SIGTERM.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ctxpack_core::engine::EngineStats;
use ctxpack_core::{Config, ContextEngine, ContextRequest, OptimalContext, Signals};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;

#[derive(Parser)]
#[command(name = "ctxpack")]
#[command(about = "Token-budgeted, self-tuning context selection for AI coding assistants")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = Format::Text, global = true)]
    format: Format,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Rank project files for a task and pack them into a token budget
    Rank {
        /// JSON request file, or `-` for stdin
        #[arg(short, long)]
        request: PathBuf,
    },

    /// Report whether a ranked context helped
    Outcome {
        /// Session id returned by `rank`
        session_id: i64,

        #[arg(long, conflicts_with = "failure", required_unless_present = "failure")]
        success: bool,

        #[arg(long)]
        failure: bool,

        /// Files that were actually used, comma separated
        #[arg(long, value_delimiter = ',')]
        used: Vec<String>,
    },

    /// Record how often two files changed together in git history
    Relate {
        file_a: String,
        file_b: String,

        #[arg(long)]
        co_changes: i64,
    },

    /// List recent context sessions
    Sessions {
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// Show learning, queue and cache statistics
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load().context("failed to load configuration")?;

    // Initialize logging
    let _log_guard =
        ctxpack_core::logging::init(&config.logging).context("failed to initialize logging")?;

    let db_path = Config::database_path();
    let engine = ContextEngine::start(&config, Some(&db_path), Signals::default())
        .with_context(|| format!("failed to open store at {}", db_path.display()))?;

    let outcome = tokio::select! {
        result = run(&engine, args.command, args.format) => result,
        signal = shutdown_signal() => {
            tracing::info!(signal, "Interrupted; writing final snapshot");
            Err(anyhow::anyhow!("interrupted by {}", signal))
        }
    };

    engine
        .shutdown()
        .await
        .context("failed to write final snapshot")?;

    outcome
}

async fn run(engine: &ContextEngine, command: Command, format: Format) -> Result<()> {
    match command {
        Command::Rank { request } => {
            let request = read_request(&request).await?;
            let context = engine
                .get_optimal_context(request)
                .await
                .context("failed to rank context")?;
            match format {
                Format::Json => println!("{}", serde_json::to_string_pretty(&context)?),
                Format::Text => print_context(&context),
            }
        }

        Command::Outcome {
            session_id,
            success,
            failure,
            used,
        } => {
            let was_successful = success && !failure;
            let summary = engine
                .record_session_outcome(session_id, was_successful, used)
                .await
                .with_context(|| format!("failed to record outcome for session {}", session_id))?;
            match format {
                Format::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
                Format::Text => println!(
                    "Outcome recorded for session {}: {} file(s) updated, {} pair(s) reinforced",
                    summary.session_id, summary.files_updated, summary.pairs_reinforced
                ),
            }
        }

        Command::Relate {
            file_a,
            file_b,
            co_changes,
        } => {
            let relationship = engine
                .record_relationship(&file_a, &file_b, co_changes)
                .await
                .context("failed to record relationship")?;
            match format {
                Format::Json => println!("{}", serde_json::to_string_pretty(&relationship)?),
                Format::Text => println!(
                    "Related {} <-> {} (strength {:.2})",
                    relationship.file_a, relationship.file_b, relationship.strength
                ),
            }
        }

        Command::Sessions { limit } => {
            let sessions = engine
                .recent_sessions(limit)
                .await
                .context("failed to list sessions")?;
            if format == Format::Json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
                return Ok(());
            }
            if sessions.is_empty() {
                println!("No sessions recorded yet.");
                return Ok(());
            }
            for session in &sessions {
                let outcome = match session.outcome_success {
                    Some(true) => "success",
                    Some(false) => "failure",
                    None => "pending",
                };
                println!(
                    "#{:<5} {} [{}] {} file(s), {} tokens, {}: {}",
                    session.id,
                    session.timestamp.format("%Y-%m-%d %H:%M"),
                    session.task_mode,
                    session.included_files.len(),
                    session.total_tokens,
                    outcome,
                    session.task_description
                );
            }
        }

        Command::Stats => {
            let stats = engine.stats().await.context("failed to load stats")?;
            print_stats(&stats, format)?;
        }
    }
    Ok(())
}

/// Resolves with the name of the first process-exit signal received.
#[cfg(unix)]
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(error = %e, "Cannot listen for SIGTERM; only Ctrl-C is handled");
            let _ = tokio::signal::ctrl_c().await;
            return "SIGINT";
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "Ctrl-C"
}

async fn read_request(path: &Path) -> Result<ContextRequest> {
    let content = if path.as_os_str() == "-" {
        let mut buf = String::new();
        tokio::io::stdin()
            .read_to_string(&mut buf)
            .await
            .context("failed to read request from stdin")?;
        buf
    } else {
        tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read request file {}", path.display()))?
    };
    serde_json::from_str(&content).context("failed to parse request JSON")
}

fn print_context(context: &OptimalContext) {
    println!(
        "Session {} ({} mode): {} file(s), {}/{} tokens",
        context.session_id,
        context.task_mode,
        context.included.len(),
        context.total_tokens,
        context.token_budget
    );

    for file in &context.included {
        println!(
            "  [{:<11}] {:.2}  {:>6} tok  {}",
            file.tier.as_str(),
            file.file.score,
            file.tokens,
            file.file.path
        );
        for reason in &file.file.reasons {
            println!("                 - {}", reason);
        }
    }

    if !context.excluded.is_empty() {
        println!("Excluded:");
        for file in &context.excluded {
            println!("  {:.2}  {}  ({})", file.score, file.path, file.reason);
        }
    }

    if context.low_score_warning {
        println!("Warning: low-confidence context");
    }
    for suggestion in &context.suggestions {
        println!("Hint: {}", suggestion);
    }
}

fn print_stats(stats: &EngineStats, format: Format) -> Result<()> {
    let success_rate = stats.learning.success_rate();

    if format == Format::Json {
        let value = serde_json::json!({
            "sessions": stats.learning.total_sessions,
            "sessions_with_outcome": stats.learning.sessions_with_outcome,
            "success_rate": success_rate,
            "relevance_records": stats.learning.relevance_records,
            "relationships": stats.learning.relationships,
            "queue": {
                "total": stats.queue.total,
                "succeeded": stats.queue.succeeded,
                "failed": stats.queue.failed,
                "timed_out": stats.queue.timed_out,
                "average_wait_ms": stats.queue.average_wait().as_secs_f64() * 1000.0,
            },
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Sessions:          {}", stats.learning.total_sessions);
    println!("With outcome:      {}", stats.learning.sessions_with_outcome);
    match success_rate {
        Some(rate) => println!("Success rate:      {:.0}%", rate * 100.0),
        None => println!("Success rate:      n/a"),
    }
    println!("Relevance records: {}", stats.learning.relevance_records);
    println!("Relationships:     {}", stats.learning.relationships);
    println!(
        "Store queue:       {} ops, {} failed, {} timed out, avg wait {:.1}ms",
        stats.queue.total,
        stats.queue.failed,
        stats.queue.timed_out,
        stats.queue.average_wait().as_secs_f64() * 1000.0
    );
    Ok(())
}
