//! Mem OS: a memory governance engine for coding agents.
//!
//! **Mem OS is a local-first governance layer over a plain-markdown
//! memory workspace.**
//!
//! Agents record decisions, tasks, entities, and daily logs as typed
//! blocks; the engine continuously audits them for contradictions and
//! drift, and every mutation flows through a staged proposal that is
//! applied atomically: snapshot, write-ahead log, post-validation, and
//! rollback on any failure.
//!
//! # Core Principles
//!
//! - **Local-first**: all state is UTF-8 markdown plus two JSON files;
//!   nothing leaves the workspace directory
//! - **Deterministic**: scans, validation, and recall are pure functions
//!   of the corpus bytes and configuration
//! - **Append-oriented**: blocks are superseded or archived, never
//!   silently rewritten; daily logs only grow
//! - **Proposal-gated**: the apply engine is the single write path, and
//!   the governance mode decides how much of it runs unattended
//!
//! # Crate Structure
//!
//! - [`core`]: block model, parser, lock, WAL, snapshots, config, ACL,
//!   validator
//! - [`engine`]: integrity scanning, proposals, apply, capture,
//!   compaction, and the recall core

pub mod core;
pub mod engine;

use crate::core::error::MemosError;
use crate::core::mode::{check_transition, GovernanceMode};
use crate::core::workspace::Workspace;
use crate::engine::recall::{GraphMode, IndexCache, RecallOptions};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "memos",
    version = env!("CARGO_PKG_VERSION"),
    about = "Mem OS: local-first memory governance for coding agents"
)]
struct Cli {
    /// Workspace root (defaults to the current directory).
    #[clap(long, short = 'w', global = true)]
    workspace: Option<PathBuf>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scaffold a new workspace (idempotent)
    Init,
    /// Run the integrity scan (contradictions, drift, dead, orphans)
    Scan {
        #[clap(long)]
        json: bool,
    },
    /// Ranked recall over the memory corpus
    Recall {
        #[clap(long, short = 'q')]
        query: String,
        #[clap(long, short = 'l', default_value = "10")]
        limit: usize,
        #[clap(long)]
        active_only: bool,
        #[clap(long, default_value = "default")]
        agent: String,
        /// Graph boost: auto, on, or off
        #[clap(long, default_value = "auto")]
        graph: String,
        #[clap(long)]
        json: bool,
    },
    /// Capture decision-like language from today's daily log
    Capture {
        /// Date to scan (YYYY-MM-DD, defaults to today)
        #[clap(long)]
        date: Option<String>,
    },
    /// Record a signal in intelligence/SIGNALS.md
    Propose {
        #[clap(long = "type", default_value = "manual")]
        signal_type: String,
        #[clap(long)]
        source: String,
        #[clap(long)]
        excerpt: String,
    },
    /// Apply a staged proposal
    Apply {
        proposal_id: String,
        #[clap(long, default_value = "operator")]
        agent: String,
        #[clap(long)]
        dry_run: bool,
    },
    /// Restore the workspace from a receipt's snapshot
    Rollback { receipt_id: String },
    /// Run the structural validator
    Validate {
        #[clap(long)]
        json: bool,
    },
    /// Show or change the governance mode
    Mode {
        /// New mode: detect_only, propose, or enforce
        target: Option<String>,
    },
    /// Age out archived blocks, old logs, signals, and snapshots
    Compact,
    /// Summarize workspace state: mode, corpus size, staged proposals
    Status,
}

fn open_workspace(dir: &Option<PathBuf>) -> Result<Workspace, MemosError> {
    let root = match dir {
        Some(d) => d.clone(),
        None => std::env::current_dir()?,
    };
    Workspace::open(&root)
}

pub fn run() -> Result<(), MemosError> {
    let cli = Cli::parse();

    if let Command::Init = cli.command {
        let root = match &cli.workspace {
            Some(d) => d.clone(),
            None => std::env::current_dir()?,
        };
        let ws = Workspace::init(&root)?;
        println!(
            "{} workspace ready at {}",
            "✓".bright_green(),
            ws.root().display()
        );
        return Ok(());
    }

    let ws = open_workspace(&cli.workspace)?;

    match cli.command {
        Command::Init => unreachable!(),
        Command::Scan { json } => {
            let report = engine::integrity::scan(&ws)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "scan {}: {} critical, {} warnings",
                    report.date, report.critical, report.warnings
                );
                for c in &report.contradictions {
                    println!(
                        "  {} {} vs {} on {} (supersede candidate: {})",
                        "✗".bright_red(),
                        c.first,
                        c.second,
                        c.axis_key,
                        c.supersede_candidate
                    );
                }
                for d in &report.drift {
                    println!("  {} {} at {}:{}", "~".bright_yellow(), d.referenced, d.log_file, d.line);
                }
                for id in &report.dead {
                    println!("  {} dead decision {}", "·".bright_black(), id);
                }
                for id in &report.orphans {
                    println!("  {} orphan task {}", "·".bright_black(), id);
                }
                if !report.proposals_staged.is_empty() {
                    println!("  staged: {}", report.proposals_staged.join(", "));
                }
            }
        }
        Command::Recall {
            query,
            limit,
            active_only,
            agent,
            graph,
            json,
        } => {
            let graph = match graph.as_str() {
                "on" => GraphMode::On,
                "off" => GraphMode::Off,
                _ => GraphMode::Auto,
            };
            let opts = RecallOptions {
                limit,
                active_only,
                agent_id: agent,
                graph,
                deadline: None,
            };
            let mut cache = IndexCache::new();
            let result = engine::recall::recall(&ws, &mut cache, &query, &opts)?;
            let abstention = engine::recall::check_abstention(
                &query,
                &result.hits,
                ws.config.abstention.threshold,
            );
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "hits": result.hits,
                        "query_class": result.query_class,
                        "expanded_terms": result.expanded_terms,
                        "truncated": result.truncated,
                        "abstention": abstention,
                    }))?
                );
            } else if abstention.abstain {
                println!(
                    "{} (confidence {:.2})",
                    engine::recall::ABSTENTION_ANSWER.bright_yellow(),
                    abstention.confidence
                );
            } else {
                for hit in &result.hits {
                    println!(
                        "[{:.3}] {} ({}) - {}",
                        hit.score,
                        hit.block_id.bright_white(),
                        hit.kind,
                        hit.excerpt.chars().take(80).collect::<String>()
                    );
                    println!("        {}:{}", hit.source_file, hit.line);
                }
            }
        }
        Command::Capture { date } => {
            let date = match date {
                Some(d) => NaiveDate::parse_from_str(&d, "%Y-%m-%d")
                    .map_err(|e| MemosError::Validation(format!("bad date: {}", e)))?,
                None => Utc::now().date_naive(),
            };
            let written = engine::capture::capture(&ws, date)?;
            println!("capture: {} new signal(s)", written);
        }
        Command::Propose {
            signal_type,
            source,
            excerpt,
        } => {
            let corpus = ws.load_corpus()?;
            let id = engine::proposal::propose_signal(&ws, &corpus, &signal_type, &source, &excerpt)?;
            println!("signal recorded: {}", id);
        }
        Command::Apply {
            proposal_id,
            agent,
            dry_run,
        } => {
            let receipt = engine::apply::apply_proposal(&ws, &proposal_id, &agent, dry_run)?;
            if dry_run {
                println!("dry run OK for {}", proposal_id);
            } else {
                println!(
                    "{} {} → receipt {}",
                    "✓".bright_green(),
                    proposal_id,
                    receipt.id
                );
            }
        }
        Command::Rollback { receipt_id } => {
            let receipt = engine::apply::rollback(&ws, &receipt_id)?;
            println!("{} restored from {}", "✓".bright_green(), receipt_id);
            println!("  rollback receipt: {}", receipt.id);
        }
        Command::Validate { json } => {
            let corpus = ws.load_corpus()?;
            let issues = core::validate::validate_corpus(&corpus);
            if json {
                println!("{}", serde_json::to_string_pretty(&issues)?);
            } else if issues.is_empty() {
                println!("{} 0 issues", "✓".bright_green());
            } else {
                for issue in &issues {
                    println!(
                        "{:?} [{}] {}:{} {}",
                        issue.severity,
                        issue.check_id,
                        issue.file.display(),
                        issue.line,
                        issue.message
                    );
                }
                println!("TOTAL: {} issues", issues.len());
            }
            if !core::validate::is_clean(&issues) {
                return Err(MemosError::Validation("validation failed".into()));
            }
        }
        Command::Mode { target } => match target {
            None => println!("{}", ws.config.governance_mode),
            Some(target) => {
                let to = GovernanceMode::parse(&target).ok_or_else(|| {
                    MemosError::Validation(format!("unknown mode '{}'", target))
                })?;
                let state = ws.load_intel_state()?;
                let clean_days = state.clean_days(Utc::now().date_naive());
                check_transition(ws.config.governance_mode, to, clean_days)
                    .map_err(|e| MemosError::Validation(e.to_string()))?;
                let mut ws = ws;
                ws.config.governance_mode = to;
                ws.save_config()?;
                println!("{} mode → {}", "✓".bright_green(), to);
            }
        },
        Command::Compact => {
            let report = engine::compact::compact(&ws, Utc::now().date_naive())?;
            println!(
                "compact: {} blocks, {} logs, {} signals archived; {} snapshots removed",
                report.blocks_archived,
                report.logs_archived,
                report.signals_archived,
                report.snapshots_removed.len()
            );
        }
        Command::Status => {
            let corpus = ws.load_corpus()?;
            let state = ws.load_intel_state()?;
            let open = engine::proposal::load_proposals(&ws)?
                .iter()
                .filter(|p| p.status.is_open())
                .count();
            println!("mode: {}", ws.config.governance_mode);
            println!("blocks: {}", corpus.blocks.len());
            println!("open proposals: {}", open);
            println!(
                "last scan: {}",
                state.last_scan_ts.as_deref().unwrap_or("never")
            );
            println!(
                "last apply: {}",
                state.last_apply_ts.as_deref().unwrap_or("never")
            );
            if let Some(since) = &state.clean_since {
                println!("clean since: {}", since);
            }
        }
    }
    Ok(())
}
