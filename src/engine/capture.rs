//! Auto-capture: surface decision-like language from daily logs as
//! signals.
//!
//! Writes ONLY to `intelligence/SIGNALS.md`. Captured signals become
//! formal decision or task blocks exclusively through the proposal
//! pipeline, which keeps extraction errors from poisoning the governed
//! corpus.

use crate::core::block::{BlockId, BlockKind};
use crate::core::error::MemosError;
use crate::core::workspace::{Workspace, SIGNALS_FILE};
use chrono::NaiveDate;
use regex::Regex;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::OnceLock;

/// Phrases that suggest a decision or task was made but not formalized.
const DECISION_PATTERNS: &[(&str, &str)] = &[
    (r"\bwe(?:'ll| will| decided| agreed| chose| went with)\b", "decision"),
    (r"\bdecided to\b", "decision"),
    (r"\blet'?s go with\b", "decision"),
    (r"\bgoing forward\b", "decision"),
    (r"\bfrom now on\b", "decision"),
    (r"\bswitching to\b", "decision"),
    (r"\bneed to\b", "task"),
    (r"\btodo\b", "task"),
    (r"\baction item\b", "task"),
    (r"\bfollow up\b", "task"),
    (r"\bdeadline\b", "task"),
    (r"\bby end of\b", "task"),
];

fn xref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[DT]-\d{8}-\d{3}\b").unwrap())
}

fn patterns() -> &'static Vec<(Regex, &'static str)> {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        DECISION_PATTERNS
            .iter()
            .map(|(p, t)| (Regex::new(&format!("(?i){}", p)).unwrap(), *t))
            .collect()
    })
}

#[derive(Debug, Clone)]
pub struct CapturedSignal {
    pub line: usize,
    pub signal_type: &'static str,
    pub excerpt: String,
}

/// Scan one day's log for uncaptured decision/task language. Lines that
/// already cross-reference a formal `D-`/`T-` block are skipped.
pub fn scan_log(content: &str) -> Vec<CapturedSignal> {
    let mut signals = Vec::new();
    for (i, line) in content.lines().enumerate() {
        let stripped = line.trim();
        if stripped.is_empty() || stripped.starts_with('#') {
            continue;
        }
        if xref_re().is_match(stripped) {
            continue;
        }
        for (re, signal_type) in patterns() {
            if re.is_match(stripped) {
                signals.push(CapturedSignal {
                    line: i + 1,
                    signal_type,
                    excerpt: stripped.chars().take(150).collect(),
                });
                break; // one match per line is enough
            }
        }
    }
    signals
}

/// Capture signals from `date`'s daily log into SIGNALS.md. Returns how
/// many new signals were appended (already-seen excerpts are skipped, and
/// the per-day ID space caps at 999).
pub fn capture(ws: &Workspace, date: NaiveDate) -> Result<usize, MemosError> {
    let log_path = ws.daily_log_path(date);
    if !log_path.is_file() {
        return Ok(0);
    }
    let content = std::fs::read_to_string(&log_path)?;
    let signals = scan_log(&content);
    if signals.is_empty() {
        return Ok(0);
    }

    let signals_path = ws.path(SIGNALS_FILE);
    let existing = std::fs::read_to_string(&signals_path).unwrap_or_default();

    let fresh: Vec<&CapturedSignal> = signals
        .iter()
        .filter(|s| {
            let probe: String = s.excerpt.chars().take(100).collect();
            !existing.contains(&probe)
        })
        .collect();
    if fresh.is_empty() {
        return Ok(0);
    }

    let corpus = ws.load_corpus()?;
    let mut counter = corpus.max_seq(BlockKind::Signal, date);
    let date_str = date.format("%Y-%m-%d").to_string();

    let mut out = String::new();
    let mut written = 0;
    for signal in &fresh {
        if counter >= 999 {
            break;
        }
        counter += 1;
        let id = BlockId::new_dated(BlockKind::Signal, date, counter);
        out.push_str(&format!("\n[{}]\n", id));
        out.push_str(&format!("Date: {}\n", date_str));
        out.push_str(&format!("Type: auto-capture-{}\n", signal.signal_type));
        out.push_str(&format!("Source: memory/{}.md:{}\n", date_str, signal.line));
        out.push_str("Status: pending\n");
        out.push_str(&format!("Excerpt: {}\n", signal.excerpt));
        written += 1;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&signals_path)?;
    file.write_all(out.as_bytes())?;
    file.sync_all()?;
    Ok(written)
}
