//! Integrity engine: contradiction, drift, dead-decision, orphan, and
//! impact analyses over the block corpus.
//!
//! Every pass is deterministic: same corpus bytes, same report. A scan
//! rewrites the `intelligence/` artifacts atomically, appends one entry
//! to `SCAN_LOG.md`, and in propose/enforce mode stages resolution
//! proposals under the configured budget.

use crate::core::block::{Block, BlockId, BlockKind, Enforcement, FieldValue, SigScope};
use crate::core::error::MemosError;
use crate::core::validate::{self, ValidationIssue};
use crate::core::workspace::{
    atomic_replace_write, Corpus, Workspace, CONTRADICTIONS_FILE, DRIFT_FILE, IMPACT_FILE,
    SCAN_LOG_FILE,
};
use crate::engine::proposal::{self, Proposal, ProposalType, StageOutcome};
use chrono::{NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::OnceLock;

fn block_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(?:D|T|PRJ|PER|TOOL|INC|C|DREF|SIG|P|I|B|S)-(?:\d{8}-)?\d{3}\b").unwrap()
    })
}

fn decision_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bD-\d{8}-\d{3}\b").unwrap())
}

/// Two hard constraints on the same axis with different objects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contradiction {
    pub axis_key: String,
    pub first: String,
    pub second: String,
    pub first_object: String,
    pub second_object: String,
    /// Loser of the tie-break; a supersede proposal targets this one.
    pub supersede_candidate: String,
    pub kept: String,
}

/// A decision reference in a daily log that resolves to nothing active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftRef {
    pub referenced: String,
    pub log_file: String,
    pub line: usize,
    pub excerpt: String,
}

#[derive(Debug, Default, Serialize)]
pub struct ScanReport {
    pub date: String,
    pub contradictions: Vec<Contradiction>,
    pub drift: Vec<DriftRef>,
    /// Active decisions with no inbound references past the threshold.
    pub dead: Vec<String>,
    /// Tasks whose `AlignsWith` resolves to nothing active.
    pub orphans: Vec<String>,
    /// Impact graph: decision ID → blocks referencing it.
    pub impact: BTreeMap<String, Vec<String>>,
    pub validation: Vec<ValidationIssue>,
    pub proposals_staged: Vec<String>,
    /// Low-risk proposals applied unattended (enforce mode only).
    pub auto_applied: Vec<String>,
    pub critical: usize,
    pub warnings: usize,
}

impl ScanReport {
    pub fn is_clean(&self) -> bool {
        self.critical == 0
    }
}

/// Resolution weight of a decision on one axis: (priority, scope
/// specificity, date). Higher wins.
fn tiebreak_weight(block: &Block, axis_key: &str) -> (u8, u8, NaiveDate) {
    let sig = block
        .signatures
        .iter()
        .find(|s| s.axis_key == axis_key);
    let priority = sig.and_then(|s| s.priority).unwrap_or(5);
    let specificity = sig
        .and_then(|s| s.scope)
        .map(|s| s.specificity())
        .unwrap_or(SigScope::Workspace.specificity());
    let date = block
        .date()
        .unwrap_or_else(|| NaiveDate::from_ymd_opt(1970, 1, 1).unwrap());
    (priority, specificity, date)
}

/// Pairwise contradiction detection over active decisions. Two signatures
/// contradict iff axis keys match, objects differ, and both are hard.
pub fn detect_contradictions(corpus: &Corpus) -> Vec<Contradiction> {
    let decisions: Vec<&Block> = corpus
        .blocks
        .iter()
        .filter(|b| b.kind() == BlockKind::Decision && b.status() == Some("active"))
        .collect();

    let mut found = Vec::new();
    for (i, a) in decisions.iter().enumerate() {
        for b in decisions.iter().skip(i + 1) {
            for sig_a in &a.signatures {
                if sig_a.enforcement != Enforcement::Hard {
                    continue;
                }
                for sig_b in &b.signatures {
                    if sig_b.enforcement != Enforcement::Hard {
                        continue;
                    }
                    if sig_a.axis_key != sig_b.axis_key || sig_a.object == sig_b.object {
                        continue;
                    }
                    let weight_a = tiebreak_weight(a, &sig_a.axis_key);
                    let weight_b = tiebreak_weight(b, &sig_b.axis_key);
                    let (kept, candidate) = if weight_a >= weight_b {
                        (a.id.as_str(), b.id.as_str())
                    } else {
                        (b.id.as_str(), a.id.as_str())
                    };
                    found.push(Contradiction {
                        axis_key: sig_a.axis_key.clone(),
                        first: a.id.as_str().to_string(),
                        second: b.id.as_str().to_string(),
                        first_object: object_text(&sig_a.object),
                        second_object: object_text(&sig_b.object),
                        supersede_candidate: candidate.to_string(),
                        kept: kept.to_string(),
                    });
                }
            }
        }
    }
    found
}

fn object_text(value: &FieldValue) -> String {
    match value {
        FieldValue::Scalar(s) => s.clone(),
        FieldValue::List(items) => format!("[{}]", items.join(", ")),
    }
}

/// Decision references in daily logs that no longer resolve to an active
/// decision.
pub fn detect_drift(ws: &Workspace, corpus: &Corpus) -> Result<Vec<DriftRef>, MemosError> {
    let mut drift = Vec::new();
    for (_date, path) in ws.daily_logs()? {
        let content = std::fs::read_to_string(&path)?;
        let rel = path
            .strip_prefix(ws.root())
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");
        for (lineno, line) in content.lines().enumerate() {
            for m in decision_ref_re().find_iter(line) {
                let referenced = m.as_str();
                let active = corpus
                    .get(referenced)
                    .is_some_and(|b| b.status() == Some("active"));
                if !active {
                    drift.push(DriftRef {
                        referenced: referenced.to_string(),
                        log_file: rel.clone(),
                        line: lineno + 1,
                        excerpt: line.trim().chars().take(150).collect(),
                    });
                }
            }
        }
    }
    Ok(drift)
}

/// Active decisions older than `threshold_days` with zero inbound
/// references in tasks, logs, or other decisions.
pub fn detect_dead(
    corpus: &Corpus,
    log_text: &str,
    today: NaiveDate,
    threshold_days: i64,
) -> Vec<String> {
    let mut referenced: BTreeSet<String> = BTreeSet::new();
    for block in &corpus.blocks {
        for (_, value) in &block.fields {
            for item in value.items() {
                for m in block_ref_re().find_iter(item) {
                    if m.as_str() != block.id.as_str() {
                        referenced.insert(m.as_str().to_string());
                    }
                }
            }
        }
    }
    for m in block_ref_re().find_iter(log_text) {
        referenced.insert(m.as_str().to_string());
    }

    corpus
        .blocks
        .iter()
        .filter(|b| b.kind() == BlockKind::Decision && b.status() == Some("active"))
        .filter(|b| {
            b.date()
                .map(|d| (today - d).num_days() >= threshold_days)
                .unwrap_or(false)
        })
        .filter(|b| !referenced.contains(b.id.as_str()))
        .map(|b| b.id.as_str().to_string())
        .collect()
}

/// Tasks whose `AlignsWith` does not resolve to an active decision.
pub fn detect_orphans(corpus: &Corpus) -> Vec<String> {
    corpus
        .blocks
        .iter()
        .filter(|b| b.kind() == BlockKind::Task && b.status() != Some("archived"))
        .filter(|b| {
            b.get_scalar("AlignsWith").is_some_and(|target| {
                !corpus
                    .get(target)
                    .is_some_and(|d| d.kind() == BlockKind::Decision && d.status() == Some("active"))
            })
        })
        .map(|b| b.id.as_str().to_string())
        .collect()
}

/// Directed impact edges: decision → blocks that reference it anywhere in
/// their fields.
pub fn build_impact_graph(corpus: &Corpus) -> BTreeMap<String, Vec<String>> {
    let mut graph: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for block in &corpus.blocks {
        if block.kind() == BlockKind::Decision {
            graph.entry(block.id.as_str().to_string()).or_default();
        }
    }
    for block in &corpus.blocks {
        for (_, value) in &block.fields {
            for item in value.items() {
                for m in decision_ref_re().find_iter(item) {
                    if m.as_str() == block.id.as_str() {
                        continue;
                    }
                    if let Some(edges) = graph.get_mut(m.as_str()) {
                        if !edges.contains(&block.id.as_str().to_string()) {
                            edges.push(block.id.as_str().to_string());
                        }
                    }
                }
            }
        }
    }
    graph
}

/// Run the full scan: all five passes, artifact rewrite, scan log entry,
/// and budgeted proposal generation when the mode allows it.
pub fn scan(ws: &Workspace) -> Result<ScanReport, MemosError> {
    let corpus = ws.load_corpus()?;
    let today = Utc::now().date_naive();
    scan_at(ws, &corpus, today)
}

/// Scan against an injected `today` so replays are reproducible in tests.
pub fn scan_at(
    ws: &Workspace,
    corpus: &Corpus,
    today: NaiveDate,
) -> Result<ScanReport, MemosError> {
    let mut log_text = String::new();
    for (_d, path) in ws.daily_logs()? {
        log_text.push_str(&std::fs::read_to_string(&path)?);
        log_text.push('\n');
    }

    let mut report = ScanReport {
        date: today.format("%Y-%m-%d").to_string(),
        contradictions: detect_contradictions(corpus),
        drift: detect_drift(ws, corpus)?,
        dead: detect_dead(corpus, &log_text, today, ws.config.dead_threshold_days),
        orphans: detect_orphans(corpus),
        impact: build_impact_graph(corpus),
        validation: validate::validate_corpus(corpus),
        proposals_staged: Vec::new(),
        auto_applied: Vec::new(),
        critical: 0,
        warnings: 0,
    };

    report.critical = report.contradictions.len()
        + report
            .validation
            .iter()
            .filter(|i| i.severity == validate::Severity::Fail)
            .count();
    report.warnings = report.drift.len() + report.dead.len() + report.orphans.len();

    write_contradictions(ws, &report, today)?;
    write_drift(ws, &report, today)?;
    write_impact(ws, &report)?;

    if ws.config.governance_mode.can_propose() {
        generate_proposals(ws, corpus, &mut report, today)?;
    }

    append_scan_log(ws, &report)?;
    update_clean_window(ws, &report, today)?;
    Ok(report)
}

fn write_contradictions(
    ws: &Workspace,
    report: &ScanReport,
    today: NaiveDate,
) -> Result<(), MemosError> {
    let mut out = String::from("# Contradictions\n");
    for (i, c) in report.contradictions.iter().enumerate() {
        let id = BlockId::new_dated(BlockKind::Contradiction, today, (i + 1) as u16);
        out.push_str(&format!("\n[{}]\n", id));
        out.push_str(&format!("Date: {}\n", report.date));
        out.push_str("Status: open\n");
        out.push_str(&format!("Axis: {}\n", c.axis_key));
        out.push_str(&format!("First: {} ({})\n", c.first, c.first_object));
        out.push_str(&format!("Second: {} ({})\n", c.second, c.second_object));
        out.push_str(&format!("Kept: {}\n", c.kept));
        out.push_str(&format!("SupersedeCandidate: {}\n", c.supersede_candidate));
    }
    atomic_replace_write(&ws.path(CONTRADICTIONS_FILE), out.as_bytes())
}

fn write_drift(ws: &Workspace, report: &ScanReport, today: NaiveDate) -> Result<(), MemosError> {
    let mut out = String::from("# Drift\n");
    for (i, d) in report.drift.iter().enumerate() {
        let id = BlockId::new_dated(BlockKind::Drift, today, (i + 1) as u16);
        out.push_str(&format!("\n[{}]\n", id));
        out.push_str(&format!("Date: {}\n", report.date));
        out.push_str("Status: open\n");
        out.push_str(&format!("Referenced: {}\n", d.referenced));
        out.push_str(&format!("Source: {}:{}\n", d.log_file, d.line));
        out.push_str(&format!("Excerpt: {}\n", d.excerpt));
    }
    atomic_replace_write(&ws.path(DRIFT_FILE), out.as_bytes())
}

fn write_impact(ws: &Workspace, report: &ScanReport) -> Result<(), MemosError> {
    let mut out = String::from("# Impact\n\n");
    for (decision, dependents) in &report.impact {
        out.push_str(&format!("- {} <- [{}]\n", decision, dependents.join(", ")));
    }
    atomic_replace_write(&ws.path(IMPACT_FILE), out.as_bytes())
}

fn append_scan_log(ws: &Workspace, report: &ScanReport) -> Result<(), MemosError> {
    let line = format!(
        "- {} TOTAL: {} critical, {} warnings ({} contradictions, {} drift, {} dead, {} orphans, {} proposals)\n",
        report.date,
        report.critical,
        report.warnings,
        report.contradictions.len(),
        report.drift.len(),
        report.dead.len(),
        report.orphans.len(),
        report.proposals_staged.len(),
    );
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(ws.path(SCAN_LOG_FILE))?;
    file.write_all(line.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// Track the clean-scan streak that gates mode upgrades.
fn update_clean_window(
    ws: &Workspace,
    report: &ScanReport,
    today: NaiveDate,
) -> Result<(), MemosError> {
    let mut state = ws.load_intel_state()?;
    if report.is_clean() {
        if state.clean_since.is_none() {
            state.clean_since = Some(today.format("%Y-%m-%d").to_string());
        }
    } else {
        state.clean_since = None;
    }
    state.last_scan_ts = Some(Utc::now().to_rfc3339());
    ws.save_intel_state(&state)
}

/// One proposal per issue, capped by `proposal_budget.per_run` and
/// `per_day`. Supersede resolutions are staged but never auto-applied.
fn generate_proposals(
    ws: &Workspace,
    corpus: &Corpus,
    report: &mut ScanReport,
    today: NaiveDate,
) -> Result<(), MemosError> {
    let budget = &ws.config.proposal_budget;
    let mut state = ws.load_intel_state()?;
    let today_str = today.format("%Y-%m-%d").to_string();
    if state.proposals_today.date != today_str {
        state.proposals_today.date = today_str;
        state.proposals_today.count = 0;
    }

    let mut staged_this_run: u32 = 0;
    let mut auto_candidates: Vec<String> = Vec::new();
    let mut next_seq = corpus.max_seq(BlockKind::Proposal, today);

    // Issues in severity order: contradictions, orphans, dead decisions.
    let mut wanted: Vec<(ProposalType, String, String, String, Vec<String>)> = Vec::new();
    for c in &report.contradictions {
        wanted.push((
            ProposalType::Supersede,
            c.supersede_candidate.clone(),
            c.kept.clone(),
            format!(
                "hard contradiction on {}: {} vs {}",
                c.axis_key, c.first_object, c.second_object
            ),
            vec![format!("{} vs {}", c.first, c.second)],
        ));
    }
    for t in &report.orphans {
        wanted.push((
            ProposalType::StatusChange,
            t.clone(),
            "blocked".to_string(),
            "task aligns with no active decision".to_string(),
            vec![format!("{} AlignsWith target inactive or missing", t)],
        ));
    }
    for d in &report.dead {
        wanted.push((
            ProposalType::Archive,
            d.clone(),
            "archived".to_string(),
            format!(
                "no inbound references for {} days",
                ws.config.dead_threshold_days
            ),
            vec![format!("{} unreferenced past threshold", d)],
        ));
    }

    for (ptype, target, action, reason, evidence) in wanted {
        if staged_this_run >= budget.per_run {
            break;
        }
        if state.proposals_today.count >= budget.per_day {
            break;
        }
        next_seq += 1;
        if next_seq > 999 {
            return Err(MemosError::CounterExhausted(format!(
                "proposal IDs exhausted for {}",
                today
            )));
        }
        let id = BlockId::new_dated(BlockKind::Proposal, today, next_seq);
        let prop = Proposal::new(
            id.clone(),
            today,
            ptype,
            &target,
            &action,
            &reason,
            evidence,
            None,
        );
        match proposal::stage(ws, &prop, today) {
            Ok(StageOutcome::Staged) => {
                staged_this_run += 1;
                state.proposals_today.count += 1;
                report.proposals_staged.push(id.as_str().to_string());
                if ptype.is_low_risk() {
                    auto_candidates.push(id.as_str().to_string());
                }
            }
            Ok(_) => {
                // Duplicate or cooling down; the seq was burned, which is
                // fine; IDs only need to be unique, not dense.
            }
            Err(MemosError::BudgetExceeded(_)) => break,
            Err(e) => return Err(e),
        }
    }

    ws.save_intel_state(&state)?;

    // Enforce mode applies low-risk proposals unattended. Supersedes
    // never qualify, and an apply-side failure (budget included) leaves
    // the proposal staged for the operator.
    if ws.config.governance_mode.can_auto_apply() {
        for id in auto_candidates {
            if crate::engine::apply::apply_proposal(ws, &id, "memos-auto", false).is_ok() {
                report.auto_applied.push(id);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::mode::GovernanceMode;
    use crate::core::workspace::{Workspace, DECISIONS_FILE, TASKS_FILE};

    fn decision(id: &str, date: &str, axis: &str, object: &str, extra_sig: &str) -> String {
        format!(
            "[{}]\nDate: {}\nStatus: active\nStatement: choose {}\nConstraintSignatures:\n  - axis.key: {}\n    relation: must_be\n    object: {}\n    enforcement: hard\n    domain: infra\n{}",
            id, date, object, axis, object, extra_sig
        )
    }

    fn ws_with(decisions: &str, tasks: &str) -> (tempfile::TempDir, Workspace) {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::init(tmp.path()).unwrap();
        std::fs::write(ws.path(DECISIONS_FILE), decisions).unwrap();
        std::fs::write(ws.path(TASKS_FILE), tasks).unwrap();
        (tmp, ws)
    }

    #[test]
    fn hard_axis_conflict_detected_once() {
        let decisions = format!(
            "{}\n\n{}",
            decision("D-20260101-001", "2026-01-01", "database.engine", "postgresql", ""),
            decision("D-20260105-001", "2026-01-05", "database.engine", "mysql", ""),
        );
        let (_tmp, ws) = ws_with(&decisions, "");
        let corpus = ws.load_corpus().unwrap();
        let found = detect_contradictions(&corpus);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].axis_key, "database.engine");
        // Priorities tie, scopes tie, newer date wins.
        assert_eq!(found[0].kept, "D-20260105-001");
        assert_eq!(found[0].supersede_candidate, "D-20260101-001");
    }

    #[test]
    fn priority_beats_recency() {
        let decisions = format!(
            "{}\n\n{}",
            decision(
                "D-20260101-001",
                "2026-01-01",
                "database.engine",
                "postgresql",
                "    priority: 9\n"
            ),
            decision(
                "D-20260105-001",
                "2026-01-05",
                "database.engine",
                "mysql",
                "    priority: 7\n"
            ),
        );
        let (_tmp, ws) = ws_with(&decisions, "");
        let corpus = ws.load_corpus().unwrap();
        let found = detect_contradictions(&corpus);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kept, "D-20260101-001");
        assert_eq!(found[0].supersede_candidate, "D-20260105-001");
    }

    #[test]
    fn soft_constraints_do_not_contradict() {
        let decisions = "[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: a\nConstraintSignatures:\n  - axis.key: api.style\n    object: rest\n    enforcement: soft\n    domain: api\n\n[D-20260102-001]\nDate: 2026-01-02\nStatus: active\nStatement: b\nConstraintSignatures:\n  - axis.key: api.style\n    object: grpc\n    enforcement: hard\n    domain: api\n";
        let (_tmp, ws) = ws_with(decisions, "");
        let corpus = ws.load_corpus().unwrap();
        assert!(detect_contradictions(&corpus).is_empty());
    }

    #[test]
    fn drift_flags_dangling_log_reference() {
        let (_tmp, ws) = ws_with(
            "[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: x\n",
            "",
        );
        let date = NaiveDate::from_ymd_opt(2026, 2, 13).unwrap();
        ws.append_daily_log(date, "Working per D-20260101-001 and the old D-20250101-001 plan\n")
            .unwrap();
        let corpus = ws.load_corpus().unwrap();
        let drift = detect_drift(&ws, &corpus).unwrap();
        assert_eq!(drift.len(), 1);
        assert_eq!(drift[0].referenced, "D-20250101-001");
    }

    #[test]
    fn dead_requires_age_and_silence() {
        let (_tmp, ws) = ws_with(
            "[D-20250101-001]\nDate: 2025-01-01\nStatus: active\nStatement: old quiet\n\n[D-20250102-001]\nDate: 2025-01-02\nStatus: active\nStatement: old referenced\n\n[D-20260210-001]\nDate: 2026-02-10\nStatus: active\nStatement: fresh\n",
            "[T-20260211-001]\nDate: 2026-02-11\nStatus: todo\nTitle: t\nAlignsWith: D-20250102-001\n",
        );
        let corpus = ws.load_corpus().unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 2, 13).unwrap();
        let dead = detect_dead(&corpus, "", today, 30);
        assert_eq!(dead, vec!["D-20250101-001".to_string()]);
    }

    #[test]
    fn impact_graph_collects_dependents() {
        let (_tmp, ws) = ws_with(
            "[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: x\n",
            "[T-20260102-001]\nDate: 2026-01-02\nStatus: todo\nTitle: t\nAlignsWith: D-20260101-001\n",
        );
        let corpus = ws.load_corpus().unwrap();
        let graph = build_impact_graph(&corpus);
        assert_eq!(
            graph.get("D-20260101-001"),
            Some(&vec!["T-20260102-001".to_string()])
        );
    }

    #[test]
    fn detect_only_mode_stages_nothing() {
        let decisions = format!(
            "{}\n\n{}",
            decision("D-20260101-001", "2026-01-01", "database.engine", "postgresql", ""),
            decision("D-20260105-001", "2026-01-05", "database.engine", "mysql", ""),
        );
        let (_tmp, ws) = ws_with(&decisions, "");
        let corpus = ws.load_corpus().unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 2, 13).unwrap();
        let report = scan_at(&ws, &corpus, today).unwrap();
        assert_eq!(report.contradictions.len(), 1);
        assert!(report.proposals_staged.is_empty());
        assert!(proposal::load_proposals(&ws).unwrap().is_empty());
    }

    #[test]
    fn propose_mode_stages_supersede_under_budget() {
        let decisions = format!(
            "{}\n\n{}",
            decision("D-20260101-001", "2026-01-01", "database.engine", "postgresql", ""),
            decision("D-20260105-001", "2026-01-05", "database.engine", "mysql", ""),
        );
        let (_tmp, mut_ws) = ws_with(&decisions, "");
        let mut ws = mut_ws;
        ws.config.governance_mode = GovernanceMode::Propose;
        let corpus = ws.load_corpus().unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 2, 13).unwrap();
        let report = scan_at(&ws, &corpus, today).unwrap();
        assert_eq!(report.proposals_staged.len(), 1);

        let staged = proposal::load_proposals(&ws).unwrap();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].proposal_type, ProposalType::Supersede);
        assert_eq!(staged[0].target, "D-20260101-001");
        assert_eq!(staged[0].action, "D-20260105-001");

        // Second scan: same issue, same fingerprint, no duplicate.
        let corpus = ws.load_corpus().unwrap();
        let report2 = scan_at(&ws, &corpus, today).unwrap();
        assert!(report2.proposals_staged.is_empty());
        assert_eq!(proposal::load_proposals(&ws).unwrap().len(), 1);
    }

    #[test]
    fn clean_scan_opens_clean_window() {
        let (_tmp, ws) = ws_with(
            "[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: x\n",
            "",
        );
        let corpus = ws.load_corpus().unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 2, 13).unwrap();
        let report = scan_at(&ws, &corpus, today).unwrap();
        assert!(report.is_clean());
        let state = ws.load_intel_state().unwrap();
        assert_eq!(state.clean_since.as_deref(), Some("2026-02-13"));
    }
}
