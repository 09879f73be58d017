//! Apply engine: pre-check → snapshot → WAL-journaled mutation →
//! post-check → commit or rollback.
//!
//! Exactly one proposal per apply, no cascading. The whole pipeline runs
//! under the workspace lock; pre-check failures surface before any
//! snapshot or journal entry exists, and every failure after `begin`
//! restores the touched files byte-identically from the snapshot.

use crate::core::block::{BlockKind, FieldValue};
use crate::core::error::MemosError;
use crate::core::lock::{self, DEFAULT_LOCK_TIMEOUT};
use crate::core::parser;
use crate::core::receipt::{
    allocate_receipt_id, append_receipt, ApplyResult, Receipt, ReceiptId,
};
use crate::core::snapshot;
use crate::core::validate;
use crate::core::wal::{TouchedPath, Wal};
use crate::core::workspace::{
    atomic_replace_write, Corpus, Workspace, DECISIONS_FILE, MEMORY_DIR, TASKS_FILE,
};
use crate::engine::integrity;
use crate::engine::proposal::{self, Proposal, ProposalStatus, ProposalType};
use chrono::Utc;
use std::collections::BTreeSet;
use std::path::Path;

/// One planned file rewrite, staged fully in memory before any byte
/// touches disk.
#[derive(Debug, Clone)]
struct FileMutation {
    rel_path: String,
    new_content: String,
}

/// Apply a staged proposal on behalf of `agent_id`.
///
/// With `dry_run` the pipeline stops after the pre-check and mutation
/// planning: nothing is written, no receipt is persisted, and the
/// returned receipt carries action `dry_run`.
pub fn apply_proposal(
    ws: &Workspace,
    proposal_id: &str,
    agent_id: &str,
    dry_run: bool,
) -> Result<Receipt, MemosError> {
    let _lock = lock::acquire(ws.root(), DEFAULT_LOCK_TIMEOUT)?;

    // ── Pre-check: nothing below this section mutates state. ──
    let prop = proposal::find_proposal(ws, proposal_id)?;
    if !prop.status.is_open() {
        return Err(MemosError::Validation(format!(
            "proposal {} is {}, not applicable",
            proposal_id,
            prop.status.as_str()
        )));
    }
    if !ws.config.governance_mode.can_apply() {
        return Err(MemosError::Validation(format!(
            "governance mode {} does not permit apply",
            ws.config.governance_mode
        )));
    }

    let mut state = ws.load_intel_state()?;
    let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();
    if state.applies_today.date != today {
        state.applies_today.date = today.clone();
        state.applies_today.count = 0;
    }
    if state.applies_today.count >= ws.config.proposal_budget.per_day {
        return Err(MemosError::BudgetExceeded(format!(
            "daily apply budget ({}) exhausted",
            ws.config.proposal_budget.per_day
        )));
    }

    // A second open proposal with the same fingerprint is a staging bug;
    // refuse rather than guess which one the operator meant.
    let duplicates = proposal::load_proposals(ws)?
        .into_iter()
        .filter(|p| {
            p.fingerprint == prop.fingerprint && p.status.is_open() && p.id != prop.id
        })
        .count();
    if duplicates > 0 {
        return Err(MemosError::Validation(format!(
            "duplicate open proposal for ({}, {})",
            prop.target, prop.action
        )));
    }

    let corpus = ws.load_corpus()?;
    let mutations = plan_mutation(ws, &corpus, &prop)?;

    for m in &mutations {
        let resolved = ws.resolve_contained(&m.rel_path)?;
        let rel = resolved
            .strip_prefix(ws.root())
            .map_err(|_| MemosError::PathTraversal(m.rel_path.clone()))?
            .to_string_lossy()
            .replace('\\', "/");
        if !ws.acl.can_write(agent_id, &rel) {
            return Err(MemosError::AclDenied(format!(
                "agent {} may not write {}",
                agent_id, rel
            )));
        }
        // Daily logs accept only appends, even through a proposal.
        if rel.starts_with(MEMORY_DIR) {
            let current = std::fs::read_to_string(&resolved).unwrap_or_default();
            if !m.new_content.as_bytes().starts_with(current.as_bytes()) {
                return Err(MemosError::AppendOnlyViolation(format!(
                    "proposal {} would rewrite daily log {}",
                    proposal_id, rel
                )));
            }
        }
    }

    if dry_run {
        return Ok(Receipt {
            id: allocate_receipt_id()?,
            date: today,
            proposal_id: proposal_id.to_string(),
            action: "dry_run".to_string(),
            result: ApplyResult::Applied,
            snapshot_id: None,
            diff: None,
        });
    }

    // Baseline for the new-violation comparison in the post-check.
    let pre_issues = issue_keys(&corpus);

    // ── Receipt, snapshot, journal. ──
    let receipt_id = allocate_receipt_id()?;
    let touched: Vec<String> = mutations.iter().map(|m| m.rel_path.clone()).collect();
    snapshot::take(ws, &receipt_id, &touched)?;

    let mut wal = Wal::open(ws)?;
    let mut journal_entries = Vec::with_capacity(mutations.len());
    for m in &mutations {
        journal_entries.push(TouchedPath {
            path: m.rel_path.clone(),
            pre_hash: snapshot::file_hash(&ws.path(&m.rel_path))?,
            post_hash: snapshot::sha256_hex(m.new_content.as_bytes()),
        });
    }
    wal.begin(&receipt_id, &journal_entries)?;

    // ── Execute. ──
    let exec_result: Result<(), MemosError> = (|| {
        for m in &mutations {
            atomic_replace_write(&ws.path(&m.rel_path), m.new_content.as_bytes())?;
        }
        post_check(ws, &pre_issues)
    })();

    match exec_result {
        Ok(()) => {
            let diff = unified_diff(ws, &receipt_id, &touched)?;
            wal.commit(&receipt_id)?;
            let receipt = Receipt {
                id: receipt_id.clone(),
                date: today,
                proposal_id: proposal_id.to_string(),
                action: prop.proposal_type.as_str().to_string(),
                result: ApplyResult::Applied,
                snapshot_id: Some(receipt_id.clone()),
                diff: Some(diff),
            };
            append_receipt(ws, &receipt)?;
            proposal::set_status(ws, proposal_id, ProposalStatus::Applied)?;
            state.applies_today.count += 1;
            state.last_apply_ts = Some(Utc::now().to_rfc3339());
            ws.save_intel_state(&state)?;
            Ok(receipt)
        }
        Err(e) => {
            snapshot::restore(ws, &receipt_id)?;
            wal.rollback(&receipt_id)?;
            let receipt = Receipt {
                id: receipt_id.clone(),
                date: Utc::now().format("%Y-%m-%d").to_string(),
                proposal_id: proposal_id.to_string(),
                action: prop.proposal_type.as_str().to_string(),
                result: ApplyResult::RolledBack,
                snapshot_id: Some(receipt_id.clone()),
                diff: None,
            };
            append_receipt(ws, &receipt)?;
            proposal::set_status(ws, proposal_id, ProposalStatus::Failed)?;
            Err(e)
        }
    }
}

/// Restore the workspace from a prior receipt's snapshot.
pub fn rollback(ws: &Workspace, receipt_id: &str) -> Result<Receipt, MemosError> {
    let _lock = lock::acquire(ws.root(), DEFAULT_LOCK_TIMEOUT)?;
    let id = ReceiptId::parse(receipt_id)
        .ok_or_else(|| MemosError::Validation(format!("malformed receipt id {}", receipt_id)))?;
    snapshot::restore(ws, &id)?;
    let receipt = Receipt {
        id: allocate_receipt_id()?,
        date: Utc::now().format("%Y-%m-%d").to_string(),
        proposal_id: "-".to_string(),
        action: "rollback".to_string(),
        result: ApplyResult::RolledBack,
        snapshot_id: Some(id),
        diff: None,
    };
    append_receipt(ws, &receipt)?;
    Ok(receipt)
}

/// Translate a proposal into the single block-granular mutation it
/// implies. Pure planning: reads the corpus, writes nothing.
fn plan_mutation(
    ws: &Workspace,
    corpus: &Corpus,
    prop: &Proposal,
) -> Result<Vec<FileMutation>, MemosError> {
    match prop.proposal_type {
        ProposalType::NewDecision => plan_append_new(ws, corpus, prop, DECISIONS_FILE, BlockKind::Decision),
        ProposalType::NewTask => plan_append_new(ws, corpus, prop, TASKS_FILE, BlockKind::Task),
        ProposalType::Supersede => plan_supersede(ws, corpus, prop),
        ProposalType::StatusChange => {
            plan_field_edit(ws, corpus, &prop.target, &[("Status", prop.action.clone())])
        }
        ProposalType::Archive => {
            plan_field_edit(ws, corpus, &prop.target, &[("Status", "archived".to_string())])
        }
        ProposalType::Merge => {
            let survivor = corpus.get(&prop.action).ok_or_else(|| {
                MemosError::NotFound(format!("merge survivor {}", prop.action))
            })?;
            if survivor.kind() != target_kind(corpus, &prop.target)? {
                return Err(MemosError::Validation(format!(
                    "merge of {} into {} crosses kinds",
                    prop.target, prop.action
                )));
            }
            plan_field_edit(
                ws,
                corpus,
                &prop.target,
                &[
                    ("Status", "archived".to_string()),
                    ("MergedInto", prop.action.clone()),
                ],
            )
        }
    }
}

fn target_kind(corpus: &Corpus, id: &str) -> Result<BlockKind, MemosError> {
    corpus
        .get(id)
        .map(|b| b.kind())
        .ok_or_else(|| MemosError::NotFound(format!("block {}", id)))
}

/// Append the proposal's patch block to `file`, validating its ID is new
/// and of the right kind.
fn plan_append_new(
    ws: &Workspace,
    corpus: &Corpus,
    prop: &Proposal,
    file: &str,
    kind: BlockKind,
) -> Result<Vec<FileMutation>, MemosError> {
    let patch = prop.patch.as_deref().ok_or_else(|| {
        MemosError::Validation(format!("{} proposal carries no patch block", prop.id))
    })?;
    let parsed = parser::parse_str(patch, Path::new(file));
    let [block] = parsed.blocks.as_slice() else {
        return Err(MemosError::Validation(format!(
            "{} patch must contain exactly one block",
            prop.id
        )));
    };
    if block.kind() != kind {
        return Err(MemosError::Validation(format!(
            "{} patch declares a {:?}, expected {:?}",
            prop.id,
            block.kind(),
            kind
        )));
    }
    if corpus.contains(block.id.as_str()) {
        return Err(MemosError::Validation(format!(
            "{} patch re-declares existing ID {}",
            prop.id, block.id
        )));
    }
    let current = std::fs::read_to_string(ws.path(file)).unwrap_or_default();
    let mut new_content = current;
    if !new_content.ends_with('\n') && !new_content.is_empty() {
        new_content.push('\n');
    }
    new_content.push('\n');
    new_content.push_str(patch.trim_end());
    new_content.push('\n');
    Ok(vec![FileMutation {
        rel_path: file.to_string(),
        new_content,
    }])
}

/// Supersede: append the successor (from the patch, or reference an
/// existing decision via `action`), then flip the predecessor to
/// `superseded` with a back-reference.
fn plan_supersede(
    ws: &Workspace,
    corpus: &Corpus,
    prop: &Proposal,
) -> Result<Vec<FileMutation>, MemosError> {
    let old = corpus
        .get(&prop.target)
        .ok_or_else(|| MemosError::NotFound(format!("supersede target {}", prop.target)))?;
    if old.kind() != BlockKind::Decision {
        return Err(MemosError::Validation(format!(
            "supersede target {} is not a decision",
            prop.target
        )));
    }
    if old.status() != Some("active") {
        return Err(MemosError::Validation(format!(
            "supersede target {} is not active",
            prop.target
        )));
    }

    let (successor_id, patch) = match (&prop.patch, prop.action.as_str()) {
        (Some(patch), _) => {
            let parsed = parser::parse_str(patch, Path::new(DECISIONS_FILE));
            let [block] = parsed.blocks.as_slice() else {
                return Err(MemosError::Validation(format!(
                    "{} supersede patch must contain exactly one block",
                    prop.id
                )));
            };
            if block.kind() != BlockKind::Decision {
                return Err(MemosError::Validation(format!(
                    "{} supersede patch is not a decision",
                    prop.id
                )));
            }
            if corpus.contains(block.id.as_str()) {
                return Err(MemosError::Validation(format!(
                    "{} supersede patch re-declares {}",
                    prop.id, block.id
                )));
            }
            (block.id.as_str().to_string(), Some(patch.clone()))
        }
        (None, successor) => {
            let existing = corpus.get(successor).ok_or_else(|| {
                MemosError::Validation(format!(
                    "supersede without patch needs an existing successor, got '{}'",
                    successor
                ))
            })?;
            if existing.kind() != BlockKind::Decision || existing.status() != Some("active") {
                return Err(MemosError::Validation(format!(
                    "supersede successor {} is not an active decision",
                    successor
                )));
            }
            (successor.to_string(), None)
        }
    };

    // Rebuild the decisions file: flip the predecessor in place, then
    // append the successor if it is new.
    let content = std::fs::read_to_string(ws.path(DECISIONS_FILE))?;
    let outcome = parser::parse_str(&content, Path::new(DECISIONS_FILE));
    let mut blocks = outcome.blocks;
    let target = blocks
        .iter_mut()
        .find(|b| b.id.as_str() == prop.target)
        .ok_or_else(|| MemosError::NotFound(format!("supersede target {}", prop.target)))?;
    target.set_field("Status", FieldValue::Scalar("superseded".to_string()));
    target.set_field("SupersededBy", FieldValue::Scalar(successor_id));

    let mut new_content = String::from("# Decisions\n\n");
    new_content.push_str(&parser::serialize_blocks(&blocks));
    if let Some(patch) = patch {
        new_content.push('\n');
        new_content.push_str(patch.trim_end());
        new_content.push('\n');
    }
    Ok(vec![FileMutation {
        rel_path: DECISIONS_FILE.to_string(),
        new_content,
    }])
}

/// Rewrite one block's fields in its source file; no other block changes.
fn plan_field_edit(
    ws: &Workspace,
    corpus: &Corpus,
    target_id: &str,
    edits: &[(&str, String)],
) -> Result<Vec<FileMutation>, MemosError> {
    let target = corpus
        .get(target_id)
        .ok_or_else(|| MemosError::NotFound(format!("block {}", target_id)))?;
    let rel = target.source_file.to_string_lossy().replace('\\', "/");
    let content = std::fs::read_to_string(ws.path(&rel))?;
    let outcome = parser::parse_str(&content, Path::new(rel.as_str()));
    let mut blocks = outcome.blocks;
    let block = blocks
        .iter_mut()
        .find(|b| b.id.as_str() == target_id)
        .ok_or_else(|| MemosError::NotFound(format!("block {}", target_id)))?;
    for (key, value) in edits {
        block.set_field(key, FieldValue::Scalar(value.clone()));
    }
    let heading = content
        .lines()
        .next()
        .filter(|l| l.starts_with('#') && !l.contains('['))
        .map(|l| format!("{}\n\n", l))
        .unwrap_or_default();
    let mut new_content = heading;
    new_content.push_str(&parser::serialize_blocks(&blocks));
    Ok(vec![FileMutation {
        rel_path: rel,
        new_content,
    }])
}

/// Keys identifying validation issues and contradictions so the
/// post-check can tell new violations from pre-existing ones.
fn issue_keys(corpus: &Corpus) -> BTreeSet<String> {
    let mut keys = BTreeSet::new();
    for issue in validate::validate_corpus(corpus) {
        if issue.severity == validate::Severity::Fail {
            keys.insert(format!("{}|{}", issue.check_id, issue.message));
        }
    }
    for c in integrity::detect_contradictions(corpus) {
        keys.insert(format!("CONTRADICTION|{}|{}|{}", c.axis_key, c.first, c.second));
    }
    keys
}

/// Re-parse the workspace and fail if the mutation introduced any
/// violation that did not exist pre-apply.
fn post_check(ws: &Workspace, pre_issues: &BTreeSet<String>) -> Result<(), MemosError> {
    let corpus = ws.load_corpus()?;
    let post = issue_keys(&corpus);
    let new: Vec<&String> = post.difference(pre_issues).collect();
    if new.is_empty() {
        return Ok(());
    }
    Err(MemosError::Validation(format!(
        "apply introduced {} new violation(s): {}",
        new.len(),
        new.iter()
            .take(3)
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    )))
}

/// Unified diff of every touched file against its snapshot copy, written
/// into the snapshot directory as `DIFF.txt` and embedded in the receipt.
fn unified_diff(
    ws: &Workspace,
    receipt_id: &ReceiptId,
    touched: &[String],
) -> Result<String, MemosError> {
    let manifest = snapshot::load_manifest(ws, receipt_id)?;
    let snap_dir = ws.snapshots_dir().join(receipt_id.as_str());
    let mut out = String::new();
    for rel in touched {
        let old = manifest
            .files
            .iter()
            .find(|e| e.path == *rel && e.existed)
            .map(|e| std::fs::read_to_string(snap_dir.join(&e.path)))
            .transpose()?
            .unwrap_or_default();
        let new = std::fs::read_to_string(ws.path(rel)).unwrap_or_default();
        if old == new {
            continue;
        }
        let patch = diffy::create_patch(&old, &new);
        out.push_str(&format!("# {}\n{}\n", rel, patch));
    }
    atomic_replace_write(&snap_dir.join("DIFF.txt"), out.as_bytes())?;
    Ok(out)
}
