//! End-to-end apply pipeline: supersession, rollback fidelity, pre-check
//! guards, and serialized concurrent applies.

use chrono::NaiveDate;
use memos::core::block::{BlockId, BlockKind};
use memos::core::error::MemosError;
use memos::core::mode::GovernanceMode;
use memos::core::workspace::{Workspace, AUDIT_FILE, DECISIONS_FILE, TASKS_FILE};
use memos::engine::apply;
use memos::engine::proposal::{self, Proposal, ProposalStatus, ProposalType, StageOutcome};

const TODAY: fn() -> NaiveDate = || NaiveDate::from_ymd_opt(2026, 2, 13).unwrap();

fn propose_workspace() -> (tempfile::TempDir, Workspace) {
    let tmp = tempfile::tempdir().unwrap();
    let mut ws = Workspace::init(tmp.path()).unwrap();
    ws.config.governance_mode = GovernanceMode::Propose;
    ws.save_config().unwrap();
    (tmp, ws)
}

fn stage(ws: &Workspace, proposal: &Proposal) {
    assert_eq!(
        proposal::stage(ws, proposal, TODAY()).unwrap(),
        StageOutcome::Staged
    );
}

fn supersede_proposal(seq: u16, target: &str, patch: &str) -> Proposal {
    Proposal::new(
        BlockId::new_dated(BlockKind::Proposal, TODAY(), seq),
        TODAY(),
        ProposalType::Supersede,
        target,
        "supersede with successor block",
        "replaced by a newer decision",
        vec!["scan finding".to_string()],
        Some(patch.to_string()),
    )
}

fn status_proposal(seq: u16, target: &str, new_status: &str) -> Proposal {
    Proposal::new(
        BlockId::new_dated(BlockKind::Proposal, TODAY(), seq),
        TODAY(),
        ProposalType::StatusChange,
        target,
        new_status,
        "status observed in daily log",
        vec!["memory log".to_string()],
        None,
    )
}

#[test]
fn supersede_appends_successor_and_flips_predecessor() {
    let (_tmp, ws) = propose_workspace();
    std::fs::write(
        ws.path(DECISIONS_FILE),
        "# Decisions\n\n[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: Use REST everywhere\n",
    )
    .unwrap();

    let patch = "[D-20260213-002]\nDate: 2026-02-13\nStatus: active\nStatement: Use gRPC for internal services\n";
    stage(&ws, &supersede_proposal(1, "D-20260101-001", patch));

    let receipt = apply::apply_proposal(&ws, "P-20260213-001", "operator", false).unwrap();
    assert_eq!(receipt.result, memos::core::receipt::ApplyResult::Applied);

    let corpus = ws.load_corpus().unwrap();
    let old = corpus.get("D-20260101-001").unwrap();
    assert_eq!(old.status(), Some("superseded"));
    assert_eq!(old.get_scalar("SupersededBy"), Some("D-20260213-002"));
    let new = corpus.get("D-20260213-002").unwrap();
    assert_eq!(new.status(), Some("active"));

    // Audit receipt recorded, proposal marked applied.
    let audit = std::fs::read_to_string(ws.path(AUDIT_FILE)).unwrap();
    assert!(audit.contains(&format!("[AR-{}]", receipt.id)));
    assert!(audit.contains("Result: applied"));
    let staged = proposal::find_proposal(&ws, "P-20260213-001").unwrap();
    assert_eq!(staged.status, ProposalStatus::Applied);
}

#[test]
fn failed_post_check_rolls_back_byte_identical() {
    let (_tmp, ws) = propose_workspace();
    let pre_decisions = "# Decisions\n\n[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: keep this exact content\n";
    std::fs::write(ws.path(DECISIONS_FILE), pre_decisions).unwrap();

    // An invalid status survives staging but fails the post-check.
    stage(&ws, &status_proposal(1, "D-20260101-001", "not_a_status"));

    let err = apply::apply_proposal(&ws, "P-20260213-001", "operator", false);
    assert!(matches!(err, Err(MemosError::Validation(_))));

    let post_decisions = std::fs::read_to_string(ws.path(DECISIONS_FILE)).unwrap();
    assert_eq!(post_decisions, pre_decisions);

    let audit = std::fs::read_to_string(ws.path(AUDIT_FILE)).unwrap();
    assert!(audit.contains("Result: rolled_back"));
    let staged = proposal::find_proposal(&ws, "P-20260213-001").unwrap();
    assert_eq!(staged.status, ProposalStatus::Failed);
}

#[test]
fn dry_run_validates_without_mutation() {
    let (_tmp, ws) = propose_workspace();
    let pre = "# Decisions\n\n[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: stable\n";
    std::fs::write(ws.path(DECISIONS_FILE), pre).unwrap();
    stage(&ws, &status_proposal(1, "D-20260101-001", "archived"));

    let receipt = apply::apply_proposal(&ws, "P-20260213-001", "operator", true).unwrap();
    assert_eq!(receipt.action, "dry_run");

    assert_eq!(std::fs::read_to_string(ws.path(DECISIONS_FILE)).unwrap(), pre);
    // Proposal stays open after a dry run.
    let staged = proposal::find_proposal(&ws, "P-20260213-001").unwrap();
    assert_eq!(staged.status, ProposalStatus::Pending);
}

#[test]
fn detect_only_mode_rejects_apply() {
    let tmp = tempfile::tempdir().unwrap();
    let ws = Workspace::init(tmp.path()).unwrap();
    std::fs::write(
        ws.path(DECISIONS_FILE),
        "[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: x\n",
    )
    .unwrap();
    // Stage while still permitted, then check the gate at apply time.
    stage(&ws, &status_proposal(1, "D-20260101-001", "archived"));

    let err = apply::apply_proposal(&ws, "P-20260213-001", "operator", false);
    assert!(matches!(err, Err(MemosError::Validation(_))));
    assert_eq!(
        std::fs::read_to_string(ws.path(DECISIONS_FILE)).unwrap(),
        "[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: x\n"
    );
}

#[test]
fn acl_denial_is_a_pre_check() {
    let (_tmp, mut ws) = propose_workspace();
    std::fs::write(
        ws.path(DECISIONS_FILE),
        "[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: x\n",
    )
    .unwrap();
    stage(&ws, &status_proposal(1, "D-20260101-001", "archived"));

    // Restrict the ACL: no write grants at all.
    ws.acl = memos::core::acl::Acl { rules: vec![] };
    let err = apply::apply_proposal(&ws, "P-20260213-001", "intruder", false);
    assert!(matches!(err, Err(MemosError::AclDenied(_))));

    // No snapshot, no audit entry: pre-check failures leave no trace.
    let audit = std::fs::read_to_string(ws.path(AUDIT_FILE)).unwrap();
    assert!(!audit.contains("rolled_back"));
}

#[test]
fn daily_apply_budget_enforced() {
    let (_tmp, mut ws) = propose_workspace();
    ws.config.proposal_budget.per_day = 1;
    std::fs::write(
        ws.path(TASKS_FILE),
        "[T-20260101-001]\nDate: 2026-01-01\nStatus: todo\nTitle: a\n\n[T-20260101-002]\nDate: 2026-01-01\nStatus: todo\nTitle: b\n",
    )
    .unwrap();
    stage(&ws, &status_proposal(1, "T-20260101-001", "done"));
    stage(&ws, &status_proposal(2, "T-20260101-002", "done"));

    apply::apply_proposal(&ws, "P-20260213-001", "operator", false).unwrap();
    let err = apply::apply_proposal(&ws, "P-20260213-002", "operator", false);
    assert!(matches!(err, Err(MemosError::BudgetExceeded(_))));
}

#[test]
fn explicit_rollback_restores_pre_apply_bytes() {
    let (_tmp, ws) = propose_workspace();
    let pre = "# Decisions\n\n[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: original statement\n";
    std::fs::write(ws.path(DECISIONS_FILE), pre).unwrap();
    stage(&ws, &status_proposal(1, "D-20260101-001", "archived"));

    let receipt = apply::apply_proposal(&ws, "P-20260213-001", "operator", false).unwrap();
    assert_ne!(std::fs::read_to_string(ws.path(DECISIONS_FILE)).unwrap(), pre);

    apply::rollback(&ws, receipt.id.as_str()).unwrap();
    assert_eq!(std::fs::read_to_string(ws.path(DECISIONS_FILE)).unwrap(), pre);
}

#[test]
fn concurrent_applies_serialize_with_distinct_receipts() {
    let (_tmp, ws) = propose_workspace();
    std::fs::write(
        ws.path(TASKS_FILE),
        "[T-20260101-001]\nDate: 2026-01-01\nStatus: todo\nTitle: a\n\n[T-20260101-002]\nDate: 2026-01-01\nStatus: todo\nTitle: b\n",
    )
    .unwrap();
    stage(&ws, &status_proposal(1, "T-20260101-001", "done"));
    stage(&ws, &status_proposal(2, "T-20260101-002", "done"));

    let ws_a = ws.clone();
    let ws_b = ws.clone();
    let a = std::thread::spawn(move || {
        apply::apply_proposal(&ws_a, "P-20260213-001", "operator", false)
    });
    let b = std::thread::spawn(move || {
        apply::apply_proposal(&ws_b, "P-20260213-002", "operator", false)
    });
    let ra = a.join().unwrap().unwrap();
    let rb = b.join().unwrap().unwrap();
    assert_ne!(ra.id, rb.id);

    let corpus = ws.load_corpus().unwrap();
    assert_eq!(corpus.get("T-20260101-001").unwrap().status(), Some("done"));
    assert_eq!(corpus.get("T-20260101-002").unwrap().status(), Some("done"));
}
