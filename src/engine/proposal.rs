//! Staged proposals: the only path by which anything mutates the corpus.
//!
//! A proposal is itself a `P` block in
//! `intelligence/proposed/PROPOSALS_PROPOSED.md`. Staging enforces the
//! backlog limit, the per-day budget, fingerprint de-duplication, and the
//! cooldown on recently rejected/deferred targets. Execution lives in
//! [`crate::engine::apply`].

use crate::core::block::{Block, BlockId, BlockKind, FieldValue};
use crate::core::error::MemosError;
use crate::core::parser;
use crate::core::workspace::{Corpus, Workspace, PROPOSED_FILE, SIGNALS_FILE};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalType {
    NewDecision,
    NewTask,
    Supersede,
    StatusChange,
    Merge,
    Archive,
}

impl ProposalType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new_decision" => Some(ProposalType::NewDecision),
            "new_task" => Some(ProposalType::NewTask),
            "supersede" => Some(ProposalType::Supersede),
            "status_change" => Some(ProposalType::StatusChange),
            "merge" => Some(ProposalType::Merge),
            "archive" => Some(ProposalType::Archive),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalType::NewDecision => "new_decision",
            ProposalType::NewTask => "new_task",
            ProposalType::Supersede => "supersede",
            ProposalType::StatusChange => "status_change",
            ProposalType::Merge => "merge",
            ProposalType::Archive => "archive",
        }
    }

    /// Low-risk proposals may auto-apply in enforce mode. Supersedes and
    /// merges never qualify.
    pub fn is_low_risk(&self) -> bool {
        matches!(
            self,
            ProposalType::NewTask | ProposalType::StatusChange | ProposalType::Archive
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Approved,
    Applied,
    Rejected,
    Deferred,
    Failed,
}

impl ProposalStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ProposalStatus::Pending),
            "approved" => Some(ProposalStatus::Approved),
            "applied" => Some(ProposalStatus::Applied),
            "rejected" => Some(ProposalStatus::Rejected),
            "deferred" => Some(ProposalStatus::Deferred),
            "failed" => Some(ProposalStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Pending => "pending",
            ProposalStatus::Approved => "approved",
            ProposalStatus::Applied => "applied",
            ProposalStatus::Rejected => "rejected",
            ProposalStatus::Deferred => "deferred",
            ProposalStatus::Failed => "failed",
        }
    }

    /// Counts against the staged backlog.
    pub fn is_open(&self) -> bool {
        matches!(self, ProposalStatus::Pending | ProposalStatus::Approved)
    }
}

/// A staged mutation, convertible to and from its `P` block form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: BlockId,
    pub date: String,
    pub proposal_type: ProposalType,
    pub target: String,
    pub action: String,
    pub reason: String,
    pub status: ProposalStatus,
    pub evidence: Vec<String>,
    pub fingerprint: String,
    /// Serialized block content for `new_*` and `supersede` proposals.
    pub patch: Option<String>,
}

impl Proposal {
    /// Deterministic content fingerprint used for duplicate suppression.
    pub fn compute_fingerprint(ptype: ProposalType, target: &str, action: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(ptype.as_str().as_bytes());
        hasher.update(b"\x1f");
        hasher.update(target.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(action.as_bytes());
        format!("{:x}", hasher.finalize())[..16].to_string()
    }

    pub fn new(
        id: BlockId,
        date: NaiveDate,
        proposal_type: ProposalType,
        target: &str,
        action: &str,
        reason: &str,
        evidence: Vec<String>,
        patch: Option<String>,
    ) -> Self {
        Proposal {
            id,
            date: date.format("%Y-%m-%d").to_string(),
            proposal_type,
            target: target.to_string(),
            action: action.to_string(),
            reason: reason.to_string(),
            status: ProposalStatus::Pending,
            evidence,
            fingerprint: Self::compute_fingerprint(proposal_type, target, action),
            patch,
        }
    }

    pub fn from_block(block: &Block) -> Option<Self> {
        if block.kind() != BlockKind::Proposal {
            return None;
        }
        let proposal_type = ProposalType::parse(block.get_scalar("Type")?)?;
        let status = ProposalStatus::parse(block.get_scalar("Status")?)?;
        let target = block.get_scalar("Target")?.to_string();
        let action = block.get_scalar("Action")?.to_string();
        Some(Proposal {
            id: block.id.clone(),
            date: block.get_scalar("Date").unwrap_or_default().to_string(),
            proposal_type,
            target: target.clone(),
            action: action.clone(),
            reason: block.get_scalar("Reason").unwrap_or_default().to_string(),
            status,
            evidence: block
                .get("Evidence")
                .map(|v| v.items().iter().map(|s| s.to_string()).collect())
                .unwrap_or_default(),
            fingerprint: block
                .get_scalar("Fingerprint")
                .map(str::to_string)
                .unwrap_or_else(|| Self::compute_fingerprint(proposal_type, &target, &action)),
            patch: block.get_scalar("Body").map(dedent_patch),
        })
    }

    pub fn to_block(&self) -> Block {
        let mut fields: Vec<(String, FieldValue)> = vec![
            ("Date".into(), FieldValue::Scalar(self.date.clone())),
            (
                "Status".into(),
                FieldValue::Scalar(self.status.as_str().into()),
            ),
            (
                "Type".into(),
                FieldValue::Scalar(self.proposal_type.as_str().into()),
            ),
            ("Target".into(), FieldValue::Scalar(self.target.clone())),
            ("Action".into(), FieldValue::Scalar(self.action.clone())),
            ("Reason".into(), FieldValue::Scalar(self.reason.clone())),
            (
                "Fingerprint".into(),
                FieldValue::Scalar(self.fingerprint.clone()),
            ),
        ];
        if !self.evidence.is_empty() {
            fields.push(("Evidence".into(), FieldValue::List(self.evidence.clone())));
        }
        if let Some(patch) = &self.patch {
            fields.push(("Body".into(), FieldValue::Scalar(indent_patch(patch))));
        }
        Block {
            id: self.id.clone(),
            source_file: PROPOSED_FILE.into(),
            line_range: (0, 0),
            fields,
            signatures: Vec::new(),
        }
    }
}

/// Patch blocks are stored indented inside the proposal's body so their
/// `[ID]` headers do not parse as separate blocks in the staging file.
fn indent_patch(patch: &str) -> String {
    patch
        .trim_end()
        .lines()
        .map(|l| {
            if l.is_empty() {
                String::new()
            } else {
                format!("    {}", l)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn dedent_patch(body: &str) -> String {
    let mut out = body
        .lines()
        .map(|l| l.strip_prefix("    ").unwrap_or(l))
        .collect::<Vec<_>>()
        .join("\n");
    out.push('\n');
    out
}

/// Next free proposal ID for `date`, or `CounterExhausted` past 999.
pub fn allocate_proposal_id(corpus: &Corpus, date: NaiveDate) -> Result<BlockId, MemosError> {
    let next = corpus.max_seq(BlockKind::Proposal, date) + 1;
    if next > 999 {
        return Err(MemosError::CounterExhausted(format!(
            "proposal IDs exhausted for {}",
            date
        )));
    }
    Ok(BlockId::new_dated(BlockKind::Proposal, date, next))
}

/// All proposals currently in the staging file.
pub fn load_proposals(ws: &Workspace) -> Result<Vec<Proposal>, MemosError> {
    let path = ws.path(PROPOSED_FILE);
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let outcome = parser::parse_file(&path)?;
    Ok(outcome
        .blocks
        .iter()
        .filter_map(Proposal::from_block)
        .collect())
}

pub fn find_proposal(ws: &Workspace, proposal_id: &str) -> Result<Proposal, MemosError> {
    load_proposals(ws)?
        .into_iter()
        .find(|p| p.id.as_str() == proposal_id)
        .ok_or_else(|| MemosError::NotFound(format!("proposal {}", proposal_id)))
}

/// Why a staging attempt was suppressed rather than written.
#[derive(Debug, PartialEq, Eq)]
pub enum StageOutcome {
    Staged,
    DuplicateFingerprint(String),
    CooldownActive(String),
}

/// Stage a proposal, enforcing dedup, backlog, and cooldown. The caller
/// enforces mode gating and the per-run budget.
pub fn stage(ws: &Workspace, proposal: &Proposal, today: NaiveDate) -> Result<StageOutcome, MemosError> {
    let existing = load_proposals(ws)?;

    let backlog = existing.iter().filter(|p| p.status.is_open()).count() as u32;
    if backlog >= ws.config.proposal_budget.backlog_limit {
        return Err(MemosError::BudgetExceeded(format!(
            "proposal backlog at limit ({} open)",
            backlog
        )));
    }

    for p in &existing {
        if p.fingerprint == proposal.fingerprint
            && matches!(
                p.status,
                ProposalStatus::Pending | ProposalStatus::Approved | ProposalStatus::Deferred
            )
        {
            return Ok(StageOutcome::DuplicateFingerprint(p.id.as_str().to_string()));
        }
    }

    // Rejected/deferred proposals for the same (target, action) suppress
    // re-staging for the cooldown window.
    let cooldown = ws.config.defer_cooldown_days;
    for p in &existing {
        if !matches!(p.status, ProposalStatus::Rejected | ProposalStatus::Deferred) {
            continue;
        }
        if p.target != proposal.target || p.action != proposal.action {
            continue;
        }
        if let Ok(created) = NaiveDate::parse_from_str(&p.date, "%Y-%m-%d") {
            let age = (today - created).num_days();
            if age < cooldown {
                return Ok(StageOutcome::CooldownActive(p.id.as_str().to_string()));
            }
        }
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(ws.path(PROPOSED_FILE))?;
    file.write_all(format!("\n{}", parser::serialize_block(&proposal.to_block())).as_bytes())?;
    file.sync_all()?;
    Ok(StageOutcome::Staged)
}

/// Flip a staged proposal's status in place. Proposals are bookkeeping
/// blocks, not governed corpus, so this edits the staging file directly.
pub fn set_status(
    ws: &Workspace,
    proposal_id: &str,
    status: ProposalStatus,
) -> Result<(), MemosError> {
    let path = ws.path(PROPOSED_FILE);
    let content = std::fs::read_to_string(&path)?;
    let outcome = parser::parse_str(&content, std::path::Path::new(PROPOSED_FILE));
    let mut blocks = outcome.blocks;
    let block = blocks
        .iter_mut()
        .find(|b| b.id.as_str() == proposal_id)
        .ok_or_else(|| MemosError::NotFound(format!("proposal {}", proposal_id)))?;
    block.set_field("Status", FieldValue::Scalar(status.as_str().to_string()));
    let mut out = String::from("# Staged Proposals\n\n");
    out.push_str(&parser::serialize_blocks(&blocks));
    crate::core::workspace::atomic_replace_write(&path, out.as_bytes())
}

/// Public `propose(signal)` surface: record a signal block in
/// `intelligence/SIGNALS.md` only. Formalization happens later through a
/// staged proposal.
pub fn propose_signal(
    ws: &Workspace,
    corpus: &Corpus,
    signal_type: &str,
    source: &str,
    excerpt: &str,
) -> Result<BlockId, MemosError> {
    let today = Utc::now().date_naive();
    let next = corpus.max_seq(BlockKind::Signal, today) + 1;
    if next > 999 {
        return Err(MemosError::CounterExhausted(format!(
            "signal IDs exhausted for {}",
            today
        )));
    }
    let id = BlockId::new_dated(BlockKind::Signal, today, next);

    let mut out = String::new();
    out.push_str(&format!("\n[{}]\n", id));
    out.push_str(&format!("Date: {}\n", today.format("%Y-%m-%d")));
    out.push_str(&format!("Type: {}\n", signal_type));
    out.push_str(&format!("Source: {}\n", source));
    out.push_str("Status: pending\n");
    out.push_str(&format!("Excerpt: {}\n", excerpt));

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(ws.path(SIGNALS_FILE))?;
    file.write_all(out.as_bytes())?;
    file.sync_all()?;
    Ok(id)
}
