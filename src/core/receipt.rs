//! Receipt identifiers and the audit trail (`intelligence/AUDIT.md`).
//!
//! A receipt records one apply attempt. Its ID, `YYYYMMDD-HHMMSS-NNN`,
//! combines a UTC timestamp with a per-process counter so two applies in
//! the same second (or under a stalled clock) still allocate distinct,
//! monotonically increasing IDs.

use crate::core::error::MemosError;
use crate::core::workspace::{Workspace, AUDIT_FILE};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReceiptId(String);

impl ReceiptId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() == 3
            && parts[0].len() == 8
            && parts[1].len() == 6
            && parts[2].len() == 3
            && parts.iter().all(|p| p.bytes().all(|b| b.is_ascii_digit()))
        {
            Some(ReceiptId(s.to_string()))
        } else {
            None
        }
    }

    /// Date prefix `YYYYMMDD` of this receipt.
    pub fn day(&self) -> &str {
        &self.0[..8]
    }
}

impl fmt::Display for ReceiptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

static ALLOCATOR: Mutex<(String, u16)> = Mutex::new((String::new(), 0));

/// Allocate the next receipt ID. Monotonic within the process: when the
/// clock stalls (or steps backwards) the previous timestamp is reused and
/// the counter advances instead.
pub fn allocate_receipt_id() -> Result<ReceiptId, MemosError> {
    let now = Utc::now().format("%Y%m%d-%H%M%S").to_string();
    let mut state = ALLOCATOR.lock().unwrap();
    let (last_ts, counter) = &mut *state;
    if now > *last_ts {
        *last_ts = now;
        *counter = 1;
    } else {
        *counter += 1;
        if *counter > 999 {
            return Err(MemosError::CounterExhausted(format!(
                "receipt counter exhausted for {}",
                last_ts
            )));
        }
    }
    Ok(ReceiptId(format!("{}-{:03}", last_ts, counter)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyResult {
    Applied,
    RolledBack,
    Rejected,
}

impl ApplyResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyResult::Applied => "applied",
            ApplyResult::RolledBack => "rolled_back",
            ApplyResult::Rejected => "rejected",
        }
    }
}

/// Auditable record of one apply attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub id: ReceiptId,
    pub date: String,
    pub proposal_id: String,
    pub action: String,
    pub result: ApplyResult,
    pub snapshot_id: Option<ReceiptId>,
    pub diff: Option<String>,
}

impl Receipt {
    fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("\n[AR-{}]\n", self.id));
        out.push_str(&format!("Date: {}\n", self.date));
        out.push_str(&format!("ProposalId: {}\n", self.proposal_id));
        out.push_str(&format!("Action: {}\n", self.action));
        out.push_str(&format!("Result: {}\n", self.result.as_str()));
        if let Some(snap) = &self.snapshot_id {
            out.push_str(&format!("SnapshotId: {}\n", snap));
        }
        if let Some(diff) = &self.diff {
            out.push_str("Diff:\n```\n");
            out.push_str(diff);
            if !diff.ends_with('\n') {
                out.push('\n');
            }
            out.push_str("```\n");
        }
        out
    }
}

/// Append a receipt to the audit trail. The audit file is append-only by
/// convention; a missing file is created.
pub fn append_receipt(ws: &Workspace, receipt: &Receipt) -> Result<(), MemosError> {
    let path = ws.path(AUDIT_FILE);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    file.write_all(receipt.render().as_bytes())?;
    file.sync_all()?;
    Ok(())
}
