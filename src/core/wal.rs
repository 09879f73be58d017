//! Write-ahead log (`.wal/journal.log`) and startup replay.
//!
//! One line per record, tab-separated:
//! `seq \t receipt \t op \t path \t pre_hash \t post_hash`, fsynced after
//! each append. The apply engine stages new file content in memory, so a
//! `begin` record carries both the pre-mutation and intended
//! post-mutation hash of each touched path; `commit` and `rollback` are
//! single terminator lines.
//!
//! Replay runs on workspace open. For every receipt with no terminator,
//! each touched file is compared against its recorded hashes: matching
//! `post_hash` on every path infers a commit; anything else restores the
//! whole receipt from its snapshot and logs a `rolled_back` receipt. A
//! file matching neither hash with no usable snapshot refuses startup
//! with `WalReplayConflict`.

use crate::core::error::MemosError;
use crate::core::receipt::{self, ApplyResult, Receipt, ReceiptId};
use crate::core::snapshot::{self, file_hash};
use crate::core::workspace::Workspace;
use chrono::Utc;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalOp {
    Begin,
    Commit,
    Rollback,
}

impl WalOp {
    fn as_str(&self) -> &'static str {
        match self {
            WalOp::Begin => "begin",
            WalOp::Commit => "commit",
            WalOp::Rollback => "rollback",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "begin" => Some(WalOp::Begin),
            "commit" => Some(WalOp::Commit),
            "rollback" => Some(WalOp::Rollback),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WalRecord {
    pub seq: u64,
    pub receipt: ReceiptId,
    pub op: WalOp,
    pub path: String,
    pub pre_hash: String,
    pub post_hash: String,
}

/// Pre/post hashes for one path touched by an apply.
#[derive(Debug, Clone)]
pub struct TouchedPath {
    pub path: String,
    pub pre_hash: String,
    pub post_hash: String,
}

/// Handle on the journal. The fd is held only for the duration of an
/// apply; replay reopens the file itself.
pub struct Wal {
    path: PathBuf,
    next_seq: u64,
}

impl Wal {
    pub fn open(ws: &Workspace) -> Result<Self, MemosError> {
        let path = ws.wal_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let next_seq = read_records(&path)?
            .last()
            .map(|r| r.seq + 1)
            .unwrap_or(1);
        Ok(Wal { path, next_seq })
    }

    fn append(&mut self, record: &WalRecord) -> Result<(), MemosError> {
        let line = format!(
            "{}\t{}\t{}\t{}\t{}\t{}\n",
            record.seq,
            record.receipt,
            record.op.as_str(),
            record.path,
            record.pre_hash,
            record.post_hash
        );
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// Journal one `begin` record per touched path.
    pub fn begin(&mut self, receipt: &ReceiptId, touched: &[TouchedPath]) -> Result<(), MemosError> {
        for t in touched {
            let record = WalRecord {
                seq: self.next_seq,
                receipt: receipt.clone(),
                op: WalOp::Begin,
                path: t.path.clone(),
                pre_hash: t.pre_hash.clone(),
                post_hash: t.post_hash.clone(),
            };
            self.append(&record)?;
            self.next_seq += 1;
        }
        Ok(())
    }

    pub fn commit(&mut self, receipt: &ReceiptId) -> Result<(), MemosError> {
        self.terminator(receipt, WalOp::Commit)
    }

    pub fn rollback(&mut self, receipt: &ReceiptId) -> Result<(), MemosError> {
        self.terminator(receipt, WalOp::Rollback)
    }

    fn terminator(&mut self, receipt: &ReceiptId, op: WalOp) -> Result<(), MemosError> {
        let record = WalRecord {
            seq: self.next_seq,
            receipt: receipt.clone(),
            op,
            path: "-".to_string(),
            pre_hash: "-".to_string(),
            post_hash: "-".to_string(),
        };
        self.append(&record)?;
        self.next_seq += 1;
        Ok(())
    }
}

fn read_records(path: &PathBuf) -> Result<Vec<WalRecord>, MemosError> {
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)?;
    let mut records = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 6 {
            return Err(MemosError::WalReplayConflict(format!(
                "journal line {} is malformed",
                lineno + 1
            )));
        }
        let seq = fields[0].parse::<u64>().map_err(|_| {
            MemosError::WalReplayConflict(format!("journal line {}: bad seq", lineno + 1))
        })?;
        let receipt = ReceiptId::parse(fields[1]).ok_or_else(|| {
            MemosError::WalReplayConflict(format!("journal line {}: bad receipt", lineno + 1))
        })?;
        let op = WalOp::parse(fields[2]).ok_or_else(|| {
            MemosError::WalReplayConflict(format!("journal line {}: bad op", lineno + 1))
        })?;
        records.push(WalRecord {
            seq,
            receipt,
            op,
            path: fields[3].to_string(),
            pre_hash: fields[4].to_string(),
            post_hash: fields[5].to_string(),
        });
    }
    Ok(records)
}

/// Outcome of one startup replay pass.
#[derive(Debug, Default)]
pub struct ReplayReport {
    pub committed: Vec<ReceiptId>,
    pub rolled_back: Vec<ReceiptId>,
}

/// Recover from a crash between WAL `begin` and `commit`. Called on every
/// workspace open; truncates the journal on success.
pub fn replay(ws: &Workspace) -> Result<ReplayReport, MemosError> {
    let path = ws.wal_path();
    let records = read_records(&path)?;
    if records.is_empty() {
        return Ok(ReplayReport::default());
    }

    // Group begins and terminators per receipt, in journal order.
    let mut begins: BTreeMap<String, Vec<&WalRecord>> = BTreeMap::new();
    let mut finalized: BTreeMap<String, WalOp> = BTreeMap::new();
    for record in &records {
        match record.op {
            WalOp::Begin => begins
                .entry(record.receipt.as_str().to_string())
                .or_default()
                .push(record),
            WalOp::Commit | WalOp::Rollback => {
                finalized.insert(record.receipt.as_str().to_string(), record.op);
            }
        }
    }

    let mut report = ReplayReport::default();
    for (receipt_str, entries) in &begins {
        if finalized.contains_key(receipt_str) {
            continue;
        }
        let receipt = ReceiptId::parse(receipt_str).expect("validated on read");

        let mut all_post = true;
        let mut any_divergent = false;
        for entry in entries {
            let current = file_hash(&ws.path(&entry.path))?;
            if current != entry.post_hash {
                all_post = false;
            }
            if current != entry.post_hash && current != entry.pre_hash {
                any_divergent = true;
            }
        }

        if all_post {
            // The mutation fully landed before the crash; infer commit.
            report.committed.push(receipt);
            continue;
        }

        match snapshot::restore(ws, &receipt) {
            Ok(()) => {}
            Err(MemosError::NotFound(_)) if !any_divergent => {
                // Every file still matches pre_hash: nothing landed and
                // nothing needs restoring.
            }
            Err(MemosError::NotFound(msg)) => {
                return Err(MemosError::WalReplayConflict(format!(
                    "receipt {} needs restoration but {}",
                    receipt, msg
                )));
            }
            Err(e) => return Err(e),
        }

        receipt::append_receipt(
            ws,
            &Receipt {
                id: receipt.clone(),
                date: Utc::now().format("%Y-%m-%d").to_string(),
                proposal_id: "-".to_string(),
                action: "wal_replay".to_string(),
                result: ApplyResult::RolledBack,
                snapshot_id: Some(receipt.clone()),
                diff: None,
            },
        )?;
        report.rolled_back.push(receipt);
    }

    // Truncate only after a fully successful replay.
    fs::write(&path, b"")?;
    Ok(report)
}
