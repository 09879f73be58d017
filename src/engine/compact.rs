//! Compaction: age-based archival of blocks, logs, signals, and
//! snapshots.
//!
//! Physical removal of blocks happens only here. Archived blocks move to
//! dated archive files (`<dir>/archive/YYYY-MM.md`); old daily logs move
//! under `memory/archive/`; resolved signals and expired snapshots are
//! aged out per the `compaction.*` config. Every pass runs under the
//! workspace lock and is receipted in the audit trail.

use crate::core::block::Block;
use crate::core::error::MemosError;
use crate::core::lock::{self, DEFAULT_LOCK_TIMEOUT};
use crate::core::parser;
use crate::core::receipt::{allocate_receipt_id, append_receipt, ApplyResult, Receipt};
use crate::core::snapshot;
use crate::core::workspace::{
    atomic_replace_write, Workspace, DECISIONS_FILE, MEMORY_DIR, SIGNALS_FILE, TASKS_FILE,
};
use chrono::NaiveDate;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

#[derive(Debug, Default)]
pub struct CompactionReport {
    pub blocks_archived: usize,
    pub logs_archived: usize,
    pub signals_archived: usize,
    pub snapshots_removed: Vec<String>,
}

/// Run every compaction pass with `today` as the reference date.
pub fn compact(ws: &Workspace, today: NaiveDate) -> Result<CompactionReport, MemosError> {
    let _lock = lock::acquire(ws.root(), DEFAULT_LOCK_TIMEOUT)?;
    let cfg = &ws.config.compaction;

    let mut report = CompactionReport::default();
    for file in [DECISIONS_FILE, TASKS_FILE] {
        report.blocks_archived += compact_block_file(ws, file, today, cfg.archive_days)?;
    }
    report.signals_archived = compact_signals(ws, today, cfg.signal_days)?;
    report.logs_archived = compact_logs(ws, today, cfg.log_days)?;
    report.snapshots_removed = snapshot::compact(ws, today, cfg.snapshot_days)?;

    append_receipt(
        ws,
        &Receipt {
            id: allocate_receipt_id()?,
            date: today.format("%Y-%m-%d").to_string(),
            proposal_id: "-".to_string(),
            action: format!(
                "compact: {} blocks, {} logs, {} signals, {} snapshots",
                report.blocks_archived,
                report.logs_archived,
                report.signals_archived,
                report.snapshots_removed.len()
            ),
            result: ApplyResult::Applied,
            snapshot_id: None,
            diff: None,
        },
    )?;
    Ok(report)
}

fn block_age_days(block: &Block, today: NaiveDate) -> Option<i64> {
    block.date().map(|d| (today - d).num_days())
}

/// Move archived blocks past the age threshold into the sibling
/// `archive/YYYY-MM.md` file. The source file is rewritten without them.
fn compact_block_file(
    ws: &Workspace,
    rel: &str,
    today: NaiveDate,
    max_age_days: i64,
) -> Result<usize, MemosError> {
    let path = ws.path(rel);
    if !path.is_file() {
        return Ok(0);
    }
    let content = std::fs::read_to_string(&path)?;
    let outcome = parser::parse_str(&content, Path::new(rel));

    let (expired, kept): (Vec<Block>, Vec<Block>) = outcome.blocks.into_iter().partition(|b| {
        b.status() == Some("archived")
            && block_age_days(b, today).is_some_and(|age| age > max_age_days)
    });
    if expired.is_empty() {
        return Ok(0);
    }

    let dir = Path::new(rel)
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_string_lossy()
        .to_string();
    append_to_archive(ws, &dir, today, &expired)?;

    let heading = content
        .lines()
        .next()
        .filter(|l| l.starts_with('#') && !l.contains('['))
        .map(|l| format!("{}\n\n", l))
        .unwrap_or_default();
    let mut new_content = heading;
    new_content.push_str(&parser::serialize_blocks(&kept));
    atomic_replace_write(&path, new_content.as_bytes())?;
    Ok(expired.len())
}

fn append_to_archive(
    ws: &Workspace,
    dir: &str,
    today: NaiveDate,
    blocks: &[Block],
) -> Result<(), MemosError> {
    let archive_rel = format!("{}/archive/{}.md", dir, today.format("%Y-%m"));
    let archive_path = ws.path(&archive_rel);
    if let Some(parent) = archive_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&archive_path)?;
    for block in blocks {
        file.write_all(format!("\n{}", parser::serialize_block(block)).as_bytes())?;
    }
    file.sync_all()?;
    Ok(())
}

/// Age out signals that are no longer pending.
fn compact_signals(
    ws: &Workspace,
    today: NaiveDate,
    max_age_days: i64,
) -> Result<usize, MemosError> {
    let path = ws.path(SIGNALS_FILE);
    if !path.is_file() {
        return Ok(0);
    }
    let content = std::fs::read_to_string(&path)?;
    let outcome = parser::parse_str(&content, Path::new(SIGNALS_FILE));
    let (expired, kept): (Vec<Block>, Vec<Block>) = outcome.blocks.into_iter().partition(|b| {
        b.status() != Some("pending")
            && block_age_days(b, today).is_some_and(|age| age > max_age_days)
    });
    if expired.is_empty() {
        return Ok(0);
    }
    append_to_archive(ws, "intelligence", today, &expired)?;
    let mut new_content = String::from("# Signals\n\n");
    new_content.push_str(&parser::serialize_blocks(&kept));
    atomic_replace_write(&path, new_content.as_bytes())?;
    Ok(expired.len())
}

/// Move old daily logs into `memory/archive/`. The bytes are unchanged;
/// append-only history is preserved, just relocated.
fn compact_logs(ws: &Workspace, today: NaiveDate, max_age_days: i64) -> Result<usize, MemosError> {
    let mut moved = 0;
    let archive_dir = ws.path(MEMORY_DIR).join("archive");
    for (date, path) in ws.daily_logs()? {
        if (today - date).num_days() <= max_age_days {
            continue;
        }
        std::fs::create_dir_all(&archive_dir)?;
        let dest = archive_dir.join(path.file_name().unwrap());
        std::fs::rename(&path, &dest)?;
        moved += 1;
    }
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archives_old_archived_decisions_only() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::init(tmp.path()).unwrap();
        std::fs::write(
            ws.path(DECISIONS_FILE),
            "# Decisions\n\n[D-20250101-001]\nDate: 2025-01-01\nStatus: archived\nStatement: old\n\n[D-20260210-001]\nDate: 2026-02-10\nStatus: active\nStatement: live\n",
        )
        .unwrap();

        let today = NaiveDate::from_ymd_opt(2026, 2, 13).unwrap();
        let report = compact(&ws, today).unwrap();
        assert_eq!(report.blocks_archived, 1);

        let decisions = std::fs::read_to_string(ws.path(DECISIONS_FILE)).unwrap();
        assert!(!decisions.contains("D-20250101-001"));
        assert!(decisions.contains("D-20260210-001"));
        let archive =
            std::fs::read_to_string(ws.path("decisions/archive/2026-02.md")).unwrap();
        assert!(archive.contains("D-20250101-001"));
    }

    #[test]
    fn old_logs_move_to_archive_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::init(tmp.path()).unwrap();
        let old = NaiveDate::from_ymd_opt(2025, 11, 1).unwrap();
        ws.append_daily_log(old, "ancient notes\n").unwrap();

        let today = NaiveDate::from_ymd_opt(2026, 2, 13).unwrap();
        let report = compact(&ws, today).unwrap();
        assert_eq!(report.logs_archived, 1);
        let moved = std::fs::read_to_string(ws.path("memory/archive/2025-11-01.md")).unwrap();
        assert_eq!(moved, "ancient notes\n");
    }

    #[test]
    fn pending_signals_survive_compaction() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::init(tmp.path()).unwrap();
        std::fs::write(
            ws.path(SIGNALS_FILE),
            "# Signals\n\n[SIG-20250101-001]\nDate: 2025-01-01\nType: auto-capture-task\nStatus: pending\nExcerpt: still waiting\n\n[SIG-20250101-002]\nDate: 2025-01-01\nType: auto-capture-task\nStatus: dismissed\nExcerpt: handled\n",
        )
        .unwrap();

        let today = NaiveDate::from_ymd_opt(2026, 2, 13).unwrap();
        let report = compact(&ws, today).unwrap();
        assert_eq!(report.signals_archived, 1);
        let signals = std::fs::read_to_string(ws.path(SIGNALS_FILE)).unwrap();
        assert!(signals.contains("SIG-20250101-001"));
        assert!(!signals.contains("SIG-20250101-002"));
    }
}
