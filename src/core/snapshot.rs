//! Content-addressed pre-apply snapshots.
//!
//! Before an apply mutates anything, every touched file is copied
//! byte-identically into `intelligence/state/snapshots/<receipt_id>/`
//! together with a manifest. Restoration is a flat overwrite of the
//! manifest-listed paths; files that did not exist pre-apply are removed
//! again. Snapshots older than `compaction.snapshot_days` are deleted by
//! the compaction pass.

use crate::core::error::MemosError;
use crate::core::receipt::ReceiptId;
use crate::core::workspace::{atomic_replace_write, Workspace};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Workspace-relative path, `/`-separated.
    pub path: String,
    /// Whether the file existed pre-apply; absent files are deleted on
    /// restore.
    pub existed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub receipt_id: ReceiptId,
    pub created_at: String,
    pub files: Vec<ManifestEntry>,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Hash of a file's current bytes, or `"absent"` when it does not exist.
pub fn file_hash(path: &Path) -> Result<String, MemosError> {
    match fs::read(path) {
        Ok(bytes) => Ok(sha256_hex(&bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok("absent".to_string()),
        Err(e) => Err(MemosError::Io(e)),
    }
}

fn snapshot_dir(ws: &Workspace, receipt_id: &ReceiptId) -> PathBuf {
    ws.snapshots_dir().join(receipt_id.as_str())
}

/// Copy every touched file into the snapshot directory and write the
/// manifest. `touched` paths are workspace-relative.
pub fn take(ws: &Workspace, receipt_id: &ReceiptId, touched: &[String]) -> Result<(), MemosError> {
    let dir = snapshot_dir(ws, receipt_id);
    fs::create_dir_all(&dir)?;
    let mut entries = Vec::with_capacity(touched.len());

    for rel in touched {
        let src = ws.path(rel);
        if src.is_file() {
            let bytes = fs::read(&src)?;
            let dst = dir.join(rel);
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&dst, &bytes)?;
            entries.push(ManifestEntry {
                path: rel.clone(),
                existed: true,
                sha256: Some(sha256_hex(&bytes)),
            });
        } else {
            entries.push(ManifestEntry {
                path: rel.clone(),
                existed: false,
                sha256: None,
            });
        }
    }

    let manifest = Manifest {
        receipt_id: receipt_id.clone(),
        created_at: Utc::now().to_rfc3339(),
        files: entries,
    };
    let mut json = serde_json::to_string_pretty(&manifest)?;
    json.push('\n');
    atomic_replace_write(&dir.join(MANIFEST_FILE), json.as_bytes())?;
    Ok(())
}

pub fn load_manifest(ws: &Workspace, receipt_id: &ReceiptId) -> Result<Manifest, MemosError> {
    let path = snapshot_dir(ws, receipt_id).join(MANIFEST_FILE);
    if !path.is_file() {
        return Err(MemosError::NotFound(format!(
            "snapshot {} has no manifest",
            receipt_id
        )));
    }
    let content = fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Restore the workspace to the snapshot's pre-apply state: overwrite
/// every manifest-listed file, delete files that did not exist.
pub fn restore(ws: &Workspace, receipt_id: &ReceiptId) -> Result<(), MemosError> {
    let dir = snapshot_dir(ws, receipt_id);
    let manifest = load_manifest(ws, receipt_id)?;
    for entry in &manifest.files {
        let target = ws.path(&entry.path);
        if entry.existed {
            let bytes = fs::read(dir.join(&entry.path))?;
            atomic_replace_write(&target, &bytes)?;
        } else if target.exists() {
            fs::remove_file(&target)?;
        }
    }
    Ok(())
}

/// Verify the workspace currently matches the snapshot byte-for-byte.
pub fn matches_workspace(ws: &Workspace, receipt_id: &ReceiptId) -> Result<bool, MemosError> {
    let manifest = load_manifest(ws, receipt_id)?;
    for entry in &manifest.files {
        let target = ws.path(&entry.path);
        match (&entry.sha256, target.is_file()) {
            (Some(expected), true) => {
                if file_hash(&target)? != *expected {
                    return Ok(false);
                }
            }
            (Some(_), false) => return Ok(false),
            (None, exists) => {
                if exists {
                    return Ok(false);
                }
            }
        }
    }
    Ok(true)
}

/// Delete snapshots whose receipt day is older than `max_age_days`.
/// Returns the removed receipt IDs.
pub fn compact(
    ws: &Workspace,
    today: NaiveDate,
    max_age_days: i64,
) -> Result<Vec<String>, MemosError> {
    let dir = ws.snapshots_dir();
    let mut removed = Vec::new();
    if !dir.is_dir() {
        return Ok(removed);
    }
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(id) = ReceiptId::parse(&name) else {
            continue;
        };
        let Ok(day) = NaiveDate::parse_from_str(id.day(), "%Y%m%d") else {
            continue;
        };
        if (today - day).num_days() > max_age_days {
            fs::remove_dir_all(entry.path())?;
            removed.push(name);
        }
    }
    removed.sort();
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ws() -> (tempfile::TempDir, Workspace) {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::init(tmp.path()).unwrap();
        (tmp, ws)
    }

    #[test]
    fn snapshot_and_restore_round_trip() {
        let (_tmp, ws) = ws();
        let rel = "decisions/DECISIONS.md".to_string();
        fs::write(ws.path(&rel), "original\n").unwrap();

        let id = ReceiptId::parse("20260213-120000-001").unwrap();
        take(&ws, &id, std::slice::from_ref(&rel)).unwrap();
        fs::write(ws.path(&rel), "mutated\n").unwrap();
        assert!(!matches_workspace(&ws, &id).unwrap());

        restore(&ws, &id).unwrap();
        assert_eq!(fs::read_to_string(ws.path(&rel)).unwrap(), "original\n");
        assert!(matches_workspace(&ws, &id).unwrap());
    }

    #[test]
    fn restore_removes_created_files() {
        let (_tmp, ws) = ws();
        let rel = "decisions/new-file.md".to_string();
        let id = ReceiptId::parse("20260213-120000-002").unwrap();
        take(&ws, &id, std::slice::from_ref(&rel)).unwrap();

        fs::write(ws.path(&rel), "created by apply\n").unwrap();
        restore(&ws, &id).unwrap();
        assert!(!ws.path(&rel).exists());
    }

    #[test]
    fn compact_removes_only_old_snapshots() {
        let (_tmp, ws) = ws();
        let old = ReceiptId::parse("20250101-000000-001").unwrap();
        let new = ReceiptId::parse("20260210-000000-001").unwrap();
        take(&ws, &old, &[]).unwrap();
        take(&ws, &new, &[]).unwrap();

        let today = NaiveDate::from_ymd_opt(2026, 2, 13).unwrap();
        let removed = compact(&ws, today, 30).unwrap();
        assert_eq!(removed, vec!["20250101-000000-001".to_string()]);
        assert!(ws.snapshots_dir().join(new.as_str()).is_dir());
    }
}
