//! Workspace context: canonical layout, atomic writes, and corpus access.
//!
//! A workspace is a directory of plain UTF-8 markdown plus two JSON files
//! (`mem-os.json`, `mem-os-acl.json`). All mutable state the engine needs
//! at runtime hangs off [`Workspace`], constructed at open and torn down
//! at close; there is no process-global state beyond the lock registry.
//!
//! Every write goes through `replace(tempfile, target)` for per-file
//! atomicity. Daily logs are the one exception: they are append-only and
//! any rewrite must preserve the prior content as a byte prefix.

use crate::core::acl::Acl;
use crate::core::block::{Block, BlockId};
use crate::core::config::{Config, IntelState, CONFIG_FILE, INTEL_STATE_FILE};
use crate::core::error::MemosError;
use crate::core::parser::{self, ParseDiagnostic};
use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use ulid::Ulid;

pub const ACL_FILE: &str = "mem-os-acl.json";
pub const DECISIONS_FILE: &str = "decisions/DECISIONS.md";
pub const TASKS_FILE: &str = "tasks/TASKS.md";
pub const PROJECTS_FILE: &str = "entities/projects.md";
pub const PEOPLE_FILE: &str = "entities/people.md";
pub const TOOLS_FILE: &str = "entities/tools.md";
pub const INCIDENTS_FILE: &str = "entities/incidents.md";
pub const MEMORY_DIR: &str = "memory";
pub const CONTRADICTIONS_FILE: &str = "intelligence/CONTRADICTIONS.md";
pub const DRIFT_FILE: &str = "intelligence/DRIFT.md";
pub const SIGNALS_FILE: &str = "intelligence/SIGNALS.md";
pub const IMPACT_FILE: &str = "intelligence/IMPACT.md";
pub const AUDIT_FILE: &str = "intelligence/AUDIT.md";
pub const SCAN_LOG_FILE: &str = "intelligence/SCAN_LOG.md";
pub const PROPOSED_FILE: &str = "intelligence/proposed/PROPOSALS_PROPOSED.md";
pub const SNAPSHOTS_DIR: &str = "intelligence/state/snapshots";
pub const WAL_FILE: &str = ".wal/journal.log";
pub const AGENTS_DIR: &str = "agents";

/// Block-bearing files scanned into the corpus, in a fixed order so every
/// pass over the workspace is deterministic.
pub const CORPUS_FILES: &[&str] = &[
    DECISIONS_FILE,
    TASKS_FILE,
    PROJECTS_FILE,
    PEOPLE_FILE,
    TOOLS_FILE,
    INCIDENTS_FILE,
    CONTRADICTIONS_FILE,
    DRIFT_FILE,
    SIGNALS_FILE,
    PROPOSED_FILE,
];

/// Atomic write: temp file in the target's directory, fsync, rename over.
pub fn atomic_replace_write(path: &Path, bytes: &[u8]) -> Result<(), MemosError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let tmp = parent.join(format!(
        ".{}.{}.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string()),
        Ulid::new()
    ));
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    match fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(MemosError::Io(e))
        }
    }
}

/// Workspace-relative parsed corpus plus the `BlockID → (file, span)`
/// symbol table. Cross-references are looked up here, never owned.
#[derive(Debug, Default)]
pub struct Corpus {
    pub blocks: Vec<Block>,
    by_id: HashMap<String, usize>,
    /// IDs declared by more than one block (first declaration kept).
    pub duplicate_ids: Vec<(String, PathBuf)>,
    pub diagnostics: Vec<ParseDiagnostic>,
}

impl Corpus {
    pub fn get(&self, id: &str) -> Option<&Block> {
        self.by_id.get(id).map(|&i| &self.blocks[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn active(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(|b| b.is_active())
    }

    /// Highest sequence number already used for `kind` on `date`.
    pub fn max_seq(&self, kind: crate::core::block::BlockKind, date: NaiveDate) -> u16 {
        self.blocks
            .iter()
            .filter(|b| b.id.kind() == kind && b.id.date() == Some(date))
            .map(|b| b.id.seq())
            .max()
            .unwrap_or(0)
    }

    fn insert(&mut self, block: Block) {
        let id = block.id.as_str().to_string();
        if self.by_id.contains_key(&id) {
            self.duplicate_ids.push((id, block.source_file.clone()));
            self.blocks.push(block);
        } else {
            self.by_id.insert(id, self.blocks.len());
            self.blocks.push(block);
        }
    }
}

/// Open workspace context. Construct with [`Workspace::open`].
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    pub config: Config,
    pub acl: Acl,
}

impl Workspace {
    /// Open an existing workspace: canonicalize the root, run schema
    /// migration, load config and ACL, and replay any unfinalized WAL
    /// entries left by a crashed apply.
    pub fn open(root: &Path) -> Result<Self, MemosError> {
        let root = root.canonicalize().map_err(|e| {
            MemosError::NotFound(format!("workspace root {}: {}", root.display(), e))
        })?;
        crate::core::migration::ensure_schema_version(&root)?;
        let config = Config::load(&root.join(CONFIG_FILE))?;
        let acl = Acl::load(&root.join(ACL_FILE))?;
        let ws = Workspace { root, config, acl };
        crate::core::wal::replay(&ws)?;
        Ok(ws)
    }

    /// Scaffold a new workspace at `root` (idempotent; existing files are
    /// preserved) and open it.
    pub fn init(root: &Path) -> Result<Self, MemosError> {
        fs::create_dir_all(root)?;
        let seeds: &[(&str, &str)] = &[
            (DECISIONS_FILE, "# Decisions\n"),
            (TASKS_FILE, "# Tasks\n"),
            (PROJECTS_FILE, "# Projects\n"),
            (PEOPLE_FILE, "# People\n"),
            (TOOLS_FILE, "# Tools\n"),
            (INCIDENTS_FILE, "# Incidents\n"),
            (CONTRADICTIONS_FILE, "# Contradictions\n"),
            (DRIFT_FILE, "# Drift\n"),
            (SIGNALS_FILE, "# Signals\n"),
            (IMPACT_FILE, "# Impact\n"),
            (AUDIT_FILE, "# Audit\n"),
            (SCAN_LOG_FILE, "# Scan Log\n"),
            (PROPOSED_FILE, "# Staged Proposals\n"),
        ];
        for (rel, seed) in seeds {
            let path = root.join(rel);
            if !path.exists() {
                atomic_replace_write(&path, seed.as_bytes())?;
            }
        }
        fs::create_dir_all(root.join(MEMORY_DIR))?;
        fs::create_dir_all(root.join(SNAPSHOTS_DIR))?;
        fs::create_dir_all(root.join(AGENTS_DIR))?;
        let acl_path = root.join(ACL_FILE);
        if !acl_path.exists() {
            atomic_replace_write(&acl_path, Acl::default_json().as_bytes())?;
        }
        Workspace::open(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.root.join(WAL_FILE)
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join(SNAPSHOTS_DIR)
    }

    pub fn daily_log_path(&self, date: NaiveDate) -> PathBuf {
        self.root
            .join(MEMORY_DIR)
            .join(format!("{}.md", date.format("%Y-%m-%d")))
    }

    /// Resolve a workspace-relative path through symlinks and reject
    /// anything that escapes the root.
    pub fn resolve_contained(&self, rel: &str) -> Result<PathBuf, MemosError> {
        let joined = self.root.join(rel);
        // Canonicalize the deepest existing ancestor so symlinks collapse
        // even for files the apply is about to create.
        let mut existing = joined.clone();
        let mut suffix = Vec::new();
        while !existing.exists() {
            match (existing.parent(), existing.file_name()) {
                (Some(parent), Some(name)) => {
                    suffix.push(name.to_os_string());
                    existing = parent.to_path_buf();
                }
                _ => break,
            }
        }
        let mut resolved = existing
            .canonicalize()
            .map_err(|e| MemosError::Io(e))?;
        for part in suffix.iter().rev() {
            resolved.push(part);
        }
        if !resolved.starts_with(&self.root) {
            return Err(MemosError::PathTraversal(format!(
                "{} resolves outside workspace root",
                rel
            )));
        }
        Ok(resolved)
    }

    /// Parse every corpus file into blocks with a workspace-wide symbol
    /// table. Missing files are skipped; parse failures become
    /// diagnostics, never errors.
    pub fn load_corpus(&self) -> Result<Corpus, MemosError> {
        let mut corpus = Corpus::default();
        for rel in CORPUS_FILES {
            let path = self.root.join(rel);
            if !path.is_file() {
                continue;
            }
            let content = fs::read_to_string(&path)?;
            let mut outcome = parser::parse_str(&content, Path::new(rel));
            corpus.diagnostics.append(&mut outcome.diagnostics);
            for block in outcome.blocks {
                corpus.insert(block);
            }
        }
        Ok(corpus)
    }

    /// Daily log files present under `memory/`, sorted by date.
    pub fn daily_logs(&self) -> Result<Vec<(NaiveDate, PathBuf)>, MemosError> {
        let dir = self.root.join(MEMORY_DIR);
        let mut logs = Vec::new();
        if !dir.is_dir() {
            return Ok(logs);
        }
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            if let Ok(date) = NaiveDate::parse_from_str(stem, "%Y-%m-%d") {
                logs.push((date, path));
            }
        }
        logs.sort();
        Ok(logs)
    }

    /// Append to a daily log. Rewriting that does not preserve the prior
    /// bytes as a prefix is an `AppendOnlyViolation`.
    pub fn append_daily_log(&self, date: NaiveDate, text: &str) -> Result<(), MemosError> {
        let path = self.daily_log_path(date);
        fs::create_dir_all(path.parent().unwrap())?;
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(text.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// Guarded rewrite of a daily log: `new_content` must start with the
    /// current bytes.
    pub fn rewrite_daily_log_checked(
        &self,
        date: NaiveDate,
        new_content: &str,
    ) -> Result<(), MemosError> {
        let path = self.daily_log_path(date);
        if path.is_file() {
            let current = fs::read_to_string(&path)?;
            if !new_content.as_bytes().starts_with(current.as_bytes()) {
                return Err(MemosError::AppendOnlyViolation(format!(
                    "daily log {} would lose its byte prefix",
                    path.display()
                )));
            }
        }
        atomic_replace_write(&path, new_content.as_bytes())
    }

    /// Content epoch over the corpus: changes whenever any corpus file's
    /// bytes change. Drives inverted-index rebuilds.
    pub fn corpus_epoch(&self) -> Result<String, MemosError> {
        let mut hasher = Sha256::new();
        for rel in CORPUS_FILES {
            let path = self.root.join(rel);
            if let Ok(bytes) = fs::read(&path) {
                hasher.update(rel.as_bytes());
                hasher.update((bytes.len() as u64).to_le_bytes());
                hasher.update(&bytes);
            }
        }
        for (date, path) in self.daily_logs()? {
            if let Ok(bytes) = fs::read(&path) {
                hasher.update(date.format("%Y-%m-%d").to_string().as_bytes());
                hasher.update(&bytes);
            }
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    pub fn load_intel_state(&self) -> Result<IntelState, MemosError> {
        IntelState::load(&self.root.join(INTEL_STATE_FILE))
    }

    pub fn save_intel_state(&self, state: &IntelState) -> Result<(), MemosError> {
        atomic_replace_write(&self.root.join(INTEL_STATE_FILE), state.to_json()?.as_bytes())
    }

    pub fn save_config(&self) -> Result<(), MemosError> {
        atomic_replace_write(&self.root.join(CONFIG_FILE), self.config.to_json()?.as_bytes())
    }

    /// Look up the file and span a block ID resolves to, if any.
    pub fn locate(&self, corpus: &Corpus, id: &BlockId) -> Option<(PathBuf, (usize, usize))> {
        corpus
            .get(id.as_str())
            .map(|b| (b.source_file.clone(), b.line_range))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_scaffolds_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::init(tmp.path()).unwrap();
        assert!(ws.path(DECISIONS_FILE).is_file());
        assert!(ws.path(PROPOSED_FILE).is_file());
        assert!(ws.path(ACL_FILE).is_file());
        assert!(ws.snapshots_dir().is_dir());
    }

    #[test]
    fn resolve_rejects_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::init(tmp.path()).unwrap();
        assert!(matches!(
            ws.resolve_contained("../outside.md"),
            Err(MemosError::PathTraversal(_))
        ));
        assert!(ws.resolve_contained("decisions/DECISIONS.md").is_ok());
    }

    #[test]
    fn append_only_guard_detects_truncation() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::init(tmp.path()).unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 2, 13).unwrap();
        ws.append_daily_log(date, "first line\n").unwrap();
        let err = ws.rewrite_daily_log_checked(date, "replaced\n");
        assert!(matches!(err, Err(MemosError::AppendOnlyViolation(_))));
        ws.rewrite_daily_log_checked(date, "first line\nsecond\n")
            .unwrap();
    }

    #[test]
    fn corpus_epoch_changes_on_write() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::init(tmp.path()).unwrap();
        let before = ws.corpus_epoch().unwrap();
        std::fs::write(
            ws.path(DECISIONS_FILE),
            "# Decisions\n\n[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: x\n",
        )
        .unwrap();
        let after = ws.corpus_epoch().unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn duplicate_ids_tracked() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::init(tmp.path()).unwrap();
        std::fs::write(
            ws.path(DECISIONS_FILE),
            "[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: a\n\n[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: b\n",
        )
        .unwrap();
        let corpus = ws.load_corpus().unwrap();
        assert_eq!(corpus.duplicate_ids.len(), 1);
        assert_eq!(corpus.get("D-20260101-001").unwrap().get_scalar("Statement"), Some("a"));
    }
}
