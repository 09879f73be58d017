//! Workspace configuration (`mem-os.json`) and scanner state
//! (`memory/intel-state.json`).
//!
//! Unknown keys are preserved on rewrite so older and newer binaries can
//! share a workspace. Schema upgrades live in [`crate::core::migration`].

use crate::core::error::MemosError;
use crate::core::mode::GovernanceMode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

pub const CONFIG_FILE: &str = "mem-os.json";
pub const INTEL_STATE_FILE: &str = "memory/intel-state.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecallBackendKind {
    #[default]
    Bm25,
    Vector,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VectorBackendConfig {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RecallConfig {
    #[serde(default)]
    pub backend: RecallBackendKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<VectorBackendConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalBudget {
    #[serde(default = "default_per_run")]
    pub per_run: u32,
    #[serde(default = "default_per_day")]
    pub per_day: u32,
    #[serde(default = "default_backlog_limit")]
    pub backlog_limit: u32,
}

fn default_per_run() -> u32 {
    5
}
fn default_per_day() -> u32 {
    10
}
fn default_backlog_limit() -> u32 {
    30
}

impl Default for ProposalBudget {
    fn default() -> Self {
        ProposalBudget {
            per_run: default_per_run(),
            per_day: default_per_day(),
            backlog_limit: default_backlog_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "default_archive_days")]
    pub archive_days: i64,
    #[serde(default = "default_snapshot_days")]
    pub snapshot_days: i64,
    #[serde(default = "default_log_days")]
    pub log_days: i64,
    #[serde(default = "default_signal_days")]
    pub signal_days: i64,
}

fn default_archive_days() -> i64 {
    90
}
fn default_snapshot_days() -> i64 {
    30
}
fn default_log_days() -> i64 {
    60
}
fn default_signal_days() -> i64 {
    30
}

impl Default for CompactionConfig {
    fn default() -> Self {
        CompactionConfig {
            archive_days: default_archive_days(),
            snapshot_days: default_snapshot_days(),
            log_days: default_log_days(),
            signal_days: default_signal_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbstentionConfig {
    #[serde(default = "default_abstention_threshold")]
    pub threshold: f64,
}

fn default_abstention_threshold() -> f64 {
    0.20
}

impl Default for AbstentionConfig {
    fn default() -> Self {
        AbstentionConfig {
            threshold: default_abstention_threshold(),
        }
    }
}

/// `mem-os.json`. `extra` captures unrecognized keys verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<String>,
    #[serde(default)]
    pub governance_mode: GovernanceMode,
    #[serde(default = "default_true")]
    pub auto_capture: bool,
    #[serde(default = "default_true")]
    pub auto_recall: bool,
    #[serde(default)]
    pub recall: RecallConfig,
    #[serde(default)]
    pub proposal_budget: ProposalBudget,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub abstention: AbstentionConfig,
    #[serde(default = "default_dead_threshold_days")]
    pub dead_threshold_days: i64,
    #[serde(default = "default_defer_cooldown_days")]
    pub defer_cooldown_days: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_true() -> bool {
    true
}
fn default_dead_threshold_days() -> i64 {
    30
}
fn default_defer_cooldown_days() -> i64 {
    7
}

impl Default for Config {
    fn default() -> Self {
        Config {
            version: crate::core::migration::SCHEMA_VERSION.to_string(),
            workspace_path: None,
            governance_mode: GovernanceMode::default(),
            auto_capture: true,
            auto_recall: true,
            recall: RecallConfig::default(),
            proposal_budget: ProposalBudget::default(),
            compaction: CompactionConfig::default(),
            abstention: AbstentionConfig::default(),
            dead_threshold_days: default_dead_threshold_days(),
            defer_cooldown_days: default_defer_cooldown_days(),
            extra: Map::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, MemosError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn to_json(&self) -> Result<String, MemosError> {
        let mut out = serde_json::to_string_pretty(self)?;
        out.push('\n');
        Ok(out)
    }
}

/// Per-day proposal counter used by the daily budget.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DailyCounter {
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub count: u32,
}

/// `memory/intel-state.json`: mutable scanner bookkeeping kept out of
/// the governed markdown corpus.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IntelState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scan_ts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_apply_ts: Option<String>,
    #[serde(default)]
    pub proposals_today: DailyCounter,
    #[serde(default)]
    pub applies_today: DailyCounter,
    /// First day of the current streak of clean scans, `YYYY-MM-DD`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clean_since: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl IntelState {
    pub fn load(path: &Path) -> Result<Self, MemosError> {
        if !path.is_file() {
            return Ok(IntelState::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn to_json(&self) -> Result<String, MemosError> {
        let mut out = serde_json::to_string_pretty(self)?;
        out.push('\n');
        Ok(out)
    }

    /// Days in the current clean streak as of `today`.
    pub fn clean_days(&self, today: chrono::NaiveDate) -> i64 {
        match &self.clean_since {
            Some(since) => chrono::NaiveDate::parse_from_str(since, "%Y-%m-%d")
                .map(|d| (today - d).num_days() + 1)
                .unwrap_or(0),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configuration_values() {
        let cfg = Config::default();
        assert_eq!(cfg.governance_mode, GovernanceMode::DetectOnly);
        assert_eq!(cfg.proposal_budget.per_run, 5);
        assert_eq!(cfg.proposal_budget.backlog_limit, 30);
        assert!((cfg.abstention.threshold - 0.20).abs() < f64::EPSILON);
        assert_eq!(cfg.defer_cooldown_days, 7);
    }

    #[test]
    fn unknown_keys_survive_rewrite() {
        let raw = r#"{"version":"2.1.0","governance_mode":"propose","future_key":{"a":1}}"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.governance_mode, GovernanceMode::Propose);
        let out = cfg.to_json().unwrap();
        assert!(out.contains("future_key"));
    }

    #[test]
    fn clean_days_counts_inclusive() {
        let state = IntelState {
            clean_since: Some("2026-01-01".to_string()),
            ..Default::default()
        };
        let today = chrono::NaiveDate::from_ymd_opt(2026, 1, 14).unwrap();
        assert_eq!(state.clean_days(today), 14);
    }
}
