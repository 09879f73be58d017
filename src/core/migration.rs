//! Schema version detection and automatic migration.
//!
//! `ensure_schema_version` upgrades `mem-os.json` between schema versions.
//! Migrations are ordered `v_i → v_{i+1}` functions over the raw JSON map;
//! each rewrite is atomic via replace-on-rename and the whole pass is
//! idempotent: running it twice equals running it once.
//!
//! Reference migration: 2.0.x workspaces named the mode key
//! `self_correcting_mode`; 2.1.0 renames it to `governance_mode`. The old
//! key is consumed as input during the migration cycle and physically
//! removed on rewrite.

use crate::core::config::CONFIG_FILE;
use crate::core::error::MemosError;
use crate::core::workspace::atomic_replace_write;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::path::Path;

/// Current schema version written to `mem-os.json`.
pub const SCHEMA_VERSION: &str = "2.1.0";

/// One schema upgrade step.
pub struct Migration {
    /// Version this migration targets (e.g. "2.1.0").
    pub target_version: &'static str,
    pub description: &'static str,
    /// Rewrites the config map in place; returns true when it changed.
    pub up: fn(&mut Map<String, Value>) -> bool,
}

/// All migrations in chronological order. Each must be idempotent.
pub fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        target_version: "2.1.0",
        description: "rename self_correcting_mode to governance_mode",
        up: migrate_governance_mode,
    }]
}

fn migrate_governance_mode(config: &mut Map<String, Value>) -> bool {
    let Some(old) = config.remove("self_correcting_mode") else {
        return false;
    };
    if !config.contains_key("governance_mode") {
        config.insert("governance_mode".to_string(), old);
    }
    true
}

/// Upgrade the workspace config to [`SCHEMA_VERSION`]. Creates a default
/// config when none exists.
pub fn ensure_schema_version(workspace_root: &Path) -> Result<(), MemosError> {
    let config_path = workspace_root.join(CONFIG_FILE);
    if !config_path.is_file() {
        let config = crate::core::config::Config::default();
        atomic_replace_write(&config_path, config.to_json()?.as_bytes())?;
        return Ok(());
    }

    let content = std::fs::read_to_string(&config_path)?;
    let value: Value = serde_json::from_str(&content)?;
    let Value::Object(mut map) = value else {
        return Err(MemosError::Validation(format!(
            "{} is not a JSON object",
            config_path.display()
        )));
    };

    let stored = map
        .get("version")
        .and_then(|v| v.as_str())
        .unwrap_or("2.0.0")
        .to_string();
    if stored == SCHEMA_VERSION {
        return Ok(());
    }

    let mut changed = false;
    for migration in all_migrations() {
        if compare_versions(&stored, migration.target_version) == Ordering::Less {
            changed |= (migration.up)(&mut map);
        }
    }

    map.insert(
        "version".to_string(),
        Value::String(SCHEMA_VERSION.to_string()),
    );
    changed = true;

    if changed {
        let mut out = serde_json::to_string_pretty(&Value::Object(map))?;
        out.push('\n');
        atomic_replace_write(&config_path, out.as_bytes())?;
    }
    Ok(())
}

/// Dotted numeric version comparison; missing components compare low.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u32> {
        v.split('.')
            .filter_map(|s| s.parse::<u32>().ok())
            .collect()
    };
    let a_parts = parse(a);
    let b_parts = parse(b);
    for (x, y) in a_parts.iter().zip(b_parts.iter()) {
        match x.cmp(y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a_parts.len().cmp(&b_parts.len())
}
