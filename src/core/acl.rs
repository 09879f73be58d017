//! Agent-scoped namespace authorization (`mem-os-acl.json`).
//!
//! The workspace is a shared root plus per-agent namespaces under
//! `agents/<agent_id>/`. Rules grant read/write over namespace prefixes
//! per agent pattern (exact, `prefix-*` glob, or `*`). An agent always
//! owns its own namespace. `can_write` is a pure predicate: the apply
//! engine consults it per touched path in the pre-check, and recall uses
//! `can_read` to filter the corpus.

use crate::core::error::MemosError;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclRule {
    /// Agent pattern: exact id, `prefix-*`, or `*`.
    pub agent: String,
    /// Readable namespace prefixes (workspace-relative, `/`-separated).
    #[serde(default)]
    pub read: Vec<String>,
    /// Writable namespace prefixes.
    #[serde(default)]
    pub write: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Acl {
    #[serde(default)]
    pub rules: Vec<AclRule>,
}

impl Acl {
    /// Load the ACL file; a missing file yields the default policy.
    pub fn load(path: &Path) -> Result<Self, MemosError> {
        if !path.is_file() {
            return Ok(Acl::default_policy());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Default policy: every agent may read the whole workspace and write
    /// the governed shared directories.
    pub fn default_policy() -> Self {
        Acl {
            rules: vec![AclRule {
                agent: "*".to_string(),
                read: vec![".".to_string()],
                write: vec![
                    "decisions".to_string(),
                    "tasks".to_string(),
                    "entities".to_string(),
                    "memory".to_string(),
                    "intelligence".to_string(),
                ],
            }],
        }
    }

    pub fn default_json() -> String {
        let mut out = serde_json::to_string_pretty(&Acl::default_policy()).unwrap_or_default();
        out.push('\n');
        out
    }

    /// True when `agent_id` may write the workspace-relative `rel_path`.
    pub fn can_write(&self, agent_id: &str, rel_path: &str) -> bool {
        let rel = normalize_rel(rel_path);
        if let Some(owner) = namespace_owner(&rel) {
            if owner == agent_id {
                return true;
            }
            // Foreign namespaces need an explicit grant.
            return self.granted(agent_id, &rel, |r| &r.write);
        }
        self.granted(agent_id, &rel, |r| &r.write)
    }

    /// True when `agent_id` may read `rel_path`. Read resolution is the
    /// union of all matching grants plus the agent's own namespace.
    pub fn can_read(&self, agent_id: &str, rel_path: &str) -> bool {
        let rel = normalize_rel(rel_path);
        if let Some(owner) = namespace_owner(&rel) {
            if owner == agent_id {
                return true;
            }
            return self.granted(agent_id, &rel, |r| &r.read);
        }
        self.granted(agent_id, &rel, |r| &r.read)
    }

    fn granted<'a>(
        &'a self,
        agent_id: &str,
        rel: &str,
        list: impl Fn(&'a AclRule) -> &'a Vec<String>,
    ) -> bool {
        self.rules
            .iter()
            .filter(|rule| pattern_matches(&rule.agent, agent_id))
            .flat_map(|rule| list(rule).iter())
            .any(|prefix| prefix_matches(prefix, rel))
    }
}

/// The agent id owning `agents/<id>/...` paths, if the path is in one.
fn namespace_owner(rel: &str) -> Option<&str> {
    let rest = rel.strip_prefix("agents/")?;
    let owner = rest.split('/').next()?;
    if owner.is_empty() {
        None
    } else {
        Some(owner)
    }
}

fn normalize_rel(rel: &str) -> String {
    rel.trim_start_matches("./").replace('\\', "/")
}

fn pattern_matches(pattern: &str, agent_id: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return agent_id.starts_with(prefix);
    }
    pattern == agent_id
}

fn prefix_matches(prefix: &str, rel: &str) -> bool {
    if prefix == "." || prefix.is_empty() {
        return true;
    }
    let prefix = prefix.trim_end_matches('/');
    rel == prefix || rel.starts_with(&format!("{}/", prefix))
}
