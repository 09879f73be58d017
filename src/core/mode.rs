//! Governance mode state machine.
//!
//! Three modes gate what the engine may do to the workspace:
//!
//! - `detect_only`: scans report issues; no proposals, no applies.
//! - `propose`: scans may stage proposals; applies are manual.
//! - `enforce`: low-risk proposals may auto-apply within budget.
//!
//! Upward transitions require an explicit operator action and a clean
//! observation window; downgrades are always allowed. Capabilities are
//! static predicates on the variant, not runtime dispatch.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GovernanceMode {
    #[default]
    DetectOnly,
    Propose,
    Enforce,
}

impl GovernanceMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "detect_only" => Some(GovernanceMode::DetectOnly),
            "propose" => Some(GovernanceMode::Propose),
            "enforce" => Some(GovernanceMode::Enforce),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GovernanceMode::DetectOnly => "detect_only",
            GovernanceMode::Propose => "propose",
            GovernanceMode::Enforce => "enforce",
        }
    }

    /// Scans may generate staged proposals.
    pub fn can_propose(&self) -> bool {
        matches!(self, GovernanceMode::Propose | GovernanceMode::Enforce)
    }

    /// `apply_proposal` is permitted at all.
    pub fn can_apply(&self) -> bool {
        matches!(self, GovernanceMode::Propose | GovernanceMode::Enforce)
    }

    /// Low-risk proposals may be applied without an operator in the loop.
    /// Supersedes never qualify.
    pub fn can_auto_apply(&self) -> bool {
        matches!(self, GovernanceMode::Enforce)
    }
}

impl fmt::Display for GovernanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a requested transition was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionDenied {
    /// Upgrades need `clean_days` consecutive days without critical findings.
    CleanWindowRequired { needed_days: i64, observed_days: i64 },
    /// detect_only → enforce must pass through propose.
    SkipsPropose,
}

impl fmt::Display for TransitionDenied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionDenied::CleanWindowRequired {
                needed_days,
                observed_days,
            } => write!(
                f,
                "clean observation window required: {} day(s) observed, {} needed",
                observed_days, needed_days
            ),
            TransitionDenied::SkipsPropose => {
                write!(f, "cannot skip propose: upgrade one mode at a time")
            }
        }
    }
}

/// Validate a mode transition. `clean_days` is the length of the current
/// window with zero critical scan findings. Downgrades always pass; no
/// upward transition is ever automatic; this is only called from an
/// explicit operator action.
pub fn check_transition(
    from: GovernanceMode,
    to: GovernanceMode,
    clean_days: i64,
) -> Result<(), TransitionDenied> {
    if to <= from {
        return Ok(());
    }
    match (from, to) {
        (GovernanceMode::DetectOnly, GovernanceMode::Propose) => {
            // One clean observation window (a day with a clean scan).
            if clean_days >= 1 {
                Ok(())
            } else {
                Err(TransitionDenied::CleanWindowRequired {
                    needed_days: 1,
                    observed_days: clean_days,
                })
            }
        }
        (GovernanceMode::Propose, GovernanceMode::Enforce) => {
            if clean_days >= 14 {
                Ok(())
            } else {
                Err(TransitionDenied::CleanWindowRequired {
                    needed_days: 14,
                    observed_days: clean_days,
                })
            }
        }
        (GovernanceMode::DetectOnly, GovernanceMode::Enforce) => {
            Err(TransitionDenied::SkipsPropose)
        }
        _ => Ok(()),
    }
}
