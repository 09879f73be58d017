//! Error types for Mem OS operations.
//!
//! This module defines the canonical error type used throughout the engine.
//! All subsystems return `Result<T, MemosError>`.
//!
//! Propagation policy (per subsystem):
//!
//! - **Parse errors are local**: a malformed block is dropped with a recorded
//!   diagnostic and scanning continues.
//! - **Pre-check errors never mutate state**: `AclDenied`, `PathTraversal`,
//!   `BudgetExceeded`, and `LockTimeout` are surfaced before any snapshot
//!   or WAL entry is written.
//! - **Mid-apply errors always roll back**: `Validation` and `Io` during an
//!   apply restore every touched file from the snapshot.
//! - **Retrieval degrades**: recall errors produce fewer results, not
//!   failures; abstention is a normal result, never an error.

use std::io;
use thiserror::Error;

/// Canonical error type for all Mem OS operations.
#[derive(Error, Debug)]
pub enum MemosError {
    /// I/O error (auto-converts from `std::io::Error`)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization error for config/state/ACL files
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Block or file failed to parse
    #[error("Parse error: {0}")]
    Parse(String),

    /// Structural or referential invariant violated
    #[error("Validation error: {0}")]
    Validation(String),

    /// Proposal budget (per-run, per-day, or backlog) exhausted
    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    /// Workspace lock could not be acquired within the timeout
    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    /// Agent is not authorized to write a touched path
    #[error("ACL denied: {0}")]
    AclDenied(String),

    /// Resolved path escapes the workspace root
    #[error("Path traversal rejected: {0}")]
    PathTraversal(String),

    /// WAL replay found a file matching neither pre nor post hash and no
    /// usable snapshot; operator action required before startup
    #[error("WAL replay conflict: {0}")]
    WalReplayConflict(String),

    /// Attempted truncation or rewrite of an append-only daily log
    #[error("Append-only violation: {0}")]
    AppendOnlyViolation(String),

    /// Per-day ID counter rolled past 999
    #[error("ID counter exhausted: {0}")]
    CounterExhausted(String),

    /// Resource not found (missing block, proposal, receipt, file)
    #[error("Not found: {0}")]
    NotFound(String),
}
