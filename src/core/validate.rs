//! Structural and referential validation of the block corpus.
//!
//! A pure function of the parsed file set: no side effects, identical
//! output on back-to-back runs with no writes. The apply engine runs it
//! as a post-check over the affected files; the scan runs it over the
//! whole workspace.

use crate::core::block::{Block, BlockKind};
use crate::core::parser::DiagnosticSeverity;
use crate::core::workspace::Corpus;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub check_id: &'static str,
    pub severity: Severity,
    pub file: PathBuf,
    pub line: usize,
    pub message: String,
}

impl ValidationIssue {
    fn fail(check_id: &'static str, block: &Block, message: String) -> Self {
        ValidationIssue {
            check_id,
            severity: Severity::Fail,
            file: block.source_file.clone(),
            line: block.line_range.0,
            message,
        }
    }
}

/// Run every structural check over a parsed corpus.
pub fn validate_corpus(corpus: &Corpus) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    check_parse_diagnostics(corpus, &mut issues);
    check_unique_ids(corpus, &mut issues);
    check_required_fields(corpus, &mut issues);
    check_status_vocab(corpus, &mut issues);
    check_superseded_refs(corpus, &mut issues);
    check_aligns_with(corpus, &mut issues);
    check_signature_placement(corpus, &mut issues);
    issues
}

/// True when no issue reaches `Fail`.
pub fn is_clean(issues: &[ValidationIssue]) -> bool {
    issues.iter().all(|i| i.severity != Severity::Fail)
}

fn check_parse_diagnostics(corpus: &Corpus, issues: &mut Vec<ValidationIssue>) {
    for diag in &corpus.diagnostics {
        issues.push(ValidationIssue {
            check_id: "PARSE",
            severity: match diag.severity {
                DiagnosticSeverity::Warn => Severity::Warn,
                DiagnosticSeverity::Error => Severity::Fail,
            },
            file: diag.file.clone(),
            line: diag.line,
            message: format!("{}; fix the block header or field syntax", diag.message),
        });
    }
}

fn check_unique_ids(corpus: &Corpus, issues: &mut Vec<ValidationIssue>) {
    for (id, file) in &corpus.duplicate_ids {
        issues.push(ValidationIssue {
            check_id: "ID_UNIQUE",
            severity: Severity::Fail,
            file: file.clone(),
            line: 0,
            message: format!(
                "[{}] is declared more than once; re-number the later block",
                id
            ),
        });
    }
}

fn check_required_fields(corpus: &Corpus, issues: &mut Vec<ValidationIssue>) {
    for block in &corpus.blocks {
        for key in block.kind().required_fields() {
            let missing = match block.get(key) {
                None => true,
                Some(v) => v.as_scalar().is_some_and(str::is_empty),
            };
            if missing {
                issues.push(ValidationIssue::fail(
                    "REQUIRED_FIELD",
                    block,
                    format!("[{}] is missing required field '{}'", block.id, key),
                ));
            }
        }
    }
}

fn check_status_vocab(corpus: &Corpus, issues: &mut Vec<ValidationIssue>) {
    for block in &corpus.blocks {
        let vocab = block.kind().status_vocab();
        if vocab.is_empty() {
            continue;
        }
        if let Some(status) = block.status() {
            if !vocab.contains(&status) {
                issues.push(ValidationIssue::fail(
                    "STATUS_ENUM",
                    block,
                    format!(
                        "[{}] has status '{}'; expected one of {}",
                        block.id,
                        status,
                        vocab.join("|")
                    ),
                ));
            }
        }
    }
}

fn check_superseded_refs(corpus: &Corpus, issues: &mut Vec<ValidationIssue>) {
    for block in &corpus.blocks {
        let Some(target) = block.get_scalar("SupersededBy") else {
            continue;
        };
        match corpus.get(target) {
            None => issues.push(ValidationIssue::fail(
                "SUPERSEDED_REF",
                block,
                format!(
                    "[{}] SupersededBy targets missing block '{}'",
                    block.id, target
                ),
            )),
            Some(successor) if successor.kind() != block.kind() => {
                issues.push(ValidationIssue::fail(
                    "SUPERSEDED_KIND",
                    block,
                    format!(
                        "[{}] SupersededBy '{}' is a {:?}, expected {:?}",
                        block.id,
                        target,
                        successor.kind(),
                        block.kind()
                    ),
                ));
            }
            Some(_) => {}
        }
    }
}

fn check_aligns_with(corpus: &Corpus, issues: &mut Vec<ValidationIssue>) {
    for block in &corpus.blocks {
        if block.kind() != BlockKind::Task {
            continue;
        }
        let Some(target) = block.get_scalar("AlignsWith") else {
            continue;
        };
        match corpus.get(target) {
            Some(decision)
                if decision.kind() == BlockKind::Decision
                    && decision.status() == Some("active") => {}
            Some(decision) if decision.kind() == BlockKind::Decision => {
                issues.push(ValidationIssue::fail(
                    "ALIGNS_INACTIVE",
                    block,
                    format!(
                        "[{}] AlignsWith '{}' which is {}; align to an active decision",
                        block.id,
                        target,
                        decision.status().unwrap_or("statusless")
                    ),
                ));
            }
            _ => issues.push(ValidationIssue::fail(
                "ALIGNS_REF",
                block,
                format!(
                    "[{}] AlignsWith '{}' does not resolve to a decision",
                    block.id, target
                ),
            )),
        }
    }
}

fn check_signature_placement(corpus: &Corpus, issues: &mut Vec<ValidationIssue>) {
    for block in &corpus.blocks {
        if !block.signatures.is_empty() && block.kind() != BlockKind::Decision {
            issues.push(ValidationIssue {
                check_id: "SIG_PLACEMENT",
                severity: Severity::Warn,
                file: block.source_file.clone(),
                line: block.line_range.0,
                message: format!(
                    "[{}] carries ConstraintSignatures but is not a decision",
                    block.id
                ),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::workspace::{Workspace, DECISIONS_FILE, TASKS_FILE};

    fn corpus_from(decisions: &str, tasks: &str) -> Corpus {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::init(tmp.path()).unwrap();
        std::fs::write(ws.path(DECISIONS_FILE), decisions).unwrap();
        std::fs::write(ws.path(TASKS_FILE), tasks).unwrap();
        ws.load_corpus().unwrap()
    }

    #[test]
    fn clean_workspace_validates() {
        let corpus = corpus_from(
            "[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: x\n",
            "[T-20260102-001]\nDate: 2026-01-02\nStatus: todo\nTitle: y\nAlignsWith: D-20260101-001\n",
        );
        let issues = validate_corpus(&corpus);
        assert!(is_clean(&issues), "{:?}", issues);
    }

    #[test]
    fn missing_required_field_fails() {
        let corpus = corpus_from("[D-20260101-001]\nDate: 2026-01-01\nStatus: active\n", "");
        let issues = validate_corpus(&corpus);
        assert!(issues
            .iter()
            .any(|i| i.check_id == "REQUIRED_FIELD" && i.severity == Severity::Fail));
    }

    #[test]
    fn bad_status_fails() {
        let corpus = corpus_from(
            "[D-20260101-001]\nDate: 2026-01-01\nStatus: wip\nStatement: x\n",
            "",
        );
        let issues = validate_corpus(&corpus);
        assert!(issues.iter().any(|i| i.check_id == "STATUS_ENUM"));
    }

    #[test]
    fn dangling_superseded_by_fails() {
        let corpus = corpus_from(
            "[D-20260101-001]\nDate: 2026-01-01\nStatus: superseded\nStatement: x\nSupersededBy: D-20260202-009\n",
            "",
        );
        let issues = validate_corpus(&corpus);
        assert!(issues.iter().any(|i| i.check_id == "SUPERSEDED_REF"));
    }

    #[test]
    fn orphan_aligns_with_fails() {
        let corpus = corpus_from(
            "",
            "[T-20260102-001]\nDate: 2026-01-02\nStatus: todo\nTitle: y\nAlignsWith: D-19990101-001\n",
        );
        let issues = validate_corpus(&corpus);
        assert!(issues.iter().any(|i| i.check_id == "ALIGNS_REF"));
    }

    #[test]
    fn validator_is_idempotent() {
        let corpus = corpus_from(
            "[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: x\n",
            "",
        );
        let a = validate_corpus(&corpus);
        let b = validate_corpus(&corpus);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.check_id, y.check_id);
            assert_eq!(x.message, y.message);
        }
    }
}
