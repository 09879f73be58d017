//! Markdown block parser and canonical serializer.
//!
//! A block starts at a line matching `[ID]`, optionally prefixed by up to
//! two `#` heading markers. Subsequent `Key: Value` lines are fields until
//! a blank line or the next header. A `ConstraintSignatures:` line opens a
//! list of 2-space-indented `- key: value` records, terminated by dedent.
//! Free text after the field region is retained as an implicit `Body`
//! field so recall can index prose.
//!
//! Parsing is total: malformed IDs drop the block with a diagnostic and
//! scanning continues; duplicate keys keep the first value; unknown keys
//! are retained verbatim. Same bytes always produce the same blocks.

use crate::core::block::{Block, BlockId, ConstraintSignature, FieldValue};
use crate::core::error::MemosError;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Severity of a parse diagnostic. Diagnostics never abort a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticSeverity {
    Warn,
    Error,
}

#[derive(Debug, Clone)]
pub struct ParseDiagnostic {
    pub severity: DiagnosticSeverity,
    pub file: PathBuf,
    pub line: usize,
    pub message: String,
}

/// Result of parsing one file: blocks in document order plus diagnostics.
#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub blocks: Vec<Block>,
    pub diagnostics: Vec<ParseDiagnostic>,
}

fn header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:#{1,2}\s*)?\[([A-Z]+(?:-[^\]\s]+)*)\]\s*$").unwrap())
}

fn field_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-Za-z][A-Za-z0-9_.]*):\s*(.*)$").unwrap())
}

pub fn parse_file(path: &Path) -> Result<ParseOutcome, MemosError> {
    let content = std::fs::read_to_string(path)?;
    Ok(parse_str(&content, path))
}

/// Parse a UTF-8 buffer into blocks. `source` is recorded for provenance
/// only; no I/O happens here.
pub fn parse_str(content: &str, source: &Path) -> ParseOutcome {
    let lines: Vec<&str> = content.lines().collect();
    let mut outcome = ParseOutcome::default();
    let mut i = 0;

    while i < lines.len() {
        let Some(caps) = header_re().captures(lines[i]) else {
            i += 1;
            continue;
        };
        let raw_id = caps.get(1).unwrap().as_str();
        let header_line = i + 1; // 1-based

        let Some(id) = BlockId::parse(raw_id) else {
            outcome.diagnostics.push(ParseDiagnostic {
                severity: DiagnosticSeverity::Error,
                file: source.to_path_buf(),
                line: header_line,
                message: format!("malformed block ID [{}]; block dropped", raw_id),
            });
            // Skip forward to the next header so the bad block's body is
            // not misattributed to a neighbor.
            i += 1;
            while i < lines.len() && !header_re().is_match(lines[i]) {
                i += 1;
            }
            continue;
        };

        let (block, consumed) = parse_block_body(
            id,
            source,
            header_line,
            &lines[i + 1..],
            &mut outcome.diagnostics,
        );
        outcome.blocks.push(block);
        i += 1 + consumed;
    }

    outcome
}

/// Parse field lines after a header. Returns the block and how many lines
/// were consumed.
fn parse_block_body(
    id: BlockId,
    source: &Path,
    header_line: usize,
    rest: &[&str],
    diagnostics: &mut Vec<ParseDiagnostic>,
) -> (Block, usize) {
    let mut fields: Vec<(String, FieldValue)> = Vec::new();
    let mut signatures: Vec<ConstraintSignature> = Vec::new();
    let mut body_lines: Vec<&str> = Vec::new();
    let mut in_fields = true;
    let mut j = 0;

    while j < rest.len() {
        let line = rest[j];
        if header_re().is_match(line) {
            break;
        }
        let lineno = header_line + 1 + j;

        if in_fields {
            if line.trim().is_empty() {
                in_fields = false;
                j += 1;
                continue;
            }
            if line.trim_end() == "ConstraintSignatures:" {
                let (sigs, consumed) = parse_signature_list(&rest[j + 1..]);
                signatures = sigs;
                j += 1 + consumed;
                continue;
            }
            if let Some(item) = parse_list_item(line) {
                // Continuation of the most recent list field, or promotion
                // of an empty `Key:` scalar into a list.
                match fields.last_mut() {
                    Some((_, FieldValue::List(items))) => items.push(item.to_string()),
                    Some((_, value)) if value.as_scalar() == Some("") => {
                        *value = FieldValue::List(vec![item.to_string()]);
                    }
                    _ => body_lines.push(line),
                }
                j += 1;
                continue;
            }
            if let Some(caps) = field_re().captures(line) {
                let key = caps.get(1).unwrap().as_str().to_string();
                let value = caps.get(2).unwrap().as_str().trim_end().to_string();
                if fields.iter().any(|(k, _)| *k == key) {
                    diagnostics.push(ParseDiagnostic {
                        severity: DiagnosticSeverity::Warn,
                        file: source.to_path_buf(),
                        line: lineno,
                        message: format!("duplicate key '{}' in [{}]; first kept", key, id),
                    });
                } else {
                    fields.push((key, FieldValue::Scalar(value)));
                }
                j += 1;
                continue;
            }
            // Non-field line inside the field region ends it.
            in_fields = false;
            continue;
        }

        if line.trim() != "---" {
            body_lines.push(line);
        }
        j += 1;
    }

    while body_lines.last().is_some_and(|l| l.trim().is_empty()) {
        body_lines.pop();
    }
    while body_lines.first().is_some_and(|l| l.trim().is_empty()) {
        body_lines.remove(0);
    }
    if !body_lines.is_empty() && !fields.iter().any(|(k, _)| k == "Body") {
        fields.push((
            "Body".to_string(),
            FieldValue::Scalar(body_lines.join("\n")),
        ));
    }

    let block = Block {
        id,
        source_file: source.to_path_buf(),
        line_range: (header_line, header_line + j),
        fields,
        signatures,
    };
    (block, j)
}

/// One `- item` line at zero or two spaces of indent.
fn parse_list_item(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    let indent = line.len() - trimmed.len();
    if indent <= 2 {
        trimmed.strip_prefix("- ")
    } else {
        None
    }
}

/// Parse the `- key: value` records under `ConstraintSignatures:`.
/// Entries open at 2-space indent; continuation pairs are indented
/// deeper. The list ends at the first dedented line.
fn parse_signature_list(rest: &[&str]) -> (Vec<ConstraintSignature>, usize) {
    let mut signatures = Vec::new();
    let mut current: Vec<(String, String)> = Vec::new();
    let mut consumed = 0;

    for line in rest {
        let trimmed = line.trim_start();
        let indent = line.len() - trimmed.len();
        if trimmed.is_empty() || indent < 2 {
            break;
        }
        if let Some(entry) = trimmed.strip_prefix("- ") {
            if !current.is_empty() {
                if let Some(sig) = ConstraintSignature::from_pairs(std::mem::take(&mut current)) {
                    signatures.push(sig);
                }
            }
            if let Some((key, value)) = split_pair(entry) {
                current.push((key, value));
            }
        } else if let Some((key, value)) = split_pair(trimmed) {
            current.push((key, value));
        } else {
            break;
        }
        consumed += 1;
    }

    if !current.is_empty() {
        if let Some(sig) = ConstraintSignature::from_pairs(current) {
            signatures.push(sig);
        }
    }
    (signatures, consumed)
}

fn split_pair(s: &str) -> Option<(String, String)> {
    let (key, value) = s.split_once(':')?;
    Some((key.trim().to_string(), value.trim().to_string()))
}

/// Serialize one block to canonical form. `parse_str(serialize_block(b))`
/// yields `b` up to line spans.
pub fn serialize_block(block: &Block) -> String {
    let mut out = String::new();
    out.push_str(&format!("[{}]\n", block.id));
    for (key, value) in &block.fields {
        match value {
            // Body is emitted as trailing prose after the field region.
            FieldValue::Scalar(_) if key == "Body" => {}
            FieldValue::Scalar(s) => out.push_str(&format!("{}: {}\n", key, s)),
            FieldValue::List(items) => {
                out.push_str(&format!("{}:\n", key));
                for item in items {
                    out.push_str(&format!("- {}\n", item));
                }
            }
        }
    }
    if !block.signatures.is_empty() {
        out.push_str("ConstraintSignatures:\n");
        for sig in &block.signatures {
            let pairs = sig.to_pairs();
            for (i, (key, value)) in pairs.iter().enumerate() {
                if i == 0 {
                    out.push_str(&format!("  - {}: {}\n", key, value));
                } else {
                    out.push_str(&format!("    {}: {}\n", key, value));
                }
            }
        }
    }
    if let Some(body) = block.get_scalar("Body") {
        out.push('\n');
        out.push_str(body);
        out.push('\n');
    }
    out
}

/// Serialize a sequence of blocks separated by single blank lines.
pub fn serialize_blocks(blocks: &[Block]) -> String {
    let mut out = String::new();
    for (i, block) in blocks.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(&serialize_block(block));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::BlockKind;

    fn parse(content: &str) -> ParseOutcome {
        parse_str(content, Path::new("test.md"))
    }

    #[test]
    fn parses_basic_block() {
        let outcome = parse(
            "[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: Use PostgreSQL\n",
        );
        assert_eq!(outcome.blocks.len(), 1);
        let b = &outcome.blocks[0];
        assert_eq!(b.kind(), BlockKind::Decision);
        assert_eq!(b.get_scalar("Statement"), Some("Use PostgreSQL"));
        assert_eq!(b.line_range.0, 1);
    }

    #[test]
    fn heading_prefixed_header_accepted() {
        let outcome = parse("## [T-20260101-001]\nDate: 2026-01-01\nStatus: todo\nTitle: x\n");
        assert_eq!(outcome.blocks.len(), 1);
    }

    #[test]
    fn malformed_id_dropped_with_diagnostic() {
        let outcome = parse(
            "[D-2026-001]\nDate: 2026-01-01\n\n[T-20260101-001]\nDate: 2026-01-01\nStatus: todo\nTitle: ok\n",
        );
        assert_eq!(outcome.blocks.len(), 1);
        assert_eq!(outcome.blocks[0].id.as_str(), "T-20260101-001");
        assert_eq!(outcome.diagnostics.len(), 1);
        assert_eq!(outcome.diagnostics[0].severity, DiagnosticSeverity::Error);
    }

    #[test]
    fn duplicate_key_keeps_first() {
        let outcome = parse("[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatus: archived\nStatement: x\n");
        let b = &outcome.blocks[0];
        assert_eq!(b.status(), Some("active"));
        assert!(outcome
            .diagnostics
            .iter()
            .any(|d| d.severity == DiagnosticSeverity::Warn));
    }

    #[test]
    fn list_field_parsed() {
        let outcome = parse(
            "[T-20260101-001]\nDate: 2026-01-01\nStatus: todo\nTitle: x\nDependencies:\n- D-20260101-001\n- D-20260101-002\n",
        );
        let b = &outcome.blocks[0];
        let deps = b.get("Dependencies").unwrap().items();
        assert_eq!(deps, vec!["D-20260101-001", "D-20260101-002"]);
    }

    #[test]
    fn constraint_signatures_parsed() {
        let outcome = parse(
            "[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: Use PostgreSQL\nConstraintSignatures:\n  - axis.key: database.engine\n    relation: must_be\n    object: postgresql\n    enforcement: hard\n    domain: db\n",
        );
        let b = &outcome.blocks[0];
        assert_eq!(b.signatures.len(), 1);
        assert_eq!(b.signatures[0].axis_key, "database.engine");
    }

    #[test]
    fn unknown_keys_retained() {
        let outcome = parse("[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: x\nFutureKey: kept\n");
        assert_eq!(outcome.blocks[0].get_scalar("FutureKey"), Some("kept"));
    }

    #[test]
    fn serialize_then_parse_round_trips() {
        let src = "[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: Use PostgreSQL\nTags: db, storage\nConstraintSignatures:\n  - axis.key: database.engine\n    relation: must_be\n    object: postgresql\n    enforcement: hard\n    domain: db\n";
        let first = parse(src);
        let serialized = serialize_blocks(&first.blocks);
        let second = parse_str(&serialized, Path::new("test.md"));
        assert_eq!(first.blocks.len(), second.blocks.len());
        for (a, b) in first.blocks.iter().zip(second.blocks.iter()) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.fields, b.fields);
            assert_eq!(a.signatures, b.signatures);
        }
    }

    #[test]
    fn trailing_prose_becomes_body() {
        let outcome = parse("[S-20260101-001]\nDate: 2026-01-01\n\nFree text after the fields.\nSecond line.\n");
        let b = &outcome.blocks[0];
        assert_eq!(
            b.get_scalar("Body"),
            Some("Free text after the fields.\nSecond line.")
        );
    }

    #[test]
    fn deterministic_parse() {
        let src = "[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: x\n";
        let a = parse(src);
        let b = parse(src);
        assert_eq!(a.blocks, b.blocks);
    }
}
