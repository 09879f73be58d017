//! Typed block model: IDs, kinds, fields, and constraint signatures.
//!
//! A block is the unit of memory. Every decision, task, entity, signal,
//! and proposal in the workspace is a block: an `[ID]` header followed by
//! `Key: Value` fields, parsed from plain UTF-8 markdown. Blocks are
//! append-oriented: once active they are never edited in place beyond a
//! status flip and a `SupersededBy` back-reference.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Block kind, derived from the ID prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Decision,      // D
    Task,          // T
    Project,       // PRJ
    Person,        // PER
    Tool,          // TOOL
    Incident,      // INC
    Contradiction, // C
    Drift,         // DREF
    Signal,        // SIG
    Proposal,      // P
    Impact,        // I
    Bookmark,      // B
    Summary,       // S
}

impl BlockKind {
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "D" => Some(BlockKind::Decision),
            "T" => Some(BlockKind::Task),
            "PRJ" => Some(BlockKind::Project),
            "PER" => Some(BlockKind::Person),
            "TOOL" => Some(BlockKind::Tool),
            "INC" => Some(BlockKind::Incident),
            "C" => Some(BlockKind::Contradiction),
            "DREF" => Some(BlockKind::Drift),
            "SIG" => Some(BlockKind::Signal),
            "P" => Some(BlockKind::Proposal),
            "I" => Some(BlockKind::Impact),
            "B" => Some(BlockKind::Bookmark),
            "S" => Some(BlockKind::Summary),
            _ => None,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            BlockKind::Decision => "D",
            BlockKind::Task => "T",
            BlockKind::Project => "PRJ",
            BlockKind::Person => "PER",
            BlockKind::Tool => "TOOL",
            BlockKind::Incident => "INC",
            BlockKind::Contradiction => "C",
            BlockKind::Drift => "DREF",
            BlockKind::Signal => "SIG",
            BlockKind::Proposal => "P",
            BlockKind::Impact => "I",
            BlockKind::Bookmark => "B",
            BlockKind::Summary => "S",
        }
    }

    /// Required field keys for structural validation.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            BlockKind::Decision => &["Date", "Status", "Statement"],
            BlockKind::Task => &["Date", "Status", "Title"],
            BlockKind::Project | BlockKind::Person | BlockKind::Tool => &["Name"],
            BlockKind::Incident => &["Date", "Status", "Summary"],
            BlockKind::Proposal => &["Date", "Status", "Type", "Target", "Action", "Reason"],
            BlockKind::Signal => &["Date", "Type", "Status"],
            BlockKind::Contradiction | BlockKind::Drift => &["Date", "Status"],
            BlockKind::Impact | BlockKind::Bookmark | BlockKind::Summary => &[],
        }
    }

    /// Closed status vocabulary per kind. Empty slice = status not required.
    pub fn status_vocab(&self) -> &'static [&'static str] {
        match self {
            BlockKind::Decision => &["active", "superseded", "archived"],
            BlockKind::Task => &["todo", "doing", "done", "blocked", "archived"],
            BlockKind::Proposal => &[
                "pending", "approved", "applied", "rejected", "deferred", "failed",
            ],
            BlockKind::Signal => &["pending", "promoted", "dismissed"],
            BlockKind::Incident => &["open", "resolved", "archived"],
            BlockKind::Contradiction | BlockKind::Drift => &["open", "resolved"],
            BlockKind::Project | BlockKind::Person | BlockKind::Tool => {
                &["active", "inactive", "archived"]
            }
            BlockKind::Impact | BlockKind::Bookmark | BlockKind::Summary => &[],
        }
    }
}

/// Parsed block identifier, grammar `Prefix[-YYYYMMDD]-NNN`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId {
    raw: String,
    kind: BlockKind,
    date: Option<NaiveDate>,
    seq: u16,
}

impl BlockId {
    /// Parse an ID string. Returns `None` when the grammar does not match
    /// or the embedded date is not a real calendar date.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.splitn(3, '-');
        let prefix = parts.next()?;
        let kind = BlockKind::from_prefix(prefix)?;
        let second = parts.next()?;
        let (date, seq_str) = match parts.next() {
            Some(third) => {
                if second.len() != 8 || !second.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                let date = NaiveDate::parse_from_str(second, "%Y%m%d").ok()?;
                (Some(date), third)
            }
            None => (None, second),
        };
        if seq_str.len() != 3 || !seq_str.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let seq: u16 = seq_str.parse().ok()?;
        Some(BlockId {
            raw: raw.to_string(),
            kind,
            date,
            seq,
        })
    }

    /// Construct a dated ID, e.g. `D-20260213-002`.
    pub fn new_dated(kind: BlockKind, date: NaiveDate, seq: u16) -> Self {
        let raw = format!("{}-{}-{:03}", kind.prefix(), date.format("%Y%m%d"), seq);
        BlockId {
            raw,
            kind,
            date: Some(date),
            seq,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub fn date(&self) -> Option<NaiveDate> {
        self.date
    }

    pub fn seq(&self) -> u16 {
        self.seq
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A field value: scalar line or `- item` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Scalar(String),
    List(Vec<String>),
}

impl FieldValue {
    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            FieldValue::Scalar(s) => Some(s),
            FieldValue::List(_) => None,
        }
    }

    pub fn items(&self) -> Vec<&str> {
        match self {
            FieldValue::Scalar(s) => vec![s.as_str()],
            FieldValue::List(v) => v.iter().map(|s| s.as_str()).collect(),
        }
    }
}

/// Relation of a constraint signature to its object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    MustBe,
    MustNotBe,
    ShouldBe,
    ShouldNotBe,
    Prefers,
    Requires,
    Excludes,
    Replaces,
}

impl Relation {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "must_be" => Some(Relation::MustBe),
            "must_not_be" => Some(Relation::MustNotBe),
            "should_be" => Some(Relation::ShouldBe),
            "should_not_be" => Some(Relation::ShouldNotBe),
            "prefers" => Some(Relation::Prefers),
            "requires" => Some(Relation::Requires),
            "excludes" => Some(Relation::Excludes),
            "replaces" => Some(Relation::Replaces),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Relation::MustBe => "must_be",
            Relation::MustNotBe => "must_not_be",
            Relation::ShouldBe => "should_be",
            Relation::ShouldNotBe => "should_not_be",
            Relation::Prefers => "prefers",
            Relation::Requires => "requires",
            Relation::Excludes => "excludes",
            Relation::Replaces => "replaces",
        }
    }
}

/// Enforcement strength of a constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Enforcement {
    Advisory,
    Soft,
    Hard,
}

impl Enforcement {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hard" => Some(Enforcement::Hard),
            "soft" => Some(Enforcement::Soft),
            "advisory" => Some(Enforcement::Advisory),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Enforcement::Hard => "hard",
            Enforcement::Soft => "soft",
            Enforcement::Advisory => "advisory",
        }
    }
}

/// Signature scope; ordering is specificity (module most specific).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigScope {
    Org,
    Workspace,
    Project,
    Module,
}

impl SigScope {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "module" => Some(SigScope::Module),
            "project" => Some(SigScope::Project),
            "workspace" => Some(SigScope::Workspace),
            "org" => Some(SigScope::Org),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SigScope::Module => "module",
            SigScope::Project => "project",
            SigScope::Workspace => "workspace",
            SigScope::Org => "org",
        }
    }

    /// Higher wins contradiction tie-breaks: module > project > workspace > org.
    pub fn specificity(&self) -> u8 {
        match self {
            SigScope::Module => 3,
            SigScope::Project => 2,
            SigScope::Workspace => 1,
            SigScope::Org => 0,
        }
    }
}

/// Structured intent of a decision, used for contradiction detection.
///
/// Parsed from the `ConstraintSignatures:` list of a decision block. Only
/// the fields the integrity engine consumes are typed; everything else is
/// retained verbatim in `extra` so unknown keys survive a round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintSignature {
    pub axis_key: String,
    pub relation: Option<Relation>,
    pub object: FieldValue,
    pub enforcement: Enforcement,
    pub domain: String,
    pub subject: Option<String>,
    pub predicate: Option<String>,
    pub scope: Option<SigScope>,
    pub modality: Option<String>,
    pub priority: Option<u8>,
    /// Unrecognized `key: value` pairs, order preserved.
    pub extra: Vec<(String, String)>,
}

impl ConstraintSignature {
    /// Build a signature from parsed `- key: value` pairs. `axis.key` is
    /// mandatory; everything else defaults (`enforcement` to advisory).
    pub fn from_pairs(pairs: Vec<(String, String)>) -> Option<Self> {
        let mut sig = ConstraintSignature {
            axis_key: String::new(),
            relation: None,
            object: FieldValue::Scalar(String::new()),
            enforcement: Enforcement::Advisory,
            domain: String::new(),
            subject: None,
            predicate: None,
            scope: None,
            modality: None,
            priority: None,
            extra: Vec::new(),
        };
        for (key, value) in pairs {
            match key.as_str() {
                "axis.key" => sig.axis_key = value,
                "relation" => sig.relation = Relation::parse(&value),
                "object" => sig.object = parse_object(&value),
                "enforcement" => {
                    sig.enforcement = Enforcement::parse(&value).unwrap_or(Enforcement::Advisory)
                }
                "domain" => sig.domain = value,
                "subject" => sig.subject = Some(value),
                "predicate" => sig.predicate = Some(value),
                "scope" => sig.scope = SigScope::parse(&value),
                "modality" => sig.modality = Some(value),
                "priority" => sig.priority = value.parse::<u8>().ok().filter(|p| (1..=10).contains(p)),
                _ => sig.extra.push((key, value)),
            }
        }
        if sig.axis_key.is_empty() {
            return None;
        }
        Some(sig)
    }

    /// Serialize back to `- key: value` pairs in canonical order.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![("axis.key".to_string(), self.axis_key.clone())];
        if let Some(rel) = self.relation {
            pairs.push(("relation".to_string(), rel.as_str().to_string()));
        }
        pairs.push(("object".to_string(), serialize_object(&self.object)));
        pairs.push(("enforcement".to_string(), self.enforcement.as_str().to_string()));
        if !self.domain.is_empty() {
            pairs.push(("domain".to_string(), self.domain.clone()));
        }
        if let Some(s) = &self.subject {
            pairs.push(("subject".to_string(), s.clone()));
        }
        if let Some(p) = &self.predicate {
            pairs.push(("predicate".to_string(), p.clone()));
        }
        if let Some(sc) = self.scope {
            pairs.push(("scope".to_string(), sc.as_str().to_string()));
        }
        if let Some(m) = &self.modality {
            pairs.push(("modality".to_string(), m.clone()));
        }
        if let Some(p) = self.priority {
            pairs.push(("priority".to_string(), p.to_string()));
        }
        pairs.extend(self.extra.iter().cloned());
        pairs
    }
}

/// Objects may be scalar (`postgresql`) or bracketed lists (`[a, b]`).
fn parse_object(value: &str) -> FieldValue {
    let trimmed = value.trim();
    if let Some(inner) = trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        let items: Vec<String> = inner
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        FieldValue::List(items)
    } else {
        FieldValue::Scalar(trimmed.to_string())
    }
}

fn serialize_object(value: &FieldValue) -> String {
    match value {
        FieldValue::Scalar(s) => s.clone(),
        FieldValue::List(items) => format!("[{}]", items.join(", ")),
    }
}

/// A parsed block: ID, provenance, ordered fields, and signatures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub source_file: PathBuf,
    /// 1-based inclusive line span in the source file.
    pub line_range: (usize, usize),
    /// Insertion-ordered field map; keys unique (first occurrence wins).
    pub fields: Vec<(String, FieldValue)>,
    pub signatures: Vec<ConstraintSignature>,
}

impl Block {
    pub fn kind(&self) -> BlockKind {
        self.id.kind()
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_scalar(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.as_scalar())
    }

    pub fn status(&self) -> Option<&str> {
        self.get_scalar("Status")
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status(), Some("active" | "todo" | "doing" | "open"))
    }

    pub fn date(&self) -> Option<NaiveDate> {
        self.get_scalar("Date")
            .and_then(|d| d.get(..10).or(Some(d)))
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            .or_else(|| self.id.date())
    }

    /// Set or replace a field, preserving its position when it exists.
    pub fn set_field(&mut self, key: &str, value: FieldValue) {
        if let Some(slot) = self.fields.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value;
        } else {
            self.fields.push((key.to_string(), value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dated_id() {
        let id = BlockId::parse("D-20260213-002").unwrap();
        assert_eq!(id.kind(), BlockKind::Decision);
        assert_eq!(id.seq(), 2);
        assert_eq!(
            id.date(),
            Some(NaiveDate::from_ymd_opt(2026, 2, 13).unwrap())
        );
    }

    #[test]
    fn parses_undated_id() {
        let id = BlockId::parse("PRJ-001").unwrap();
        assert_eq!(id.kind(), BlockKind::Project);
        assert_eq!(id.date(), None);
        assert_eq!(id.seq(), 1);
    }

    #[test]
    fn rejects_bad_ids() {
        assert!(BlockId::parse("X-20260213-002").is_none());
        assert!(BlockId::parse("D-2026021-002").is_none());
        assert!(BlockId::parse("D-20260213-02").is_none());
        assert!(BlockId::parse("D-20261345-001").is_none());
        assert!(BlockId::parse("D").is_none());
    }

    #[test]
    fn signature_from_pairs_requires_axis() {
        assert!(ConstraintSignature::from_pairs(vec![(
            "domain".to_string(),
            "db".to_string()
        )])
        .is_none());
        let sig = ConstraintSignature::from_pairs(vec![
            ("axis.key".to_string(), "database.engine".to_string()),
            ("object".to_string(), "postgresql".to_string()),
            ("enforcement".to_string(), "hard".to_string()),
        ])
        .unwrap();
        assert_eq!(sig.axis_key, "database.engine");
        assert_eq!(sig.enforcement, Enforcement::Hard);
    }

    #[test]
    fn scope_specificity_ordering() {
        assert!(SigScope::Module.specificity() > SigScope::Project.specificity());
        assert!(SigScope::Project.specificity() > SigScope::Workspace.specificity());
        assert!(SigScope::Workspace.specificity() > SigScope::Org.specificity());
    }

    #[test]
    fn object_list_round_trips() {
        let v = parse_object("[a, b, c]");
        assert_eq!(serialize_object(&v), "[a, b, c]");
    }
}
