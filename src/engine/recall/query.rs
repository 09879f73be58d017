//! Query classification and gated synonym expansion.
//!
//! Classes are rule-based and mutually non-exclusive: a query can be both
//! temporal and multi-hop. Adversarial queries (verification intent)
//! expand in morph-only mode (lemma and month normalization, no
//! synonyms) so negation traps are not widened into topic drift.

use crate::engine::recall::stem::{self, is_stopword};
use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryClass {
    pub temporal: bool,
    pub multi_hop: bool,
    pub adversarial: bool,
}

impl QueryClass {
    /// Primary label for reporting; `single_hop` when nothing else fires.
    pub fn label(&self) -> &'static str {
        if self.adversarial {
            "adversarial"
        } else if self.multi_hop {
            "multi_hop"
        } else if self.temporal {
            "temporal"
        } else {
            "single_hop"
        }
    }
}

fn temporal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(?:\d{4}-\d{2}-\d{2}|\d{1,2}/\d{1,2}(?:/\d{2,4})?|january|february|march|april|may|june|july|august|september|october|november|december|(?:first|second|third|fourth|last|\d{1,2}(?:st|nd|rd|th))\s+week|before|after|when|during|yesterday|today|tomorrow)\b",
        )
        .unwrap()
    })
}

fn multi_hop_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(?:and|then|both)\b").unwrap())
}

fn adversarial_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\bdid\s+\w+\s+really\b|\bis\s+it\s+true\s+that\b|\bdidn'?t\b|\bnever\b|\bdid\s+\w+\s+not\b|\breally\s+(?:say|agree|approve|decide)\b")
            .unwrap()
    })
}

/// Capitalized tokens not at sentence start, a cheap named-entity count.
pub fn named_entities(query: &str) -> Vec<String> {
    let mut entities = Vec::new();
    let mut sentence_start = true;
    for raw in query.split_whitespace() {
        let word: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        if word.is_empty() {
            continue;
        }
        let capitalized = word.chars().next().is_some_and(|c| c.is_ascii_uppercase());
        if capitalized && !sentence_start && !is_stopword(&word.to_ascii_lowercase()) {
            let lower = word.to_ascii_lowercase();
            if !entities.contains(&lower) {
                entities.push(lower);
            }
        }
        sentence_start = raw.ends_with(['.', '!', '?']);
    }
    entities
}

pub fn classify(query: &str) -> QueryClass {
    QueryClass {
        temporal: temporal_re().is_match(query),
        multi_hop: named_entities(query).len() >= 2 || multi_hop_re().is_match(query),
        adversarial: adversarial_re().is_match(query),
    }
}

/// Domain synonym groups. Any member of a group expands to the whole
/// group; matching happens on stems.
const SYNONYM_GROUPS: &[&[&str]] = &[
    &["auth", "authentication", "login", "oauth", "jwt", "session"],
    &["db", "database", "postgres", "postgresql", "mysql", "sql", "storage"],
    &["api", "endpoint", "rest", "grpc", "route"],
    &["deployment", "deploy", "release", "rollout", "ship"],
    &["testing", "test", "ci", "coverage", "regression"],
    &["security", "vulnerability", "encryption", "secret", "credential"],
    &["performance", "latency", "throughput", "optimization", "profiling"],
];

/// Expanded, stemmed query terms. Original-token stems come first so
/// downstream bigram checks see the query's own adjacency.
pub fn expand(query: &str, class: QueryClass) -> Vec<String> {
    let stems = stem::stem_tokens(query);
    let mut expanded: Vec<String> = Vec::new();
    for s in &stems {
        if is_stopword(s) {
            continue;
        }
        if !expanded.contains(s) {
            expanded.push(s.clone());
        }
    }

    // Morph-only for adversarial queries: no synonym widening.
    if class.adversarial {
        return expanded;
    }

    let base: Vec<String> = expanded.clone();
    for term in &base {
        for group in SYNONYM_GROUPS {
            if group.iter().any(|g| stem::stem(g) == *term) {
                for g in group.iter() {
                    let gs = stem::stem(g);
                    if !expanded.contains(&gs) {
                        expanded.push(gs);
                    }
                }
            }
        }
    }
    expanded
}

/// Query-adjacent stem pairs, used for bigram scoring and coherence.
pub fn query_bigrams(query: &str) -> Vec<(String, String)> {
    let stems: Vec<String> = stem::stem_tokens(query)
        .into_iter()
        .filter(|s| !is_stopword(s))
        .collect();
    stems
        .windows(2)
        .map(|w| (w[0].clone(), w[1].clone()))
        .collect()
}
