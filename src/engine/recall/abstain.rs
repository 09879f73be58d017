//! Abstention classifier: the pre-answer gate.
//!
//! Computes cheap features over the packed result set and combines them
//! linearly. Below the configured threshold (default 0.20) the engine
//! returns the "insufficient evidence" sentinel instead of handing weak
//! context to a downstream answerer. Abstention is a normal result,
//! never an error.

use crate::engine::recall::query;
use crate::engine::recall::stem::{self, is_stopword};
use crate::engine::recall::Hit;
use serde::Serialize;
use std::collections::BTreeMap;

/// Sentinel answer returned when the gate closes.
pub const ABSTENTION_ANSWER: &str = "insufficient evidence";

pub const DEFAULT_THRESHOLD: f64 = 0.20;

const W_ENTITY_OVERLAP: f64 = 0.45;
const W_TOP_SCORE: f64 = 0.20;
const W_SPEAKER: f64 = 0.20;
const W_DENSITY: f64 = 0.15;
const NEGATION_PENALTY: f64 = 0.15;

#[derive(Debug, Clone, Serialize)]
pub struct AbstentionResult {
    pub confidence: f64,
    pub abstain: bool,
    pub features: BTreeMap<String, f64>,
    /// Empty unless abstaining.
    pub forced_answer: String,
}

/// Content-bearing query terms: stems minus stopwords.
fn query_entities(query_text: &str) -> Vec<String> {
    stem::stem_tokens(query_text)
        .into_iter()
        .filter(|t| !is_stopword(t))
        .collect()
}

/// Fraction of `entities` present in `text` (stem-matched).
fn term_overlap(text: &str, entities: &[String]) -> f64 {
    if entities.is_empty() {
        return 0.0;
    }
    let tokens = stem::stem_tokens(text);
    let present = entities.iter().filter(|e| tokens.contains(e)).count();
    present as f64 / entities.len() as f64
}

fn speaker_in_hit(hit: &Hit, speaker: &str) -> bool {
    if speaker.is_empty() {
        return false;
    }
    if hit
        .speaker
        .as_deref()
        .is_some_and(|s| s.eq_ignore_ascii_case(speaker))
    {
        return true;
    }
    hit.excerpt.to_ascii_lowercase().contains(speaker)
}

/// Ratio of non-stopword tokens across the evidence set.
fn evidence_density(hits: &[Hit]) -> f64 {
    let mut total = 0usize;
    let mut content = 0usize;
    for hit in hits {
        for token in stem::tokenize(&hit.excerpt) {
            total += 1;
            if !is_stopword(&token) {
                content += 1;
            }
        }
    }
    if total == 0 {
        0.0
    } else {
        content as f64 / total as f64
    }
}

/// Gate a query against its packed evidence.
pub fn check_abstention(query_text: &str, hits: &[Hit], threshold: f64) -> AbstentionResult {
    let mut features = BTreeMap::new();

    if hits.is_empty() {
        features.insert("entity_overlap".to_string(), 0.0);
        features.insert("top1_score_raw".to_string(), 0.0);
        features.insert("speaker_coverage".to_string(), 0.0);
        features.insert("evidence_density".to_string(), 0.0);
        features.insert("speaker_detected".to_string(), 0.0);
        features.insert("has_ever_pattern".to_string(), 0.0);
        return AbstentionResult {
            confidence: 0.0,
            abstain: true,
            features,
            forced_answer: ABSTENTION_ANSWER.to_string(),
        };
    }

    let entities = query_entities(query_text);
    let speaker = query::named_entities(query_text)
        .into_iter()
        .next()
        .unwrap_or_default();

    let overlaps: Vec<f64> = hits
        .iter()
        .map(|h| term_overlap(&h.excerpt, &entities))
        .collect();
    let mean_overlap = overlaps.iter().sum::<f64>() / overlaps.len() as f64;

    let top1 = hits
        .iter()
        .map(|h| h.score)
        .fold(0.0_f64, f64::max);
    let top1_norm = (top1 / 10.0).min(1.0);

    // No speaker in the query means coverage cannot count against it.
    let speaker_coverage = if speaker.is_empty() {
        1.0
    } else {
        let covered = hits.iter().filter(|h| speaker_in_hit(h, &speaker)).count();
        covered as f64 / hits.len() as f64
    };

    let density = evidence_density(hits);

    // Negation asymmetry: "did X ever ..." and friends probe for absence;
    // weak overlap there should read as abstain, not as a thin yes.
    let lowered = query_text.to_ascii_lowercase();
    let has_ever_pattern = lowered.contains(" ever ")
        || lowered.contains("didn't")
        || lowered.contains("didn t")
        || lowered.contains(" never ")
        || query::classify(query_text).adversarial;

    let mut confidence = W_ENTITY_OVERLAP * mean_overlap
        + W_TOP_SCORE * top1_norm
        + W_SPEAKER * speaker_coverage
        + W_DENSITY * density;
    if has_ever_pattern {
        confidence -= NEGATION_PENALTY * (1.0 - mean_overlap);
    }
    confidence = confidence.clamp(0.0, 1.0);

    features.insert("entity_overlap".to_string(), mean_overlap);
    features.insert("top1_score_raw".to_string(), top1);
    features.insert("speaker_coverage".to_string(), speaker_coverage);
    features.insert("evidence_density".to_string(), density);
    features.insert(
        "speaker_detected".to_string(),
        if speaker.is_empty() { 0.0 } else { 1.0 },
    );
    features.insert(
        "has_ever_pattern".to_string(),
        if has_ever_pattern { 1.0 } else { 0.0 },
    );

    let abstain = confidence < threshold;
    AbstentionResult {
        confidence,
        abstain,
        features,
        forced_answer: if abstain {
            ABSTENTION_ANSWER.to_string()
        } else {
            String::new()
        },
    }
}
