//! Chunking, inverted index, and BM25F scoring.
//!
//! Every block field is chunked into overlapping 3-sentence windows
//! (stride 2) tagged with the field they came from; daily logs are
//! chunked the same way as body text, with `Speaker:` prefixes captured
//! for the rerank stage. The index is rebuilt whenever the corpus epoch
//! changes.

use crate::core::block::BlockKind;
use crate::core::error::MemosError;
use crate::core::workspace::{Corpus, Workspace};
use crate::engine::recall::stem;
use chrono::NaiveDate;
use std::collections::HashMap;

pub const K1: f64 = 1.2;
pub const B: f64 = 0.75;

/// Fields carrying searchable text, with their BM25F weights.
const FIELD_WEIGHTS: &[(&str, f64)] = &[
    ("Statement", 3.0),
    ("Title", 2.5),
    ("Name", 2.0),
    ("Summary", 1.5),
    ("Body", 1.0),
    ("Tags", 0.8),
    ("Context", 0.5),
];

/// Weight for a field tag; unknown text fields index at body weight.
pub fn field_weight(field: &str) -> f64 {
    FIELD_WEIGHTS
        .iter()
        .find(|(name, _)| *name == field)
        .map(|(_, w)| *w)
        .unwrap_or(1.0)
}

/// Additional fields worth indexing at their mapped weight.
const EXTRA_TEXT_FIELDS: &[(&str, &str)] = &[
    ("Description", "Summary"),
    ("Reason", "Context"),
    ("Excerpt", "Body"),
    ("Date", "Date"),
];

/// One scored retrieval unit, aligned to the block (or log) it came from.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub block_id: String,
    pub kind: String,
    /// Field-origin tag (Statement, Title, ..., Body for log text).
    pub field: String,
    pub text: String,
    pub tokens: Vec<String>,
    pub date: Option<NaiveDate>,
    pub speaker: Option<String>,
    pub source_file: String,
    pub line: usize,
    /// Position of this chunk within its source, for dialog adjacency.
    pub ordinal: usize,
}

#[derive(Debug, Default)]
pub struct Index {
    pub chunks: Vec<Chunk>,
    /// stem → (chunk index, term frequency)
    postings: HashMap<String, Vec<(usize, u32)>>,
    /// "a b" adjacent stem pair → chunk indices
    bigrams: HashMap<String, Vec<usize>>,
    /// document frequency per stem
    df: HashMap<String, u32>,
    /// mean token length per field tag
    avg_len: HashMap<String, f64>,
    pub epoch: String,
}

/// Split text into sentences on terminal punctuation and newlines.
fn sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?' | '\n') {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                out.push(trimmed.to_string());
            }
            current.clear();
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
    out
}

/// Overlapping 3-sentence windows with stride 2.
fn windows(sents: &[String]) -> Vec<String> {
    if sents.is_empty() {
        return Vec::new();
    }
    if sents.len() <= 3 {
        return vec![sents.join(" ")];
    }
    let mut out = Vec::new();
    let mut start = 0;
    while start < sents.len() {
        let end = (start + 3).min(sents.len());
        out.push(sents[start..end].join(" "));
        if end == sents.len() {
            break;
        }
        start += 2;
    }
    out
}

/// `Speaker: text` prefix of a log line, when it looks like dialog.
fn extract_speaker(text: &str) -> Option<String> {
    let (head, _) = text.split_once(':')?;
    let head = head.trim();
    if head.is_empty() || head.len() > 24 || head.contains(' ') {
        return None;
    }
    if head.chars().next().is_some_and(|c| c.is_ascii_uppercase())
        && head.chars().all(|c| c.is_ascii_alphanumeric())
    {
        Some(head.to_string())
    } else {
        None
    }
}

impl Index {
    /// Build the full index from the corpus plus daily logs.
    pub fn build(ws: &Workspace, corpus: &Corpus) -> Result<Self, MemosError> {
        let mut index = Index {
            epoch: ws.corpus_epoch()?,
            ..Default::default()
        };

        for block in &corpus.blocks {
            let kind = format!("{:?}", block.kind()).to_lowercase();
            let date = block.date();
            let source = block.source_file.to_string_lossy().replace('\\', "/");
            let mut ordinal = 0;

            for (key, value) in &block.fields {
                let field_tag = FIELD_WEIGHTS
                    .iter()
                    .map(|(name, _)| *name)
                    .find(|name| *name == key.as_str())
                    .or_else(|| {
                        EXTRA_TEXT_FIELDS
                            .iter()
                            .find(|(name, _)| *name == key.as_str())
                            .map(|(_, tag)| *tag)
                    });
                let Some(field_tag) = field_tag else {
                    continue;
                };
                let text = value.items().join(" ");
                for window in windows(&sentences(&text)) {
                    index.push_chunk(Chunk {
                        block_id: block.id.as_str().to_string(),
                        kind: kind.clone(),
                        field: field_tag.to_string(),
                        speaker: extract_speaker(&window),
                        tokens: stem::stem_tokens(&window),
                        text: window,
                        date,
                        source_file: source.clone(),
                        line: block.line_range.0,
                        ordinal,
                    });
                    ordinal += 1;
                }
            }

            // Signature text participates at Tags weight so constraint
            // vocabulary is findable.
            let mut sig_text = String::new();
            for sig in &block.signatures {
                sig_text.push_str(&sig.axis_key.replace('.', " "));
                sig_text.push(' ');
                for item in sig.object.items() {
                    sig_text.push_str(item);
                    sig_text.push(' ');
                }
                sig_text.push_str(&sig.domain);
                sig_text.push(' ');
            }
            if !sig_text.trim().is_empty() {
                index.push_chunk(Chunk {
                    block_id: block.id.as_str().to_string(),
                    kind: kind.clone(),
                    field: "Tags".to_string(),
                    speaker: None,
                    tokens: stem::stem_tokens(&sig_text),
                    text: sig_text.trim().to_string(),
                    date,
                    source_file: source.clone(),
                    line: block.line_range.0,
                    ordinal,
                });
            }
        }

        for (date, path) in ws.daily_logs()? {
            let content = std::fs::read_to_string(&path)?;
            let rel = path
                .strip_prefix(ws.root())
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            let block_id = format!("LOG-{}", date.format("%Y-%m-%d"));
            for (ordinal, window) in windows(&sentences(&content)).into_iter().enumerate() {
                index.push_chunk(Chunk {
                    block_id: block_id.clone(),
                    kind: "log".to_string(),
                    field: "Body".to_string(),
                    speaker: extract_speaker(&window),
                    tokens: stem::stem_tokens(&window),
                    text: window,
                    date: Some(date),
                    source_file: rel.clone(),
                    line: 1,
                    ordinal,
                });
            }
        }

        index.finalize();
        Ok(index)
    }

    fn push_chunk(&mut self, chunk: Chunk) {
        let idx = self.chunks.len();
        let mut tf: HashMap<&str, u32> = HashMap::new();
        for token in &chunk.tokens {
            *tf.entry(token.as_str()).or_insert(0) += 1;
        }
        for (token, count) in tf {
            self.postings
                .entry(token.to_string())
                .or_default()
                .push((idx, count));
            *self.df.entry(token.to_string()).or_insert(0) += 1;
        }
        for pair in chunk.tokens.windows(2) {
            let key = format!("{} {}", pair[0], pair[1]);
            let entry = self.bigrams.entry(key).or_default();
            if entry.last() != Some(&idx) {
                entry.push(idx);
            }
        }
        self.chunks.push(chunk);
    }

    fn finalize(&mut self) {
        let mut totals: HashMap<String, (usize, usize)> = HashMap::new();
        for chunk in &self.chunks {
            let entry = totals.entry(chunk.field.clone()).or_insert((0, 0));
            entry.0 += chunk.tokens.len();
            entry.1 += 1;
        }
        for (field, (tokens, count)) in totals {
            self.avg_len
                .insert(field, tokens as f64 / count.max(1) as f64);
        }
    }

    fn idf(&self, term: &str) -> f64 {
        let n = self.chunks.len() as f64;
        let df = *self.df.get(term).unwrap_or(&0) as f64;
        (((n - df + 0.5) / (df + 0.5)) + 1.0).ln()
    }

    pub fn has_bigram(&self, chunk_idx: usize, a: &str, b: &str) -> bool {
        // Posting lists are built in chunk order, so they are sorted.
        self.bigrams
            .get(&format!("{} {}", a, b))
            .is_some_and(|v| v.binary_search(&chunk_idx).is_ok())
    }

    /// BM25F over the expanded term set, plus the bigram adjacency bonus
    /// and temporal adjustments. Returns (chunk index, score) for every
    /// chunk with a nonzero score.
    ///
    /// Scores are invariant under insertion of blocks containing none of
    /// the query's expanded terms, except through the corpus-wide IDF
    /// denominators the formula itself prescribes.
    pub fn score(
        &self,
        terms: &[String],
        bigrams: &[(String, String)],
        temporal: bool,
        today: NaiveDate,
    ) -> Vec<(usize, f64)> {
        let mut scores: HashMap<usize, f64> = HashMap::new();
        let mut term_scores: HashMap<(usize, &str), f64> = HashMap::new();

        for term in terms {
            let Some(postings) = self.postings.get(term) else {
                continue;
            };
            let idf = self.idf(term);
            for &(chunk_idx, tf) in postings {
                let chunk = &self.chunks[chunk_idx];
                let avg = *self.avg_len.get(&chunk.field).unwrap_or(&1.0);
                let len_norm = 1.0 - B + B * (chunk.tokens.len() as f64 / avg.max(1.0));
                let tf = tf as f64;
                let partial =
                    idf * field_weight(&chunk.field) * (tf * (K1 + 1.0)) / (tf + K1 * len_norm);
                *scores.entry(chunk_idx).or_insert(0.0) += partial;
                term_scores.insert((chunk_idx, term.as_str()), partial);
            }
        }

        // +25% of the pair's base term score per adjacent pair present.
        let chunk_ids: Vec<usize> = scores.keys().copied().collect();
        for chunk_idx in chunk_ids {
            let mut bonus = 0.0;
            for (a, b) in bigrams {
                if self.has_bigram(chunk_idx, a, b) {
                    let base = term_scores.get(&(chunk_idx, a.as_str())).unwrap_or(&0.0)
                        + term_scores.get(&(chunk_idx, b.as_str())).unwrap_or(&0.0);
                    bonus += 0.25 * base;
                }
            }
            *scores.get_mut(&chunk_idx).unwrap() += bonus;
        }

        if temporal {
            for (chunk_idx, score) in scores.iter_mut() {
                let chunk = &self.chunks[*chunk_idx];
                if chunk.field == "Date" {
                    *score *= 2.0;
                }
                if let Some(date) = chunk.date {
                    let age = (today - date).num_days().max(0) as f64;
                    *score *= (-age / 180.0).exp();
                }
            }
        }

        let mut out: Vec<(usize, f64)> = scores.into_iter().filter(|(_, s)| *s > 0.0).collect();
        out.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| self.chunks[a.0].block_id.cmp(&self.chunks[b.0].block_id))
        });
        out
    }

    /// Whether a chunk belongs to an active block (logs always count).
    pub fn chunk_active(&self, corpus: &Corpus, chunk: &Chunk) -> bool {
        if chunk.kind == "log" {
            return true;
        }
        corpus.get(&chunk.block_id).is_some_and(|b| {
            b.is_active() || b.kind() == BlockKind::Project || b.kind() == BlockKind::Person
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::workspace::{Workspace, DECISIONS_FILE};

    fn indexed(decisions: &str) -> (tempfile::TempDir, Workspace, Index, Corpus) {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::init(tmp.path()).unwrap();
        std::fs::write(ws.path(DECISIONS_FILE), decisions).unwrap();
        let corpus = ws.load_corpus().unwrap();
        let index = Index::build(&ws, &corpus).unwrap();
        (tmp, ws, index, corpus)
    }

    #[test]
    fn sentence_windows_stride_two() {
        let sents: Vec<String> = (1..=6).map(|i| format!("s{}.", i)).collect();
        let w = windows(&sents);
        assert_eq!(w.len(), 3);
        assert_eq!(w[0], "s1. s2. s3.");
        assert_eq!(w[1], "s3. s4. s5.");
        assert_eq!(w[2], "s5. s6.");
    }

    #[test]
    fn statement_field_outweighs_tags() {
        let (_tmp, _ws, index, _corpus) = indexed(
            "[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: OAuth migration plan\n\n[D-20260102-001]\nDate: 2026-01-02\nStatus: active\nStatement: unrelated topic\nTags: oauth\n",
        );
        let today = NaiveDate::from_ymd_opt(2026, 2, 13).unwrap();
        let scored = index.score(&["oauth".to_string()], &[], false, today);
        assert!(scored.len() >= 2);
        let top = &index.chunks[scored[0].0];
        assert_eq!(top.field, "Statement");
        // Field weights 3.0 vs 0.8 give at least a 2x margin.
        assert!(scored[0].1 >= 2.0 * scored[1].1);
    }

    #[test]
    fn bigram_adjacency_adds_bonus() {
        let (_tmp, _ws, index, _corpus) = indexed(
            "[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: database migration finished\n\n[D-20260102-001]\nDate: 2026-01-02\nStatus: active\nStatement: migration of the database\n",
        );
        let today = NaiveDate::from_ymd_opt(2026, 2, 13).unwrap();
        let terms = vec!["database".to_string(), "migration".to_string()];
        let bigrams = vec![("database".to_string(), "migration".to_string())];
        let scored = index.score(&terms, &bigrams, false, today);
        let top = &index.chunks[scored[0].0];
        assert_eq!(top.block_id, "D-20260101-001");
    }

    #[test]
    fn temporal_scoring_prefers_recent() {
        let (_tmp, _ws, index, _corpus) = indexed(
            "[D-20240101-001]\nDate: 2024-01-01\nStatus: active\nStatement: deploy pipeline rework\n\n[D-20260201-001]\nDate: 2026-02-01\nStatus: active\nStatement: deploy pipeline rework\n",
        );
        let today = NaiveDate::from_ymd_opt(2026, 2, 13).unwrap();
        let scored = index.score(&["deploy".to_string()], &[], true, today);
        assert_eq!(index.chunks[scored[0].0].block_id, "D-20260201-001");
        assert!(scored[0].1 > scored[1].1);
    }

    #[test]
    fn ranking_stable_under_unrelated_insertion() {
        let base = "[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: use oauth for login\n\n[D-20260102-001]\nDate: 2026-01-02\nStatus: active\nStatement: oauth mentioned in passing among other words here\n";
        let (_t1, _w1, index_a, _c1) = indexed(base);
        let with_noise = format!(
            "{}\n[D-20260103-001]\nDate: 2026-01-03\nStatus: active\nStatement: completely unrelated grocery planning\n",
            base
        );
        let (_t2, _w2, index_b, _c2) = indexed(&with_noise);
        let today = NaiveDate::from_ymd_opt(2026, 2, 13).unwrap();
        let a = index_a.score(&["oauth".to_string()], &[], false, today);
        let b = index_b.score(&["oauth".to_string()], &[], false, today);
        let order_a: Vec<&str> = a.iter().map(|(i, _)| index_a.chunks[*i].block_id.as_str()).collect();
        let order_b: Vec<&str> = b.iter().map(|(i, _)| index_b.chunks[*i].block_id.as_str()).collect();
        assert_eq!(order_a, order_b);
    }

    #[test]
    fn speaker_extracted_from_dialog_lines() {
        assert_eq!(extract_speaker("Emma: let's adopt the dog."), Some("Emma".to_string()));
        assert_eq!(extract_speaker("no speaker here"), None);
        assert_eq!(extract_speaker("2026-01-01: date not speaker"), None);
    }
}
