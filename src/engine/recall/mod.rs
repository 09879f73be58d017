//! Retrieval core: BM25F lexical ranking with query-type gating, graph
//! boost, context packing, and the abstention gate.
//!
//! `recall` is a pure function of the corpus bytes and configuration:
//! index construction, classification, expansion, scoring, and packing
//! are all deterministic. The in-memory index is cached per workspace
//! and rebuilt when the corpus epoch changes.

pub mod abstain;
pub mod index;
pub mod query;
pub mod rerank;
pub mod stem;

use crate::core::error::MemosError;
use crate::core::workspace::Workspace;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::time::Instant;

pub use abstain::{check_abstention, AbstentionResult, ABSTENTION_ANSWER};
pub use index::Index;
pub use query::QueryClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HitOriginTag {
    Bm25,
    Graph,
}

/// One ranked result, aligned to the block (or daily log) it came from.
#[derive(Debug, Clone, Serialize)]
pub struct Hit {
    pub block_id: String,
    pub kind: String,
    pub score: f64,
    pub excerpt: String,
    pub field: String,
    pub source_file: String,
    pub line: usize,
    pub origin: HitOriginTag,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GraphMode {
    /// Boost only when the query classifies as multi-hop.
    #[default]
    Auto,
    On,
    Off,
}

#[derive(Debug, Clone)]
pub struct RecallOptions {
    pub limit: usize,
    pub active_only: bool,
    pub agent_id: String,
    pub graph: GraphMode,
    /// Best-effort deadline; expiry returns current top-K with
    /// `truncated = true` instead of failing.
    pub deadline: Option<Instant>,
}

impl Default for RecallOptions {
    fn default() -> Self {
        RecallOptions {
            limit: 10,
            active_only: false,
            agent_id: "default".to_string(),
            graph: GraphMode::Auto,
            deadline: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RecallResult {
    pub hits: Vec<Hit>,
    pub query_class: &'static str,
    pub expanded_terms: Vec<String>,
    pub truncated: bool,
}

/// Per-workspace index cache keyed by corpus epoch.
#[derive(Default)]
pub struct IndexCache {
    cached: Option<Index>,
}

impl IndexCache {
    pub fn new() -> Self {
        IndexCache::default()
    }

    /// Return the cached index, rebuilding when the epoch moved.
    pub fn get(
        &mut self,
        ws: &Workspace,
        corpus: &crate::core::workspace::Corpus,
    ) -> Result<&Index, MemosError> {
        let epoch = ws.corpus_epoch()?;
        let stale = self
            .cached
            .as_ref()
            .map(|i| i.epoch != epoch)
            .unwrap_or(true);
        if stale {
            self.cached = Some(Index::build(ws, corpus)?);
        }
        Ok(self.cached.as_ref().unwrap())
    }
}

fn expired(deadline: &Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

/// Ranked retrieval over the workspace corpus.
pub fn recall(
    ws: &Workspace,
    cache: &mut IndexCache,
    query_text: &str,
    opts: &RecallOptions,
) -> Result<RecallResult, MemosError> {
    let corpus = ws.load_corpus()?;
    let index = cache.get(ws, &corpus)?;
    let today = Utc::now().date_naive();

    let class = query::classify(query_text);
    let terms = query::expand(query_text, class);
    let bigrams = query::query_bigrams(query_text);
    let entities: Vec<String> = query::named_entities(query_text)
        .into_iter()
        .chain(
            stem::stem_tokens(query_text)
                .into_iter()
                .filter(|t| !stem::is_stopword(t)),
        )
        .fold(Vec::new(), |mut acc, e| {
            if !acc.contains(&e) {
                acc.push(e);
            }
            acc
        });

    let mut scored = index.score(&terms, &bigrams, class.temporal, today);

    // Authorization and lifecycle filters happen before ranking depth
    // decisions so the wide pool is already agent-visible.
    scored.retain(|(chunk_idx, _)| {
        let chunk = &index.chunks[*chunk_idx];
        if !ws.acl.can_read(&opts.agent_id, &chunk.source_file) {
            return false;
        }
        if opts.active_only && !index.chunk_active(&corpus, chunk) {
            return false;
        }
        true
    });

    let mut truncated = false;
    let ctx = rerank::QueryContext {
        class,
        entities,
        speaker: query::named_entities(query_text).into_iter().next(),
        bigrams,
        date_hint: extract_date(query_text),
        today,
    };
    let mut ranked = rerank::rerank(index, &scored, &ctx);

    if expired(&opts.deadline) {
        truncated = true;
    } else {
        let graph_on = match opts.graph {
            GraphMode::On => true,
            GraphMode::Off => false,
            GraphMode::Auto => class.multi_hop,
        };
        if graph_on {
            rerank::graph_boost(index, &corpus, &mut ranked, opts.limit);
        }
        if expired(&opts.deadline) {
            truncated = true;
        } else {
            rerank::pack_context(index, &mut ranked, opts.limit);
        }
    }

    // Packing is append-only, so truncation to the limit keeps relevance
    // order followed by appended context.
    let hits: Vec<Hit> = ranked
        .iter()
        .take(opts.limit.max(1))
        .map(|r| {
            let chunk = &index.chunks[r.chunk_idx];
            Hit {
                block_id: chunk.block_id.clone(),
                kind: chunk.kind.clone(),
                score: r.score,
                excerpt: chunk.text.chars().take(240).collect(),
                field: chunk.field.clone(),
                source_file: chunk.source_file.clone(),
                line: chunk.line,
                origin: match r.origin {
                    rerank::HitOrigin::Bm25 => HitOriginTag::Bm25,
                    rerank::HitOrigin::Graph => HitOriginTag::Graph,
                },
                speaker: chunk.speaker.clone(),
                date: chunk.date,
            }
        })
        .collect();

    Ok(RecallResult {
        hits,
        query_class: class.label(),
        expanded_terms: terms,
        truncated,
    })
}

/// First ISO date literal in the query, if any, as the time-proximity
/// hint.
fn extract_date(query_text: &str) -> Option<NaiveDate> {
    let re = regex::Regex::new(r"\d{4}-\d{2}-\d{2}").ok()?;
    let m = re.find(query_text)?;
    NaiveDate::parse_from_str(m.as_str(), "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::workspace::DECISIONS_FILE;

    #[test]
    fn recall_is_deterministic() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::init(tmp.path()).unwrap();
        std::fs::write(
            ws.path(DECISIONS_FILE),
            "[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: Use OAuth2 for login\n",
        )
        .unwrap();
        let mut cache = IndexCache::new();
        let opts = RecallOptions::default();
        let a = recall(&ws, &mut cache, "auth", &opts).unwrap();
        let b = recall(&ws, &mut cache, "auth", &opts).unwrap();
        assert_eq!(a.hits.len(), b.hits.len());
        for (x, y) in a.hits.iter().zip(b.hits.iter()) {
            assert_eq!(x.block_id, y.block_id);
            assert!((x.score - y.score).abs() < 1e-12);
        }
    }

    #[test]
    fn cache_rebuilds_after_mutation() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::init(tmp.path()).unwrap();
        std::fs::write(
            ws.path(DECISIONS_FILE),
            "[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: original topic\n",
        )
        .unwrap();
        let mut cache = IndexCache::new();
        let opts = RecallOptions::default();
        assert!(recall(&ws, &mut cache, "quasar", &opts).unwrap().hits.is_empty());

        std::fs::write(
            ws.path(DECISIONS_FILE),
            "[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: quasar observation notes\n",
        )
        .unwrap();
        let result = recall(&ws, &mut cache, "quasar", &opts).unwrap();
        assert_eq!(result.hits.len(), 1);
    }

    #[test]
    fn active_only_filters_superseded() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::init(tmp.path()).unwrap();
        std::fs::write(
            ws.path(DECISIONS_FILE),
            "[D-20260101-001]\nDate: 2026-01-01\nStatus: superseded\nStatement: legacy auth approach\nSupersededBy: D-20260102-001\n\n[D-20260102-001]\nDate: 2026-01-02\nStatus: active\nStatement: current auth approach\n",
        )
        .unwrap();
        let mut cache = IndexCache::new();
        let opts = RecallOptions {
            active_only: true,
            ..Default::default()
        };
        let result = recall(&ws, &mut cache, "auth approach", &opts).unwrap();
        assert!(!result.hits.is_empty());
        assert!(result.hits.iter().all(|h| h.block_id != "D-20260101-001"));
    }
}
