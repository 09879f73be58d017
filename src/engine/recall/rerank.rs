//! Wide-retrieval rerank, cross-reference graph boost, and context
//! packing.
//!
//! The top-200 BM25F candidates are re-scored by five fixed-weight
//! signals, then 1- and 2-hop cross-reference neighbors are surfaced at
//! a fraction of their source's score. Context packing appends adjacent
//! utterances, entity-diverse chunks, and pronoun antecedents; it never
//! reorders what ranking produced.

use crate::core::workspace::Corpus;
use crate::engine::recall::index::Index;
use crate::engine::recall::query::QueryClass;
use crate::engine::recall::stem;
use chrono::NaiveDate;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

pub const WIDE_POOL: usize = 200;

const W_SPEAKER: f64 = 0.15;
const W_TIME: f64 = 0.10;
const W_ENTITY: f64 = 0.20;
const W_BIGRAM: f64 = 0.15;
const W_RECENCY: f64 = 0.10;

const GRAPH_1HOP: f64 = 0.3;
const GRAPH_2HOP: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitOrigin {
    Bm25,
    Graph,
}

#[derive(Debug, Clone)]
pub struct Ranked {
    pub chunk_idx: usize,
    pub score: f64,
    pub origin: HitOrigin,
}

fn block_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(?:D|T|PRJ|PER|TOOL|INC|C|DREF|SIG|P|I|B|S)-(?:\d{8}-)?\d{3}\b").unwrap()
    })
}

pub struct QueryContext {
    pub class: QueryClass,
    pub entities: Vec<String>,
    pub speaker: Option<String>,
    pub bigrams: Vec<(String, String)>,
    pub date_hint: Option<NaiveDate>,
    pub today: NaiveDate,
}

/// Re-score the wide pool: normalized BM25F plus the five signals.
/// Output is sorted, best first.
pub fn rerank(index: &Index, scored: &[(usize, f64)], ctx: &QueryContext) -> Vec<Ranked> {
    let pool = &scored[..scored.len().min(WIDE_POOL)];
    let max_score = pool.first().map(|(_, s)| *s).unwrap_or(1.0).max(f64::EPSILON);

    let mut ranked: Vec<Ranked> = pool
        .iter()
        .map(|&(chunk_idx, bm25)| {
            let chunk = &index.chunks[chunk_idx];
            let mut score = bm25 / max_score;

            // speaker_match: ±0.15 when the query names a speaker.
            if let Some(speaker) = &ctx.speaker {
                let hit = chunk
                    .speaker
                    .as_deref()
                    .is_some_and(|s| s.eq_ignore_ascii_case(speaker))
                    || chunk.text.to_ascii_lowercase().contains(speaker);
                score += if hit { W_SPEAKER } else { -W_SPEAKER };
            }

            // time_proximity: ±0.10 toward the query's date hint.
            if let (Some(hint), Some(date)) = (ctx.date_hint, chunk.date) {
                let days = (hint - date).num_days().abs() as f64;
                let closeness = (-days / 30.0).exp();
                score += W_TIME * (2.0 * closeness - 1.0);
            }

            // entity_overlap: 0..0.20 of query entities present.
            if !ctx.entities.is_empty() {
                let text = chunk.text.to_ascii_lowercase();
                let present = ctx
                    .entities
                    .iter()
                    .filter(|e| text.contains(e.as_str()))
                    .count();
                score += W_ENTITY * present as f64 / ctx.entities.len() as f64;
            }

            // bigram_coherence: 0..0.15 of query pairs intact.
            if !ctx.bigrams.is_empty() {
                let intact = ctx
                    .bigrams
                    .iter()
                    .filter(|(a, b)| index.has_bigram(chunk_idx, a, b))
                    .count();
                score += W_BIGRAM * intact as f64 / ctx.bigrams.len() as f64;
            }

            // recency_decay: 0..0.10.
            if let Some(date) = chunk.date {
                let age = (ctx.today - date).num_days().max(0) as f64;
                score += W_RECENCY * (-age / 180.0).exp();
            }

            Ranked {
                chunk_idx,
                score,
                origin: HitOrigin::Bm25,
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                index.chunks[a.chunk_idx]
                    .block_id
                    .cmp(&index.chunks[b.chunk_idx].block_id)
            })
    });
    ranked
}

/// Cross-reference neighbors of a block: every block ID mentioned in its
/// fields, plus anything that mentions it (the impact direction).
fn neighbors(corpus: &Corpus, block_id: &str) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(block) = corpus.get(block_id) {
        for (_, value) in &block.fields {
            for item in value.items() {
                for m in block_ref_re().find_iter(item) {
                    if m.as_str() != block_id && !out.contains(&m.as_str().to_string()) {
                        out.push(m.as_str().to_string());
                    }
                }
            }
        }
    }
    for other in &corpus.blocks {
        if other.id.as_str() == block_id {
            continue;
        }
        let mentions = other.fields.iter().any(|(_, v)| {
            v.items()
                .iter()
                .any(|item| item.contains(block_id))
        });
        if mentions && !out.contains(&other.id.as_str().to_string()) {
            out.push(other.id.as_str().to_string());
        }
    }
    out
}

/// Surface 1-hop (×0.3) and 2-hop (×0.1) neighbors of the top-K as
/// graph-origin results, appended after the reranked list.
pub fn graph_boost(
    index: &Index,
    corpus: &Corpus,
    ranked: &mut Vec<Ranked>,
    top_k: usize,
) {
    // Represent each neighbor block by its heaviest-field chunk.
    let mut chunk_of_block: HashMap<&str, usize> = HashMap::new();
    for (i, chunk) in index.chunks.iter().enumerate() {
        match chunk_of_block.get(chunk.block_id.as_str()) {
            Some(&j)
                if crate::engine::recall::index::field_weight(&index.chunks[j].field)
                    >= crate::engine::recall::index::field_weight(&chunk.field) => {}
            _ => {
                chunk_of_block.insert(chunk.block_id.as_str(), i);
            }
        }
    }

    let mut present: HashSet<String> = ranked
        .iter()
        .map(|r| index.chunks[r.chunk_idx].block_id.clone())
        .collect();

    let seeds: Vec<(String, f64)> = ranked
        .iter()
        .take(top_k)
        .map(|r| (index.chunks[r.chunk_idx].block_id.clone(), r.score))
        .collect();

    let mut additions: Vec<Ranked> = Vec::new();
    for (seed_id, seed_score) in &seeds {
        for hop1 in neighbors(corpus, seed_id) {
            if present.contains(&hop1) {
                continue;
            }
            if let Some(&chunk_idx) = chunk_of_block.get(hop1.as_str()) {
                additions.push(Ranked {
                    chunk_idx,
                    score: seed_score * GRAPH_1HOP,
                    origin: HitOrigin::Graph,
                });
                present.insert(hop1.clone());

                for hop2 in neighbors(corpus, &hop1) {
                    if present.contains(&hop2) {
                        continue;
                    }
                    if let Some(&chunk_idx2) = chunk_of_block.get(hop2.as_str()) {
                        additions.push(Ranked {
                            chunk_idx: chunk_idx2,
                            score: seed_score * GRAPH_2HOP,
                            origin: HitOrigin::Graph,
                        });
                        present.insert(hop2);
                    }
                }
            }
        }
    }
    additions.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    ranked.extend(additions);
}

const LEADING_PRONOUNS: &[&str] = &["he", "she", "they", "it", "this", "that"];

/// Append-only context packing over the final window. Never reorders.
pub fn pack_context(index: &Index, ranked: &mut Vec<Ranked>, top_k: usize) {
    let mut present: HashSet<usize> = ranked.iter().map(|r| r.chunk_idx).collect();
    let window: Vec<Ranked> = ranked.iter().take(top_k).cloned().collect();

    // Dialog adjacency: neighbors of matched utterances.
    for r in &window {
        let chunk = &index.chunks[r.chunk_idx];
        if chunk.speaker.is_none() || chunk.kind != "log" {
            continue;
        }
        for (i, other) in index.chunks.iter().enumerate() {
            if other.source_file == chunk.source_file
                && (other.ordinal + 1 == chunk.ordinal || other.ordinal == chunk.ordinal + 1)
                && !present.contains(&i)
            {
                ranked.push(Ranked {
                    chunk_idx: i,
                    score: 0.0,
                    origin: HitOrigin::Bm25,
                });
                present.insert(i);
            }
        }
    }

    // Entity diversity: if the window is dominated by one speaker,
    // append the best chunk voiced by someone else.
    let speakers: HashSet<&str> = window
        .iter()
        .filter_map(|r| index.chunks[r.chunk_idx].speaker.as_deref())
        .collect();
    if speakers.len() == 1 && window.len() > 1 {
        let dominant = *speakers.iter().next().unwrap();
        if let Some((i, _)) = index
            .chunks
            .iter()
            .enumerate()
            .filter(|(i, c)| {
                !present.contains(i)
                    && c.speaker.as_deref().is_some_and(|s| s != dominant)
            })
            .map(|(i, c)| (i, c.tokens.len()))
            .max_by_key(|&(_, len)| len)
        {
            ranked.push(Ranked {
                chunk_idx: i,
                score: 0.0,
                origin: HitOrigin::Bm25,
            });
            present.insert(i);
        }
    }

    // Pronoun rescue: a window chunk opening on a third-person pronoun
    // pulls its predecessor for the antecedent.
    for r in &window {
        let chunk = &index.chunks[r.chunk_idx];
        let first = stem::tokenize(&chunk.text)
            .into_iter()
            .next()
            .unwrap_or_default();
        if !LEADING_PRONOUNS.contains(&first.as_str()) || chunk.ordinal == 0 {
            continue;
        }
        for (i, other) in index.chunks.iter().enumerate() {
            if other.block_id == chunk.block_id
                && other.field == chunk.field
                && other.ordinal + 1 == chunk.ordinal
                && !present.contains(&i)
            {
                ranked.push(Ranked {
                    chunk_idx: i,
                    score: 0.0,
                    origin: HitOrigin::Bm25,
                });
                present.insert(i);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::workspace::{Workspace, DECISIONS_FILE, TASKS_FILE};
    use crate::engine::recall::query;

    fn setup(decisions: &str, tasks: &str, log: Option<(&str, &str)>) -> (tempfile::TempDir, Workspace, Index, Corpus) {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::init(tmp.path()).unwrap();
        std::fs::write(ws.path(DECISIONS_FILE), decisions).unwrap();
        std::fs::write(ws.path(TASKS_FILE), tasks).unwrap();
        if let Some((date, content)) = log {
            let d = NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap();
            ws.append_daily_log(d, content).unwrap();
        }
        let corpus = ws.load_corpus().unwrap();
        let index = Index::build(&ws, &corpus).unwrap();
        (tmp, ws, index, corpus)
    }

    fn ctx(query_text: &str, today: &str) -> QueryContext {
        let class = query::classify(query_text);
        QueryContext {
            class,
            entities: query::named_entities(query_text)
                .into_iter()
                .chain(
                    stem::stem_tokens(query_text)
                        .into_iter()
                        .filter(|t| !stem::is_stopword(t)),
                )
                .collect(),
            speaker: query::named_entities(query_text).into_iter().next(),
            bigrams: query::query_bigrams(query_text),
            date_hint: None,
            today: NaiveDate::parse_from_str(today, "%Y-%m-%d").unwrap(),
        }
    }

    #[test]
    fn entity_overlap_lifts_matching_chunk() {
        let (_tmp, _ws, index, _corpus) = setup(
            "[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: Alice approved the rollout plan\n\n[D-20260102-001]\nDate: 2026-01-02\nStatus: active\nStatement: the rollout plan has steps\n",
            "",
            None,
        );
        let today = NaiveDate::from_ymd_opt(2026, 2, 13).unwrap();
        let scored = index.score(
            &["rollout".to_string(), "plan".to_string(), "alice".to_string()],
            &[],
            false,
            today,
        );
        let ranked = rerank(&index, &scored, &ctx("What did Alice decide about the rollout plan?", "2026-02-13"));
        assert_eq!(index.chunks[ranked[0].chunk_idx].block_id, "D-20260101-001");
    }

    #[test]
    fn graph_boost_surfaces_aligned_task() {
        let (_tmp, _ws, index, corpus) = setup(
            "[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: adopt postgres everywhere\n",
            "[T-20260102-001]\nDate: 2026-01-02\nStatus: todo\nTitle: provision cluster\nAlignsWith: D-20260101-001\n",
            None,
        );
        let today = NaiveDate::from_ymd_opt(2026, 2, 13).unwrap();
        let scored = index.score(&["postgre".to_string(), "postgres".to_string()], &[], false, today);
        let mut ranked = rerank(&index, &scored, &ctx("postgres", "2026-02-13"));
        let before = ranked.len();
        graph_boost(&index, &corpus, &mut ranked, 5);
        assert!(ranked.len() > before);
        let graph_hit = ranked.iter().find(|r| r.origin == HitOrigin::Graph).unwrap();
        assert_eq!(index.chunks[graph_hit.chunk_idx].block_id, "T-20260102-001");
        // 1-hop neighbors carry 0.3 of their seed's score.
        assert!(graph_hit.score <= ranked[0].score * GRAPH_1HOP + f64::EPSILON);
    }

    #[test]
    fn packing_appends_dialog_neighbors() {
        let log = "Alice: the deploy went fine.\nBob: good to hear.\nAlice: one more thing.\nBob: the quorum setting needs review.\nAlice: noted, will check.\nBob: thanks.\n";
        let (_tmp, _ws, index, _corpus) = setup("", "", Some(("2026-02-10", log)));
        let today = NaiveDate::from_ymd_opt(2026, 2, 13).unwrap();
        let scored = index.score(&["quorum".to_string()], &[], false, today);
        assert_eq!(scored.len(), 1);
        let matched = &index.chunks[scored[0].0];
        assert_eq!(matched.ordinal, 1);

        let mut ranked = rerank(&index, &scored, &ctx("quorum setting", "2026-02-13"));
        pack_context(&index, &mut ranked, 1);
        // The matched window stays first; its neighbor windows append.
        assert_eq!(index.chunks[ranked[0].chunk_idx].ordinal, 1);
        let appended: Vec<usize> = ranked[1..]
            .iter()
            .map(|r| index.chunks[r.chunk_idx].ordinal)
            .collect();
        assert!(appended.contains(&0));
        assert!(appended.contains(&2));
    }
}
