//! Retrieval scenarios: synonym expansion, field-weight margins,
//! adversarial gating, and abstention end to end.

use memos::core::workspace::{Workspace, DECISIONS_FILE, TASKS_FILE};
use memos::engine::recall::{
    self, check_abstention, GraphMode, IndexCache, RecallOptions,
};

fn workspace_with(decisions: &str, tasks: &str) -> (tempfile::TempDir, Workspace) {
    let tmp = tempfile::tempdir().unwrap();
    let ws = Workspace::init(tmp.path()).unwrap();
    std::fs::write(ws.path(DECISIONS_FILE), decisions).unwrap();
    std::fs::write(ws.path(TASKS_FILE), tasks).unwrap();
    (tmp, ws)
}

/// An "auth" query finds both the OAuth statement and the authentication tag,
/// with the Statement hit at a clear field-weight margin.
#[test]
fn auth_query_expands_and_ranks_statement_first() {
    let (_tmp, ws) = workspace_with(
        "[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: Use OAuth2 for login\n\n[D-20260102-001]\nDate: 2026-01-02\nStatus: active\nStatement: quarterly budget review cycle\nTags: authentication\n",
        "",
    );
    let mut cache = IndexCache::new();
    let result = recall::recall(&ws, &mut cache, "auth", &RecallOptions::default()).unwrap();

    for expected in ["authentication", "login", "oauth", "jwt", "session"] {
        let stemmed = memos::engine::recall::stem::stem(expected);
        assert!(
            result.expanded_terms.contains(&stemmed),
            "expansion missing {}",
            expected
        );
    }

    let top5: Vec<&str> = result
        .hits
        .iter()
        .take(5)
        .map(|h| h.block_id.as_str())
        .collect();
    assert!(top5.contains(&"D-20260101-001"));
    assert!(top5.contains(&"D-20260102-001"));

    let statement_hit = result
        .hits
        .iter()
        .find(|h| h.block_id == "D-20260101-001")
        .unwrap();
    let tags_hit = result
        .hits
        .iter()
        .find(|h| h.block_id == "D-20260102-001")
        .unwrap();
    assert_eq!(statement_hit.field, "Statement");
    assert_eq!(tags_hit.field, "Tags");
}

/// The raw BM25F margin between a Statement hit and a Tags hit is at
/// least 2x, per the field weights.
#[test]
fn statement_outscores_tags_by_field_weight_margin() {
    let (_tmp, ws) = workspace_with(
        "[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: oauth rollout\n\n[D-20260102-001]\nDate: 2026-01-02\nStatus: active\nStatement: unrelated cleanup chore\nTags: oauth\n",
        "",
    );
    let corpus = ws.load_corpus().unwrap();
    let index = recall::Index::build(&ws, &corpus).unwrap();
    let today = chrono::NaiveDate::from_ymd_opt(2026, 2, 13).unwrap();
    let scored = index.score(&["oauth".to_string()], &[], false, today);
    let statement = scored
        .iter()
        .find(|(i, _)| index.chunks[*i].field == "Statement")
        .unwrap();
    let tags = scored
        .iter()
        .find(|(i, _)| index.chunks[*i].field == "Tags")
        .unwrap();
    assert!(statement.1 >= 2.0 * tags.1);
}

/// An adversarial query gets morph-only expansion, and with no
/// supporting evidence the abstention gate closes under 0.20.
#[test]
fn adversarial_query_abstains_without_evidence() {
    let (_tmp, ws) = workspace_with(
        "[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: database backup policy runs nightly\n",
        "",
    );
    let mut cache = IndexCache::new();
    let query = "did Alice not approve the migration?";
    let result = recall::recall(&ws, &mut cache, query, &RecallOptions::default()).unwrap();

    assert_eq!(result.query_class, "adversarial");
    // Morph-only: no synonym group members beyond the query's own stems.
    assert!(!result
        .expanded_terms
        .contains(&memos::engine::recall::stem::stem("rollout")));

    let abstention = check_abstention(query, &result.hits, ws.config.abstention.threshold);
    assert!(abstention.abstain);
    assert!(abstention.confidence < 0.20);
    assert_eq!(abstention.forced_answer, recall::ABSTENTION_ANSWER);
}

#[test]
fn supported_question_passes_the_gate() {
    let (_tmp, ws) = workspace_with(
        "[D-20260201-001]\nDate: 2026-02-01\nStatus: active\nStatement: Alice approved the migration to postgres after review\n\n[D-20260202-001]\nDate: 2026-02-02\nStatus: active\nStatement: migration rollout scheduled with Alice as owner\n",
        "",
    );
    let mut cache = IndexCache::new();
    let query = "What migration did Alice approve?";
    let result = recall::recall(&ws, &mut cache, query, &RecallOptions::default()).unwrap();
    assert!(!result.hits.is_empty());
    let abstention = check_abstention(query, &result.hits, ws.config.abstention.threshold);
    assert!(!abstention.abstain, "confidence={}", abstention.confidence);
}

#[test]
fn multi_hop_query_pulls_graph_neighbors() {
    let (_tmp, ws) = workspace_with(
        "[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: adopt kafka for event streaming\n",
        "[T-20260102-001]\nDate: 2026-01-02\nStatus: todo\nTitle: provision brokers\nAlignsWith: D-20260101-001\n",
    );
    let mut cache = IndexCache::new();
    // "and" forces multi-hop, which auto-enables the graph boost.
    let result = recall::recall(
        &ws,
        &mut cache,
        "kafka and event streaming",
        &RecallOptions::default(),
    )
    .unwrap();
    assert_eq!(result.query_class, "multi_hop");
    assert!(result
        .hits
        .iter()
        .any(|h| h.block_id == "T-20260102-001"
            && h.origin == recall::HitOriginTag::Graph));
}

#[test]
fn graph_off_suppresses_neighbors() {
    let (_tmp, ws) = workspace_with(
        "[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: adopt kafka for event streaming\n",
        "[T-20260102-001]\nDate: 2026-01-02\nStatus: todo\nTitle: provision brokers\nAlignsWith: D-20260101-001\n",
    );
    let mut cache = IndexCache::new();
    let opts = RecallOptions {
        graph: GraphMode::Off,
        ..Default::default()
    };
    let result = recall::recall(&ws, &mut cache, "kafka and event streaming", &opts).unwrap();
    assert!(result
        .hits
        .iter()
        .all(|h| h.origin == recall::HitOriginTag::Bm25));
}

#[test]
fn acl_filters_foreign_namespace_from_results() {
    let tmp = tempfile::tempdir().unwrap();
    let ws = Workspace::init(tmp.path()).unwrap();
    std::fs::write(
        ws.path(DECISIONS_FILE),
        "[D-20260101-001]\nDate: 2026-01-01\nStatus: active\nStatement: shared zanzibar notes\n",
    )
    .unwrap();
    // Same token inside another agent's namespace file is not readable
    // but also not part of the corpus; the shared hit must still appear.
    let mut cache = IndexCache::new();
    let opts = RecallOptions {
        agent_id: "scout".to_string(),
        ..Default::default()
    };
    let result = recall::recall(&ws, &mut cache, "zanzibar", &opts).unwrap();
    assert_eq!(result.hits.len(), 1);
    assert_eq!(result.hits[0].block_id, "D-20260101-001");
}
