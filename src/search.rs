//! Run-scoped retrieval: vector, keyword, and fused hybrid search.
//!
//! Hybrid search runs both sub-searches concurrently under a shared deadline
//! and fuses their rankings with reciprocal rank fusion (RRF). A single
//! failing sub-search degrades to the surviving ranking and logs a degraded
//! event; only when both fail does the call error. Reranking reorders the
//! fused candidates when a relevance scorer is configured and silently
//! falls back to the fused order when it fails.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::events;
use crate::models::{EventType, SearchMode, SearchResult};
use crate::providers::{blob_to_vec, cosine_similarity, EmbeddingService, RelevanceScorer};
use crate::store;

/// Cosine similarity over the run's stored vectors, best-first.
pub async fn vector_search(
    pool: &SqlitePool,
    embedder: &dyn EmbeddingService,
    run_id: Uuid,
    query: &str,
    limit: usize,
) -> Result<Vec<SearchResult>> {
    // Searching a missing run is an error, not an empty result.
    store::get_run(pool, run_id).await?;

    let query_vec = embedder
        .embed(&[query.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::Internal(anyhow::anyhow!("empty embedding response")))?;

    let rows = sqlx::query(
        r#"
        SELECT cv.chunk_id, cv.embedding, c.chunk_index
        FROM chunk_vectors cv
        JOIN chunks c ON c.id = cv.chunk_id
        WHERE cv.run_id = ?
        "#,
    )
    .bind(run_id.to_string())
    .fetch_all(pool)
    .await?;

    let mut scored: Vec<(String, f64, i64)> = rows
        .iter()
        .map(|row| {
            let chunk_id: String = row.get("chunk_id");
            let blob: Vec<u8> = row.get("embedding");
            let chunk_index: i64 = row.get("chunk_index");
            let sim = cosine_similarity(&query_vec, &blob_to_vec(&blob)) as f64;
            (chunk_id, sim, chunk_index)
        })
        .collect();

    // Best-first, ties by ascending chunk_index.
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.2.cmp(&b.2))
    });
    scored.truncate(limit);
    let scored: Vec<(String, f64)> = scored.into_iter().map(|(id, s, _)| (id, s)).collect();

    hydrate(pool, &scored, SearchMode::Vector).await
}

/// BM25 keyword search over the run's lexical index, best-first.
///
/// The query string is handed to FTS5 as-is; malformed query syntax fails
/// this arm rather than being rewritten.
pub async fn keyword_search(
    pool: &SqlitePool,
    run_id: Uuid,
    query: &str,
    limit: usize,
) -> Result<Vec<SearchResult>> {
    // Searching a missing run is an error, not an empty result.
    store::get_run(pool, run_id).await?;

    let rows = sqlx::query(
        r#"
        SELECT chunks_fts.chunk_id, bm25(chunks_fts) AS rank
        FROM chunks_fts
        JOIN chunks c ON c.id = chunks_fts.chunk_id
        WHERE chunks_fts MATCH ? AND chunks_fts.run_id = ?
        ORDER BY rank, c.chunk_index
        LIMIT ?
        "#,
    )
    .bind(query)
    .bind(run_id.to_string())
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    // bm25() is smaller-is-better; negate so every mode is best-first
    // descending.
    let scored: Vec<(String, f64)> = rows
        .iter()
        .map(|row| {
            let chunk_id: String = row.get("chunk_id");
            let rank: f64 = row.get("rank");
            (chunk_id, -rank)
        })
        .collect();

    hydrate(pool, &scored, SearchMode::Keyword).await
}

/// Hybrid search: concurrent vector + keyword sub-searches fused with RRF,
/// optionally reranked. Returns at most `top_k` results.
pub async fn hybrid_search(
    pool: &SqlitePool,
    config: &Config,
    embedder: Arc<dyn EmbeddingService>,
    scorer: Option<Arc<dyn RelevanceScorer>>,
    run_id: Uuid,
    query: &str,
    top_k: Option<usize>,
) -> Result<Vec<SearchResult>> {
    // Searching a missing run is an error, not an empty result.
    store::get_run(pool, run_id).await?;

    let r = &config.retrieval;
    let top_k = top_k.unwrap_or(r.top_k);
    let candidate_k = r.candidate_k(top_k) as usize;
    let deadline = Duration::from_millis(r.deadline_ms);

    let vector_fut = tokio::time::timeout(
        deadline,
        vector_search(pool, embedder.as_ref(), run_id, query, candidate_k),
    );
    let keyword_fut =
        tokio::time::timeout(deadline, keyword_search(pool, run_id, query, candidate_k));

    let (vector_out, keyword_out) = tokio::join!(vector_fut, keyword_fut);

    let vector_results = flatten_arm(vector_out);
    let keyword_results = flatten_arm(keyword_out);

    let (vector_results, keyword_results) = match (vector_results, keyword_results) {
        (Ok(v), Ok(k)) => (v, k),
        (Ok(v), Err(e)) => {
            degraded_event(pool, run_id, "keyword", &e).await;
            (v, Vec::new())
        }
        (Err(e), Ok(k)) => {
            degraded_event(pool, run_id, "vector", &e).await;
            (Vec::new(), k)
        }
        (Err(ve), Err(ke)) => {
            degraded_event(pool, run_id, "vector", &ve).await;
            degraded_event(pool, run_id, "keyword", &ke).await;
            return Err(EngineError::RetrievalUnavailable);
        }
    };

    let mut by_id: HashMap<Uuid, SearchResult> = HashMap::new();
    for result in vector_results.iter().chain(keyword_results.iter()) {
        by_id.entry(result.chunk_id).or_insert_with(|| result.clone());
    }

    let vector_ids: Vec<Uuid> = vector_results.iter().map(|r| r.chunk_id).collect();
    let keyword_ids: Vec<Uuid> = keyword_results.iter().map(|r| r.chunk_id).collect();
    let index_of: HashMap<Uuid, i64> =
        by_id.iter().map(|(id, r)| (*id, r.chunk_index)).collect();

    let fused = rrf_fuse(
        &[(&vector_ids, r.vector_weight), (&keyword_ids, r.keyword_weight)],
        r.rrf_k,
        &index_of,
    );

    let mut ordered: Vec<SearchResult> = fused
        .iter()
        .filter_map(|(id, score)| {
            by_id.remove(id).map(|mut result| {
                result.score = *score;
                result.search_mode = SearchMode::Hybrid;
                result
            })
        })
        .collect();

    if r.rerank {
        if let Some(scorer) = scorer {
            ordered = rerank(pool, run_id, scorer.as_ref(), query, ordered, r.rerank_top_m).await;
        }
    }

    ordered.truncate(top_k);
    Ok(ordered)
}

fn flatten_arm(
    out: std::result::Result<Result<Vec<SearchResult>>, tokio::time::error::Elapsed>,
) -> std::result::Result<Vec<SearchResult>, String> {
    match out {
        Ok(Ok(results)) => Ok(results),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("deadline exceeded".to_string()),
    }
}

async fn degraded_event(pool: &SqlitePool, run_id: Uuid, arm: &str, cause: &str) {
    // Degradation logging is itself best-effort.
    let _ = events::append(
        pool,
        run_id,
        EventType::ToolCall,
        None,
        serde_json::json!({
            "tool": "search",
            "degraded": true,
            "arm": arm,
            "cause": cause,
        }),
    )
    .await;
}

/// Reciprocal rank fusion over ranked id lists. Each candidate scores
/// `Σ weight / (k + rank)` with 1-based ranks. Ties prefer candidates
/// present in every contributing list, then lower `chunk_index`.
pub fn rrf_fuse(
    lists: &[(&Vec<Uuid>, f64)],
    rrf_k: i64,
    index_of: &HashMap<Uuid, i64>,
) -> Vec<(Uuid, f64)> {
    let mut scores: HashMap<Uuid, f64> = HashMap::new();
    let mut appearances: HashMap<Uuid, usize> = HashMap::new();

    for (ids, weight) in lists {
        let mut seen = HashSet::new();
        for (rank0, id) in ids.iter().enumerate() {
            if !seen.insert(*id) {
                continue;
            }
            *scores.entry(*id).or_insert(0.0) += weight / (rrf_k as f64 + (rank0 + 1) as f64);
            *appearances.entry(*id).or_insert(0) += 1;
        }
    }

    let contributing = lists.iter().filter(|(ids, _)| !ids.is_empty()).count();

    let mut fused: Vec<(Uuid, f64)> = scores.into_iter().collect();
    fused.sort_by(|(a_id, a_score), (b_id, b_score)| {
        b_score
            .partial_cmp(a_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let a_all = appearances.get(a_id).copied().unwrap_or(0) >= contributing;
                let b_all = appearances.get(b_id).copied().unwrap_or(0) >= contributing;
                b_all.cmp(&a_all)
            })
            .then_with(|| {
                let a_idx = index_of.get(a_id).copied().unwrap_or(i64::MAX);
                let b_idx = index_of.get(b_id).copied().unwrap_or(i64::MAX);
                a_idx.cmp(&b_idx)
            })
    });

    fused
}

/// Rerank the top `top_m` fused candidates with the relevance scorer. The
/// scorer reorders; it never adds or removes candidates. On failure the
/// fused order is kept and a degraded event is logged.
async fn rerank(
    pool: &SqlitePool,
    run_id: Uuid,
    scorer: &dyn RelevanceScorer,
    query: &str,
    mut ordered: Vec<SearchResult>,
    top_m: usize,
) -> Vec<SearchResult> {
    let head_len = ordered.len().min(top_m);
    let passages: Vec<String> = ordered[..head_len]
        .iter()
        .map(|r| r.content.clone())
        .collect();

    if passages.is_empty() {
        return ordered;
    }

    match scorer.score(query, &passages).await {
        Ok(scores) if scores.len() == head_len => {
            let tail = ordered.split_off(head_len);
            let mut head: Vec<(SearchResult, f32)> =
                ordered.into_iter().zip(scores).collect();
            head.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

            let mut reranked: Vec<SearchResult> = head
                .into_iter()
                .map(|(mut r, s)| {
                    r.score = s as f64;
                    r
                })
                .collect();
            reranked.extend(tail);
            reranked
        }
        Ok(_) | Err(_) => {
            let _ = events::append(
                pool,
                run_id,
                EventType::ToolCall,
                None,
                serde_json::json!({
                    "tool": "rerank",
                    "degraded": true,
                }),
            )
            .await;
            ordered
        }
    }
}

/// Join scored chunk ids back to full chunk + source rows, preserving order.
async fn hydrate(
    pool: &SqlitePool,
    scored: &[(String, f64)],
    mode: SearchMode,
) -> Result<Vec<SearchResult>> {
    let mut results = Vec::with_capacity(scored.len());

    for (chunk_id, score) in scored {
        let row = sqlx::query(
            r#"
            SELECT c.id, c.source_id, c.chunk_index, c.content, c.contextual_prefix,
                   c.page_start, c.page_end, c.section_hint,
                   s.title AS source_title, s.uri AS source_uri
            FROM chunks c
            JOIN sources s ON s.id = c.source_id
            WHERE c.id = ?
            "#,
        )
        .bind(chunk_id)
        .fetch_optional(pool)
        .await?;

        let Some(row) = row else {
            // Vector row outlived its chunk; skip rather than fail the search.
            continue;
        };

        let id: String = row.get("id");
        let source_id: String = row.get("source_id");
        results.push(SearchResult {
            chunk_id: Uuid::parse_str(&id)
                .map_err(|e| EngineError::Internal(anyhow::anyhow!("bad chunk id: {}", e)))?,
            source_id: Uuid::parse_str(&source_id)
                .map_err(|e| EngineError::Internal(anyhow::anyhow!("bad source id: {}", e)))?,
            chunk_index: row.get("chunk_index"),
            content: row.get("content"),
            contextual_prefix: row.get("contextual_prefix"),
            page_start: row.get("page_start"),
            page_end: row.get("page_end"),
            section_hint: row.get("section_hint"),
            score: *score,
            source_title: row.get("source_title"),
            source_uri: row.get("source_uri"),
            search_mode: mode,
        });
    }

    Ok(results)
}
