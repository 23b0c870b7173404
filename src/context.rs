//! Contextualizer: situating prefixes and embeddings for stored chunks.
//!
//! Prefix generation fans out over a bounded worker pool; submission blocks
//! once the pool is saturated, so the external service never sees an
//! unbounded queue. Each call has its own deadline; a failed or timed-out
//! call falls back to the raw chunk text and tags the chunk
//! `context: unavailable` instead of failing ingestion.
//!
//! The whole pass is keyed on the chunk's content hash: a chunk whose
//! current content already has a stored embedding is skipped entirely, so
//! re-running over unchanged chunks issues no generation or embedding calls.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::models::{Chunk, Source};
use crate::providers::{vec_to_blob, EmbeddingService, TextGenerator};
use crate::store::now;

/// Outcome counts for one contextualize-and-embed pass.
#[derive(Debug, Default, Clone)]
pub struct ContextReport {
    pub prefixed: usize,
    pub degraded: usize,
    pub embedded: usize,
    pub skipped: usize,
}

fn prefix_prompt(source: &Source, chunk: &Chunk) -> String {
    let location = match (chunk.page_start, &chunk.section_hint) {
        (Some(p), Some(s)) => format!(" (page {}, section \"{}\")", p, s),
        (Some(p), None) => format!(" (page {})", p),
        (None, Some(s)) => format!(" (section \"{}\")", s),
        _ => String::new(),
    };

    format!(
        "The following passage comes from \"{}\"{}.\n\n\
         Passage:\n{}\n\n\
         Write one or two sentences situating this passage within the \
         document so it can be understood in isolation. Respond with the \
         sentences only.",
        source.title, location, chunk.content
    )
}

/// Generate situating prefixes for `chunks` over a bounded worker pool, then
/// embed and store vectors. Updates each chunk row in place.
///
/// Chunks whose content hash already has a stored embedding are skipped
/// before any service call. `generator` is `None` when contextual prefixes
/// are disabled; chunks are then embedded as raw text.
pub async fn contextualize_and_embed(
    pool: &SqlitePool,
    config: &Config,
    generator: Option<Arc<dyn TextGenerator>>,
    embedder: Arc<dyn EmbeddingService>,
    source: &Source,
    chunks: &mut [Chunk],
) -> Result<ContextReport> {
    let mut report = ContextReport::default();
    let model = embedder.model_name().to_string();

    let mut pending: Vec<&mut Chunk> = Vec::new();
    for chunk in chunks.iter_mut() {
        let existing: Option<String> =
            sqlx::query_scalar("SELECT hash FROM embeddings WHERE chunk_id = ? AND model = ?")
                .bind(chunk.id.to_string())
                .bind(&model)
                .fetch_optional(pool)
                .await?;

        if existing.as_deref() == Some(chunk.content_hash.as_str()) {
            report.skipped += 1;
        } else {
            pending.push(chunk);
        }
    }

    if pending.is_empty() {
        return Ok(report);
    }

    if let Some(generator) = generator.filter(|_| config.ingestion.contextual_prefixes) {
        let semaphore = Arc::new(Semaphore::new(config.ingestion.workers));
        let deadline = Duration::from_millis(config.ingestion.context_timeout_ms);

        let mut handles = Vec::with_capacity(pending.len());
        for chunk in pending.iter() {
            // Blocks here when all workers are busy.
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| EngineError::Internal(e.into()))?;
            let generator = Arc::clone(&generator);
            let prompt = prefix_prompt(source, chunk);

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                match tokio::time::timeout(deadline, generator.generate(&prompt)).await {
                    Ok(Ok(text)) if !text.trim().is_empty() => Some(text.trim().to_string()),
                    _ => None,
                }
            }));
        }

        for (chunk, handle) in pending.iter_mut().zip(handles) {
            match handle.await {
                Ok(Some(prefix)) => {
                    chunk.contextual_prefix = Some(prefix);
                    report.prefixed += 1;
                }
                _ => {
                    chunk.contextual_prefix = None;
                    chunk.metadata_json =
                        serde_json::json!({ "context": "unavailable" }).to_string();
                    report.degraded += 1;
                }
            }

            sqlx::query("UPDATE chunks SET contextual_prefix = ?, metadata_json = ? WHERE id = ?")
                .bind(&chunk.contextual_prefix)
                .bind(&chunk.metadata_json)
                .bind(chunk.id.to_string())
                .execute(pool)
                .await?;
        }
    }

    embed_chunks(pool, embedder, &pending, &mut report).await?;
    Ok(report)
}

/// Embed the pending chunks and store the vectors, recording each chunk's
/// content hash so an unchanged chunk never re-enters the pass. The whole
/// batch fails if the service returns the wrong count or dimensionality.
async fn embed_chunks(
    pool: &SqlitePool,
    embedder: Arc<dyn EmbeddingService>,
    chunks: &[&mut Chunk],
    report: &mut ContextReport,
) -> Result<()> {
    let model = embedder.model_name().to_string();
    let dims = embedder.dims();

    let texts: Vec<String> = chunks.iter().map(|c| c.embeddable_text()).collect();
    let vectors = embedder.embed(&texts).await?;
    if vectors.len() != chunks.len() {
        return Err(EngineError::Internal(anyhow::anyhow!(
            "embedding service returned {} vectors for {} texts",
            vectors.len(),
            chunks.len()
        )));
    }
    for vector in &vectors {
        if vector.len() != dims {
            return Err(EngineError::Internal(anyhow::anyhow!(
                "embedding service returned {} dims, expected {}",
                vector.len(),
                dims
            )));
        }
    }

    for (chunk, vector) in chunks.iter().zip(vectors) {
        write_embedding(
            pool,
            chunk.run_id,
            chunk.id,
            &model,
            dims,
            &chunk.content_hash,
            &vector,
        )
        .await?;
        report.embedded += 1;
    }

    Ok(())
}

async fn write_embedding(
    pool: &SqlitePool,
    run_id: Uuid,
    chunk_id: Uuid,
    model: &str,
    dims: usize,
    hash: &str,
    vector: &[f32],
) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO embeddings (chunk_id, model, dims, hash, created_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(chunk_id) DO UPDATE SET model = excluded.model,
            dims = excluded.dims, hash = excluded.hash, created_at = excluded.created_at
        "#,
    )
    .bind(chunk_id.to_string())
    .bind(model)
    .bind(dims as i64)
    .bind(hash)
    .bind(now())
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO chunk_vectors (chunk_id, run_id, embedding)
        VALUES (?, ?, ?)
        ON CONFLICT(chunk_id) DO UPDATE SET embedding = excluded.embedding
        "#,
    )
    .bind(chunk_id.to_string())
    .bind(run_id.to_string())
    .bind(vec_to_blob(vector))
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
