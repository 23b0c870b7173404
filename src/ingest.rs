//! Source ingestion: extraction, chunk normalization, contextualization.
//!
//! Failure isolation is per source. One source failing to extract marks that
//! source `failed` and logs an error event; the rest of the run proceeds.
//! Chunk rows for a source land transactionally, so a failure mid-source
//! leaves no partial evidence behind.

use std::sync::Arc;

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::chunk::normalize_chunks;
use crate::config::Config;
use crate::context::{contextualize_and_embed, ContextReport};
use crate::error::Result;
use crate::events;
use crate::models::{EventType, Source, SourceStatus};
use crate::providers::{EmbeddingService, Extractor, TextGenerator};
use crate::store;

/// Outcome of one ingestion pass over a run.
#[derive(Debug, Default, Clone)]
pub struct IngestReport {
    pub ingested: usize,
    pub failed: usize,
    pub chunks: usize,
    pub context: ContextReport,
}

pub struct IngestServices {
    pub extractor: Arc<dyn Extractor>,
    pub embedder: Arc<dyn EmbeddingService>,
    pub generator: Option<Arc<dyn TextGenerator>>,
}

/// Ingest every pending (or previously failed) source in the run.
pub async fn ingest_run(
    pool: &SqlitePool,
    config: &Config,
    services: &IngestServices,
    run_id: Uuid,
) -> Result<IngestReport> {
    let sources = store::list_sources(pool, run_id).await?;
    let mut report = IngestReport::default();

    for source in &sources {
        if source.status == SourceStatus::Ingested {
            continue;
        }

        match ingest_source(pool, config, services, source).await {
            Ok((chunk_count, context)) => {
                store::set_source_status(pool, source.id, SourceStatus::Ingested, None).await?;
                report.ingested += 1;
                report.chunks += chunk_count;
                report.context.prefixed += context.prefixed;
                report.context.degraded += context.degraded;
                report.context.embedded += context.embedded;
                report.context.skipped += context.skipped;
            }
            Err(e) => {
                let message = e.to_string();
                store::set_source_status(pool, source.id, SourceStatus::Failed, Some(&message))
                    .await?;
                events::append(
                    pool,
                    run_id,
                    EventType::Error,
                    Some("ingesting"),
                    serde_json::json!({
                        "source_id": source.id.to_string(),
                        "error": message,
                    }),
                )
                .await?;
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

/// Re-ingest a single failed source in isolation. Existing chunk rows for
/// the source are replaced.
pub async fn retry_source(
    pool: &SqlitePool,
    config: &Config,
    services: &IngestServices,
    source_id: Uuid,
) -> Result<IngestReport> {
    let source = store::get_source(pool, source_id).await?;
    store::delete_source_chunks(pool, source_id).await?;

    let mut report = IngestReport::default();
    match ingest_source(pool, config, services, &source).await {
        Ok((chunk_count, context)) => {
            store::set_source_status(pool, source.id, SourceStatus::Ingested, None).await?;
            report.ingested = 1;
            report.chunks = chunk_count;
            report.context = context;
            Ok(report)
        }
        Err(e) => {
            let message = e.to_string();
            store::set_source_status(pool, source.id, SourceStatus::Failed, Some(&message))
                .await?;
            Err(e)
        }
    }
}

async fn ingest_source(
    pool: &SqlitePool,
    config: &Config,
    services: &IngestServices,
    source: &Source,
) -> Result<(usize, ContextReport)> {
    let extracted = services
        .extractor
        .extract(source)
        .await
        .map_err(|e| crate::error::EngineError::ExtractionFailed(e.to_string()))?;

    let mut chunks = normalize_chunks(
        source.run_id,
        source.id,
        &extracted,
        &config.ingestion.chunk_method,
    );

    if chunks.is_empty() {
        return Err(crate::error::EngineError::ExtractionFailed(format!(
            "source {} produced no text",
            source.id
        )));
    }

    store::insert_chunks(pool, &chunks).await?;

    let context = contextualize_and_embed(
        pool,
        config,
        services.generator.clone(),
        Arc::clone(&services.embedder),
        source,
        &mut chunks,
    )
    .await?;

    Ok((chunks.len(), context))
}
