//! End-to-end tests over a temporary file-backed database with in-process
//! fake services standing in for extraction, embedding, generation, and
//! reranking.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use sqlx::SqlitePool;
use uuid::Uuid;

use deepbrief::citation;
use deepbrief::config::Config;
use deepbrief::context::contextualize_and_embed;
use deepbrief::db;
use deepbrief::error::EngineError;
use deepbrief::events;
use deepbrief::ingest::{self, IngestServices};
use deepbrief::migrate;
use deepbrief::models::{EventType, RunStatus, SourceKind, SourceStatus};
use deepbrief::pipeline::{self, StageSignal};
use deepbrief::providers::{
    EmbeddingService, ExtractedChunk, Extractor, RelevanceScorer, TextGenerator,
};
use deepbrief::search;
use deepbrief::store;
use deepbrief::version;

// ============ Fake services ============

/// Extractor backed by a uri → paragraphs map; unknown uris fail.
struct MapExtractor {
    texts: HashMap<String, Vec<String>>,
}

#[async_trait]
impl Extractor for MapExtractor {
    async fn extract(
        &self,
        source: &deepbrief::models::Source,
    ) -> anyhow::Result<Vec<ExtractedChunk>> {
        match self.texts.get(&source.uri) {
            Some(paragraphs) => Ok(paragraphs
                .iter()
                .map(|text| ExtractedChunk {
                    text: text.clone(),
                    page_start: Some(1),
                    page_end: Some(1),
                    section_hint: None,
                    heading_path: vec![],
                })
                .collect()),
            None => bail!("unreadable source: {}", source.uri),
        }
    }
}

const VOCAB: [&str; 4] = ["solar", "battery", "grid", "policy"];

fn bag_of_words(text: &str) -> Vec<f32> {
    let lower = text.to_lowercase();
    let mut v: Vec<f32> = VOCAB
        .iter()
        .map(|word| lower.matches(word).count() as f32)
        .collect();
    // Constant tail keeps every vector nonzero.
    v.push(0.1);
    v
}

struct FakeEmbedder;

#[async_trait]
impl EmbeddingService for FakeEmbedder {
    fn model_name(&self) -> &str {
        "fake-embed"
    }
    fn dims(&self) -> usize {
        VOCAB.len() + 1
    }
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| bag_of_words(t)).collect())
    }
}

struct FailingEmbedder;

#[async_trait]
impl EmbeddingService for FailingEmbedder {
    fn model_name(&self) -> &str {
        "failing-embed"
    }
    fn dims(&self) -> usize {
        5
    }
    async fn embed(&self, _texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        bail!("embedding service down")
    }
}

struct FakeGenerator;

#[async_trait]
impl TextGenerator for FakeGenerator {
    async fn generate(&self, _prompt: &str) -> anyhow::Result<String> {
        Ok("Part of the grid energy report.".to_string())
    }
}

/// Counts every call it receives.
struct CountingGenerator {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl TextGenerator for CountingGenerator {
    async fn generate(&self, _prompt: &str) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok("Part of the grid energy report.".to_string())
    }
}

/// Records the peak number of in-flight calls.
struct GaugeGenerator {
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl TextGenerator for GaugeGenerator {
    async fn generate(&self, _prompt: &str) -> anyhow::Result<String> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok("Context line.".to_string())
    }
}

/// Declares one dimensionality but returns another.
struct WrongDimsEmbedder;

#[async_trait]
impl EmbeddingService for WrongDimsEmbedder {
    fn model_name(&self) -> &str {
        "wrong-dims"
    }
    fn dims(&self) -> usize {
        5
    }
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![1.0, 0.5]).collect())
    }
}

struct FailingGenerator;

#[async_trait]
impl TextGenerator for FailingGenerator {
    async fn generate(&self, _prompt: &str) -> anyhow::Result<String> {
        bail!("generation service down")
    }
}

struct FailingScorer;

#[async_trait]
impl RelevanceScorer for FailingScorer {
    async fn score(&self, _query: &str, _passages: &[String]) -> anyhow::Result<Vec<f32>> {
        bail!("reranker down")
    }
}

/// Scores passages in reverse input order, so reranking visibly reorders.
struct ReversingScorer;

#[async_trait]
impl RelevanceScorer for ReversingScorer {
    async fn score(&self, _query: &str, passages: &[String]) -> anyhow::Result<Vec<f32>> {
        Ok((0..passages.len()).map(|i| i as f32).collect())
    }
}

// ============ Helpers ============

async fn setup() -> (tempfile::TempDir, SqlitePool, Config) {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::minimal(dir.path().join("engine-test.sqlite"));
    let pool = db::connect(&config).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    (dir, pool, config)
}

fn fake_services(texts: &[(&str, &[&str])]) -> IngestServices {
    let texts: HashMap<String, Vec<String>> = texts
        .iter()
        .map(|(uri, paragraphs)| {
            (
                uri.to_string(),
                paragraphs.iter().map(|p| p.to_string()).collect(),
            )
        })
        .collect();
    IngestServices {
        extractor: Arc::new(MapExtractor { texts }),
        embedder: Arc::new(FakeEmbedder),
        generator: Some(Arc::new(FakeGenerator)),
    }
}

async fn new_run(pool: &SqlitePool, config: &Config, title: &str) -> Uuid {
    store::create_run(pool, title, "test objective", "{}", &config.snapshot_json())
        .await
        .unwrap()
        .id
}

async fn add_source(pool: &SqlitePool, run_id: Uuid, uri: &str) -> Uuid {
    store::create_source(
        pool,
        run_id,
        SourceKind::Note,
        uri,
        uri,
        &deepbrief::chunk::hash_text(uri),
        "{}",
    )
    .await
    .unwrap()
    .id
}

// ============ Ingestion ============

#[tokio::test]
async fn ingest_writes_chunks_prefixes_and_vectors() {
    let (_dir, pool, config) = setup().await;
    let run_id = new_run(&pool, &config, "energy").await;
    let source_id = add_source(&pool, run_id, "solar.txt").await;

    let services = fake_services(&[(
        "solar.txt",
        &["Solar output grew sharply.", "Battery storage lagged."][..],
    )]);

    let report = ingest::ingest_run(&pool, &config, &services, run_id)
        .await
        .unwrap();
    assert_eq!(report.ingested, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(report.chunks, 2);
    assert_eq!(report.context.prefixed, 2);
    assert_eq!(report.context.embedded, 2);

    let source = store::get_source(&pool, source_id).await.unwrap();
    assert_eq!(source.status, SourceStatus::Ingested);

    let chunks = store::list_chunks(&pool, source_id).await.unwrap();
    assert_eq!(chunks.len(), 2);
    assert!(chunks[0].contextual_prefix.is_some());
    assert_eq!(chunks[1].chunk_index, 1);
}

#[tokio::test]
async fn failed_source_is_isolated() {
    let (_dir, pool, config) = setup().await;
    let run_id = new_run(&pool, &config, "energy").await;
    add_source(&pool, run_id, "good.txt").await;
    let bad_id = add_source(&pool, run_id, "missing.txt").await;

    let services = fake_services(&[("good.txt", &["Grid demand is stable."][..])]);

    let report = ingest::ingest_run(&pool, &config, &services, run_id)
        .await
        .unwrap();
    assert_eq!(report.ingested, 1);
    assert_eq!(report.failed, 1);

    let bad = store::get_source(&pool, bad_id).await.unwrap();
    assert_eq!(bad.status, SourceStatus::Failed);
    assert!(bad.error.as_deref().unwrap().contains("unreadable"));

    // Failure logged as an event against the run.
    let log = events::list(&pool, run_id, 10).await.unwrap();
    assert!(log
        .iter()
        .any(|e| e.event_type == EventType::Error && e.payload_json.contains("unreadable")));

    // A later retry with a now-readable source recovers it.
    let services = fake_services(&[("missing.txt", &["Policy shifted in March."][..])]);
    let report = ingest::retry_source(&pool, &config, &services, bad_id)
        .await
        .unwrap();
    assert_eq!(report.ingested, 1);
    let bad = store::get_source(&pool, bad_id).await.unwrap();
    assert_eq!(bad.status, SourceStatus::Ingested);
}

#[tokio::test]
async fn duplicate_content_dedups_within_run() {
    let (_dir, pool, config) = setup().await;
    let run_id = new_run(&pool, &config, "energy").await;

    let a = store::create_source(&pool, run_id, SourceKind::Note, "a", "a.txt", "samehash", "{}")
        .await
        .unwrap();
    let b = store::create_source(&pool, run_id, SourceKind::Note, "b", "b.txt", "samehash", "{}")
        .await
        .unwrap();
    assert_eq!(a.id, b.id);

    // Same content in a different run is a distinct source.
    let other_run = new_run(&pool, &config, "other").await;
    let c = store::create_source(&pool, other_run, SourceKind::Note, "c", "c.txt", "samehash", "{}")
        .await
        .unwrap();
    assert_ne!(a.id, c.id);
}

#[tokio::test]
async fn context_failure_degrades_to_raw_text() {
    let (_dir, pool, config) = setup().await;
    let run_id = new_run(&pool, &config, "energy").await;
    let source_id = add_source(&pool, run_id, "doc.txt").await;

    let services = IngestServices {
        extractor: Arc::new(MapExtractor {
            texts: [(
                "doc.txt".to_string(),
                vec!["Solar capacity doubled.".to_string()],
            )]
            .into_iter()
            .collect(),
        }),
        embedder: Arc::new(FakeEmbedder),
        generator: Some(Arc::new(FailingGenerator)),
    };

    let report = ingest::ingest_run(&pool, &config, &services, run_id)
        .await
        .unwrap();
    assert_eq!(report.ingested, 1);
    assert_eq!(report.context.degraded, 1);
    assert_eq!(report.context.embedded, 1);

    let chunks = store::list_chunks(&pool, source_id).await.unwrap();
    assert!(chunks[0].contextual_prefix.is_none());
    assert!(chunks[0].metadata_json.contains("unavailable"));
}

#[tokio::test]
async fn reembedding_unchanged_chunks_is_a_noop() {
    let (_dir, pool, config) = setup().await;
    let run_id = new_run(&pool, &config, "energy").await;
    let source_id = add_source(&pool, run_id, "doc.txt").await;

    let services = fake_services(&[("doc.txt", &["Battery prices fell."][..])]);
    ingest::ingest_run(&pool, &config, &services, run_id)
        .await
        .unwrap();

    let source = store::get_source(&pool, source_id).await.unwrap();
    let mut chunks = store::list_chunks(&pool, source_id).await.unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let report = contextualize_and_embed(
        &pool,
        &config,
        Some(Arc::new(CountingGenerator {
            calls: Arc::clone(&calls),
        })),
        Arc::new(FakeEmbedder),
        &source,
        &mut chunks,
    )
    .await
    .unwrap();

    // The pass is keyed on content hash: unchanged chunks make no generation
    // call at all, not just no embedding write.
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(report.prefixed, 0);
    assert_eq!(report.embedded, 0);
    assert_eq!(report.skipped, chunks.len());
}

#[tokio::test]
async fn prefix_generation_respects_the_worker_pool_limit() {
    let (_dir, pool, mut config) = setup().await;
    config.ingestion.workers = 2;
    let run_id = new_run(&pool, &config, "energy").await;
    add_source(&pool, run_id, "doc.txt").await;

    let paragraphs: Vec<String> = (0..6).map(|i| format!("Grid note number {}.", i)).collect();
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let services = IngestServices {
        extractor: Arc::new(MapExtractor {
            texts: [("doc.txt".to_string(), paragraphs)].into_iter().collect(),
        }),
        embedder: Arc::new(FakeEmbedder),
        generator: Some(Arc::new(GaugeGenerator {
            in_flight: Arc::clone(&in_flight),
            peak: Arc::clone(&peak),
        })),
    };

    let report = ingest::ingest_run(&pool, &config, &services, run_id)
        .await
        .unwrap();
    assert_eq!(report.context.prefixed, 6);
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn mismatched_embedding_dims_fail_the_source() {
    let (_dir, pool, config) = setup().await;
    let run_id = new_run(&pool, &config, "energy").await;
    let source_id = add_source(&pool, run_id, "doc.txt").await;

    let services = IngestServices {
        extractor: Arc::new(MapExtractor {
            texts: [(
                "doc.txt".to_string(),
                vec!["Solar capacity doubled.".to_string()],
            )]
            .into_iter()
            .collect(),
        }),
        embedder: Arc::new(WrongDimsEmbedder),
        generator: None,
    };

    let report = ingest::ingest_run(&pool, &config, &services, run_id)
        .await
        .unwrap();
    assert_eq!(report.ingested, 0);
    assert_eq!(report.failed, 1);

    let source = store::get_source(&pool, source_id).await.unwrap();
    assert_eq!(source.status, SourceStatus::Failed);
    assert!(source.error.as_deref().unwrap().contains("dims"));

    // The batch failed before any write; no vector rows survive.
    let stored: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors WHERE run_id = ?")
        .bind(run_id.to_string())
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(stored, 0);
}

// ============ Search ============

async fn seeded_run(pool: &SqlitePool, config: &Config) -> Uuid {
    let run_id = new_run(pool, config, "energy").await;
    add_source(pool, run_id, "solar.txt").await;
    add_source(pool, run_id, "policy.txt").await;

    let services = fake_services(&[
        (
            "solar.txt",
            &[
                "Solar generation set a record this quarter.",
                "Battery storage capacity remains the bottleneck.",
            ][..],
        ),
        (
            "policy.txt",
            &[
                "Grid policy changed to favor distributed generation.",
                "Subsidy policy for battery installations expanded.",
            ][..],
        ),
    ]);
    let report = ingest::ingest_run(pool, config, &services, run_id)
        .await
        .unwrap();
    assert_eq!(report.ingested, 2);
    run_id
}

#[tokio::test]
async fn hybrid_search_fuses_and_respects_run_boundary() {
    let (_dir, pool, config) = setup().await;
    let run_id = seeded_run(&pool, &config).await;

    // A second run with overlapping vocabulary must never leak in.
    let other = new_run(&pool, &config, "decoy").await;
    add_source(&pool, other, "decoy.txt").await;
    let services = fake_services(&[("decoy.txt", &["Solar solar solar battery grid."][..])]);
    ingest::ingest_run(&pool, &config, &services, other)
        .await
        .unwrap();

    let results = search::hybrid_search(
        &pool,
        &config,
        Arc::new(FakeEmbedder),
        None,
        run_id,
        "battery storage",
        Some(3),
    )
    .await
    .unwrap();

    assert!(!results.is_empty());
    assert!(results.len() <= 3);

    let mut own_chunks = HashSet::new();
    for source in store::list_sources(&pool, run_id).await.unwrap() {
        for chunk in store::list_chunks(&pool, source.id).await.unwrap() {
            own_chunks.insert(chunk.id);
        }
    }
    for result in &results {
        assert!(own_chunks.contains(&result.chunk_id));
    }
}

#[tokio::test]
async fn search_on_unknown_run_is_not_found_in_every_mode() {
    let (_dir, pool, config) = setup().await;
    let missing = Uuid::new_v4();

    let err = search::hybrid_search(
        &pool,
        &config,
        Arc::new(FakeEmbedder),
        None,
        missing,
        "battery",
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    let err = search::vector_search(&pool, &FakeEmbedder, missing, "battery", 5)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    let err = search::keyword_search(&pool, missing, "battery", 5)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn hybrid_degrades_when_keyword_arm_fails() {
    let (_dir, pool, config) = setup().await;
    let run_id = seeded_run(&pool, &config).await;

    // FTS5 rejects unbalanced parens, failing the keyword arm only.
    let degraded = search::hybrid_search(
        &pool,
        &config,
        Arc::new(FakeEmbedder),
        None,
        run_id,
        "(((",
        Some(5),
    )
    .await
    .unwrap();
    assert!(!degraded.is_empty());

    // A degraded hybrid is exactly the vector-only ranking, with fused
    // scores still best-first.
    let vector_only = search::vector_search(&pool, &FakeEmbedder, run_id, "(((", 5)
        .await
        .unwrap();
    let degraded_ids: Vec<Uuid> = degraded.iter().map(|r| r.chunk_id).collect();
    let vector_ids: Vec<Uuid> = vector_only.iter().map(|r| r.chunk_id).collect();
    assert_eq!(degraded_ids, vector_ids);
    assert!(degraded.windows(2).all(|w| w[0].score >= w[1].score));

    let log = events::list(&pool, run_id, 20).await.unwrap();
    assert!(log.iter().any(|e| {
        e.event_type == EventType::ToolCall
            && e.payload_json.contains("\"degraded\":true")
            && e.payload_json.contains("keyword")
    }));
}

#[tokio::test]
async fn hybrid_fails_only_when_both_arms_fail() {
    let (_dir, pool, config) = setup().await;
    let run_id = seeded_run(&pool, &config).await;

    // Vector arm down, keyword arm fine: still answers.
    let results = search::hybrid_search(
        &pool,
        &config,
        Arc::new(FailingEmbedder),
        None,
        run_id,
        "battery",
        Some(5),
    )
    .await
    .unwrap();
    assert!(!results.is_empty());

    // Vector arm down and malformed keyword query: nothing survives.
    let err = search::hybrid_search(
        &pool,
        &config,
        Arc::new(FailingEmbedder),
        None,
        run_id,
        "(((",
        Some(5),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, EngineError::RetrievalUnavailable));
}

#[tokio::test]
async fn rerank_reorders_but_failure_keeps_fused_order() {
    let (_dir, pool, config) = setup().await;
    let run_id = seeded_run(&pool, &config).await;

    let fused = search::hybrid_search(
        &pool,
        &config,
        Arc::new(FakeEmbedder),
        None,
        run_id,
        "battery",
        Some(4),
    )
    .await
    .unwrap();

    let reversed = search::hybrid_search(
        &pool,
        &config,
        Arc::new(FakeEmbedder),
        Some(Arc::new(ReversingScorer)),
        run_id,
        "battery",
        Some(4),
    )
    .await
    .unwrap();

    let fused_ids: Vec<Uuid> = fused.iter().map(|r| r.chunk_id).collect();
    let mut reversed_ids: Vec<Uuid> = reversed.iter().map(|r| r.chunk_id).collect();
    reversed_ids.reverse();
    assert_eq!(fused_ids, reversed_ids);

    let fallback = search::hybrid_search(
        &pool,
        &config,
        Arc::new(FakeEmbedder),
        Some(Arc::new(FailingScorer)),
        run_id,
        "battery",
        Some(4),
    )
    .await
    .unwrap();
    let fallback_ids: Vec<Uuid> = fallback.iter().map(|r| r.chunk_id).collect();
    assert_eq!(fused_ids, fallback_ids);

    let log = events::list(&pool, run_id, 20).await.unwrap();
    assert!(log
        .iter()
        .any(|e| e.payload_json.contains("\"tool\":\"rerank\"")));
}

// ============ Citations ============

#[tokio::test]
async fn citations_resolve_against_the_run_evidence() {
    let (_dir, pool, config) = setup().await;
    let run_id = seeded_run(&pool, &config).await;

    let sources = store::list_sources(&pool, run_id).await.unwrap();
    let chunks_a = store::list_chunks(&pool, sources[0].id).await.unwrap();
    let chunks_b = store::list_chunks(&pool, sources[1].id).await.unwrap();

    let foreign = Uuid::new_v4();
    let draft = format!(
        "Solar surged [cite:{}]. Policy helped [cite:{}] and again [cite:{}]. Unknown [cite:{}].",
        chunks_a[0].id, chunks_b[0].id, chunks_a[1].id, foreign
    );

    let (resolution, citations) = citation::resolve_draft(&pool, run_id, &draft).await.unwrap();
    assert_eq!(
        resolution.body,
        "Solar surged [1]. Policy helped [2] and again [1]. Unknown [citation needed]."
    );
    assert_eq!(citations.len(), 2);
    assert_eq!(citations[0].citation_key, "1");
    assert_eq!(citations[0].source_id, sources[0].id);
    assert_eq!(citations[0].anchors.len(), 2);
    assert_eq!(resolution.issues.len(), 1);

    // Persist against a published document and read back.
    let document = version::publish(&pool, run_id, "brief", &resolution.body, None, "{}")
        .await
        .unwrap();
    citation::save_citations(&pool, document.id, &citations)
        .await
        .unwrap();
    let stored = citation::list_citations(&pool, document.id).await.unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[1].citation_key, "2");

    // Resolving the resolved body again changes nothing.
    let (again, _) = citation::resolve_draft(&pool, run_id, &resolution.body)
        .await
        .unwrap();
    assert_eq!(again.body, resolution.body);
}

#[tokio::test]
async fn citation_from_another_run_is_unresolved() {
    let (_dir, pool, config) = setup().await;
    let run_id = seeded_run(&pool, &config).await;

    let other = new_run(&pool, &config, "other").await;
    add_source(&pool, other, "o.txt").await;
    let services = fake_services(&[("o.txt", &["Other run text."][..])]);
    ingest::ingest_run(&pool, &config, &services, other)
        .await
        .unwrap();

    let other_sources = store::list_sources(&pool, other).await.unwrap();
    let other_chunk = store::list_chunks(&pool, other_sources[0].id).await.unwrap()[0].id;

    let draft = format!("Stolen evidence [cite:{}].", other_chunk);
    let (resolution, citations) = citation::resolve_draft(&pool, run_id, &draft).await.unwrap();
    assert_eq!(resolution.body, "Stolen evidence [citation needed].");
    assert!(citations.is_empty());
    assert_eq!(resolution.issues.len(), 1);
}

// ============ Versioning ============

#[tokio::test]
async fn versions_are_monotonic_and_change_log_is_enforced() {
    let (_dir, pool, config) = setup().await;
    let run_id = new_run(&pool, &config, "energy").await;

    let v1 = version::publish(&pool, run_id, "brief", "first body", None, "{}")
        .await
        .unwrap();
    assert_eq!(v1.version, 1);

    let err = version::publish(&pool, run_id, "brief", "second body", None, "{}")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidVersion(_)));

    let v2 = version::publish(
        &pool,
        run_id,
        "brief",
        "second body",
        Some("Rewrote the findings."),
        "{}",
    )
    .await
    .unwrap();
    assert_eq!(v2.version, 2);
    assert_eq!(v2.change_log.as_deref(), Some("Rewrote the findings."));

    // Stored versions are immutable rows; both remain readable.
    assert_eq!(
        version::get_version(&pool, run_id, 1).await.unwrap().body,
        "first body"
    );
    assert_eq!(version::latest(&pool, run_id).await.unwrap().unwrap().version, 2);
}

#[tokio::test]
async fn concurrent_publishes_get_distinct_consecutive_versions() {
    let (_dir, pool, config) = setup().await;
    let run_id = new_run(&pool, &config, "energy").await;

    let mut handles = Vec::new();
    for i in 0..3 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            version::publish(
                &pool,
                run_id,
                "brief",
                &format!("body {}", i),
                Some("concurrent edit"),
                "{}",
            )
            .await
        }));
    }

    let mut versions = Vec::new();
    for handle in handles {
        versions.push(handle.await.unwrap().unwrap().version);
    }
    versions.sort_unstable();
    assert_eq!(versions, vec![1, 2, 3]);
}

#[tokio::test]
async fn diff_counts_additions_deletions_modifications() {
    let (_dir, pool, config) = setup().await;
    let run_id = new_run(&pool, &config, "energy").await;

    version::publish(&pool, run_id, "brief", "intro\nold finding\noutro", None, "{}")
        .await
        .unwrap();
    version::publish(
        &pool,
        run_id,
        "brief",
        "intro\nnew finding\noutro\nappendix",
        Some("Revised the finding, added an appendix."),
        "{}",
    )
    .await
    .unwrap();

    let diff = version::diff_versions(&pool, run_id, 1, 2).await.unwrap();
    assert_eq!(diff.modifications, 1);
    assert_eq!(diff.additions, 1);
    assert_eq!(diff.deletions, 0);

    let same = version::diff_versions(&pool, run_id, 2, 2).await.unwrap();
    assert!(same.is_empty());
}

// ============ Pipeline ============

#[tokio::test]
async fn lifecycle_happy_path_with_revision_loop() {
    let (_dir, pool, config) = setup().await;
    let run_id = new_run(&pool, &config, "energy").await;

    assert_eq!(
        pipeline::advance(&pool, run_id, StageSignal::IngestStarted)
            .await
            .unwrap(),
        RunStatus::Ingesting
    );
    assert_eq!(
        pipeline::advance(
            &pool,
            run_id,
            StageSignal::IngestFinished {
                ingested: 2,
                failed: 1
            }
        )
        .await
        .unwrap(),
        RunStatus::Drafting
    );

    let document_id = Uuid::new_v4();
    assert_eq!(
        pipeline::advance(&pool, run_id, StageSignal::DraftFinished { document_id })
            .await
            .unwrap(),
        RunStatus::Reviewing
    );

    // Rejected review loops back to drafting.
    assert_eq!(
        pipeline::advance(
            &pool,
            run_id,
            StageSignal::ReviewFinished {
                approved: false,
                issues: 2
            }
        )
        .await
        .unwrap(),
        RunStatus::Drafting
    );

    pipeline::advance(&pool, run_id, StageSignal::DraftFinished { document_id })
        .await
        .unwrap();
    assert_eq!(
        pipeline::advance(
            &pool,
            run_id,
            StageSignal::ReviewFinished {
                approved: true,
                issues: 0
            }
        )
        .await
        .unwrap(),
        RunStatus::Complete
    );

    // Partial ingestion earlier left a warning event behind.
    let log = events::list(&pool, run_id, 50).await.unwrap();
    assert!(log
        .iter()
        .any(|e| e.payload_json.contains("\"severity\":\"warning\"")));
}

#[tokio::test]
async fn illegal_transitions_are_rejected() {
    let (_dir, pool, config) = setup().await;
    let run_id = new_run(&pool, &config, "energy").await;

    let err = pipeline::advance(
        &pool,
        run_id,
        StageSignal::ReviewFinished {
            approved: true,
            issues: 0,
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, EngineError::StageFailed { .. }));

    // Status unchanged after the rejected signal.
    let run = store::get_run(&pool, run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Created);
}

#[tokio::test]
async fn zero_ingested_sources_errors_the_run() {
    let (_dir, pool, config) = setup().await;
    let run_id = new_run(&pool, &config, "energy").await;

    pipeline::advance(&pool, run_id, StageSignal::IngestStarted)
        .await
        .unwrap();
    let status = pipeline::advance(
        &pool,
        run_id,
        StageSignal::IngestFinished {
            ingested: 0,
            failed: 2,
        },
    )
    .await
    .unwrap();
    assert_eq!(status, RunStatus::Error);
}

#[tokio::test]
async fn resume_reenters_the_checkpointed_stage() {
    let (_dir, pool, config) = setup().await;
    let run_id = new_run(&pool, &config, "energy").await;

    pipeline::advance(&pool, run_id, StageSignal::IngestStarted)
        .await
        .unwrap();
    pipeline::advance(
        &pool,
        run_id,
        StageSignal::IngestFinished {
            ingested: 1,
            failed: 0,
        },
    )
    .await
    .unwrap();

    // Crash during drafting.
    pipeline::advance(
        &pool,
        run_id,
        StageSignal::Failed {
            stage: "drafting".to_string(),
            cause: "generator unreachable".to_string(),
        },
    )
    .await
    .unwrap();
    assert_eq!(
        store::get_run(&pool, run_id).await.unwrap().status,
        RunStatus::Error
    );

    // Resume lands on the post-ingestion checkpoint.
    assert_eq!(
        pipeline::resume(&pool, run_id).await.unwrap(),
        RunStatus::Drafting
    );
}

#[tokio::test]
async fn resume_without_checkpoint_restarts() {
    let (_dir, pool, config) = setup().await;
    let run_id = new_run(&pool, &config, "energy").await;

    pipeline::advance(
        &pool,
        run_id,
        StageSignal::Failed {
            stage: "created".to_string(),
            cause: "boom".to_string(),
        },
    )
    .await
    .unwrap();
    assert_eq!(
        pipeline::resume(&pool, run_id).await.unwrap(),
        RunStatus::Created
    );

    // A run that is not in error cannot be resumed.
    let err = pipeline::resume(&pool, run_id).await.unwrap_err();
    assert!(matches!(err, EngineError::StageFailed { .. }));
}
