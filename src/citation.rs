//! Citation resolution: draft placeholders into numbered references.
//!
//! Drafting emits `[cite:<chunk-uuid>]` placeholders. Resolution replaces
//! each with a numeric marker like `[1]`, keyed per distinct source in
//! first-appearance order, and builds the references section. A placeholder
//! whose chunk is missing or belongs to another run renders as
//! `[citation needed]` and is reported as an issue instead of failing the
//! document.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::{Citation, CitationAnchor, Source, SourceKind};
use crate::store;

const UNRESOLVED_MARKER: &str = "[citation needed]";

fn cite_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\[cite:([0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})\]")
            .expect("valid citation pattern")
    })
}

/// What resolution needs to know about a cited chunk.
#[derive(Debug, Clone, Copy)]
pub struct ChunkRef {
    pub source_id: Uuid,
    pub page: Option<i64>,
}

/// Output of placeholder resolution, before reference formatting.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Draft text with every placeholder replaced by `[n]` or
    /// `[citation needed]`.
    pub body: String,
    /// Cited sources in first-appearance order; position + 1 is the
    /// citation key.
    pub sources: Vec<Uuid>,
    /// Marker anchors grouped by source.
    pub anchors: HashMap<Uuid, Vec<CitationAnchor>>,
    /// Placeholders that could not be resolved, as issue strings.
    pub issues: Vec<String>,
}

/// Resolve placeholders against a chunk lookup. Pure: no storage access.
///
/// Anchors record the byte span of each rendered marker in the output body.
/// Text without placeholders passes through unchanged, so resolution is
/// idempotent.
pub fn resolve_text(draft: &str, chunks: &HashMap<Uuid, ChunkRef>) -> Resolution {
    let mut body = String::with_capacity(draft.len());
    let mut sources: Vec<Uuid> = Vec::new();
    let mut key_of: HashMap<Uuid, usize> = HashMap::new();
    let mut anchors: HashMap<Uuid, Vec<CitationAnchor>> = HashMap::new();
    let mut issues = Vec::new();
    let mut last_end = 0;

    for caps in cite_regex().captures_iter(draft) {
        let whole = match caps.get(0) {
            Some(m) => m,
            None => continue,
        };
        let id_text = match caps.get(1) {
            Some(m) => m.as_str(),
            None => continue,
        };

        body.push_str(&draft[last_end..whole.start()]);
        last_end = whole.end();

        let chunk_id = Uuid::parse_str(id_text).ok();
        let chunk_ref = chunk_id.and_then(|id| chunks.get(&id).copied());

        match (chunk_id, chunk_ref) {
            (Some(chunk_id), Some(chunk_ref)) => {
                let key = *key_of.entry(chunk_ref.source_id).or_insert_with(|| {
                    sources.push(chunk_ref.source_id);
                    sources.len()
                });

                let marker = format!("[{}]", key);
                let start = body.len() as i64;
                body.push_str(&marker);
                anchors
                    .entry(chunk_ref.source_id)
                    .or_default()
                    .push(CitationAnchor {
                        chunk_id,
                        page: chunk_ref.page,
                        quote_start: Some(start),
                        quote_end: Some(start + marker.len() as i64),
                    });
            }
            _ => {
                body.push_str(UNRESOLVED_MARKER);
                issues.push(format!("unresolved citation [cite:{}]", id_text));
            }
        }
    }

    body.push_str(&draft[last_end..]);

    Resolution {
        body,
        sources,
        anchors,
        issues,
    }
}

/// Resolve a draft against the run's evidence store and build citation
/// records. Chunks from other runs are treated as unresolved.
pub async fn resolve_draft(
    pool: &SqlitePool,
    run_id: Uuid,
    draft: &str,
) -> Result<(Resolution, Vec<Citation>)> {
    let mut chunks: HashMap<Uuid, ChunkRef> = HashMap::new();
    for caps in cite_regex().captures_iter(draft) {
        let Some(id_match) = caps.get(1) else { continue };
        let Ok(chunk_id) = Uuid::parse_str(id_match.as_str()) else {
            continue;
        };
        if chunks.contains_key(&chunk_id) {
            continue;
        }
        if let Some(chunk) = store::get_chunk(pool, chunk_id).await? {
            if chunk.run_id == run_id {
                chunks.insert(
                    chunk_id,
                    ChunkRef {
                        source_id: chunk.source_id,
                        page: chunk.page_start,
                    },
                );
            }
        }
    }

    let resolution = resolve_text(draft, &chunks);

    let mut citations = Vec::with_capacity(resolution.sources.len());
    for (i, source_id) in resolution.sources.iter().enumerate() {
        let source = store::get_source(pool, *source_id).await?;
        citations.push(Citation {
            id: Uuid::new_v4(),
            document_id: Uuid::nil(), // assigned at save time
            citation_key: (i + 1).to_string(),
            source_id: *source_id,
            reference_entry: reference_entry(&source),
            anchors: resolution
                .anchors
                .get(source_id)
                .cloned()
                .unwrap_or_default(),
        });
    }

    Ok((resolution, citations))
}

/// IEEE-leaning reference line for one source.
pub fn reference_entry(source: &Source) -> String {
    let captured = chrono::DateTime::from_timestamp(source.captured_at, 0)
        .map(|dt| dt.format("%Y-%m-%d").to_string());
    match (source.kind, captured) {
        (SourceKind::Pdf, _) => format!("{}. {}.", source.title, source.uri),
        (SourceKind::Url, Some(date)) => format!(
            "{}. [Online]. Available: {} (accessed {})",
            source.title, source.uri, date
        ),
        (SourceKind::Url, None) => {
            format!("{}. [Online]. Available: {}", source.title, source.uri)
        }
        (SourceKind::Note, _) => format!("{}. Research note.", source.title),
    }
}

/// How well-evidenced a resolved body is, for the critique stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageReport {
    pub sentences: usize,
    pub cited_sentences: usize,
    pub unresolved: usize,
}

fn marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[\d+\]").expect("valid marker pattern"))
}

/// Sentence-level citation coverage over a resolved body. Sentences are
/// approximated by `.`/`!`/`?` boundaries; the references section is not
/// counted.
pub fn coverage(resolution: &Resolution) -> CoverageReport {
    let body = match resolution.body.find("## References") {
        Some(pos) => &resolution.body[..pos],
        None => resolution.body.as_str(),
    };

    let mut sentences = 0;
    let mut cited = 0;
    for sentence in body.split_inclusive(['.', '!', '?']) {
        if sentence.trim().is_empty() {
            continue;
        }
        sentences += 1;
        if marker_regex().is_match(sentence) {
            cited += 1;
        }
    }

    CoverageReport {
        sentences,
        cited_sentences: cited,
        unresolved: resolution.issues.len(),
    }
}

/// Render the references section appended to a resolved document body.
pub fn render_references(citations: &[Citation]) -> String {
    if citations.is_empty() {
        return String::new();
    }

    let mut out = String::from("## References\n\n");
    for citation in citations {
        out.push_str(&format!(
            "[{}] {}\n",
            citation.citation_key, citation.reference_entry
        ));
    }
    out
}

/// Persist citations for a published document.
pub async fn save_citations(
    pool: &SqlitePool,
    document_id: Uuid,
    citations: &[Citation],
) -> Result<()> {
    let mut tx = pool.begin().await?;

    for citation in citations {
        let anchors_json = serde_json::to_string(&citation.anchors)
            .map_err(|e| EngineError::Internal(e.into()))?;
        sqlx::query(
            r#"
            INSERT INTO citations (id, document_id, citation_key, source_id, reference_entry, anchors_json)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(citation.id.to_string())
        .bind(document_id.to_string())
        .bind(&citation.citation_key)
        .bind(citation.source_id.to_string())
        .bind(&citation.reference_entry)
        .bind(&anchors_json)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

pub async fn list_citations(pool: &SqlitePool, document_id: Uuid) -> Result<Vec<Citation>> {
    let rows = sqlx::query(
        "SELECT * FROM citations WHERE document_id = ? ORDER BY CAST(citation_key AS INTEGER)",
    )
    .bind(document_id.to_string())
    .fetch_all(pool)
    .await?;

    let mut citations = Vec::with_capacity(rows.len());
    for row in rows {
        let id: String = row.get("id");
        let doc: String = row.get("document_id");
        let source: String = row.get("source_id");
        let anchors_json: String = row.get("anchors_json");
        citations.push(Citation {
            id: Uuid::parse_str(&id).map_err(|e| EngineError::Internal(e.into()))?,
            document_id: Uuid::parse_str(&doc).map_err(|e| EngineError::Internal(e.into()))?,
            citation_key: row.get("citation_key"),
            source_id: Uuid::parse_str(&source).map_err(|e| EngineError::Internal(e.into()))?,
            reference_entry: row.get("reference_entry"),
            anchors: serde_json::from_str(&anchors_json).unwrap_or_default(),
        });
    }
    Ok(citations)
}
