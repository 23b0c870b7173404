//! Core data models for the engine.
//!
//! These types represent the runs, sources, chunks, documents, citations,
//! and events that flow through the ingestion, retrieval, and publication
//! pipeline. Stored timestamps are epoch seconds (UTC).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a run. Transitions happen exclusively through the
/// pipeline orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Created,
    Ingesting,
    Drafting,
    Reviewing,
    Complete,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Created => "created",
            RunStatus::Ingesting => "ingesting",
            RunStatus::Drafting => "drafting",
            RunStatus::Reviewing => "reviewing",
            RunStatus::Complete => "complete",
            RunStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<RunStatus> {
        match s {
            "created" => Some(RunStatus::Created),
            "ingesting" => Some(RunStatus::Ingesting),
            "drafting" => Some(RunStatus::Drafting),
            "reviewing" => Some(RunStatus::Reviewing),
            "complete" => Some(RunStatus::Complete),
            "error" => Some(RunStatus::Error),
            _ => None,
        }
    }
}

/// A research run: one complete research session.
#[derive(Debug, Clone)]
pub struct Run {
    pub id: Uuid,
    pub title: String,
    pub objective: String,
    /// Free-form constraints as a JSON object.
    pub constraints_json: String,
    pub status: RunStatus,
    /// Configuration snapshot; immutable once a document version exists.
    pub config_json: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Pdf,
    Url,
    Note,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Pdf => "pdf",
            SourceKind::Url => "url",
            SourceKind::Note => "note",
        }
    }

    pub fn parse(s: &str) -> Option<SourceKind> {
        match s {
            "pdf" => Some(SourceKind::Pdf),
            "url" => Some(SourceKind::Url),
            "note" => Some(SourceKind::Note),
            _ => None,
        }
    }
}

/// Ingestion state of a source, tracked for partial-failure recovery.
/// A `failed` source can be retried in isolation without touching the rest
/// of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    Pending,
    Ingested,
    Failed,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::Pending => "pending",
            SourceStatus::Ingested => "ingested",
            SourceStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<SourceStatus> {
        match s {
            "pending" => Some(SourceStatus::Pending),
            "ingested" => Some(SourceStatus::Ingested),
            "failed" => Some(SourceStatus::Failed),
            _ => None,
        }
    }
}

/// An ingested document or link. Immutable after creation except for
/// `status` and `error`.
#[derive(Debug, Clone)]
pub struct Source {
    pub id: Uuid,
    pub run_id: Uuid,
    pub kind: SourceKind,
    pub title: String,
    /// Origin locator: URL or storage path.
    pub uri: String,
    pub captured_at: i64,
    /// Dedup key over the source content.
    pub content_hash: String,
    pub metadata_json: String,
    pub status: SourceStatus,
    /// Last ingestion error, if any.
    pub error: Option<String>,
}

/// A unit of evidence extracted from a source.
///
/// `(source_id, chunk_index)` is unique. Created once by ingestion; mutated
/// only to attach the embedding and contextual prefix.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: Uuid,
    pub source_id: Uuid,
    pub run_id: Uuid,
    pub chunk_index: i64,
    pub content: String,
    /// LLM-generated situating prefix, when available.
    pub contextual_prefix: Option<String>,
    pub page_start: Option<i64>,
    pub page_end: Option<i64>,
    pub section_hint: Option<String>,
    /// Heading path from the document structure, outermost first.
    pub heading_path: Vec<String>,
    pub content_hash: String,
    pub token_count: i64,
    pub chunk_method: String,
    pub metadata_json: String,
}

impl Chunk {
    /// Text actually embedded: prefix + content when a prefix exists.
    pub fn embeddable_text(&self) -> String {
        match &self.contextual_prefix {
            Some(prefix) => format!("{}\n---\n{}", prefix, self.content),
            None => self.content.clone(),
        }
    }
}

/// Which retrieval channel produced (or fused) a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Vector,
    Keyword,
    Hybrid,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Vector => "vector",
            SearchMode::Keyword => "keyword",
            SearchMode::Hybrid => "hybrid",
        }
    }

    pub fn parse(s: &str) -> Option<SearchMode> {
        match s {
            "vector" => Some(SearchMode::Vector),
            "keyword" => Some(SearchMode::Keyword),
            "hybrid" => Some(SearchMode::Hybrid),
            _ => None,
        }
    }
}

/// A ranked chunk reference with provenance. Ephemeral — never persisted.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub chunk_id: Uuid,
    pub source_id: Uuid,
    pub chunk_index: i64,
    pub content: String,
    pub contextual_prefix: Option<String>,
    pub page_start: Option<i64>,
    pub page_end: Option<i64>,
    pub section_hint: Option<String>,
    pub score: f64,
    pub source_title: String,
    pub source_uri: String,
    pub search_mode: SearchMode,
}

impl SearchResult {
    /// Human-readable page location, e.g. `p. 4` or `pp. 4-6`.
    pub fn location(&self) -> String {
        match (self.page_start, self.page_end) {
            (Some(a), Some(b)) if a == b => format!("p. {}", a),
            (Some(a), Some(b)) => format!("pp. {}-{}", a, b),
            (Some(a), None) => format!("p. {}", a),
            _ => String::new(),
        }
    }
}

/// A versioned research document. Immutable once created; a new version is
/// always a new row.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: Uuid,
    pub run_id: Uuid,
    /// Monotonic, unique per run, starting at 1.
    pub version: i64,
    pub title: String,
    pub body: String,
    pub created_at: i64,
    /// Required for version >= 2.
    pub change_log: Option<String>,
    /// Run configuration at generation time, for reproducibility.
    pub config_json: String,
}

/// A precise (chunk, quote-span) pointer backing a citation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitationAnchor {
    pub chunk_id: Uuid,
    pub page: Option<i64>,
    /// Byte offsets of the rendered citation marker in the resolved text.
    pub quote_start: Option<i64>,
    pub quote_end: Option<i64>,
}

/// Links one document to the evidence behind one cited source.
#[derive(Debug, Clone)]
pub struct Citation {
    pub id: Uuid,
    pub document_id: Uuid,
    /// Stable label in first-appearance order, e.g. "1".
    pub citation_key: String,
    pub source_id: Uuid,
    pub reference_entry: String,
    pub anchors: Vec<CitationAnchor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    StageStart,
    StageEnd,
    ToolCall,
    Error,
    Checkpoint,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::StageStart => "stage_start",
            EventType::StageEnd => "stage_end",
            EventType::ToolCall => "tool_call",
            EventType::Error => "error",
            EventType::Checkpoint => "checkpoint",
        }
    }

    pub fn parse(s: &str) -> Option<EventType> {
        match s {
            "stage_start" => Some(EventType::StageStart),
            "stage_end" => Some(EventType::StageEnd),
            "tool_call" => Some(EventType::ToolCall),
            "error" => Some(EventType::Error),
            "checkpoint" => Some(EventType::Checkpoint),
            _ => None,
        }
    }
}

/// Append-only audit log entry. Never mutated or deleted.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: Uuid,
    pub run_id: Uuid,
    pub ts: i64,
    pub event_type: EventType,
    pub stage: Option<String>,
    pub payload_json: String,
}
