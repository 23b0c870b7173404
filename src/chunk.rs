//! Normalization of extractor output into stored chunk rows.
//!
//! The extractor owns the actual splitting; this module assigns contiguous
//! ordinals, content hashes, and token estimates so that downstream search
//! and citation code can rely on `(source_id, chunk_index)` identity.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Chunk;
use crate::providers::ExtractedChunk;

/// Approximate chars-per-token ratio used for the stored token estimate.
const CHARS_PER_TOKEN: usize = 4;

/// Build stored chunk rows from extractor output. Empty-text chunks are
/// skipped; indices are contiguous starting at 0.
pub fn normalize_chunks(
    run_id: Uuid,
    source_id: Uuid,
    extracted: &[ExtractedChunk],
    chunk_method: &str,
) -> Vec<Chunk> {
    let mut chunks = Vec::with_capacity(extracted.len());
    let mut index: i64 = 0;

    for raw in extracted {
        let text = raw.text.trim();
        if text.is_empty() {
            continue;
        }

        chunks.push(Chunk {
            id: Uuid::new_v4(),
            source_id,
            run_id,
            chunk_index: index,
            content: text.to_string(),
            contextual_prefix: None,
            page_start: raw.page_start,
            page_end: raw.page_end,
            section_hint: raw.section_hint.clone(),
            heading_path: raw.heading_path.clone(),
            content_hash: hash_text(text),
            token_count: estimate_tokens(text),
            chunk_method: chunk_method.to_string(),
            metadata_json: "{}".to_string(),
        });
        index += 1;
    }

    chunks
}

pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn estimate_tokens(text: &str) -> i64 {
    (text.len() / CHARS_PER_TOKEN).max(1) as i64
}
