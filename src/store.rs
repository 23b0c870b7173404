//! Evidence Store: durable records for runs, sources, and chunks.
//!
//! All writes are append-style inserts or single-row status updates guarded
//! by row-level constraints. Ownership is partitioned by `run_id`, so no
//! cross-run locking is ever needed.

use anyhow::anyhow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::{Chunk, Run, RunStatus, Source, SourceKind, SourceStatus};

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| EngineError::Internal(anyhow!("bad uuid '{}': {}", s, e)))
}

// ============ Runs ============

pub async fn create_run(
    pool: &SqlitePool,
    title: &str,
    objective: &str,
    constraints_json: &str,
    config_json: &str,
) -> Result<Run> {
    let run = Run {
        id: Uuid::new_v4(),
        title: title.to_string(),
        objective: objective.to_string(),
        constraints_json: constraints_json.to_string(),
        status: RunStatus::Created,
        config_json: config_json.to_string(),
        created_at: now(),
        updated_at: now(),
    };

    sqlx::query(
        r#"
        INSERT INTO runs (id, title, objective, constraints_json, status, config_json, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(run.id.to_string())
    .bind(&run.title)
    .bind(&run.objective)
    .bind(&run.constraints_json)
    .bind(run.status.as_str())
    .bind(&run.config_json)
    .bind(run.created_at)
    .bind(run.updated_at)
    .execute(pool)
    .await?;

    Ok(run)
}

pub async fn get_run(pool: &SqlitePool, run_id: Uuid) -> Result<Run> {
    let row = sqlx::query(
        "SELECT id, title, objective, constraints_json, status, config_json, created_at, updated_at FROM runs WHERE id = ?",
    )
    .bind(run_id.to_string())
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| EngineError::not_found(format!("run {}", run_id)))?;

    let status_str: String = row.get("status");
    let status = RunStatus::parse(&status_str)
        .ok_or_else(|| EngineError::Internal(anyhow!("unknown run status '{}'", status_str)))?;

    Ok(Run {
        id: run_id,
        title: row.get("title"),
        objective: row.get("objective"),
        constraints_json: row.get("constraints_json"),
        status,
        config_json: row.get("config_json"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub async fn list_runs(pool: &SqlitePool, limit: i64) -> Result<Vec<Run>> {
    let rows = sqlx::query(
        "SELECT id, title, objective, constraints_json, status, config_json, created_at, updated_at FROM runs ORDER BY created_at DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut runs = Vec::with_capacity(rows.len());
    for row in rows {
        let id: String = row.get("id");
        let status_str: String = row.get("status");
        runs.push(Run {
            id: parse_uuid(&id)?,
            title: row.get("title"),
            objective: row.get("objective"),
            constraints_json: row.get("constraints_json"),
            status: RunStatus::parse(&status_str).unwrap_or(RunStatus::Error),
            config_json: row.get("config_json"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        });
    }
    Ok(runs)
}

pub async fn update_run_status(pool: &SqlitePool, run_id: Uuid, status: RunStatus) -> Result<()> {
    let result = sqlx::query("UPDATE runs SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(now())
        .bind(run_id.to_string())
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(EngineError::not_found(format!("run {}", run_id)));
    }
    Ok(())
}

/// Explicit cascade delete of a run and everything it owns. The FTS index
/// has no foreign keys, so its rows are removed by hand.
pub async fn delete_run(pool: &SqlitePool, run_id: Uuid) -> Result<()> {
    let mut tx = pool.begin().await?;
    let id = run_id.to_string();

    sqlx::query("DELETE FROM chunks_fts WHERE run_id = ?")
        .bind(&id)
        .execute(&mut *tx)
        .await?;
    let result = sqlx::query("DELETE FROM runs WHERE id = ?")
        .bind(&id)
        .execute(&mut *tx)
        .await?;

    if result.rows_affected() == 0 {
        return Err(EngineError::not_found(format!("run {}", run_id)));
    }

    tx.commit().await?;
    Ok(())
}

// ============ Sources ============

/// Register a source for ingestion. Content-hash deduplication: adding the
/// same content to the same run returns the existing source.
pub async fn create_source(
    pool: &SqlitePool,
    run_id: Uuid,
    kind: SourceKind,
    title: &str,
    uri: &str,
    content_hash: &str,
    metadata_json: &str,
) -> Result<Source> {
    // Run must exist
    get_run(pool, run_id).await?;

    let existing: Option<String> =
        sqlx::query_scalar("SELECT id FROM sources WHERE run_id = ? AND content_hash = ?")
            .bind(run_id.to_string())
            .bind(content_hash)
            .fetch_optional(pool)
            .await?;

    if let Some(id) = existing {
        return get_source(pool, parse_uuid(&id)?).await;
    }

    let source = Source {
        id: Uuid::new_v4(),
        run_id,
        kind,
        title: title.to_string(),
        uri: uri.to_string(),
        captured_at: now(),
        content_hash: content_hash.to_string(),
        metadata_json: metadata_json.to_string(),
        status: SourceStatus::Pending,
        error: None,
    };

    sqlx::query(
        r#"
        INSERT INTO sources (id, run_id, kind, title, uri, captured_at, content_hash, metadata_json, status, error)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
        "#,
    )
    .bind(source.id.to_string())
    .bind(run_id.to_string())
    .bind(source.kind.as_str())
    .bind(&source.title)
    .bind(&source.uri)
    .bind(source.captured_at)
    .bind(&source.content_hash)
    .bind(&source.metadata_json)
    .bind(source.status.as_str())
    .execute(pool)
    .await?;

    Ok(source)
}

fn source_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Source> {
    let id: String = row.get("id");
    let run_id: String = row.get("run_id");
    let kind_str: String = row.get("kind");
    let status_str: String = row.get("status");

    Ok(Source {
        id: parse_uuid(&id)?,
        run_id: parse_uuid(&run_id)?,
        kind: SourceKind::parse(&kind_str)
            .ok_or_else(|| EngineError::Internal(anyhow!("unknown source kind '{}'", kind_str)))?,
        title: row.get("title"),
        uri: row.get("uri"),
        captured_at: row.get("captured_at"),
        content_hash: row.get("content_hash"),
        metadata_json: row.get("metadata_json"),
        status: SourceStatus::parse(&status_str).unwrap_or(SourceStatus::Failed),
        error: row.get("error"),
    })
}

pub async fn get_source(pool: &SqlitePool, source_id: Uuid) -> Result<Source> {
    let row = sqlx::query("SELECT * FROM sources WHERE id = ?")
        .bind(source_id.to_string())
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| EngineError::not_found(format!("source {}", source_id)))?;

    source_from_row(&row)
}

pub async fn list_sources(pool: &SqlitePool, run_id: Uuid) -> Result<Vec<Source>> {
    let rows = sqlx::query("SELECT * FROM sources WHERE run_id = ? ORDER BY rowid")
        .bind(run_id.to_string())
        .fetch_all(pool)
        .await?;

    rows.iter().map(source_from_row).collect()
}

pub async fn set_source_status(
    pool: &SqlitePool,
    source_id: Uuid,
    status: SourceStatus,
    error: Option<&str>,
) -> Result<()> {
    let result = sqlx::query("UPDATE sources SET status = ?, error = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(error)
        .bind(source_id.to_string())
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(EngineError::not_found(format!("source {}", source_id)));
    }
    Ok(())
}

// ============ Chunks ============

/// Insert a source's chunks and their lexical index rows in one transaction.
/// Either all rows land or none do — a cancelled ingestion never leaves
/// partial chunk rows behind.
pub async fn insert_chunks(pool: &SqlitePool, chunks: &[Chunk]) -> Result<()> {
    let mut tx = pool.begin().await?;

    for chunk in chunks {
        sqlx::query(
            r#"
            INSERT INTO chunks (id, source_id, run_id, chunk_index, content, contextual_prefix,
                                page_start, page_end, section_hint, heading_path_json,
                                content_hash, token_count, chunk_method, metadata_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(chunk.id.to_string())
        .bind(chunk.source_id.to_string())
        .bind(chunk.run_id.to_string())
        .bind(chunk.chunk_index)
        .bind(&chunk.content)
        .bind(&chunk.contextual_prefix)
        .bind(chunk.page_start)
        .bind(chunk.page_end)
        .bind(&chunk.section_hint)
        .bind(serde_json::to_string(&chunk.heading_path).unwrap_or_else(|_| "[]".to_string()))
        .bind(&chunk.content_hash)
        .bind(chunk.token_count)
        .bind(&chunk.chunk_method)
        .bind(&chunk.metadata_json)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO chunks_fts (chunk_id, run_id, text) VALUES (?, ?, ?)")
            .bind(chunk.id.to_string())
            .bind(chunk.run_id.to_string())
            .bind(&chunk.content)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Replace a failed source's chunks before re-ingestion.
pub async fn delete_source_chunks(pool: &SqlitePool, source_id: Uuid) -> Result<()> {
    let mut tx = pool.begin().await?;
    let id = source_id.to_string();

    sqlx::query(
        "DELETE FROM chunks_fts WHERE chunk_id IN (SELECT id FROM chunks WHERE source_id = ?)",
    )
    .bind(&id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM chunks WHERE source_id = ?")
        .bind(&id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

pub fn chunk_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Chunk> {
    let id: String = row.get("id");
    let source_id: String = row.get("source_id");
    let run_id: String = row.get("run_id");
    let heading_json: String = row.get("heading_path_json");

    Ok(Chunk {
        id: parse_uuid(&id)?,
        source_id: parse_uuid(&source_id)?,
        run_id: parse_uuid(&run_id)?,
        chunk_index: row.get("chunk_index"),
        content: row.get("content"),
        contextual_prefix: row.get("contextual_prefix"),
        page_start: row.get("page_start"),
        page_end: row.get("page_end"),
        section_hint: row.get("section_hint"),
        heading_path: serde_json::from_str(&heading_json).unwrap_or_default(),
        content_hash: row.get("content_hash"),
        token_count: row.get("token_count"),
        chunk_method: row.get("chunk_method"),
        metadata_json: row.get("metadata_json"),
    })
}

pub async fn get_chunk(pool: &SqlitePool, chunk_id: Uuid) -> Result<Option<Chunk>> {
    let row = sqlx::query("SELECT * FROM chunks WHERE id = ?")
        .bind(chunk_id.to_string())
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => Ok(Some(chunk_from_row(&row)?)),
        None => Ok(None),
    }
}

pub async fn list_chunks(pool: &SqlitePool, source_id: Uuid) -> Result<Vec<Chunk>> {
    let rows = sqlx::query("SELECT * FROM chunks WHERE source_id = ? ORDER BY chunk_index")
        .bind(source_id.to_string())
        .fetch_all(pool)
        .await?;

    rows.iter().map(chunk_from_row).collect()
}

pub async fn count_run_chunks(pool: &SqlitePool, run_id: Uuid) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE run_id = ?")
        .bind(run_id.to_string())
        .fetch_one(pool)
        .await?;
    Ok(count)
}
