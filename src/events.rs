//! Append-only event log.
//!
//! Every stage transition, tool failure, and checkpoint lands here so a run
//! can be audited or resumed after a crash. Events are never updated or
//! deleted.

use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Event, EventType};
use crate::store::now;

pub async fn append(
    pool: &SqlitePool,
    run_id: Uuid,
    event_type: EventType,
    stage: Option<&str>,
    payload: serde_json::Value,
) -> Result<Event> {
    let event = Event {
        id: Uuid::new_v4(),
        run_id,
        ts: now(),
        event_type,
        stage: stage.map(|s| s.to_string()),
        payload_json: payload.to_string(),
    };

    sqlx::query(
        "INSERT INTO events (id, run_id, ts, type, stage, payload_json) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(event.id.to_string())
    .bind(run_id.to_string())
    .bind(event.ts)
    .bind(event_type.as_str())
    .bind(&event.stage)
    .bind(&event.payload_json)
    .execute(pool)
    .await?;

    Ok(event)
}

/// Newest-first event listing for a run.
pub async fn list(pool: &SqlitePool, run_id: Uuid, limit: i64) -> Result<Vec<Event>> {
    let rows = sqlx::query(
        "SELECT id, run_id, ts, type, stage, payload_json FROM events WHERE run_id = ? ORDER BY ts DESC, rowid DESC LIMIT ?",
    )
    .bind(run_id.to_string())
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut events = Vec::with_capacity(rows.len());
    for row in rows {
        let id: String = row.get("id");
        let run: String = row.get("run_id");
        let type_str: String = row.get("type");
        events.push(Event {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            run_id: Uuid::parse_str(&run).unwrap_or_default(),
            ts: row.get("ts"),
            event_type: EventType::parse(&type_str).unwrap_or(EventType::Error),
            stage: row.get("stage"),
            payload_json: row.get("payload_json"),
        });
    }
    Ok(events)
}

/// Most recent checkpoint for a run, if any. Used by pipeline resume.
pub async fn latest_checkpoint(pool: &SqlitePool, run_id: Uuid) -> Result<Option<Event>> {
    let events = list_of_type(pool, run_id, EventType::Checkpoint, 1).await?;
    Ok(events.into_iter().next())
}

async fn list_of_type(
    pool: &SqlitePool,
    run_id: Uuid,
    event_type: EventType,
    limit: i64,
) -> Result<Vec<Event>> {
    let rows = sqlx::query(
        "SELECT id, run_id, ts, type, stage, payload_json FROM events WHERE run_id = ? AND type = ? ORDER BY ts DESC, rowid DESC LIMIT ?",
    )
    .bind(run_id.to_string())
    .bind(event_type.as_str())
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut events = Vec::with_capacity(rows.len());
    for row in rows {
        let id: String = row.get("id");
        let run: String = row.get("run_id");
        let type_str: String = row.get("type");
        events.push(Event {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            run_id: Uuid::parse_str(&run).unwrap_or_default(),
            ts: row.get("ts"),
            event_type: EventType::parse(&type_str).unwrap_or(EventType::Error),
            stage: row.get("stage"),
            payload_json: row.get("payload_json"),
        });
    }
    Ok(events)
}
