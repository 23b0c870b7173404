//! Run lifecycle orchestration.
//!
//! Status moves created → ingesting → drafting → reviewing → complete, with
//! a reviewing → drafting loop for revision and error reachable from any
//! working state. Transitions happen only through [`advance`], which logs
//! stage events and writes checkpoints at the durable boundaries (after
//! ingestion and after each publication) so an errored run can be resumed.

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::events;
use crate::models::{EventType, RunStatus};
use crate::store;

/// Lifecycle signals emitted by the stages as they start and finish.
#[derive(Debug, Clone)]
pub enum StageSignal {
    IngestStarted,
    IngestFinished { ingested: usize, failed: usize },
    DraftStarted,
    DraftFinished { document_id: Uuid },
    ReviewStarted,
    ReviewFinished { approved: bool, issues: usize },
    Failed { stage: String, cause: String },
}

/// Apply a stage signal to the run, enforcing transition legality. Returns
/// the run's new status.
pub async fn advance(pool: &SqlitePool, run_id: Uuid, signal: StageSignal) -> Result<RunStatus> {
    let run = store::get_run(pool, run_id).await?;

    let next = match (run.status, &signal) {
        (RunStatus::Created, StageSignal::IngestStarted) => {
            events::append(
                pool,
                run_id,
                EventType::StageStart,
                Some("ingesting"),
                serde_json::json!({}),
            )
            .await?;
            RunStatus::Ingesting
        }

        (RunStatus::Ingesting, StageSignal::IngestFinished { ingested, failed }) => {
            events::append(
                pool,
                run_id,
                EventType::StageEnd,
                Some("ingesting"),
                serde_json::json!({ "ingested": ingested, "failed": failed }),
            )
            .await?;

            if *ingested == 0 {
                // Nothing usable came in; the run cannot draft.
                events::append(
                    pool,
                    run_id,
                    EventType::Error,
                    Some("ingesting"),
                    serde_json::json!({ "cause": "no sources ingested" }),
                )
                .await?;
                RunStatus::Error
            } else {
                if *failed > 0 {
                    events::append(
                        pool,
                        run_id,
                        EventType::Error,
                        Some("ingesting"),
                        serde_json::json!({
                            "severity": "warning",
                            "cause": format!("{} source(s) failed ingestion", failed),
                        }),
                    )
                    .await?;
                }
                checkpoint(pool, run_id, "drafting", serde_json::json!({})).await?;
                RunStatus::Drafting
            }
        }

        (RunStatus::Drafting, StageSignal::DraftStarted) => {
            events::append(
                pool,
                run_id,
                EventType::StageStart,
                Some("drafting"),
                serde_json::json!({}),
            )
            .await?;
            RunStatus::Drafting
        }

        (RunStatus::Drafting, StageSignal::DraftFinished { document_id }) => {
            events::append(
                pool,
                run_id,
                EventType::StageEnd,
                Some("drafting"),
                serde_json::json!({ "document_id": document_id.to_string() }),
            )
            .await?;
            checkpoint(
                pool,
                run_id,
                "reviewing",
                serde_json::json!({ "document_id": document_id.to_string() }),
            )
            .await?;
            RunStatus::Reviewing
        }

        (RunStatus::Reviewing, StageSignal::ReviewStarted) => {
            events::append(
                pool,
                run_id,
                EventType::StageStart,
                Some("reviewing"),
                serde_json::json!({}),
            )
            .await?;
            RunStatus::Reviewing
        }

        (RunStatus::Reviewing, StageSignal::ReviewFinished { approved, issues }) => {
            events::append(
                pool,
                run_id,
                EventType::StageEnd,
                Some("reviewing"),
                serde_json::json!({ "approved": approved, "issues": issues }),
            )
            .await?;
            if *approved {
                RunStatus::Complete
            } else {
                // Revision loop: back to drafting for the next version.
                RunStatus::Drafting
            }
        }

        (status, StageSignal::Failed { stage, cause })
            if status != RunStatus::Complete =>
        {
            events::append(
                pool,
                run_id,
                EventType::Error,
                Some(stage),
                serde_json::json!({ "cause": cause }),
            )
            .await?;
            RunStatus::Error
        }

        (status, signal) => {
            return Err(EngineError::stage_failed(
                status.as_str(),
                format!("illegal transition from '{}' on {:?}", status.as_str(), signal),
            ));
        }
    };

    if next != run.status {
        store::update_run_status(pool, run_id, next).await?;
    }
    Ok(next)
}

async fn checkpoint(
    pool: &SqlitePool,
    run_id: Uuid,
    resume_state: &str,
    mut payload: serde_json::Value,
) -> Result<()> {
    if let Some(map) = payload.as_object_mut() {
        map.insert(
            "resume_state".to_string(),
            serde_json::Value::String(resume_state.to_string()),
        );
    }
    events::append(pool, run_id, EventType::Checkpoint, None, payload).await?;
    Ok(())
}

/// Resume an errored run from its most recent checkpoint. With no
/// checkpoint the run restarts from `created`.
pub async fn resume(pool: &SqlitePool, run_id: Uuid) -> Result<RunStatus> {
    let run = store::get_run(pool, run_id).await?;
    if run.status != RunStatus::Error {
        return Err(EngineError::stage_failed(
            run.status.as_str(),
            format!("run {} is not in error state", run_id),
        ));
    }

    let target = match events::latest_checkpoint(pool, run_id).await? {
        Some(event) => {
            let payload: serde_json::Value =
                serde_json::from_str(&event.payload_json).unwrap_or_default();
            match payload.get("resume_state").and_then(|v| v.as_str()) {
                Some("drafting") => RunStatus::Drafting,
                Some("reviewing") => RunStatus::Reviewing,
                _ => RunStatus::Created,
            }
        }
        None => RunStatus::Created,
    };

    events::append(
        pool,
        run_id,
        EventType::StageStart,
        Some("resume"),
        serde_json::json!({ "target": target.as_str() }),
    )
    .await?;
    store::update_run_status(pool, run_id, target).await?;
    Ok(target)
}
