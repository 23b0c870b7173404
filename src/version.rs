//! Document versioning: immutable versions, conflict-safe publishing, diffs.
//!
//! Versions are monotonic per run starting at 1. Publishing reads the
//! current maximum and inserts the next number; the `UNIQUE(run_id,
//! version)` constraint is the serialization point, and a conflicting
//! concurrent publish simply retries with a fresh number.

use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::Document;
use crate::store::now;

const PUBLISH_ATTEMPTS: u32 = 3;

/// Publish a new document version for the run.
///
/// `change_log` is required for every version after the first.
pub async fn publish(
    pool: &SqlitePool,
    run_id: Uuid,
    title: &str,
    body: &str,
    change_log: Option<&str>,
    config_json: &str,
) -> Result<Document> {
    crate::store::get_run(pool, run_id).await?;

    for _ in 0..PUBLISH_ATTEMPTS {
        let max_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM documents WHERE run_id = ?")
                .bind(run_id.to_string())
                .fetch_one(pool)
                .await?;

        let version = max_version.unwrap_or(0) + 1;
        if version > 1 && change_log.is_none() {
            return Err(EngineError::InvalidVersion(format!(
                "version {} requires a change log",
                version
            )));
        }

        let document = Document {
            id: Uuid::new_v4(),
            run_id,
            version,
            title: title.to_string(),
            body: body.to_string(),
            created_at: now(),
            change_log: change_log.map(|s| s.to_string()),
            config_json: config_json.to_string(),
        };

        let inserted = sqlx::query(
            r#"
            INSERT INTO documents (id, run_id, version, title, body, created_at, change_log, config_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(document.id.to_string())
        .bind(run_id.to_string())
        .bind(version)
        .bind(&document.title)
        .bind(&document.body)
        .bind(document.created_at)
        .bind(&document.change_log)
        .bind(&document.config_json)
        .execute(pool)
        .await;

        match inserted {
            Ok(_) => return Ok(document),
            Err(e) if is_unique_violation(&e) => continue, // lost the race
            Err(e) => return Err(e.into()),
        }
    }

    Err(EngineError::InvalidVersion(format!(
        "could not allocate a version for run {} after {} attempts",
        run_id, PUBLISH_ATTEMPTS
    )))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed"))
}

fn document_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Document> {
    let id: String = row.get("id");
    let run_id: String = row.get("run_id");
    Ok(Document {
        id: Uuid::parse_str(&id).map_err(|e| EngineError::Internal(e.into()))?,
        run_id: Uuid::parse_str(&run_id).map_err(|e| EngineError::Internal(e.into()))?,
        version: row.get("version"),
        title: row.get("title"),
        body: row.get("body"),
        created_at: row.get("created_at"),
        change_log: row.get("change_log"),
        config_json: row.get("config_json"),
    })
}

pub async fn get_version(pool: &SqlitePool, run_id: Uuid, version: i64) -> Result<Document> {
    let row = sqlx::query("SELECT * FROM documents WHERE run_id = ? AND version = ?")
        .bind(run_id.to_string())
        .bind(version)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| {
            EngineError::not_found(format!("document version {} for run {}", version, run_id))
        })?;
    document_from_row(&row)
}

pub async fn latest(pool: &SqlitePool, run_id: Uuid) -> Result<Option<Document>> {
    let row = sqlx::query("SELECT * FROM documents WHERE run_id = ? ORDER BY version DESC LIMIT 1")
        .bind(run_id.to_string())
        .fetch_optional(pool)
        .await?;
    match row {
        Some(row) => Ok(Some(document_from_row(&row)?)),
        None => Ok(None),
    }
}

pub async fn list_versions(pool: &SqlitePool, run_id: Uuid) -> Result<Vec<Document>> {
    let rows = sqlx::query("SELECT * FROM documents WHERE run_id = ? ORDER BY version")
        .bind(run_id.to_string())
        .fetch_all(pool)
        .await?;
    rows.iter().map(document_from_row).collect()
}

// ============ Line diff ============

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffLine {
    Same(String),
    Added(String),
    Removed(String),
}

/// Line-level diff between two document bodies.
#[derive(Debug, Clone, Default)]
pub struct VersionDiff {
    pub additions: usize,
    pub deletions: usize,
    /// Paired removed/added runs, counted as changed lines.
    pub modifications: usize,
    pub lines: Vec<DiffLine>,
}

impl VersionDiff {
    pub fn is_empty(&self) -> bool {
        self.additions == 0 && self.deletions == 0 && self.modifications == 0
    }

    pub fn summary(&self) -> String {
        format!(
            "+{} -{} ~{}",
            self.additions, self.deletions, self.modifications
        )
    }
}

/// Diff two stored versions of the same run.
pub async fn diff_versions(
    pool: &SqlitePool,
    run_id: Uuid,
    from: i64,
    to: i64,
) -> Result<VersionDiff> {
    let from_doc = get_version(pool, run_id, from).await?;
    let to_doc = get_version(pool, run_id, to).await?;
    Ok(diff_text(&from_doc.body, &to_doc.body))
}

/// Longest-common-subsequence diff over lines. Identical inputs yield an
/// empty diff. A run of removals immediately followed by additions is
/// counted pairwise as modifications.
pub fn diff_text(old: &str, new: &str) -> VersionDiff {
    let old_lines: Vec<&str> = if old.is_empty() {
        vec![]
    } else {
        old.lines().collect()
    };
    let new_lines: Vec<&str> = if new.is_empty() {
        vec![]
    } else {
        new.lines().collect()
    };

    // DP table of LCS lengths.
    let n = old_lines.len();
    let m = new_lines.len();
    let mut lcs = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if old_lines[i] == new_lines[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    // Walk the table, batching removal/addition runs so pairs can be
    // counted as modifications.
    let mut diff = VersionDiff::default();
    let mut removed_run: Vec<String> = Vec::new();
    let mut added_run: Vec<String> = Vec::new();
    let (mut i, mut j) = (0, 0);

    let flush =
        |diff: &mut VersionDiff, removed: &mut Vec<String>, added: &mut Vec<String>| {
            let paired = removed.len().min(added.len());
            diff.modifications += paired;
            diff.deletions += removed.len() - paired;
            diff.additions += added.len() - paired;
            for line in removed.drain(..) {
                diff.lines.push(DiffLine::Removed(line));
            }
            for line in added.drain(..) {
                diff.lines.push(DiffLine::Added(line));
            }
        };

    while i < n && j < m {
        if old_lines[i] == new_lines[j] {
            flush(&mut diff, &mut removed_run, &mut added_run);
            diff.lines.push(DiffLine::Same(old_lines[i].to_string()));
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            removed_run.push(old_lines[i].to_string());
            i += 1;
        } else {
            added_run.push(new_lines[j].to_string());
            j += 1;
        }
    }
    while i < n {
        removed_run.push(old_lines[i].to_string());
        i += 1;
    }
    while j < m {
        added_run.push(new_lines[j].to_string());
        j += 1;
    }
    flush(&mut diff, &mut removed_run, &mut added_run);

    diff
}

/// Render a diff in unified-ish form for the CLI.
pub fn render_diff(diff: &VersionDiff) -> String {
    let mut out = String::new();
    for line in &diff.lines {
        match line {
            DiffLine::Same(text) => {
                out.push_str("  ");
                out.push_str(text);
            }
            DiffLine::Added(text) => {
                out.push_str("+ ");
                out.push_str(text);
            }
            DiffLine::Removed(text) => {
                out.push_str("- ");
                out.push_str(text);
            }
        }
        out.push('\n');
    }
    out
}

/// Change-log entry header used when accumulating a run-level change log.
pub fn change_entry(version: i64, summary: &str) -> String {
    format!("### Version {}\n\n{}\n", version, summary)
}

/// Run-level change log derived from the stored versions, newest last.
/// Derived on demand, never stored.
pub fn accumulate_change_log(documents: &[Document]) -> String {
    let mut out = String::new();
    for document in documents {
        if let Some(summary) = &document.change_log {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&change_entry(document.version, summary));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_identical_is_empty() {
        let text = "line one\nline two\nline three";
        let diff = diff_text(text, text);
        assert!(diff.is_empty());
        assert_eq!(diff.lines.len(), 3);
        assert!(diff.lines.iter().all(|l| matches!(l, DiffLine::Same(_))));
    }

    #[test]
    fn test_diff_pure_addition() {
        let diff = diff_text("a\nb", "a\nb\nc\nd");
        assert_eq!(diff.additions, 2);
        assert_eq!(diff.deletions, 0);
        assert_eq!(diff.modifications, 0);
    }

    #[test]
    fn test_diff_pure_deletion() {
        let diff = diff_text("a\nb\nc", "a");
        assert_eq!(diff.additions, 0);
        assert_eq!(diff.deletions, 2);
        assert_eq!(diff.modifications, 0);
    }

    #[test]
    fn test_diff_modification_pairs_runs() {
        let diff = diff_text("a\nold line\nc", "a\nnew line\nc");
        assert_eq!(diff.modifications, 1);
        assert_eq!(diff.additions, 0);
        assert_eq!(diff.deletions, 0);
        assert_eq!(diff.summary(), "+0 -0 ~1");
    }

    #[test]
    fn test_diff_mixed_run() {
        // Two lines replaced by three: two modifications + one addition.
        let diff = diff_text("keep\nx\ny\nkeep2", "keep\np\nq\nr\nkeep2");
        assert_eq!(diff.modifications, 2);
        assert_eq!(diff.additions, 1);
        assert_eq!(diff.deletions, 0);
    }

    #[test]
    fn test_diff_empty_sides() {
        let diff = diff_text("", "a\nb");
        assert_eq!(diff.additions, 2);
        let diff = diff_text("a", "");
        assert_eq!(diff.deletions, 1);
        let diff = diff_text("", "");
        assert!(diff.is_empty());
        assert!(diff.lines.is_empty());
    }

    #[test]
    fn test_change_entry_format() {
        let entry = change_entry(2, "Tightened the findings section.");
        assert!(entry.starts_with("### Version 2\n"));
        assert!(entry.contains("Tightened"));
    }

    #[test]
    fn test_accumulate_change_log_skips_initial_version() {
        let base = Document {
            id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            version: 1,
            title: "t".to_string(),
            body: String::new(),
            created_at: 0,
            change_log: None,
            config_json: "{}".to_string(),
        };
        let mut second = base.clone();
        second.version = 2;
        second.change_log = Some("Added findings.".to_string());
        let mut third = base.clone();
        third.version = 3;
        third.change_log = Some("Fixed citations.".to_string());

        let log = accumulate_change_log(&[base, second, third]);
        assert!(log.starts_with("### Version 2"));
        assert!(log.contains("### Version 3"));
        assert!(log.contains("Fixed citations."));
    }
}
