//! Batch report jobs.
//!
//! A batch is a row in `jobs` whose payload lists the drug names and whose
//! result accumulates one entry per drug as the briefing runs through them.

use std::collections::HashSet;
use std::sync::Arc;

use r2d2_sqlite::rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::briefing::Briefing;
use crate::db::{with_conn, DbPool};
use crate::errors::GenieError;
use crate::logging::log_event;

pub const BATCH_JOB_KIND: &str = "reports.batch";
const DRUG_COLUMN: &str = "drug_name";

pub fn enqueue_job(conn: &Connection, kind: &str, payload: serde_json::Value) -> rusqlite::Result<String> {
    let id = Uuid::new_v4().to_string();
    let now = OffsetDateTime::now_utc().unix_timestamp();
    conn.execute(
        "INSERT INTO jobs (id, kind, state, payload, created_at, updated_at) VALUES (?1, ?2, 'queued', ?3, ?4, ?5)",
        (id.as_str(), kind, payload.to_string(), now, now),
    )?;
    Ok(id)
}

fn update_job(
    conn: &Connection,
    id: &str,
    state: &str,
    result: Option<&serde_json::Value>,
) -> rusqlite::Result<()> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    conn.execute(
        "UPDATE jobs SET state = ?2, result = COALESCE(?3, result), updated_at = ?4 WHERE id = ?1",
        params![id, state, result.map(|r| r.to_string()), now],
    )?;
    Ok(())
}

/// Mark batches left `queued` or `running` by a previous process as failed.
/// Their runner task died with that process, so nothing else would finish them.
pub fn fail_interrupted_jobs(conn: &Connection) -> rusqlite::Result<usize> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let count = conn.execute(
        "UPDATE jobs SET state = 'failed', updated_at = ?2
         WHERE kind = ?1 AND state IN ('queued', 'running')",
        params![BATCH_JOB_KIND, now],
    )?;
    if count > 0 {
        log_event(
            conn,
            "warn",
            Some("JOB-0501"),
            "workers.batch",
            "Interrupted batches marked as failed",
            Some("The process stopped before these batches finished; submit them again"),
            Some(json!({ "count": count })),
        )?;
    }
    Ok(count)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchEntry {
    pub drug_name: String,
    pub status: String,
    pub report_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BatchStatus {
    pub id: String,
    pub state: String,
    pub drugs: Vec<String>,
    pub entries: Vec<BatchEntry>,
    pub created_at: i64,
    pub updated_at: i64,
}

pub struct BatchRunner {
    pool: DbPool,
    briefing: Arc<Briefing>,
}

impl BatchRunner {
    pub fn new(pool: DbPool, briefing: Arc<Briefing>) -> Arc<Self> {
        Arc::new(Self { pool, briefing })
    }

    /// Queue a batch and process it in the background.
    pub async fn submit(self: &Arc<Self>, names: Vec<String>) -> Result<BatchStatus, GenieError> {
        let queued = self.enqueue(names).await?;
        let runner = Arc::clone(self);
        let job_id = queued.id.clone();
        tokio::spawn(async move {
            if let Err(err) = runner.run(&job_id).await {
                log::error!("batch {job_id} aborted: {err}");
            }
        });
        Ok(queued)
    }

    /// Validate and store a batch without running it.
    pub async fn enqueue(&self, names: Vec<String>) -> Result<BatchStatus, GenieError> {
        let drugs = dedupe(names);
        if drugs.is_empty() {
            return Err(GenieError::InvalidRequest("batch contains no drug names".into()));
        }
        let payload = json!({ "drugs": drugs });
        let id = with_conn(&self.pool, move |conn| Ok(enqueue_job(conn, BATCH_JOB_KIND, payload)?)).await?;
        log::info!("queued batch {id}");
        self.status(&id).await
    }

    /// Process every drug of a queued batch, one at a time. A storage error
    /// part way through leaves the job `failed` rather than `running`.
    pub async fn run(&self, job_id: &str) -> Result<BatchStatus, GenieError> {
        match self.process(job_id).await {
            Err(err) if !matches!(err, GenieError::NotFound(_)) => {
                self.abort(job_id, &err).await;
                Err(err)
            }
            outcome => outcome,
        }
    }

    async fn abort(&self, job_id: &str, err: &GenieError) {
        let id = job_id.to_string();
        let data = json!({ "job_id": job_id, "error": err.to_string() });
        let marked = with_conn(&self.pool, move |conn| {
            update_job(conn, &id, "failed", None)?;
            log_event(
                conn,
                "error",
                Some("JOB-0500"),
                "workers.batch",
                "Batch aborted",
                Some("Progress could not be stored; entries recorded so far are kept"),
                Some(data),
            )?;
            Ok(())
        })
        .await;
        if let Err(mark_err) = marked {
            log::error!("batch {job_id} could not be marked failed: {mark_err}");
        }
    }

    async fn process(&self, job_id: &str) -> Result<BatchStatus, GenieError> {
        let status = self.status(job_id).await?;
        let id = status.id.clone();
        {
            let id = id.clone();
            with_conn(&self.pool, move |conn| Ok(update_job(conn, &id, "running", None)?)).await?;
        }

        let mut entries = Vec::with_capacity(status.drugs.len());
        for drug in &status.drugs {
            let entry = match self.briefing.generate(drug, None).await {
                Ok(report) => BatchEntry {
                    drug_name: drug.clone(),
                    status: "completed".into(),
                    report_id: Some(report.id),
                    error: None,
                },
                Err(err) => {
                    log::warn!("batch {id}: {drug} failed: {err}");
                    BatchEntry {
                        drug_name: drug.clone(),
                        status: "failed".into(),
                        report_id: None,
                        error: Some(err.to_string()),
                    }
                }
            };
            entries.push(entry);
            let progress = json!({ "entries": entries });
            let id = id.clone();
            with_conn(&self.pool, move |conn| {
                Ok(update_job(conn, &id, "running", Some(&progress))?)
            })
            .await?;
        }

        let failed = entries.iter().filter(|e| e.status == "failed").count();
        let state = if failed == entries.len() { "failed" } else { "completed" };
        let (code, level, message) = if state == "completed" {
            ("JOB-0000", "info", "Batch completed")
        } else {
            ("JOB-0500", "error", "Batch failed for every drug")
        };
        let result = json!({ "entries": entries });
        let data = json!({ "job_id": id, "total": entries.len(), "failed": failed });
        {
            let id = id.clone();
            with_conn(&self.pool, move |conn| {
                update_job(conn, &id, state, Some(&result))?;
                log_event(conn, level, Some(code), "workers.batch", message, None, Some(data))?;
                Ok(())
            })
            .await?;
        }
        self.status(&id).await
    }

    pub async fn status(&self, job_id: &str) -> Result<BatchStatus, GenieError> {
        let id = job_id.to_string();
        let row = with_conn(&self.pool, move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, state, payload, result, created_at, updated_at FROM jobs
                     WHERE id = ?1 AND kind = ?2",
                    params![id, BATCH_JOB_KIND],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, i64>(4)?,
                            row.get::<_, i64>(5)?,
                        ))
                    },
                )
                .optional()?)
        })
        .await?;
        let (id, state, payload, result, created_at, updated_at) =
            row.ok_or_else(|| GenieError::NotFound(format!("Batch '{job_id}'")))?;

        #[derive(Deserialize)]
        struct Payload {
            drugs: Vec<String>,
        }
        #[derive(Deserialize, Default)]
        struct Progress {
            entries: Vec<BatchEntry>,
        }
        let payload: Payload = serde_json::from_str(&payload)
            .map_err(|err| GenieError::db(format!("batch payload is unreadable: {err}")))?;
        let progress: Progress = result
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();

        Ok(BatchStatus {
            id,
            state,
            drugs: payload.drugs,
            entries: progress.entries,
            created_at,
            updated_at,
        })
    }
}

fn dedupe(names: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .into_iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .filter(|n| seen.insert(n.to_lowercase()))
        .collect()
}

/// Drug names from an uploaded list: one name per line, or CSV whose
/// header carries a `drug_name` column.
pub fn parse_drug_list(text: &str) -> Result<Vec<String>, GenieError> {
    let mut lines = text
        .lines()
        .map(|l| l.trim_start_matches('\u{feff}').trim())
        .filter(|l| !l.is_empty());
    let Some(first) = lines.next() else {
        return Err(GenieError::InvalidRequest("drug list is empty".into()));
    };

    let header: Vec<String> = split_row(first).map(|c| c.to_lowercase()).collect();
    let column = header.iter().position(|c| c == DRUG_COLUMN);
    let names: Vec<String> = match (column, header.len()) {
        (Some(idx), _) => lines
            .filter_map(|line| split_row(line).nth(idx))
            .collect(),
        (None, 1) => std::iter::once(first.to_string())
            .chain(lines.map(str::to_string))
            .map(|l| unquote(&l))
            .collect(),
        (None, _) => {
            return Err(GenieError::InvalidRequest(format!(
                "CSV input must contain a '{DRUG_COLUMN}' column"
            )))
        }
    };

    let names = dedupe(names);
    if names.is_empty() {
        return Err(GenieError::InvalidRequest("drug list contains no names".into()));
    }
    Ok(names)
}

fn split_row(line: &str) -> impl Iterator<Item = String> + '_ {
    line.split(',').map(unquote)
}

fn unquote(cell: &str) -> String {
    cell.trim().trim_matches('"').trim().to_string()
}
