use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

use drover_core::error::{DroverError, Result};
use drover_core::traits::RecordStore;
use drover_core::types::*;

use crate::db::{conversion_err, parse_opt_ts, parse_ts, ts, Database};

const JOB_COLUMNS: &str = "id, owner, description, status, created_at, completed_at, output, error";

const STEP_COLUMNS: &str = "job_id, step_id, phase_index, phase_name, position, capability,
    input_json, dependencies_json, status, output_json, error, optional, tolerate_failed_deps,
    started_at, completed_at";

const ITEM_COLUMNS: &str = "id, job_id, step_id, capability, input_json, status, retry_count,
    error, result_json, enqueued_at, started_at, completed_at";

/// SQLite-backed record store for jobs, steps and work items.
#[derive(Clone)]
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Open a private in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(Database::in_memory()?))
    }
}

fn json_col<T: serde::de::DeserializeOwned>(idx: usize, s: &str) -> rusqlite::Result<T> {
    serde_json::from_str(s).map_err(|e| conversion_err(idx, e))
}

fn opt_json_col<T: serde::de::DeserializeOwned>(
    idx: usize,
    s: Option<String>,
) -> rusqlite::Result<Option<T>> {
    s.map(|s| json_col(idx, &s)).transpose()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let status: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    Ok(Job {
        id: JobId(row.get(0)?),
        owner: row.get(1)?,
        description: row.get(2)?,
        status: status.parse().map_err(|e| conversion_err(3, e))?,
        created_at: parse_ts(4, &created_at)?,
        completed_at: parse_opt_ts(5, row.get(5)?)?,
        output: row.get(6)?,
        error: row.get(7)?,
    })
}

fn step_from_row(row: &Row<'_>) -> rusqlite::Result<Step> {
    let input: String = row.get(6)?;
    let dependencies: String = row.get(7)?;
    let status: String = row.get(8)?;
    Ok(Step {
        job_id: JobId(row.get(0)?),
        id: row.get(1)?,
        phase_index: row.get::<_, i64>(2)? as usize,
        phase_name: row.get(3)?,
        position: row.get::<_, i64>(4)? as usize,
        capability: row.get(5)?,
        input: json_col(6, &input)?,
        dependencies: json_col(7, &dependencies)?,
        status: status.parse().map_err(|e| conversion_err(8, e))?,
        output: opt_json_col(9, row.get(9)?)?,
        error: row.get(10)?,
        optional: row.get(11)?,
        tolerate_failed_deps: row.get(12)?,
        started_at: parse_opt_ts(13, row.get(13)?)?,
        completed_at: parse_opt_ts(14, row.get(14)?)?,
    })
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<WorkItem> {
    let input: String = row.get(4)?;
    let status: String = row.get(5)?;
    let enqueued_at: String = row.get(9)?;
    Ok(WorkItem {
        id: WorkItemId(row.get(0)?),
        job_id: JobId(row.get(1)?),
        step_id: row.get(2)?,
        capability: row.get(3)?,
        input: json_col(4, &input)?,
        status: status.parse().map_err(|e| conversion_err(5, e))?,
        retry_count: row.get(6)?,
        error: row.get(7)?,
        result: opt_json_col(8, row.get(8)?)?,
        enqueued_at: parse_ts(9, &enqueued_at)?,
        started_at: parse_opt_ts(10, row.get(10)?)?,
        completed_at: parse_opt_ts(11, row.get(11)?)?,
    })
}

impl RecordStore for SqliteStore {
    fn create_job(&self, job: &Job) -> BoxFuture<'_, Result<()>> {
        let job = job.clone();
        Box::pin(async move {
            self.db.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO jobs (id, owner, description, status, created_at, completed_at, output, error)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        job.id.0,
                        job.owner,
                        job.description,
                        job.status.as_str(),
                        ts(&job.created_at),
                        job.completed_at.as_ref().map(ts),
                        job.output,
                        job.error,
                    ],
                )
            })?;
            debug!(job_id = %job.id, "Job created");
            Ok(())
        })
    }

    fn get_job(&self, id: &JobId) -> BoxFuture<'_, Result<Option<Job>>> {
        let id = id.0.clone();
        Box::pin(async move {
            self.db.with_conn(|conn| {
                conn.query_row(
                    &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                    params![id],
                    job_from_row,
                )
                .optional()
            })
        })
    }

    fn list_jobs(&self, limit: usize) -> BoxFuture<'_, Result<Vec<Job>>> {
        Box::pin(async move {
            self.db.with_conn(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM jobs ORDER BY created_at DESC LIMIT ?1",
                    JOB_COLUMNS
                ))?;
                let rows = stmt.query_map(params![limit as i64], job_from_row)?;
                rows.collect()
            })
        })
    }

    fn set_job_status(
        &self,
        id: &JobId,
        status: JobStatus,
        output: Option<String>,
        error: Option<String>,
    ) -> BoxFuture<'_, Result<bool>> {
        let id = id.0.clone();
        Box::pin(async move {
            let completed_at = status.is_terminal().then(|| ts(&Utc::now()));
            let outcome = self.db.with_conn(|conn| {
                let changed = conn.execute(
                    "UPDATE jobs SET
                        status = ?2,
                        output = COALESCE(?3, output),
                        error = COALESCE(?4, error),
                        completed_at = COALESCE(completed_at, ?5)
                     WHERE id = ?1 AND status NOT IN ('completed', 'failed', 'cancelled')",
                    params![id, status.as_str(), output, error, completed_at],
                )?;
                if changed == 1 {
                    return Ok(Some(true));
                }
                // Terminal already: only the output text may still change.
                let touched = match &output {
                    Some(text) => conn.execute(
                        "UPDATE jobs SET output = ?2 WHERE id = ?1",
                        params![id, text],
                    )?,
                    None => conn.query_row(
                        "SELECT COUNT(*) FROM jobs WHERE id = ?1",
                        params![id],
                        |row| row.get::<_, i64>(0),
                    )? as usize,
                };
                Ok((touched > 0).then_some(false))
            })?;
            outcome.ok_or(DroverError::NotFound { kind: "job", id })
        })
    }

    fn save_step(&self, step: &Step) -> BoxFuture<'_, Result<()>> {
        let step = step.clone();
        Box::pin(async move {
            let input = to_json(&step.input)?;
            let dependencies = to_json(&step.dependencies)?;
            let output = step.output.as_ref().map(to_json).transpose()?;
            self.db.with_conn(|conn| {
                // Cancellation wins over late writers.
                conn.execute(
                    &format!(
                        "INSERT INTO steps ({})
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                         ON CONFLICT(job_id, step_id) DO UPDATE SET
                            phase_index = excluded.phase_index,
                            phase_name = excluded.phase_name,
                            position = excluded.position,
                            capability = excluded.capability,
                            input_json = excluded.input_json,
                            dependencies_json = excluded.dependencies_json,
                            status = excluded.status,
                            output_json = excluded.output_json,
                            error = excluded.error,
                            optional = excluded.optional,
                            tolerate_failed_deps = excluded.tolerate_failed_deps,
                            started_at = excluded.started_at,
                            completed_at = excluded.completed_at
                         WHERE steps.status != 'cancelled'",
                        STEP_COLUMNS
                    ),
                    params![
                        step.job_id.0,
                        step.id,
                        step.phase_index as i64,
                        step.phase_name,
                        step.position as i64,
                        step.capability,
                        input,
                        dependencies,
                        step.status.as_str(),
                        output,
                        step.error,
                        step.optional,
                        step.tolerate_failed_deps,
                        step.started_at.as_ref().map(ts),
                        step.completed_at.as_ref().map(ts),
                    ],
                )
            })?;
            Ok(())
        })
    }

    fn get_step(&self, job_id: &JobId, step_id: &str) -> BoxFuture<'_, Result<Option<Step>>> {
        let job_id = job_id.0.clone();
        let step_id = step_id.to_string();
        Box::pin(async move {
            self.db.with_conn(|conn| {
                conn.query_row(
                    &format!(
                        "SELECT {} FROM steps WHERE job_id = ?1 AND step_id = ?2",
                        STEP_COLUMNS
                    ),
                    params![job_id, step_id],
                    step_from_row,
                )
                .optional()
            })
        })
    }

    fn list_steps(&self, job_id: &JobId) -> BoxFuture<'_, Result<Vec<Step>>> {
        let job_id = job_id.0.clone();
        Box::pin(async move {
            self.db.with_conn(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM steps WHERE job_id = ?1 ORDER BY phase_index, position",
                    STEP_COLUMNS
                ))?;
                let rows = stmt.query_map(params![job_id], step_from_row)?;
                rows.collect()
            })
        })
    }

    fn create_work_item(&self, item: &WorkItem) -> BoxFuture<'_, Result<()>> {
        let item = item.clone();
        Box::pin(async move {
            let input = to_json(&item.input)?;
            let result = item.result.as_ref().map(to_json).transpose()?;
            self.db.with_conn(|conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO work_items ({})
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                        ITEM_COLUMNS
                    ),
                    params![
                        item.id.0,
                        item.job_id.0,
                        item.step_id,
                        item.capability,
                        input,
                        item.status.as_str(),
                        item.retry_count,
                        item.error,
                        result,
                        ts(&item.enqueued_at),
                        item.started_at.as_ref().map(ts),
                        item.completed_at.as_ref().map(ts),
                    ],
                )
            })?;
            Ok(())
        })
    }

    fn get_work_item(&self, id: &WorkItemId) -> BoxFuture<'_, Result<Option<WorkItem>>> {
        let id = id.0.clone();
        Box::pin(async move {
            self.db.with_conn(|conn| {
                conn.query_row(
                    &format!("SELECT {} FROM work_items WHERE id = ?1", ITEM_COLUMNS),
                    params![id],
                    item_from_row,
                )
                .optional()
            })
        })
    }

    fn list_work_items(&self, job_id: &JobId) -> BoxFuture<'_, Result<Vec<WorkItem>>> {
        let job_id = job_id.0.clone();
        Box::pin(async move {
            self.db.with_conn(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM work_items WHERE job_id = ?1 ORDER BY enqueued_at, rowid",
                    ITEM_COLUMNS
                ))?;
                let rows = stmt.query_map(params![job_id], item_from_row)?;
                rows.collect()
            })
        })
    }

    fn update_work_item(&self, item: &WorkItem) -> BoxFuture<'_, Result<bool>> {
        let item = item.clone();
        Box::pin(async move {
            let input = to_json(&item.input)?;
            let result = item.result.as_ref().map(to_json).transpose()?;
            let changed = self.db.with_conn(|conn| {
                conn.execute(
                    "UPDATE work_items SET
                        input_json = ?2,
                        status = ?3,
                        retry_count = ?4,
                        error = ?5,
                        result_json = ?6,
                        started_at = ?7,
                        completed_at = ?8
                     WHERE id = ?1 AND status != 'cancelled'",
                    params![
                        item.id.0,
                        input,
                        item.status.as_str(),
                        item.retry_count,
                        item.error,
                        result,
                        item.started_at.as_ref().map(ts),
                        item.completed_at.as_ref().map(ts),
                    ],
                )
            })?;
            Ok(changed == 1)
        })
    }

    fn claim_work_item(&self, id: &WorkItemId) -> BoxFuture<'_, Result<bool>> {
        let id = id.0.clone();
        Box::pin(async move {
            let now = ts(&Utc::now());
            let changed = self.db.with_conn(|conn| {
                conn.execute(
                    "UPDATE work_items SET status = 'processing', started_at = ?2
                     WHERE id = ?1 AND status IN ('queued', 'processing')",
                    params![id, now],
                )
            })?;
            Ok(changed == 1)
        })
    }

    fn latest_completed_sibling(
        &self,
        job_id: &JobId,
        exclude: &WorkItemId,
    ) -> BoxFuture<'_, Result<Option<WorkItem>>> {
        let job_id = job_id.0.clone();
        let exclude = exclude.0.clone();
        Box::pin(async move {
            self.db.with_conn(|conn| {
                conn.query_row(
                    &format!(
                        "SELECT {} FROM work_items
                         WHERE job_id = ?1 AND id != ?2
                           AND status = 'completed' AND result_json IS NOT NULL
                         ORDER BY completed_at DESC, rowid DESC
                         LIMIT 1",
                        ITEM_COLUMNS
                    ),
                    params![job_id, exclude],
                    item_from_row,
                )
                .optional()
            })
        })
    }

    fn cancel_job(&self, id: &JobId) -> BoxFuture<'_, Result<Vec<WorkItemId>>> {
        let id = id.0.clone();
        Box::pin(async move {
            let now = ts(&Utc::now());
            let outcome = self.db.with_conn(|conn| {
                let tx = conn.transaction()?;
                let status: Option<String> = tx
                    .query_row("SELECT status FROM jobs WHERE id = ?1", params![id], |row| {
                        row.get(0)
                    })
                    .optional()?;
                let Some(status) = status else {
                    return Ok(None);
                };
                if matches!(status.as_str(), "completed" | "failed" | "cancelled") {
                    return Ok(Some(vec![]));
                }

                tx.execute(
                    "UPDATE jobs SET status = 'cancelled', completed_at = ?2 WHERE id = ?1",
                    params![id, now],
                )?;
                tx.execute(
                    "UPDATE steps SET status = 'cancelled', completed_at = ?2
                     WHERE job_id = ?1 AND status IN ('pending', 'ready', 'in_progress')",
                    params![id, now],
                )?;

                let cancelled: Vec<String> = {
                    let mut stmt = tx.prepare(
                        "SELECT id FROM work_items
                         WHERE job_id = ?1 AND status IN ('queued', 'processing')",
                    )?;
                    let rows = stmt.query_map(params![id], |row| row.get(0))?;
                    rows.collect::<rusqlite::Result<_>>()?
                };
                tx.execute(
                    "UPDATE work_items SET status = 'cancelled', completed_at = ?2
                     WHERE job_id = ?1 AND status IN ('queued', 'processing')",
                    params![id, now],
                )?;
                tx.commit()?;
                Ok(Some(cancelled.into_iter().map(WorkItemId).collect()))
            })?;

            match outcome {
                Some(items) => {
                    debug!(job_id = %id, items = items.len(), "Job cancelled");
                    Ok(items)
                }
                None => Err(DroverError::NotFound { kind: "job", id }),
            }
        })
    }
}
