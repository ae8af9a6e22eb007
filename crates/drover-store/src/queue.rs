use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use drover_core::config::QueueConfig;
use drover_core::error::Result;
use drover_core::output::CapabilityOutput;
use drover_core::traits::WorkQueue;
use drover_core::types::{DeadLetter, WorkItemId};

use crate::db::{conversion_err, now_millis, parse_ts, ts, Database};

const LANE_NORMAL: &str = "normal";
const LANE_PRIORITY: &str = "priority";

/// Items waiting in each lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LaneSizes {
    pub normal: usize,
    pub priority: usize,
}

/// Durable two-lane work queue on SQLite.
///
/// The normal lane is FIFO. The priority lane holds retries and is served
/// first, highest priority then most recent (LIFO at head). Pops happen in a
/// `BEGIN IMMEDIATE` transaction so no two callers, in this process or
/// another one sharing the file, ever receive the same item.
pub struct SqliteQueue {
    db: Database,
    config: QueueConfig,
    notify: Notify,
}

impl SqliteQueue {
    pub fn new(db: Database, config: QueueConfig) -> Self {
        Self {
            db,
            config,
            notify: Notify::new(),
        }
    }

    /// Open a private in-memory queue with default settings (for testing).
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(Database::in_memory()?, QueueConfig::default()))
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    fn try_pop(&self) -> Result<Option<WorkItemId>> {
        let now = now_millis();
        self.db.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut head: Option<(i64, String)> = tx
                .query_row(
                    "SELECT seq, item_id FROM queue_entries WHERE lane = ?1
                     ORDER BY priority DESC, seq DESC LIMIT 1",
                    params![LANE_PRIORITY],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            if head.is_none() {
                head = tx
                    .query_row(
                        "SELECT seq, item_id FROM queue_entries WHERE lane = ?1
                         ORDER BY seq ASC LIMIT 1",
                        params![LANE_NORMAL],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
            }
            let Some((seq, item_id)) = head else {
                return Ok(None);
            };

            tx.execute("DELETE FROM queue_entries WHERE seq = ?1", params![seq])?;
            // Tracked as in flight from the moment it leaves the queue so a
            // crash before mark_processing is still recoverable.
            tx.execute(
                "INSERT OR REPLACE INTO processing (item_id, claimed_at) VALUES (?1, ?2)",
                params![item_id, now],
            )?;
            tx.commit()?;
            Ok(Some(WorkItemId(item_id)))
        })
    }

    fn push(&self, item: &WorkItemId, priority: u32) -> Result<()> {
        let lane = if priority > 0 { LANE_PRIORITY } else { LANE_NORMAL };
        let now = now_millis();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO queue_entries (item_id, lane, priority, enqueued_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![item.0, lane, priority, now],
            )
        })?;
        self.notify.notify_one();
        Ok(())
    }

    /// Items waiting in each lane.
    pub async fn lane_sizes(&self) -> Result<LaneSizes> {
        self.db.with_conn(|conn| {
            let count = |lane: &str| -> rusqlite::Result<usize> {
                conn.query_row(
                    "SELECT COUNT(*) FROM queue_entries WHERE lane = ?1",
                    params![lane],
                    |row| row.get::<_, i64>(0),
                )
                .map(|n| n as usize)
            };
            Ok(LaneSizes {
                normal: count(LANE_NORMAL)?,
                priority: count(LANE_PRIORITY)?,
            })
        })
    }

    /// Number of items currently claimed by workers.
    pub async fn processing_count(&self) -> Result<usize> {
        self.db.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM processing", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n as usize)
        })
    }
}

impl WorkQueue for SqliteQueue {
    fn enqueue(&self, item: &WorkItemId, priority: u32) -> BoxFuture<'_, Result<()>> {
        let item = item.clone();
        Box::pin(async move {
            self.push(&item, priority)?;
            debug!(item_id = %item, priority, "Enqueued");
            Ok(())
        })
    }

    fn dequeue(&self, timeout: Duration) -> BoxFuture<'_, Result<Option<WorkItemId>>> {
        Box::pin(async move {
            let deadline = Instant::now() + timeout;
            let poll = Duration::from_millis(self.config.poll_interval_ms);
            loop {
                if let Some(item) = self.try_pop()? {
                    return Ok(Some(item));
                }
                let now = Instant::now();
                if now >= deadline {
                    return Ok(None);
                }
                // Woken by a local enqueue, or by the poll tick for other processes.
                let wait = (deadline - now).min(poll);
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        })
    }

    fn mark_processing(&self, item: &WorkItemId) -> BoxFuture<'_, Result<()>> {
        let item = item.0.clone();
        Box::pin(async move {
            let now = now_millis();
            self.db.with_conn(|conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO processing (item_id, claimed_at) VALUES (?1, ?2)",
                    params![item, now],
                )
            })?;
            Ok(())
        })
    }

    fn mark_complete(
        &self,
        item: &WorkItemId,
        result: &CapabilityOutput,
    ) -> BoxFuture<'_, Result<()>> {
        let item = item.0.clone();
        let result = serde_json::to_string(result);
        Box::pin(async move {
            let result = result?;
            let now = now_millis();
            let expires_at = now.saturating_add(secs_to_millis(self.config.result_ttl_secs));
            self.db.with_conn(|conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                tx.execute("DELETE FROM processing WHERE item_id = ?1", params![item])?;
                tx.execute("DELETE FROM retry_counts WHERE item_id = ?1", params![item])?;
                tx.execute("DELETE FROM results WHERE expires_at <= ?1", params![now])?;
                tx.execute(
                    "INSERT OR REPLACE INTO results (item_id, result_json, expires_at)
                     VALUES (?1, ?2, ?3)",
                    params![item, result, expires_at],
                )?;
                tx.commit()
            })?;
            Ok(())
        })
    }

    fn mark_failed(&self, item: &WorkItemId, error: &str) -> BoxFuture<'_, Result<bool>> {
        let item = item.clone();
        let error = error.to_string();
        Box::pin(async move {
            let max_retries = self.config.max_retries;
            let cap = self.config.dead_letter_cap as i64;
            let now = now_millis();
            let failed_at = ts(&Utc::now());
            let (retried, retries) = self.db.with_conn(|conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                tx.execute("DELETE FROM processing WHERE item_id = ?1", params![item.0])?;
                tx.execute(
                    "INSERT INTO retry_counts (item_id, retries) VALUES (?1, 1)
                     ON CONFLICT(item_id) DO UPDATE SET retries = retries + 1",
                    params![item.0],
                )?;
                let retries: u32 = tx.query_row(
                    "SELECT retries FROM retry_counts WHERE item_id = ?1",
                    params![item.0],
                    |row| row.get(0),
                )?;

                let retried = retries <= max_retries;
                if retried {
                    // Later retries jump further ahead.
                    tx.execute(
                        "INSERT OR REPLACE INTO queue_entries (item_id, lane, priority, enqueued_at)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![item.0, LANE_PRIORITY, retries, now],
                    )?;
                } else {
                    tx.execute("DELETE FROM queue_entries WHERE item_id = ?1", params![item.0])?;
                    tx.execute("DELETE FROM retry_counts WHERE item_id = ?1", params![item.0])?;
                    tx.execute(
                        "INSERT INTO dead_letters (item_id, error, retries, failed_at)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![item.0, error, retries, failed_at],
                    )?;
                    tx.execute(
                        "DELETE FROM dead_letters WHERE seq NOT IN
                            (SELECT seq FROM dead_letters ORDER BY seq DESC LIMIT ?1)",
                        params![cap],
                    )?;
                }
                tx.commit()?;
                Ok((retried, retries))
            })?;

            if retried {
                self.notify.notify_one();
                debug!(item_id = %item, retries, "Re-enqueued on priority lane");
            } else {
                warn!(item_id = %item, retries, error = %error, "Moved to dead-letter list");
            }
            Ok(retried)
        })
    }

    fn remove(&self, item: &WorkItemId) -> BoxFuture<'_, Result<()>> {
        let item = item.0.clone();
        Box::pin(async move {
            self.db.with_conn(|conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                tx.execute("DELETE FROM queue_entries WHERE item_id = ?1", params![item])?;
                tx.execute("DELETE FROM processing WHERE item_id = ?1", params![item])?;
                tx.execute("DELETE FROM retry_counts WHERE item_id = ?1", params![item])?;
                tx.commit()
            })
        })
    }

    fn size(&self) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            self.db.with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM queue_entries", [], |row| {
                    row.get::<_, i64>(0)
                })
                .map(|n| n as usize)
            })
        })
    }

    fn dead_letter_count(&self) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            self.db.with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM dead_letters", [], |row| {
                    row.get::<_, i64>(0)
                })
                .map(|n| n as usize)
            })
        })
    }

    fn dead_letters(&self, limit: usize) -> BoxFuture<'_, Result<Vec<DeadLetter>>> {
        Box::pin(async move {
            self.db.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT item_id, error, retries, failed_at FROM dead_letters
                     ORDER BY seq DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit as i64], |row| {
                    let failed_at: String = row.get(3)?;
                    Ok(DeadLetter {
                        item_id: WorkItemId(row.get(0)?),
                        error: row.get(1)?,
                        retries: row.get(2)?,
                        failed_at: parse_ts(3, &failed_at)?,
                    })
                })?;
                rows.collect()
            })
        })
    }

    fn retry_count(&self, item: &WorkItemId) -> BoxFuture<'_, Result<u32>> {
        let item = item.0.clone();
        Box::pin(async move {
            self.db.with_conn(|conn| {
                conn.query_row(
                    "SELECT retries FROM retry_counts WHERE item_id = ?1",
                    params![item],
                    |row| row.get::<_, u32>(0),
                )
                .optional()
                .map(|n| n.unwrap_or(0))
            })
        })
    }

    fn result(&self, item: &WorkItemId) -> BoxFuture<'_, Result<Option<CapabilityOutput>>> {
        let item = item.0.clone();
        Box::pin(async move {
            let now = now_millis();
            self.db.with_conn(|conn| {
                let json: Option<String> = conn
                    .query_row(
                        "SELECT result_json FROM results WHERE item_id = ?1 AND expires_at > ?2",
                        params![item, now],
                        |row| row.get(0),
                    )
                    .optional()?;
                json.map(|s| serde_json::from_str(&s).map_err(|e| conversion_err(0, e)))
                    .transpose()
            })
        })
    }

    fn requeue_stale(&self, older_than: Duration) -> BoxFuture<'_, Result<Vec<WorkItemId>>> {
        Box::pin(async move {
            let now = now_millis();
            let cutoff =
                now.saturating_sub(i64::try_from(older_than.as_millis()).unwrap_or(i64::MAX));
            let stale: Vec<String> = self.db.with_conn(|conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let stale: Vec<String> = {
                    let mut stmt =
                        tx.prepare("SELECT item_id FROM processing WHERE claimed_at < ?1")?;
                    let rows = stmt.query_map(params![cutoff], |row| row.get(0))?;
                    rows.collect::<rusqlite::Result<_>>()?
                };
                for item in &stale {
                    tx.execute("DELETE FROM processing WHERE item_id = ?1", params![item])?;
                    tx.execute(
                        "INSERT OR IGNORE INTO queue_entries (item_id, lane, priority, enqueued_at)
                         VALUES (?1, ?2, 1, ?3)",
                        params![item, LANE_PRIORITY, now],
                    )?;
                }
                tx.commit()?;
                Ok(stale)
            })?;

            if !stale.is_empty() {
                warn!(count = stale.len(), "Re-enqueued stale work items");
                self.notify.notify_one();
            }
            Ok(stale.into_iter().map(WorkItemId).collect())
        })
    }
}

fn secs_to_millis(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX).saturating_mul(1000)
}
