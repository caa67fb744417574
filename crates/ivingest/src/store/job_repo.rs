//! Job store: the single owner of job state transitions.
//!
//! Workers hold a transient lease and propose transitions through the narrow
//! interface here; nothing else mutates job rows. Terminal states are final.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::blob::BlobRef;
use crate::model::{FileKind, Job, JobError, JobState, ResultSummary};
use crate::queue::backoff::retry_delay;
use crate::store::{parse_ts, ts, Database, StoreError};

/// Submission parameters for a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub tenant: String,
    pub blob: BlobRef,
    pub kind: FileKind,
    pub priority: i32,
    pub max_attempts: u32,
}

/// Result of a `fail` proposal.
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    /// Retryable failure with attempts remaining.
    Requeued { next_attempt_at: DateTime<Utc> },
    /// Retryable failure with attempts exhausted.
    Dead,
    /// Permanent failure.
    Failed,
}

/// Result of a `cancel` request.
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// The job was queued and has been moved straight to failed.
    Cancelled,
    /// The job is active; the owner must signal the worker cooperatively.
    SignalWorker,
}

/// Jobs reclaimed from expired leases.
#[derive(Debug, Default)]
pub struct ReapOutcome {
    /// Jobs returned to the queue.
    pub requeued: Vec<String>,
    /// Jobs that exhausted their attempts while leased; the caller publishes
    /// their terminal failure.
    pub dead: Vec<Job>,
}

/// Listing filter.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub tenant: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Counts by state, for the admin queue view.
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounts {
    pub queued: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
}

pub struct JobStore {
    db: Arc<Database>,
    visibility_timeout: Duration,
}

impl JobStore {
    pub fn new(db: Arc<Database>, visibility_timeout: Duration) -> Self {
        Self {
            db,
            visibility_timeout,
        }
    }

    /// Creates a job in `queued` and returns it.
    pub fn submit(&self, new: NewJob, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO jobs (id, tenant, content_hash, locator, kind, priority, state,
                 progress, attempts, max_attempts, submitted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'queued', 0, 0, ?7, ?8)",
                params![
                    id,
                    new.tenant,
                    new.blob.content_hash,
                    new.blob.locator,
                    new.kind.as_str(),
                    new.priority,
                    new.max_attempts,
                    ts(now),
                ],
            )?;
            Ok(())
        })?;
        self.get(&id)?
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    /// Hands the next due job to a worker, or `None` when the queue is idle.
    ///
    /// Ordering is strictly (priority DESC, next_attempt_at ASC NULLS FIRST,
    /// submitted_at ASC), ties broken by id. Acquisition marks the job
    /// `active`, stamps the lease, and counts the activation as an attempt.
    pub fn acquire(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let now_str = ts(now);
        let lease = ts(now + chrono::Duration::from_std(self.visibility_timeout).unwrap_or_default());

        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;

            let picked: Option<String> = tx
                .query_row(
                    "SELECT id FROM jobs
                     WHERE state = 'queued'
                       AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
                     ORDER BY priority DESC,
                              next_attempt_at ASC NULLS FIRST,
                              submitted_at ASC,
                              id ASC
                     LIMIT 1",
                    params![now_str],
                    |r| r.get(0),
                )
                .optional()?;

            let Some(id) = picked else {
                return Ok(None);
            };

            tx.execute(
                "UPDATE jobs SET state = 'active',
                     attempts = attempts + 1,
                     progress = 0,
                     stage = NULL,
                     worker_id = ?2,
                     first_started_at = COALESCE(first_started_at, ?3),
                     last_started_at = ?3,
                     lease_expires_at = ?4,
                     next_attempt_at = NULL
                 WHERE id = ?1",
                params![id, worker_id, now_str, lease],
            )?;

            let job = query_job(&tx, &id)?;
            tx.commit()?;
            Ok(job)
        })
    }

    /// Reclaims jobs whose lease expired without a heartbeat.
    ///
    /// Expiry alone does not consume an attempt; reclaimed jobs go back to
    /// the queue and the next acquisition counts. A job already on its final
    /// attempt when the lease lapsed is routed to `dead` instead.
    pub fn reap_expired(&self, now: DateTime<Utc>) -> Result<ReapOutcome, StoreError> {
        let now_str = ts(now);
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut outcome = ReapOutcome::default();

            let expired: Vec<(String, u32, u32)> = {
                let mut stmt = tx.prepare(
                    "SELECT id, attempts, max_attempts FROM jobs
                     WHERE state = 'active' AND lease_expires_at <= ?1",
                )?;
                let rows = stmt
                    .query_map(params![now_str], |r| {
                        Ok((r.get(0)?, r.get(1)?, r.get(2)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };

            for (id, attempts, max_attempts) in expired {
                if attempts >= max_attempts {
                    tx.execute(
                        "UPDATE jobs SET state = 'dead', finished_at = ?2,
                             lease_expires_at = NULL, worker_id = NULL,
                             error_code = ?3, error_message = ?4
                         WHERE id = ?1",
                        params![
                            id,
                            now_str,
                            crate::error::code::ATTEMPTS_EXHAUSTED,
                            "lease expired on final attempt",
                        ],
                    )?;
                    if let Some(job) = query_job(&tx, &id)? {
                        outcome.dead.push(job);
                    }
                } else {
                    tx.execute(
                        "UPDATE jobs SET state = 'queued', lease_expires_at = NULL,
                             worker_id = NULL, next_attempt_at = ?2
                         WHERE id = ?1",
                        params![id, now_str],
                    )?;
                    outcome.requeued.push(id);
                }
            }

            tx.commit()?;
            Ok(outcome)
        })
    }

    /// Updates progress and stage while the lease is live; otherwise a no-op
    /// that reports staleness. A live heartbeat also renews the lease.
    ///
    /// Progress is monotonic within an activation and capped at 100.
    pub fn heartbeat(
        &self,
        id: &str,
        progress: u8,
        stage: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let progress = progress.min(100);
        let now_str = ts(now);
        let lease = ts(now + chrono::Duration::from_std(self.visibility_timeout).unwrap_or_default());
        self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE jobs SET progress = MAX(progress, ?2), stage = ?3,
                     lease_expires_at = ?4
                 WHERE id = ?1 AND state = 'active' AND lease_expires_at > ?5",
                params![id, progress, stage, lease, now_str],
            )?;
            Ok(updated == 1)
        })
    }

    /// Finishes a job successfully. Calling this twice is an error and does
    /// not change state.
    pub fn complete(
        &self,
        id: &str,
        result: &ResultSummary,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let job = query_job(&tx, id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))?;

            guard_active(&job, "complete")?;

            tx.execute(
                "UPDATE jobs SET state = 'completed', progress = 100, stage = 'persist',
                     finished_at = ?2, lease_expires_at = NULL, worker_id = NULL,
                     result_json = ?3
                 WHERE id = ?1",
                params![id, ts(now), serde_json::to_string(result)?],
            )?;

            let job = query_job(&tx, id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            tx.commit()?;
            Ok(job)
        })
    }

    /// Records a failed activation.
    ///
    /// Retryable failures go back to the queue with back-off until attempts
    /// are exhausted, then to `dead`. Permanent failures skip the back-off.
    pub fn fail(
        &self,
        id: &str,
        error: &JobError,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let job = query_job(&tx, id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))?;

            guard_active(&job, "fail")?;

            let outcome = if !retryable {
                tx.execute(
                    "UPDATE jobs SET state = 'failed', finished_at = ?2,
                         lease_expires_at = NULL, worker_id = NULL,
                         error_code = ?3, error_message = ?4
                     WHERE id = ?1",
                    params![id, ts(now), error.code, error.message],
                )?;
                FailOutcome::Failed
            } else if job.attempts >= job.max_attempts {
                tx.execute(
                    "UPDATE jobs SET state = 'dead', finished_at = ?2,
                         lease_expires_at = NULL, worker_id = NULL,
                         error_code = ?3, error_message = ?4
                     WHERE id = ?1",
                    params![id, ts(now), error.code, error.message],
                )?;
                FailOutcome::Dead
            } else {
                let next_attempt_at = now + retry_delay(job.attempts);
                tx.execute(
                    "UPDATE jobs SET state = 'queued', lease_expires_at = NULL,
                         worker_id = NULL, next_attempt_at = ?2,
                         error_code = ?3, error_message = ?4
                     WHERE id = ?1",
                    params![id, ts(next_attempt_at), error.code, error.message],
                )?;
                FailOutcome::Requeued { next_attempt_at }
            };

            tx.commit()?;
            Ok(outcome)
        })
    }

    /// Cancels a queued job outright, or reports that the active worker must
    /// be signalled. Terminal jobs cannot be cancelled.
    pub fn cancel(&self, id: &str, now: DateTime<Utc>) -> Result<CancelOutcome, StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let job = query_job(&tx, id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))?;

            match job.state {
                JobState::Queued => {
                    tx.execute(
                        "UPDATE jobs SET state = 'failed', finished_at = ?2,
                             next_attempt_at = NULL,
                             error_code = ?3, error_message = 'cancelled by owner'
                         WHERE id = ?1",
                        params![id, ts(now), crate::error::code::CANCELLED],
                    )?;
                    tx.commit()?;
                    Ok(CancelOutcome::Cancelled)
                }
                JobState::Active => Ok(CancelOutcome::SignalWorker),
                state => Err(StoreError::AlreadyTerminal {
                    id: id.to_string(),
                    state: state.as_str().to_string(),
                }),
            }
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        self.db.with_conn(|conn| query_job(conn, id))
    }

    pub fn list(&self, filter: &JobFilter) -> Result<(Vec<Job>, u64), StoreError> {
        self.db.with_conn(|conn| {
            let mut conditions = Vec::new();
            let mut params_vec: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

            if let Some(state) = filter.state {
                conditions.push(format!("state = ?{}", params_vec.len() + 1));
                params_vec.push(Box::new(state.as_str().to_string()));
            }
            if let Some(ref tenant) = filter.tenant {
                conditions.push(format!("tenant = ?{}", params_vec.len() + 1));
                params_vec.push(Box::new(tenant.clone()));
            }

            let where_clause = if conditions.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", conditions.join(" AND "))
            };

            let count_sql = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
            let params_ref: Vec<&dyn rusqlite::types::ToSql> =
                params_vec.iter().map(|p| p.as_ref()).collect();
            let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

            let limit = filter.limit.unwrap_or(100) as i64;
            let offset = filter.offset.unwrap_or(0) as i64;
            params_vec.push(Box::new(limit));
            params_vec.push(Box::new(offset));
            let query_sql = format!(
                "SELECT * FROM jobs {} ORDER BY submitted_at DESC LIMIT ?{} OFFSET ?{}",
                where_clause,
                params_vec.len() - 1,
                params_vec.len()
            );

            let params_ref: Vec<&dyn rusqlite::types::ToSql> =
                params_vec.iter().map(|p| p.as_ref()).collect();
            let mut stmt = conn.prepare(&query_sql)?;
            let jobs = stmt
                .query_map(params_ref.as_slice(), row_to_job)?
                .collect::<Result<Vec<_>, _>>()?;

            Ok((jobs, total))
        })
    }

    /// Counts by state for the admin queue view.
    pub fn counts(&self) -> Result<QueueCounts, StoreError> {
        self.db.with_conn(|conn| {
            let mut counts = QueueCounts::default();
            let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")?;
            let rows = stmt.query_map([], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, u64>(1)?))
            })?;
            for row in rows {
                let (state, count) = row?;
                match state.as_str() {
                    "queued" => counts.queued = count,
                    "active" => counts.active = count,
                    "completed" => counts.completed = count,
                    "failed" => counts.failed = count,
                    "dead" => counts.dead = count,
                    _ => {}
                }
            }
            Ok(counts)
        })
    }
}

fn guard_active(job: &Job, event: &str) -> Result<(), StoreError> {
    match job.state {
        JobState::Active => Ok(()),
        state if state.is_terminal() => Err(StoreError::AlreadyTerminal {
            id: job.id.clone(),
            state: state.as_str().to_string(),
        }),
        state => Err(StoreError::InvalidTransition {
            id: job.id.clone(),
            from: state.as_str().to_string(),
            event: event.to_string(),
        }),
    }
}

fn query_job(conn: &rusqlite::Connection, id: &str) -> Result<Option<Job>, StoreError> {
    let mut stmt = conn.prepare("SELECT * FROM jobs WHERE id = ?1")?;
    let job = stmt.query_row(params![id], row_to_job).optional()?;
    Ok(job)
}

fn row_to_job(row: &Row<'_>) -> Result<Job, rusqlite::Error> {
    let state_str: String = row.get("state")?;
    let kind_str: String = row.get("kind")?;
    let result_json: Option<String> = row.get("result_json")?;
    let error_code: Option<String> = row.get("error_code")?;
    let error_message: Option<String> = row.get("error_message")?;

    let get_ts = |name: &str| -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
        let raw: Option<String> = row.get(name)?;
        Ok(raw.as_deref().and_then(parse_ts))
    };

    Ok(Job {
        id: row.get("id")?,
        tenant: row.get("tenant")?,
        blob: BlobRef {
            content_hash: row.get("content_hash")?,
            locator: row.get("locator")?,
        },
        kind: FileKind::parse(&kind_str).unwrap_or(FileKind::Pdf),
        priority: row.get("priority")?,
        state: JobState::parse(&state_str).unwrap_or(JobState::Queued),
        progress: row.get::<_, u32>("progress")? as u8,
        stage: row.get("stage")?,
        attempts: row.get("attempts")?,
        max_attempts: row.get("max_attempts")?,
        submitted_at: get_ts("submitted_at")?.unwrap_or_else(Utc::now),
        first_started_at: get_ts("first_started_at")?,
        last_started_at: get_ts("last_started_at")?,
        finished_at: get_ts("finished_at")?,
        next_attempt_at: get_ts("next_attempt_at")?,
        lease_expires_at: get_ts("lease_expires_at")?,
        result: result_json.and_then(|json| serde_json::from_str(&json).ok()),
        error: match (error_code, error_message) {
            (Some(code), message) => Some(JobError {
                code,
                message: message.unwrap_or_default(),
            }),
            _ => None,
        },
    })
}
