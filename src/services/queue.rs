use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;

use crate::{
    error::{AppError, AppResult},
    repository::postgres::map_db_error,
};

const DEFAULT_JOB_MAX_ATTEMPTS: i32 = 5;
/// A `running` job older than this is presumed orphaned by a dead worker.
const JOB_LEASE_SECONDS: i64 = 15 * 60;
const LEASE_EXPIRED_REASON: &str = "Lease expired after the final attempt";

/// Work items for the compliance worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ComplianceJob {
    SendSubmission { submission_id: i64 },
    CheckStatus { submission_id: i64, reference: String },
}

impl ComplianceJob {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SendSubmission { .. } => "send_submission",
            Self::CheckStatus { .. } => "check_status",
        }
    }

    pub fn submission_id(&self) -> i64 {
        match self {
            Self::SendSubmission { submission_id } | Self::CheckStatus { submission_id, .. } => {
                *submission_id
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub id: i64,
    pub job: ComplianceJob,
    /// Deliveries so far, including the current one.
    pub attempts: i32,
    pub max_attempts: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDisposition {
    Requeued { retry_at: DateTime<Utc> },
    Failed,
}

/// Durable at-least-once queue. Handlers must tolerate duplicate delivery.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, job: ComplianceJob, delay: Duration) -> AppResult<i64>;
    /// Claims due `queued` jobs plus `running` jobs whose lease expired.
    async fn claim_due(&self, batch_size: i64) -> AppResult<Vec<QueuedJob>>;
    async fn complete(&self, job: &QueuedJob) -> AppResult<()>;
    /// Requeues with backoff while the job budget lasts, then marks it failed.
    async fn fail(&self, job: &QueuedJob, error: &str) -> AppResult<JobDisposition>;
}

pub fn retry_backoff_seconds(attempts: i32) -> i64 {
    let clamped = attempts.saturating_sub(1).clamp(0, 5) as u32;
    let seconds = 30_i64.saturating_mul(1_i64 << clamped);
    seconds.min(900)
}

fn truncate_reason(reason: &str) -> String {
    reason.chars().take(1_000).collect()
}

#[derive(Clone)]
pub struct PgTaskQueue {
    pool: PgPool,
}

impl PgTaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn enqueue(&self, job: ComplianceJob, delay: Duration) -> AppResult<i64> {
        let payload = serde_json::to_value(&job)
            .map_err(|error| AppError::Internal(format!("Could not encode job: {error}")))?;
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO compliance_jobs (kind, payload, status, run_at, max_attempts)
            VALUES ($1, $2, 'queued', $3, $4)
            RETURNING id
            "#,
        )
        .bind(job.kind())
        .bind(payload)
        .bind(Utc::now() + delay.max(Duration::zero()))
        .bind(DEFAULT_JOB_MAX_ATTEMPTS)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_error)
    }

    async fn claim_due(&self, batch_size: i64) -> AppResult<Vec<QueuedJob>> {
        let abandoned = sqlx::query(
            r#"
            UPDATE compliance_jobs
            SET status = 'failed',
                finished_at = now(),
                last_error = $2,
                updated_at = now()
            WHERE status = 'running'
              AND started_at < now() - ($1::bigint * interval '1 second')
              AND attempts >= max_attempts
            "#,
        )
        .bind(JOB_LEASE_SECONDS)
        .bind(LEASE_EXPIRED_REASON)
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        if abandoned.rows_affected() > 0 {
            tracing::error!(
                jobs = abandoned.rows_affected(),
                "Failed compliance jobs whose lease expired on their final attempt"
            );
        }

        let rows = sqlx::query(
            r#"
            WITH picked AS (
              SELECT id
              FROM compliance_jobs
              WHERE (status = 'queued' AND run_at <= now())
                 OR (status = 'running'
                     AND started_at < now() - ($2::bigint * interval '1 second'))
              ORDER BY run_at ASC, created_at ASC
              FOR UPDATE SKIP LOCKED
              LIMIT $1
            )
            UPDATE compliance_jobs j
            SET status = 'running',
                started_at = now(),
                attempts = j.attempts + 1,
                updated_at = now()
            FROM picked
            WHERE j.id = picked.id
            RETURNING j.id, j.payload, j.attempts, j.max_attempts
            "#,
        )
        .bind(batch_size.clamp(1, 500))
        .bind(JOB_LEASE_SECONDS)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id").map_err(map_db_error)?;
            let payload: Value = row.try_get("payload").map_err(map_db_error)?;
            match serde_json::from_value::<ComplianceJob>(payload) {
                Ok(job) => jobs.push(QueuedJob {
                    id,
                    job,
                    attempts: row.try_get("attempts").map_err(map_db_error)?,
                    max_attempts: row.try_get("max_attempts").map_err(map_db_error)?,
                }),
                Err(error) => {
                    tracing::error!(job_id = id, error = %error, "Dropping undecodable compliance job");
                    self.mark_failed(id, &format!("Undecodable payload: {error}"))
                        .await?;
                }
            }
        }
        Ok(jobs)
    }

    async fn complete(&self, job: &QueuedJob) -> AppResult<()> {
        sqlx::query(
            "UPDATE compliance_jobs SET status = 'succeeded', finished_at = now(), last_error = NULL, updated_at = now() WHERE id = $1",
        )
        .bind(job.id)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(map_db_error)
    }

    async fn fail(&self, job: &QueuedJob, error: &str) -> AppResult<JobDisposition> {
        if job.attempts >= job.max_attempts {
            self.mark_failed(job.id, error).await?;
            return Ok(JobDisposition::Failed);
        }

        let retry_at = Utc::now() + Duration::seconds(retry_backoff_seconds(job.attempts));
        sqlx::query(
            r#"
            UPDATE compliance_jobs
            SET status = 'queued',
                run_at = $2,
                started_at = NULL,
                last_error = $3,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(retry_at)
        .bind(truncate_reason(error))
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(JobDisposition::Requeued { retry_at })
    }
}

impl PgTaskQueue {
    async fn mark_failed(&self, job_id: i64, error: &str) -> AppResult<()> {
        sqlx::query(
            "UPDATE compliance_jobs SET status = 'failed', finished_at = now(), last_error = $2, updated_at = now() WHERE id = $1",
        )
        .bind(job_id)
        .bind(truncate_reason(error))
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(map_db_error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryJobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct MemoryJob {
    pub id: i64,
    pub job: ComplianceJob,
    pub status: MemoryJobStatus,
    pub run_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
}

impl MemoryJob {
    fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == MemoryJobStatus::Running
            && self
                .started_at
                .is_some_and(|started| started < now - Duration::seconds(JOB_LEASE_SECONDS))
    }
}

/// In-process queue with the same contract. Jobs do not survive a restart.
#[derive(Default)]
pub struct MemoryTaskQueue {
    jobs: Mutex<Vec<MemoryJob>>,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn snapshot(&self) -> Vec<MemoryJob> {
        self.jobs.lock().await.clone()
    }

    /// Jobs still waiting to run, in scheduling order.
    #[cfg(test)]
    pub async fn queued(&self) -> Vec<MemoryJob> {
        let mut queued = self
            .jobs
            .lock()
            .await
            .iter()
            .filter(|job| job.status == MemoryJobStatus::Queued)
            .cloned()
            .collect::<Vec<_>>();
        queued.sort_by_key(|job| (job.run_at, job.id));
        queued
    }

    /// Moves every queued job's `run_at` to now, as if the delays elapsed.
    #[cfg(test)]
    pub async fn release_delayed(&self) {
        let now = Utc::now();
        for job in self.jobs.lock().await.iter_mut() {
            if job.status == MemoryJobStatus::Queued && job.run_at > now {
                job.run_at = now;
            }
        }
    }

    /// Backdates every running job past its lease, as if its worker died.
    #[cfg(test)]
    pub async fn expire_leases(&self) {
        let expired = Utc::now() - Duration::seconds(JOB_LEASE_SECONDS + 1);
        for job in self.jobs.lock().await.iter_mut() {
            if job.status == MemoryJobStatus::Running {
                job.started_at = Some(expired);
            }
        }
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, job: ComplianceJob, delay: Duration) -> AppResult<i64> {
        let mut jobs = self.jobs.lock().await;
        let id = jobs.len() as i64 + 1;
        jobs.push(MemoryJob {
            id,
            job,
            status: MemoryJobStatus::Queued,
            run_at: Utc::now() + delay.max(Duration::zero()),
            started_at: None,
            attempts: 0,
            max_attempts: DEFAULT_JOB_MAX_ATTEMPTS,
            last_error: None,
        });
        Ok(id)
    }

    async fn claim_due(&self, batch_size: i64) -> AppResult<Vec<QueuedJob>> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().await;
        for job in jobs.iter_mut() {
            if job.lease_expired(now) && job.attempts >= job.max_attempts {
                job.status = MemoryJobStatus::Failed;
                job.last_error = Some(LEASE_EXPIRED_REASON.to_string());
            }
        }
        let mut due = jobs
            .iter_mut()
            .filter(|job| {
                (job.status == MemoryJobStatus::Queued && job.run_at <= now)
                    || job.lease_expired(now)
            })
            .collect::<Vec<_>>();
        due.sort_by_key(|job| (job.run_at, job.id));

        Ok(due
            .into_iter()
            .take(batch_size.clamp(1, 500) as usize)
            .map(|job| {
                job.status = MemoryJobStatus::Running;
                job.started_at = Some(now);
                job.attempts += 1;
                QueuedJob {
                    id: job.id,
                    job: job.job.clone(),
                    attempts: job.attempts,
                    max_attempts: job.max_attempts,
                }
            })
            .collect())
    }

    async fn complete(&self, job: &QueuedJob) -> AppResult<()> {
        let mut jobs = self.jobs.lock().await;
        if let Some(entry) = jobs.iter_mut().find(|entry| entry.id == job.id) {
            entry.status = MemoryJobStatus::Succeeded;
            entry.last_error = None;
        }
        Ok(())
    }

    async fn fail(&self, job: &QueuedJob, error: &str) -> AppResult<JobDisposition> {
        let mut jobs = self.jobs.lock().await;
        let entry = jobs
            .iter_mut()
            .find(|entry| entry.id == job.id)
            .ok_or_else(|| AppError::NotFound("compliance_jobs record not found.".to_string()))?;
        entry.last_error = Some(truncate_reason(error));
        if entry.attempts >= entry.max_attempts {
            entry.status = MemoryJobStatus::Failed;
            return Ok(JobDisposition::Failed);
        }
        let retry_at = Utc::now() + Duration::seconds(retry_backoff_seconds(entry.attempts));
        entry.status = MemoryJobStatus::Queued;
        entry.started_at = None;
        entry.run_at = retry_at;
        Ok(JobDisposition::Requeued { retry_at })
    }
}
