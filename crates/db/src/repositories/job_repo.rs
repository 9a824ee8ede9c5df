//! Repository for the `jobs` table.
//!
//! Every status change is a single conditional `UPDATE ... WHERE status_id =
//! <expected>`, so a row can only move forward through the state machine.
//! Methods return `true` when the row was actually changed.

use std::path::Path;

use atelier_core::failure::FailureReason;
use atelier_core::job_class::JobClass;
use atelier_core::job_status::JobStatus;
use atelier_core::progress::JobProgress;
use atelier_core::types::DbId;
use sqlx::PgPool;

use crate::models::job::{Job, NewJob};

/// Column list for `jobs` queries.
const COLUMNS: &str = "\
    id, job_class, status_id, parameters, \
    progress_percent, progress_step, progress_total, progress_message, \
    error_kind, error_message, hook_error, log_path, result_ref, \
    cancel_requested_at, created_at, started_at, completed_at, updated_at";

/// Provides queue and lifecycle operations for orchestrated jobs.
pub struct JobRepo;

impl JobRepo {
    /// Insert a new queued job.
    pub async fn insert(pool: &PgPool, input: &NewJob) -> Result<Job, sqlx::Error> {
        let query = format!(
            "INSERT INTO jobs (job_class, status_id, parameters) \
             VALUES ($1, $2, $3) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(input.job_class.as_str())
            .bind(JobStatus::Queued.id())
            .bind(&input.parameters)
            .fetch_one(pool)
            .await
    }

    /// Find a job by its ID.
    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<Job>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1");
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// 0-based count of earlier still-queued jobs of the same class.
    ///
    /// `None` when the job does not exist or is no longer queued.
    pub async fn queue_position(pool: &PgPool, id: DbId) -> Result<Option<i64>, sqlx::Error> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT ( \
                 SELECT COUNT(*) FROM jobs q \
                 WHERE q.job_class = j.job_class AND q.status_id = $2 AND q.id < j.id \
             ) \
             FROM jobs j \
             WHERE j.id = $1 AND j.status_id = $2",
        )
        .bind(id)
        .bind(JobStatus::Queued.id())
        .fetch_optional(pool)
        .await?;
        Ok(row.map(|(position,)| position))
    }

    /// Atomically claim the oldest queued job of a class.
    ///
    /// Only claims while fewer than `max_running` jobs of the class are
    /// running. Uses `FOR UPDATE SKIP LOCKED` so concurrent dispatchers
    /// never claim the same row. `log_path` becomes
    /// `<log_dir>/<class>/<id>.log`.
    pub async fn claim_next(
        pool: &PgPool,
        class: JobClass,
        max_running: i64,
        log_dir: &Path,
    ) -> Result<Option<Job>, sqlx::Error> {
        let log_dir = log_dir.to_string_lossy();
        let query = format!(
            "UPDATE jobs \
             SET status_id = $2, started_at = NOW(), \
                 log_path = $4 || '/' || job_class || '/' || id::text || '.log' \
             WHERE id = ( \
                 SELECT id FROM jobs \
                 WHERE job_class = $1 AND status_id = $3 \
                   AND (SELECT COUNT(*) FROM jobs r \
                        WHERE r.job_class = $1 AND r.status_id = $2) < $5 \
                 ORDER BY id ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(class.as_str())
            .bind(JobStatus::Running.id())
            .bind(JobStatus::Queued.id())
            .bind(log_dir.trim_end_matches('/'))
            .bind(max_running)
            .fetch_optional(pool)
            .await
    }

    /// Persist a progress snapshot. Ignored unless the job is running.
    pub async fn update_progress(
        pool: &PgPool,
        id: DbId,
        progress: &JobProgress,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs \
             SET progress_percent = $3, progress_step = $4, \
                 progress_total = $5, progress_message = $6 \
             WHERE id = $1 AND status_id = $2",
        )
        .bind(id)
        .bind(JobStatus::Running.id())
        .bind(progress.percent)
        .bind(progress.step.and_then(|s| i64::try_from(s).ok()))
        .bind(progress.total_steps.and_then(|t| i64::try_from(t).ok()))
        .bind(progress.message.as_deref())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Move a running job to `completed` with its artifact reference.
    pub async fn complete(pool: &PgPool, id: DbId, result_ref: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs \
             SET status_id = $3, result_ref = $4, completed_at = NOW(), \
                 progress_percent = 100 \
             WHERE id = $1 AND status_id = $2",
        )
        .bind(id)
        .bind(JobStatus::Running.id())
        .bind(JobStatus::Completed.id())
        .bind(result_ref)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Move a running job to `failed`, or `cancelled` for a cancel reason.
    pub async fn record_failure(
        pool: &PgPool,
        id: DbId,
        reason: &FailureReason,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs \
             SET status_id = $3, error_kind = $4, error_message = $5, completed_at = NOW() \
             WHERE id = $1 AND status_id = $2",
        )
        .bind(id)
        .bind(JobStatus::Running.id())
        .bind(reason.terminal_status().id())
        .bind(reason.kind())
        .bind(reason.to_string())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Cancel a job that has not started yet.
    pub async fn cancel_queued(pool: &PgPool, id: DbId) -> Result<bool, sqlx::Error> {
        let reason = FailureReason::Cancelled;
        let result = sqlx::query(
            "UPDATE jobs \
             SET status_id = $3, error_kind = $4, error_message = $5, completed_at = NOW() \
             WHERE id = $1 AND status_id = $2",
        )
        .bind(id)
        .bind(JobStatus::Queued.id())
        .bind(JobStatus::Cancelled.id())
        .bind(reason.kind())
        .bind(reason.to_string())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Flag a running job for cancellation by whichever process supervises it.
    pub async fn request_cancel(pool: &PgPool, id: DbId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs \
             SET cancel_requested_at = COALESCE(cancel_requested_at, NOW()) \
             WHERE id = $1 AND status_id = $2",
        )
        .bind(id)
        .bind(JobStatus::Running.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Whether a cancel was requested for this job.
    pub async fn cancel_requested(pool: &PgPool, id: DbId) -> Result<bool, sqlx::Error> {
        let row: Option<(bool,)> =
            sqlx::query_as("SELECT cancel_requested_at IS NOT NULL FROM jobs WHERE id = $1")
                .bind(id)
                .fetch_optional(pool)
                .await?;
        Ok(row.is_some_and(|(requested,)| requested))
    }

    /// Append a hook failure message. Never touches `status_id`.
    pub async fn record_hook_error(pool: &PgPool, id: DbId, message: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE jobs \
             SET hook_error = CASE WHEN hook_error IS NULL THEN $2 \
                                   ELSE hook_error || E'\\n' || $2 END \
             WHERE id = $1",
        )
        .bind(id)
        .bind(message)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Fail every running job as orphaned and return the affected rows.
    ///
    /// Called once at startup, before any dispatcher runs, so every running
    /// row belongs to a supervisor that no longer exists.
    pub async fn fail_orphaned(pool: &PgPool) -> Result<Vec<Job>, sqlx::Error> {
        let reason = FailureReason::OrphanedByRestart;
        let query = format!(
            "UPDATE jobs \
             SET status_id = $2, error_kind = $3, error_message = $4, completed_at = NOW() \
             WHERE status_id = $1 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(JobStatus::Running.id())
            .bind(JobStatus::Failed.id())
            .bind(reason.kind())
            .bind(reason.to_string())
            .fetch_all(pool)
            .await
    }
}
