//! The job record store seen by the orchestrator.
//!
//! [`JobStore`] is the seam between the worker crate and persistence.
//! [`PgJobStore`] backs it with Postgres through [`JobRepo`](crate::JobRepo);
//! [`MemoryJobStore`] keeps everything in process for tests and embedding.

use std::path::Path;

use async_trait::async_trait;
use atelier_core::error::CoreError;
use atelier_core::failure::FailureReason;
use atelier_core::job_class::JobClass;
use atelier_core::progress::JobProgress;
use atelier_core::types::DbId;

use crate::models::job::{Job, NewJob};

pub mod memory;
pub mod pg;

pub use memory::MemoryJobStore;
pub use pg::PgJobStore;

/// Errors raised by a [`JobStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(e) => match e {
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => true,
                // serialization_failure, deadlock_detected
                sqlx::Error::Database(db) => {
                    matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
                }
                _ => false,
            },
            Self::Core(_) => false,
            Self::Unavailable(_) => true,
        }
    }
}

/// Durable job records.
///
/// Every mutating method is one atomic conditional update keyed by job id
/// and returns `true` only when the row actually changed.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Insert a new job in `queued`.
    async fn insert(&self, job: &NewJob) -> Result<Job, StoreError>;

    async fn find_by_id(&self, id: DbId) -> Result<Option<Job>, StoreError>;

    /// 0-based position among queued jobs of the same class, `None` unless queued.
    async fn queue_position(&self, id: DbId) -> Result<Option<i64>, StoreError>;

    /// Claim the oldest queued job of `class` if fewer than `max_running`
    /// of that class are running. Sets `started_at` and `log_path`.
    async fn claim_next(
        &self,
        class: JobClass,
        max_running: i64,
        log_dir: &Path,
    ) -> Result<Option<Job>, StoreError>;

    /// Persist progress. No-op unless running.
    async fn update_progress(&self, id: DbId, progress: &JobProgress) -> Result<bool, StoreError>;

    /// `running -> completed`.
    async fn complete(&self, id: DbId, result_ref: &str) -> Result<bool, StoreError>;

    /// `running -> failed`, or `running -> cancelled` for
    /// [`FailureReason::Cancelled`].
    async fn record_failure(&self, id: DbId, reason: &FailureReason) -> Result<bool, StoreError>;

    /// `queued -> cancelled`.
    async fn cancel_queued(&self, id: DbId) -> Result<bool, StoreError>;

    /// Mark a running job as cancel-requested.
    async fn request_cancel(&self, id: DbId) -> Result<bool, StoreError>;

    async fn cancel_requested(&self, id: DbId) -> Result<bool, StoreError>;

    async fn record_hook_error(&self, id: DbId, message: &str) -> Result<(), StoreError>;

    /// Fail every running job as orphaned by restart, returning them.
    async fn fail_orphaned(&self) -> Result<Vec<Job>, StoreError>;
}
