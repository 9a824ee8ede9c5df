use std::path::Path;

use async_trait::async_trait;
use atelier_core::failure::FailureReason;
use atelier_core::job_class::JobClass;
use atelier_core::progress::JobProgress;
use atelier_core::types::DbId;
use sqlx::PgPool;

use super::{JobStore, StoreError};
use crate::models::job::{Job, NewJob};
use crate::repositories::JobRepo;

/// [`JobStore`] over a Postgres pool.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: &NewJob) -> Result<Job, StoreError> {
        Ok(JobRepo::insert(&self.pool, job).await?)
    }

    async fn find_by_id(&self, id: DbId) -> Result<Option<Job>, StoreError> {
        Ok(JobRepo::find_by_id(&self.pool, id).await?)
    }

    async fn queue_position(&self, id: DbId) -> Result<Option<i64>, StoreError> {
        Ok(JobRepo::queue_position(&self.pool, id).await?)
    }

    async fn claim_next(
        &self,
        class: JobClass,
        max_running: i64,
        log_dir: &Path,
    ) -> Result<Option<Job>, StoreError> {
        Ok(JobRepo::claim_next(&self.pool, class, max_running, log_dir).await?)
    }

    async fn update_progress(&self, id: DbId, progress: &JobProgress) -> Result<bool, StoreError> {
        Ok(JobRepo::update_progress(&self.pool, id, progress).await?)
    }

    async fn complete(&self, id: DbId, result_ref: &str) -> Result<bool, StoreError> {
        Ok(JobRepo::complete(&self.pool, id, result_ref).await?)
    }

    async fn record_failure(&self, id: DbId, reason: &FailureReason) -> Result<bool, StoreError> {
        Ok(JobRepo::record_failure(&self.pool, id, reason).await?)
    }

    async fn cancel_queued(&self, id: DbId) -> Result<bool, StoreError> {
        Ok(JobRepo::cancel_queued(&self.pool, id).await?)
    }

    async fn request_cancel(&self, id: DbId) -> Result<bool, StoreError> {
        Ok(JobRepo::request_cancel(&self.pool, id).await?)
    }

    async fn cancel_requested(&self, id: DbId) -> Result<bool, StoreError> {
        Ok(JobRepo::cancel_requested(&self.pool, id).await?)
    }

    async fn record_hook_error(&self, id: DbId, message: &str) -> Result<(), StoreError> {
        Ok(JobRepo::record_hook_error(&self.pool, id, message).await?)
    }

    async fn fail_orphaned(&self) -> Result<Vec<Job>, StoreError> {
        Ok(JobRepo::fail_orphaned(&self.pool).await?)
    }
}
