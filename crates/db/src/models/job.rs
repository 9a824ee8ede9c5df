//! Job entity model and insert DTO.

use atelier_core::error::CoreError;
use atelier_core::job_class::JobClass;
use atelier_core::job_status::{JobStatus, StatusId};
use atelier_core::progress::JobProgress;
use atelier_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `jobs` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Job {
    pub id: DbId,
    pub job_class: String,
    pub status_id: StatusId,
    pub parameters: serde_json::Value,
    pub progress_percent: Option<f32>,
    pub progress_step: Option<i64>,
    pub progress_total: Option<i64>,
    pub progress_message: Option<String>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    /// Newline-separated completion hook failures. Informational only.
    pub hook_error: Option<String>,
    pub log_path: Option<String>,
    pub result_ref: Option<String>,
    pub cancel_requested_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub updated_at: Timestamp,
}

impl Job {
    pub fn status(&self) -> Result<JobStatus, CoreError> {
        JobStatus::from_id(self.status_id)
    }

    pub fn class(&self) -> Result<JobClass, CoreError> {
        self.job_class.parse()
    }

    /// Persisted progress columns as a snapshot.
    pub fn progress(&self) -> JobProgress {
        JobProgress {
            percent: self.progress_percent,
            step: self.progress_step.and_then(|s| u64::try_from(s).ok()),
            total_steps: self.progress_total.and_then(|t| u64::try_from(t).ok()),
            message: self.progress_message.clone(),
        }
    }
}

/// Insert DTO. Params are validated before this is built.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_class: JobClass,
    pub parameters: serde_json::Value,
}
