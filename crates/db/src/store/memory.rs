//! In-process [`JobStore`].
//!
//! All state sits behind one mutex, so each method is atomic in the same
//! way a single conditional `UPDATE` is for [`PgJobStore`](super::PgJobStore).

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use atelier_core::failure::FailureReason;
use atelier_core::job_class::JobClass;
use atelier_core::job_status::JobStatus;
use atelier_core::progress::JobProgress;
use atelier_core::types::DbId;
use chrono::Utc;

use super::{JobStore, StoreError};
use crate::models::job::{Job, NewJob};

#[derive(Debug, Default)]
struct State {
    last_id: DbId,
    jobs: BTreeMap<DbId, Job>,
    /// Number of upcoming calls that fail with [`StoreError::Unavailable`].
    injected_failures: u32,
    progress_writes: HashMap<DbId, u64>,
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    state: Mutex<State>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` store calls fail with a transient error.
    pub fn fail_next_calls(&self, n: u32) {
        self.lock().injected_failures = n;
    }

    /// Every job, in id order.
    pub fn all_jobs(&self) -> Vec<Job> {
        self.lock().jobs.values().cloned().collect()
    }

    /// Progress rows written for job `id` so far.
    pub fn progress_writes(&self, id: DbId) -> u64 {
        self.lock().progress_writes.get(&id).copied().unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the state, consuming one injected failure if any are pending.
    fn enter(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        let mut state = self.lock();
        if state.injected_failures > 0 {
            state.injected_failures -= 1;
            tracing::debug!(remaining = state.injected_failures, "Injecting store failure");
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(state)
    }
}

impl State {
    /// Apply `f` to the job if its status is `from`, moving it to `to`.
    fn transition(
        &mut self,
        id: DbId,
        from: JobStatus,
        to: JobStatus,
        f: impl FnOnce(&mut Job),
    ) -> bool {
        debug_assert!(from.can_transition_to(to));
        match self.jobs.get_mut(&id) {
            Some(job) if job.status_id == from.id() => {
                job.status_id = to.id();
                f(job);
                job.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }
}

fn fail_job(job: &mut Job, reason: &FailureReason) {
    let now = Utc::now();
    job.error_kind = Some(reason.kind().to_string());
    job.error_message = Some(reason.to_string());
    job.completed_at = Some(now);
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, input: &NewJob) -> Result<Job, StoreError> {
        let mut state = self.enter()?;
        state.last_id += 1;
        let now = Utc::now();
        let job = Job {
            id: state.last_id,
            job_class: input.job_class.as_str().to_string(),
            status_id: JobStatus::Queued.id(),
            parameters: input.parameters.clone(),
            progress_percent: None,
            progress_step: None,
            progress_total: None,
            progress_message: None,
            error_kind: None,
            error_message: None,
            hook_error: None,
            log_path: None,
            result_ref: None,
            cancel_requested_at: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        };
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn find_by_id(&self, id: DbId) -> Result<Option<Job>, StoreError> {
        Ok(self.enter()?.jobs.get(&id).cloned())
    }

    async fn queue_position(&self, id: DbId) -> Result<Option<i64>, StoreError> {
        let state = self.enter()?;
        let queued = JobStatus::Queued.id();
        let Some(job) = state.jobs.get(&id).filter(|j| j.status_id == queued) else {
            return Ok(None);
        };
        let ahead = state
            .jobs
            .range(..id)
            .filter(|(_, j)| j.status_id == queued && j.job_class == job.job_class)
            .count();
        Ok(Some(ahead as i64))
    }

    async fn claim_next(
        &self,
        class: JobClass,
        max_running: i64,
        log_dir: &Path,
    ) -> Result<Option<Job>, StoreError> {
        let mut state = self.enter()?;
        let class_name = class.as_str();
        let in_class = |j: &&Job| j.job_class == class_name;

        let running = state
            .jobs
            .values()
            .filter(in_class)
            .filter(|j| j.status_id == JobStatus::Running.id())
            .count() as i64;
        if running >= max_running {
            return Ok(None);
        }

        let Some(id) = state
            .jobs
            .values()
            .filter(in_class)
            .find(|j| j.status_id == JobStatus::Queued.id())
            .map(|j| j.id)
        else {
            return Ok(None);
        };

        let log_path = log_dir.join(class_name).join(format!("{id}.log"));
        state.transition(id, JobStatus::Queued, JobStatus::Running, |job| {
            job.started_at = Some(Utc::now());
            job.log_path = Some(log_path.to_string_lossy().into_owned());
        });
        Ok(state.jobs.get(&id).cloned())
    }

    async fn update_progress(&self, id: DbId, progress: &JobProgress) -> Result<bool, StoreError> {
        let mut state = self.enter()?;
        let written = match state.jobs.get_mut(&id) {
            Some(job) if job.status_id == JobStatus::Running.id() => {
                job.progress_percent = progress.percent;
                job.progress_step = progress.step.and_then(|s| i64::try_from(s).ok());
                job.progress_total = progress.total_steps.and_then(|t| i64::try_from(t).ok());
                job.progress_message = progress.message.clone();
                job.updated_at = Utc::now();
                true
            }
            _ => false,
        };
        if written {
            *state.progress_writes.entry(id).or_default() += 1;
        }
        Ok(written)
    }

    async fn complete(&self, id: DbId, result_ref: &str) -> Result<bool, StoreError> {
        let mut state = self.enter()?;
        Ok(state.transition(id, JobStatus::Running, JobStatus::Completed, |job| {
            job.result_ref = Some(result_ref.to_string());
            job.progress_percent = Some(100.0);
            job.completed_at = Some(Utc::now());
        }))
    }

    async fn record_failure(&self, id: DbId, reason: &FailureReason) -> Result<bool, StoreError> {
        let mut state = self.enter()?;
        Ok(state.transition(id, JobStatus::Running, reason.terminal_status(), |job| {
            fail_job(job, reason)
        }))
    }

    async fn cancel_queued(&self, id: DbId) -> Result<bool, StoreError> {
        let mut state = self.enter()?;
        Ok(state.transition(id, JobStatus::Queued, JobStatus::Cancelled, |job| {
            fail_job(job, &FailureReason::Cancelled)
        }))
    }

    async fn request_cancel(&self, id: DbId) -> Result<bool, StoreError> {
        let mut state = self.enter()?;
        match state.jobs.get_mut(&id) {
            Some(job) if job.status_id == JobStatus::Running.id() => {
                job.cancel_requested_at.get_or_insert_with(Utc::now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel_requested(&self, id: DbId) -> Result<bool, StoreError> {
        let state = self.enter()?;
        Ok(state
            .jobs
            .get(&id)
            .is_some_and(|job| job.cancel_requested_at.is_some()))
    }

    async fn record_hook_error(&self, id: DbId, message: &str) -> Result<(), StoreError> {
        let mut state = self.enter()?;
        if let Some(job) = state.jobs.get_mut(&id) {
            job.hook_error = Some(match job.hook_error.take() {
                Some(existing) => format!("{existing}\n{message}"),
                None => message.to_string(),
            });
        }
        Ok(())
    }

    async fn fail_orphaned(&self) -> Result<Vec<Job>, StoreError> {
        let mut state = self.enter()?;
        let running: Vec<DbId> = state
            .jobs
            .values()
            .filter(|j| j.status_id == JobStatus::Running.id())
            .map(|j| j.id)
            .collect();

        let mut orphaned = Vec::with_capacity(running.len());
        for id in running {
            state.transition(id, JobStatus::Running, JobStatus::Failed, |job| {
                fail_job(job, &FailureReason::OrphanedByRestart)
            });
            if let Some(job) = state.jobs.get(&id) {
                orphaned.push(job.clone());
            }
        }
        Ok(orphaned)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
