//! Queue Manager: the orchestrator's public surface.
//!
//! Each job class has its own FIFO (the `queued` rows of that class, ordered
//! by id) and its own slot table. A slot maps a running job id to the
//! cancellation token of its supervision task; the class is full when it
//! holds `max_concurrency` slots. Only [`QueueManager::try_dispatch`] takes
//! slots and only the terminal path (`finish`) gives them back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use atelier_core::failure::FailureReason;
use atelier_core::job_class::JobClass;
use atelier_core::job_status::JobStatus;
use atelier_core::progress::JobProgress;
use atelier_core::types::{DbId, Timestamp};
use atelier_db::models::job::{Job, NewJob};
use atelier_db::JobStore;
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::hooks::{run_terminal_hooks, HookContext, HookRegistry, TerminalKind};
use crate::progress::ProgressReporter;
use crate::retry::{with_retry, RetryPolicy};
use crate::supervisor::{Outcome, Supervisor};

/// Extra time on top of the kill grace that shutdown waits for supervisors.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Returned by [`QueueManager::submit`].
#[derive(Debug, Clone, Serialize)]
pub struct SubmitReceipt {
    pub job_id: DbId,
    pub status: JobStatus,
    /// Present while the job is still queued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<i64>,
}

/// What a cancel request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "status", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job was queued and is now cancelled.
    Cancelled,
    /// The job is running; it becomes cancelled once its worker is dead.
    CancelRequested,
    /// Nothing to do.
    AlreadyTerminal(JobStatus),
}

/// A job as seen by polling clients.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: DbId,
    pub job_class: JobClass,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<i64>,
    pub progress: JobProgress,
    pub params: serde_json::Value,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    pub hook_error: Option<String>,
    pub result_ref: Option<String>,
    pub log_path: Option<String>,
}

// ---------------------------------------------------------------------------
// Per-class state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ClassState {
    /// Running job id -> cancellation token of its supervision task.
    slots: Mutex<HashMap<DbId, CancellationToken>>,
    /// Serializes dispatch rounds so concurrent wakeups never over-admit.
    dispatch_lock: tokio::sync::Mutex<()>,
    /// Wakes the class dispatcher.
    wake: Notify,
}

impl ClassState {
    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<DbId, CancellationToken>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn class_index(class: JobClass) -> usize {
    match class {
        JobClass::Generation => 0,
        JobClass::Training => 1,
        JobClass::Scraping => 2,
        JobClass::Labeling => 3,
    }
}

// ---------------------------------------------------------------------------
// QueueManager
// ---------------------------------------------------------------------------

pub struct QueueManager {
    config: Arc<WorkerConfig>,
    store: Arc<dyn JobStore>,
    hooks: HookRegistry,
    reporter: Arc<ProgressReporter>,
    supervisor: Supervisor,
    retry: RetryPolicy,
    /// Indexed by [`class_index`].
    classes: [ClassState; 4],
    /// Supervision tasks.
    jobs: TaskTracker,
    shutdown: CancellationToken,
}

impl QueueManager {
    pub fn new(config: Arc<WorkerConfig>, store: Arc<dyn JobStore>, hooks: HookRegistry) -> Self {
        Self::with_retry_policy(config, store, hooks, RetryPolicy::default())
    }

    pub fn with_retry_policy(
        config: Arc<WorkerConfig>,
        store: Arc<dyn JobStore>,
        hooks: HookRegistry,
        retry: RetryPolicy,
    ) -> Self {
        let reporter = Arc::new(ProgressReporter::new(Arc::clone(&store)));
        let supervisor = Supervisor::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Arc::clone(&reporter),
            retry.clone(),
        );
        Self {
            config,
            store,
            hooks,
            reporter,
            supervisor,
            retry,
            classes: std::array::from_fn(|_| ClassState::default()),
            jobs: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn JobStore {
        self.store.as_ref()
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    // ---------- Submit / read ----------

    /// Validate and enqueue a job. Never waits for execution.
    pub async fn submit(
        &self,
        job_class: JobClass,
        params: serde_json::Value,
    ) -> WorkerResult<SubmitReceipt> {
        job_class.validate_params(&params)?;
        self.config
            .class(job_class)
            .command
            .check_resolvable(&params)?;

        let input = NewJob {
            job_class,
            parameters: params,
        };
        let job = with_retry(&self.retry, "insert_job", || self.store.insert(&input)).await?;
        let queue_position =
            with_retry(&self.retry, "queue_position", || self.store.queue_position(job.id)).await?;
        tracing::info!(
            job_id = job.id,
            job_class = %job_class,
            queue_position,
            "Job submitted",
        );

        self.wake(job_class);

        let status = match queue_position {
            Some(_) => JobStatus::Queued,
            None => self.find(job.id).await?.status()?,
        };
        Ok(SubmitReceipt {
            job_id: job.id,
            status,
            queue_position,
        })
    }

    /// Current view of a job. Queue position is computed at read time.
    pub async fn status(&self, job_id: DbId) -> WorkerResult<JobView> {
        let job = self.find(job_id).await?;
        let status = job.status()?;
        let queue_position = match status {
            JobStatus::Queued => self.store.queue_position(job_id).await?,
            _ => None,
        };
        let progress = match status {
            JobStatus::Running if self.reporter.is_tracking(job_id) => {
                self.reporter.snapshot(job_id)
            }
            _ => job.progress(),
        };

        Ok(JobView {
            id: job.id,
            job_class: job.class()?,
            status,
            queue_position,
            progress,
            params: job.parameters,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            error: job.error_message,
            error_kind: job.error_kind,
            hook_error: job.hook_error,
            result_ref: job.result_ref,
            log_path: job.log_path,
        })
    }

    /// Everything the worker has written so far. Empty before start.
    pub async fn logs(&self, job_id: DbId) -> WorkerResult<String> {
        let job = self.find(job_id).await?;
        let Some(path) = job.log_path else {
            return Ok(String::new());
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Latest in-process progress for a job. Never blocks on I/O.
    pub fn snapshot(&self, job_id: DbId) -> JobProgress {
        self.reporter.snapshot(job_id)
    }

    // ---------- Cancel ----------

    /// Cancel a job. Idempotent; a terminal job is left untouched.
    pub async fn cancel(&self, job_id: DbId) -> WorkerResult<CancelOutcome> {
        let job = self.find(job_id).await?;
        let mut status = job.status()?;

        if status == JobStatus::Queued {
            if with_retry(&self.retry, "cancel_queued", || self.store.cancel_queued(job_id)).await? {
                let class = job.class()?;
                tracing::info!(job_id, job_class = %class, "Queued job cancelled");
                let ctx = HookContext::new(&self.config, job_id, class);
                run_terminal_hooks(
                    &self.hooks,
                    self.store.as_ref(),
                    &self.retry,
                    &ctx,
                    TerminalKind::Unsuccessful,
                )
                .await;
                return Ok(CancelOutcome::Cancelled);
            }
            // Lost the race with dispatch (or another cancel).
            status = self.find(job_id).await?.status()?;
        }

        if status.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal(status));
        }

        // Running. Flag it in the store first so a supervisor in another
        // process sees it, then signal a local one directly.
        let flagged =
            with_retry(&self.retry, "request_cancel", || self.store.request_cancel(job_id)).await?;
        let class = job.class()?;
        if let Some(token) = self.class_state(class).slots().get(&job_id) {
            token.cancel();
        }

        if !flagged {
            // Finished between the two reads.
            let status = self.find(job_id).await?.status()?;
            if status.is_terminal() {
                return Ok(CancelOutcome::AlreadyTerminal(status));
            }
        }

        tracing::info!(job_id, job_class = %class, "Cancel requested for running job");
        Ok(CancelOutcome::CancelRequested)
    }

    // ---------- Dispatch ----------

    /// Claim queued jobs of `class` while it has free slots, starting a
    /// supervision task for each. Returns how many jobs were started.
    pub async fn try_dispatch(self: &Arc<Self>, class: JobClass) -> WorkerResult<usize> {
        let state = self.class_state(class);
        let _round = state.dispatch_lock.lock().await;
        let limit = self.config.class(class).max_concurrency;
        let mut started = 0;

        loop {
            if self.shutdown.is_cancelled() || state.slots().len() >= limit {
                break;
            }

            let claimed = with_retry(&self.retry, "claim_next", || {
                self.store
                    .claim_next(class, limit as i64, &self.config.log_dir)
            })
            .await?;
            let Some(job) = claimed else {
                break;
            };

            let token = CancellationToken::new();
            state.slots().insert(job.id, token.clone());
            tracing::info!(job_id = job.id, job_class = %class, "Job dispatched");

            let manager = Arc::clone(self);
            self.jobs
                .spawn(async move { manager.supervise(job, class, token).await });
            started += 1;
        }

        Ok(started)
    }

    async fn supervise(self: Arc<Self>, job: Job, class: JobClass, token: CancellationToken) {
        let outcome = self
            .supervisor
            .run(&job, class, &token, &self.shutdown)
            .await;
        self.finish(job.id, class, outcome).await;
    }

    /// Record the terminal outcome, run hooks, then free the slot.
    async fn finish(&self, job_id: DbId, class: JobClass, outcome: Outcome) {
        self.reporter.forget(job_id);

        let Some(written) = self.record_outcome(job_id, class, &outcome).await else {
            return;
        };

        if written {
            match &outcome {
                Outcome::Completed { result_ref } => {
                    tracing::info!(job_id, job_class = %class, result_ref = %result_ref, "Job completed");
                }
                Outcome::Cancelled => {
                    tracing::info!(job_id, job_class = %class, "Job cancelled");
                }
                Outcome::Failed(reason) => {
                    tracing::info!(
                        job_id,
                        job_class = %class,
                        error_kind = reason.kind(),
                        error = %reason,
                        "Job failed",
                    );
                }
            }

            let ctx = HookContext::new(&self.config, job_id, class);
            let kind = match &outcome {
                Outcome::Completed { result_ref } => TerminalKind::Completed { result_ref },
                _ => TerminalKind::Unsuccessful,
            };
            run_terminal_hooks(&self.hooks, self.store.as_ref(), &self.retry, &ctx, kind)
                .await;
        } else {
            // Someone else already moved the row out of `running`; they
            // own its hooks.
            tracing::warn!(job_id, job_class = %class, "Job was no longer running at finish");
        }

        self.class_state(class).slots().remove(&job_id);
        self.wake(class);
    }

    /// Write the terminal row, holding the slot until the write lands.
    ///
    /// Each round is a full [`with_retry`]; between rounds the write waits
    /// `retry.max_delay`. Returns `None` if shutdown starts first, leaving
    /// the row `running` for the startup recovery sweep.
    async fn record_outcome(&self, job_id: DbId, class: JobClass, outcome: &Outcome) -> Option<bool> {
        let mut round = 1u32;
        loop {
            let written = match outcome {
                Outcome::Completed { result_ref } => {
                    with_retry(&self.retry, "complete_job", || {
                        self.store.complete(job_id, result_ref)
                    })
                    .await
                }
                Outcome::Cancelled => {
                    with_retry(&self.retry, "cancel_job", || {
                        self.store.record_failure(job_id, &FailureReason::Cancelled)
                    })
                    .await
                }
                Outcome::Failed(reason) => {
                    with_retry(&self.retry, "fail_job", || {
                        self.store.record_failure(job_id, reason)
                    })
                    .await
                }
            };

            let e = match written {
                Ok(written) => return Some(written),
                Err(e) => e,
            };
            tracing::error!(
                job_id,
                job_class = %class,
                round,
                error = %e,
                "Failed to record terminal outcome, holding slot",
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::warn!(
                        job_id,
                        job_class = %class,
                        "Shutting down with terminal outcome unrecorded, leaving job to recovery",
                    );
                    return None;
                }
                _ = tokio::time::sleep(self.retry.max_delay) => {}
            }
            round += 1;
        }
    }

    // ---------- Lifecycle helpers ----------

    /// Wake the dispatcher of `class`.
    pub fn wake(&self, class: JobClass) {
        self.class_state(class).wake.notify_one();
    }

    pub(crate) fn wakeup_signal(&self, class: JobClass) -> &Notify {
        &self.class_state(class).wake
    }

    /// Number of jobs of `class` holding a slot in this process.
    pub fn running_count(&self, class: JobClass) -> usize {
        self.class_state(class).slots().len()
    }

    /// Interrupt every running worker and wait (bounded) for their
    /// supervisors to record the outcome.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.jobs.close();
        let limit = self.config.kill_grace + SHUTDOWN_SLACK;
        if tokio::time::timeout(limit, self.jobs.wait()).await.is_err() {
            tracing::warn!(
                remaining = self.jobs.len(),
                "Supervisors still running after shutdown timeout",
            );
        }
    }

    fn class_state(&self, class: JobClass) -> &ClassState {
        &self.classes[class_index(class)]
    }

    async fn find(&self, job_id: DbId) -> WorkerResult<Job> {
        self.store
            .find_by_id(job_id)
            .await?
            .ok_or(WorkerError::NotFound(job_id))
    }
}
