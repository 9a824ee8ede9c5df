//! Subprocess Supervisor.
//!
//! One [`Supervisor::run`] call owns one worker process from spawn to
//! reaping. It streams output to the job log and the
//! [`ProgressReporter`], enforces the watchdog deadlines, and turns
//! cancellation or a timeout into a group-wide SIGTERM followed by SIGKILL.

pub mod output;
pub mod process;
pub mod side_channel;
pub mod watchdog;

use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use atelier_core::command::TemplateContext;
use atelier_core::failure::FailureReason;
use atelier_core::job_class::JobClass;
use atelier_core::progress::WorkerEvent;
use atelier_core::types::DbId;
use atelier_db::models::job::Job;
use atelier_db::JobStore;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{IdleActivity, WorkerConfig};
use crate::progress::ProgressReporter;
use crate::retry::RetryPolicy;
use output::{spawn_reader, JobLog, OutputLine, StderrTail, Stream};
use side_channel::ProgressFile;
use watchdog::Watchdog;

/// How long to keep draining output after the process group is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How a supervised job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed { result_ref: String },
    Cancelled,
    Failed(FailureReason),
}

/// Why the supervisor is stopping a worker that is still running.
#[derive(Debug, Clone)]
enum StopReason {
    Cancelled,
    Interrupted,
    Timeout(FailureReason),
}

enum LoopEnd {
    Exited(io::Result<ExitStatus>),
    Stop(StopReason),
}

pub struct Supervisor {
    config: Arc<WorkerConfig>,
    store: Arc<dyn JobStore>,
    reporter: Arc<ProgressReporter>,
    retry: RetryPolicy,
}

/// Per-run mutable state shared by the line and tick handlers.
struct RunState {
    log: Option<JobLog>,
    tail: StderrTail,
    watchdog: Watchdog,
    idle_activity: IdleActivity,
    result_ref: Option<String>,
    progress: ProgressFile,
}

impl Supervisor {
    pub fn new(
        config: Arc<WorkerConfig>,
        store: Arc<dyn JobStore>,
        reporter: Arc<ProgressReporter>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            config,
            store,
            reporter,
            retry,
        }
    }

    /// Run `job` (already claimed as running) to a terminal outcome.
    ///
    /// `cancel` is the job's own token; `shutdown` is the orchestrator-wide
    /// one and yields [`FailureReason::Interrupted`].
    pub async fn run(
        &self,
        job: &Job,
        class: JobClass,
        cancel: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> Outcome {
        if cancel.is_cancelled() || self.cancel_requested(job.id).await {
            tracing::info!(job_id = job.id, "Job cancelled before spawn");
            return Outcome::Cancelled;
        }
        if shutdown.is_cancelled() {
            return Outcome::Failed(FailureReason::Interrupted);
        }

        let class_config = self.config.class(class);
        let output_dir = self.config.job_output_dir(class, job.id);
        let scratch_dir = self.config.job_scratch_dir(job.id);
        let progress_file = self.config.job_progress_file(job.id);
        let log_path = job
            .log_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.config.job_log_path(class, job.id));

        let log = match prepare_dirs(&output_dir, &scratch_dir, &log_path).await {
            Ok(log) => log,
            Err(e) => {
                tracing::error!(job_id = job.id, error = %e, "Failed to prepare job directories");
                return Outcome::Failed(FailureReason::SpawnFailed(format!(
                    "failed to prepare job directories: {e}"
                )));
            }
        };

        let ctx = TemplateContext {
            job_id: job.id,
            job_class: class,
            output_dir: &output_dir,
            scratch_dir: &scratch_dir,
            progress_file: &progress_file,
            params: &job.parameters,
        };
        let command = match class_config.command.render(&ctx) {
            Ok(command) => command,
            Err(e) => return Outcome::Failed(FailureReason::SpawnFailed(e.to_string())),
        };
        let env = vec![
            ("ATELIER_JOB_ID".to_string(), job.id.to_string()),
            ("ATELIER_JOB_CLASS".to_string(), class.as_str().to_string()),
            ("ATELIER_OUTPUT_DIR".to_string(), output_dir.display().to_string()),
            ("ATELIER_SCRATCH_DIR".to_string(), scratch_dir.display().to_string()),
            ("ATELIER_PROGRESS_FILE".to_string(), progress_file.display().to_string()),
        ];

        let mut child = match process::spawn_with_retry(&command, &env, &self.retry).await {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(
                    job_id = job.id,
                    program = %command.program,
                    error = %e,
                    "Failed to spawn worker",
                );
                return Outcome::Failed(FailureReason::SpawnFailed(format!(
                    "{}: {e}",
                    command.program
                )));
            }
        };
        let pid = child.id();
        tracing::info!(job_id = job.id, job_class = %class, pid, "Worker spawned");

        let (tx, mut rx) = mpsc::channel(self.config.output_channel_capacity.max(1));
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, Stream::Stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, Stream::Stderr, tx.clone());
        }
        drop(tx);

        let mut state = RunState {
            log: Some(log),
            tail: StderrTail::default(),
            watchdog: Watchdog::new(
                Instant::now(),
                class_config.wall_clock_timeout,
                class_config.idle_timeout,
            ),
            idle_activity: class_config.idle_activity,
            result_ref: None,
            progress: ProgressFile::new(progress_file),
        };

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut lines_open = true;

        // ---------- Supervision loop ----------
        let end = loop {
            tokio::select! {
                _ = cancel.cancelled() => break LoopEnd::Stop(StopReason::Cancelled),
                _ = shutdown.cancelled() => break LoopEnd::Stop(StopReason::Interrupted),
                status = child.wait() => break LoopEnd::Exited(status),
                line = rx.recv(), if lines_open => match line {
                    Some(line) => self.handle_line(job.id, &mut state, line).await,
                    None => lines_open = false,
                },
                _ = ticker.tick() => {
                    if let Some(stop) = self.on_tick(job.id, &mut state).await {
                        break LoopEnd::Stop(stop);
                    }
                }
            }
        };

        let (stop, exit) = match end {
            LoopEnd::Exited(status) => (None, status),
            LoopEnd::Stop(reason) => {
                tracing::info!(job_id = job.id, pid, reason = ?reason, "Terminating worker");
                let status = self.terminate(job.id, &mut child, pid, &mut rx, &mut state).await;
                (Some(reason), status)
            }
        };

        // Reap anything the leader left behind in its group.
        if let Some(pgid) = pid {
            if let Err(e) = process::kill_group(pgid) {
                tracing::warn!(job_id = job.id, pid = pgid, error = %e, "Final group kill failed");
            }
        }
        self.drain(job.id, &mut rx, &mut state).await;
        self.read_side_channel(job.id, &mut state).await;

        let outcome = match stop {
            Some(StopReason::Cancelled) => Outcome::Cancelled,
            Some(StopReason::Interrupted) => Outcome::Failed(FailureReason::Interrupted),
            Some(StopReason::Timeout(reason)) => Outcome::Failed(reason),
            None => classify_exit(exit, &mut state, &output_dir).await,
        };

        tracing::info!(job_id = job.id, pid, outcome = ?outcome, "Worker finished");
        outcome
    }

    async fn handle_line(&self, job_id: DbId, state: &mut RunState, line: OutputLine) {
        if let Some(log) = state.log.as_mut() {
            if let Err(e) = log.append(&line.text).await {
                tracing::warn!(job_id, error = %e, "Failed to write job log, disabling it");
                state.log = None;
            }
        }
        if line.stream == Stream::Stderr {
            state.tail.push(&line.text);
        }
        if state.idle_activity == IdleActivity::AnyOutput {
            state.watchdog.touch(Instant::now());
        }

        match self.reporter.on_line(job_id, &line.text).await {
            Some(WorkerEvent::Progress(_)) => state.watchdog.touch(Instant::now()),
            Some(WorkerEvent::Result(result_ref)) => state.result_ref = Some(result_ref),
            None => {}
        }
    }

    /// Periodic checks: side-channel progress, remote cancel, watchdog.
    async fn on_tick(&self, job_id: DbId, state: &mut RunState) -> Option<StopReason> {
        self.read_side_channel(job_id, state).await;

        if self.cancel_requested(job_id).await {
            return Some(StopReason::Cancelled);
        }

        state
            .watchdog
            .check(Instant::now())
            .map(StopReason::Timeout)
    }

    /// Feed lines appended to the progress file since the last read.
    async fn read_side_channel(&self, job_id: DbId, state: &mut RunState) {
        let lines = match state.progress.read_new_lines().await {
            Ok(lines) => lines,
            Err(e) => {
                tracing::debug!(
                    job_id,
                    path = %state.progress.path().display(),
                    error = %e,
                    "Failed to read progress file",
                );
                return;
            }
        };
        for line in lines {
            match self.reporter.on_line(job_id, &line).await {
                Some(WorkerEvent::Progress(_)) => state.watchdog.touch(Instant::now()),
                Some(WorkerEvent::Result(result_ref)) => state.result_ref = Some(result_ref),
                None => {}
            }
        }
    }

    async fn cancel_requested(&self, job_id: DbId) -> bool {
        match self.store.cancel_requested(job_id).await {
            Ok(requested) => requested,
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Failed to check cancel flag");
                false
            }
        }
    }

    /// SIGTERM the group, keep draining output, SIGKILL after the grace period.
    async fn terminate(
        &self,
        job_id: DbId,
        child: &mut Child,
        pid: Option<u32>,
        rx: &mut mpsc::Receiver<OutputLine>,
        state: &mut RunState,
    ) -> io::Result<ExitStatus> {
        let Some(pgid) = pid else {
            // Already reaped.
            return child.wait().await;
        };

        if let Err(e) = process::terminate_group(pgid) {
            tracing::warn!(job_id, pid = pgid, error = %e, "SIGTERM to worker group failed");
        }

        let grace = tokio::time::sleep(self.config.kill_grace);
        tokio::pin!(grace);
        let mut lines_open = true;

        loop {
            tokio::select! {
                status = child.wait() => return status,
                line = rx.recv(), if lines_open => match line {
                    Some(line) => self.handle_line(job_id, state, line).await,
                    None => lines_open = false,
                },
                _ = &mut grace => {
                    tracing::warn!(job_id, pid = pgid, "Worker ignored SIGTERM, sending SIGKILL");
                    if let Err(e) = process::kill_group(pgid) {
                        tracing::warn!(job_id, pid = pgid, error = %e, "SIGKILL to worker group failed");
                    }
                    return child.wait().await;
                }
            }
        }
    }

    /// Consume lines still buffered after the group is dead.
    async fn drain(&self, job_id: DbId, rx: &mut mpsc::Receiver<OutputLine>, state: &mut RunState) {
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(line)) => self.handle_line(job_id, state, line).await,
                Ok(None) => break,
                Err(_) => {
                    tracing::debug!(job_id, "Gave up draining worker output");
                    break;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn prepare_dirs(output_dir: &Path, scratch_dir: &Path, log_path: &Path) -> io::Result<JobLog> {
    tokio::fs::create_dir_all(output_dir).await?;
    tokio::fs::create_dir_all(scratch_dir).await?;
    JobLog::open(log_path).await
}

async fn classify_exit(
    exit: io::Result<ExitStatus>,
    state: &mut RunState,
    output_dir: &Path,
) -> Outcome {
    let status = match exit {
        Ok(status) => status,
        Err(e) => {
            return Outcome::Failed(FailureReason::WorkerFailure {
                exit_code: None,
                stderr_excerpt: format!("failed to wait for worker: {e}"),
            })
        }
    };

    if !status.success() {
        return Outcome::Failed(FailureReason::WorkerFailure {
            exit_code: status.code(),
            stderr_excerpt: state.tail.excerpt(),
        });
    }

    if let Some(result_ref) = state.result_ref.take() {
        return Outcome::Completed { result_ref };
    }
    if dir_has_entries(output_dir).await {
        return Outcome::Completed {
            result_ref: output_dir.display().to_string(),
        };
    }
    Outcome::Failed(FailureReason::MissingResult)
}

async fn dir_has_entries(dir: &Path) -> bool {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    }
}
