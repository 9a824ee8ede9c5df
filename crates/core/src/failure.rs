//! Why a job did not complete.
//!
//! [`FailureReason`] is what ends up in a job's `error` (its `Display`) and
//! `error_kind` (its [`FailureReason::kind`]) columns.

use std::time::Duration;

use crate::job_status::JobStatus;

/// Which watchdog deadline fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Total runtime since spawn.
    WallClock,
    /// Time since the last observed output or progress.
    Idle,
}

impl TimeoutKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WallClock => "wall-clock",
            Self::Idle => "idle",
        }
    }
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal error of a job that did not complete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureReason {
    #[error("{}", describe_exit(.exit_code, .stderr_excerpt))]
    WorkerFailure {
        /// `None` when the worker was killed by a signal.
        exit_code: Option<i32>,
        stderr_excerpt: String,
    },

    #[error("{kind} timeout exceeded (limit {}s)", .limit.as_secs())]
    TimeoutExceeded { kind: TimeoutKind, limit: Duration },

    #[error("cancelled by request")]
    Cancelled,

    #[error("orphaned by restart: the orchestrator stopped while this job was running")]
    OrphanedByRestart,

    #[error("failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("worker exited successfully but reported no result")]
    MissingResult,

    #[error("interrupted by orchestrator shutdown")]
    Interrupted,
}

impl FailureReason {
    /// Machine-readable classification stored as `error_kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WorkerFailure { .. } => "worker_failure",
            Self::TimeoutExceeded {
                kind: TimeoutKind::WallClock,
                ..
            } => "timeout_wall_clock",
            Self::TimeoutExceeded {
                kind: TimeoutKind::Idle,
                ..
            } => "timeout_idle",
            Self::Cancelled => "cancelled",
            Self::OrphanedByRestart => "orphaned_by_restart",
            Self::SpawnFailed(_) => "spawn_failed",
            Self::MissingResult => "missing_result",
            Self::Interrupted => "interrupted",
        }
    }

    /// Status the job ends in for this reason.
    pub fn terminal_status(&self) -> JobStatus {
        match self {
            Self::Cancelled => JobStatus::Cancelled,
            _ => JobStatus::Failed,
        }
    }
}

fn describe_exit(exit_code: &Option<i32>, stderr_excerpt: &str) -> String {
    let head = match exit_code {
        Some(code) => format!("worker exited with code {code}"),
        None => "worker terminated by signal".to_string(),
    };
    let excerpt = stderr_excerpt.trim();
    if excerpt.is_empty() {
        head
    } else {
        format!("{head}: {excerpt}")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_failure_message_includes_excerpt() {
        let reason = FailureReason::WorkerFailure {
            exit_code: Some(3),
            stderr_excerpt: "CUDA out of memory\n".into(),
        };
        assert_eq!(reason.to_string(), "worker exited with code 3: CUDA out of memory");
        assert_eq!(reason.kind(), "worker_failure");
    }

    #[test]
    fn signal_death_without_excerpt() {
        let reason = FailureReason::WorkerFailure {
            exit_code: None,
            stderr_excerpt: String::new(),
        };
        assert_eq!(reason.to_string(), "worker terminated by signal");
    }

    #[test]
    fn timeouts_are_classified_by_kind() {
        let idle = FailureReason::TimeoutExceeded {
            kind: TimeoutKind::Idle,
            limit: Duration::from_secs(300),
        };
        let wall = FailureReason::TimeoutExceeded {
            kind: TimeoutKind::WallClock,
            limit: Duration::from_secs(3600),
        };
        assert_eq!(idle.kind(), "timeout_idle");
        assert_eq!(idle.to_string(), "idle timeout exceeded (limit 300s)");
        assert_eq!(wall.kind(), "timeout_wall_clock");
        assert!(wall.to_string().starts_with("wall-clock timeout"));
    }

    #[test]
    fn only_cancel_ends_cancelled() {
        assert_eq!(FailureReason::Cancelled.terminal_status(), JobStatus::Cancelled);
        assert_eq!(FailureReason::OrphanedByRestart.terminal_status(), JobStatus::Failed);
        assert_eq!(FailureReason::Interrupted.terminal_status(), JobStatus::Failed);
        assert_eq!(FailureReason::MissingResult.terminal_status(), JobStatus::Failed);
    }

    #[test]
    fn every_message_is_non_empty() {
        let reasons = [
            FailureReason::Cancelled,
            FailureReason::OrphanedByRestart,
            FailureReason::SpawnFailed("No such file or directory".into()),
            FailureReason::MissingResult,
            FailureReason::Interrupted,
        ];
        for reason in reasons {
            assert!(!reason.to_string().is_empty(), "{:?}", reason);
        }
    }
}
