//! Single-node job orchestrator for GPU-bound work.
//!
//! Jobs are submitted through [`QueueManager`], wait in a per-class FIFO,
//! and run one external worker process each under a [`Supervisor`]. The
//! binary runs an [`Engine`] against Postgres; a web tier can embed the
//! same [`QueueManager`] for submit, status, logs and cancel.

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod progress;
pub mod queue;
pub mod recovery;
pub mod retry;
pub mod supervisor;

pub use config::{ClassConfig, IdleActivity, WorkerConfig};
pub use engine::Engine;
pub use error::{WorkerError, WorkerResult};
pub use hooks::{HookRegistry, JobHooks};
pub use queue::{CancelOutcome, JobView, QueueManager, SubmitReceipt};
pub use supervisor::{Outcome, Supervisor};
