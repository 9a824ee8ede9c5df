//! Completion hooks.
//!
//! Every class has a [`JobHooks`] implementation in the [`HookRegistry`].
//! `cleanup` runs once for every terminal job; `register` runs once, only
//! for completed jobs. A failing hook is logged and recorded on the job's
//! `hook_error` and never changes the job's status.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use atelier_core::job_class::JobClass;
use atelier_core::types::{DbId, Timestamp};
use atelier_db::JobStore;
use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::config::WorkerConfig;
use crate::retry::{with_retry, RetryPolicy};

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("{0}")]
    Failed(String),
}

/// What a hook knows about the job it runs for.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub job_id: DbId,
    pub job_class: JobClass,
    pub output_dir: PathBuf,
    pub scratch_dir: PathBuf,
}

impl HookContext {
    pub fn new(config: &WorkerConfig, job_id: DbId, job_class: JobClass) -> Self {
        Self {
            job_id,
            job_class,
            output_dir: config.job_output_dir(job_class, job_id),
            scratch_dir: config.job_scratch_dir(job_id),
        }
    }
}

/// The hook pair attached to a job class.
#[async_trait]
pub trait JobHooks: Send + Sync {
    /// Runs for every terminal job, whatever the outcome.
    async fn cleanup(&self, ctx: &HookContext) -> Result<(), HookError>;

    /// Runs only for completed jobs.
    async fn register(&self, ctx: &HookContext, result_ref: &str) -> Result<(), HookError>;
}

// ---------------------------------------------------------------------------
// Default hooks
// ---------------------------------------------------------------------------

/// Removes the job's scratch directory.
#[derive(Debug, Default)]
pub struct ScratchCleanup;

impl ScratchCleanup {
    pub async fn run(&self, ctx: &HookContext) -> Result<(), HookError> {
        match tokio::fs::remove_dir_all(&ctx.scratch_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// One line of the artifact index.
#[derive(Debug, Serialize)]
pub struct ArtifactRecord<'a> {
    pub job_id: DbId,
    pub job_class: JobClass,
    pub artifact_kind: &'static str,
    pub result_ref: &'a str,
    pub registered_at: Timestamp,
}

/// Appends completed artifacts to a JSON-lines index file.
#[derive(Debug)]
pub struct ArtifactIndex {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ArtifactIndex {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn append(&self, ctx: &HookContext, result_ref: &str) -> Result<(), HookError> {
        let record = ArtifactRecord {
            job_id: ctx.job_id,
            job_class: ctx.job_class,
            artifact_kind: ctx.job_class.artifact_kind(),
            result_ref,
            registered_at: Utc::now(),
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Scratch cleanup plus artifact registration: the hooks every built-in
/// class uses.
#[derive(Debug)]
pub struct StandardHooks {
    cleanup: ScratchCleanup,
    index: Arc<ArtifactIndex>,
}

impl StandardHooks {
    pub fn new(index: Arc<ArtifactIndex>) -> Self {
        Self {
            cleanup: ScratchCleanup,
            index,
        }
    }
}

#[async_trait]
impl JobHooks for StandardHooks {
    async fn cleanup(&self, ctx: &HookContext) -> Result<(), HookError> {
        self.cleanup.run(ctx).await
    }

    async fn register(&self, ctx: &HookContext, result_ref: &str) -> Result<(), HookError> {
        self.index.append(ctx, result_ref).await
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Class to hooks mapping.
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: HashMap<JobClass, Arc<dyn JobHooks>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// [`StandardHooks`] for every class, sharing one artifact index.
    pub fn with_defaults(config: &WorkerConfig) -> Self {
        let index = Arc::new(ArtifactIndex::new(config.index_path.clone()));
        let standard: Arc<dyn JobHooks> = Arc::new(StandardHooks::new(index));
        let mut registry = Self::new();
        for class in JobClass::ALL {
            registry.register(class, Arc::clone(&standard));
        }
        registry
    }

    /// Attach hooks to a class, replacing any previous ones.
    pub fn register(&mut self, class: JobClass, hooks: Arc<dyn JobHooks>) -> &mut Self {
        self.hooks.insert(class, hooks);
        self
    }

    pub fn get(&self, class: JobClass) -> Option<&Arc<dyn JobHooks>> {
        self.hooks.get(&class)
    }
}

/// Which hooks a terminal transition calls for.
#[derive(Debug, Clone, Copy)]
pub enum TerminalKind<'a> {
    Completed { result_ref: &'a str },
    Unsuccessful,
}

/// Run the hooks for one job that has just reached a terminal state.
///
/// Called exactly once per terminal transition, by whoever performed it.
pub async fn run_terminal_hooks(
    registry: &HookRegistry,
    store: &dyn JobStore,
    retry: &RetryPolicy,
    ctx: &HookContext,
    kind: TerminalKind<'_>,
) {
    let Some(hooks) = registry.get(ctx.job_class) else {
        tracing::debug!(job_id = ctx.job_id, job_class = %ctx.job_class, "No hooks registered");
        return;
    };

    if let TerminalKind::Completed { result_ref } = kind {
        if let Err(e) = hooks.register(ctx, result_ref).await {
            record_failure(store, retry, ctx, "register", &e).await;
        }
    }

    if let Err(e) = hooks.cleanup(ctx).await {
        record_failure(store, retry, ctx, "cleanup", &e).await;
    }
}

async fn record_failure(
    store: &dyn JobStore,
    retry: &RetryPolicy,
    ctx: &HookContext,
    hook: &str,
    error: &HookError,
) {
    tracing::warn!(
        job_id = ctx.job_id,
        job_class = %ctx.job_class,
        hook,
        error = %error,
        "Completion hook failed",
    );
    let message = format!("{hook} hook failed: {error}");
    if let Err(e) = with_retry(retry, "record_hook_error", || {
        store.record_hook_error(ctx.job_id, &message)
    })
    .await
    {
        tracing::error!(job_id = ctx.job_id, error = %e, "Failed to record hook error");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
