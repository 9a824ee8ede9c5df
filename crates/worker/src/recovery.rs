//! Recovery Sweep.
//!
//! Runs once at startup, before any dispatcher. A job still marked
//! `running` at that point lost its supervisor in a crash or restart: it is
//! failed as orphaned, its cleanup hooks run, and its class slot is free
//! again.

use atelier_core::types::DbId;
use atelier_db::JobStore;

use crate::config::WorkerConfig;
use crate::error::WorkerResult;
use crate::hooks::{run_terminal_hooks, HookContext, HookRegistry, TerminalKind};
use crate::retry::{with_retry, RetryPolicy};

/// Fail every orphaned `running` job and run its cleanup hooks.
///
/// Returns the ids of the recovered jobs.
pub async fn recover_orphans(
    store: &dyn JobStore,
    hooks: &HookRegistry,
    config: &WorkerConfig,
    retry: &RetryPolicy,
) -> WorkerResult<Vec<DbId>> {
    let orphaned = with_retry(retry, "fail_orphaned", || store.fail_orphaned()).await?;

    let mut recovered = Vec::with_capacity(orphaned.len());
    for job in orphaned {
        let class = match job.class() {
            Ok(class) => class,
            Err(e) => {
                tracing::error!(job_id = job.id, error = %e, "Orphaned job has unknown class");
                recovered.push(job.id);
                continue;
            }
        };
        tracing::warn!(job_id = job.id, job_class = %class, "Recovered job orphaned by restart");
        let ctx = HookContext::new(config, job.id, class);
        run_terminal_hooks(hooks, store, retry, &ctx, TerminalKind::Unsuccessful).await;
        recovered.push(job.id);
    }

    if !recovered.is_empty() {
        tracing::info!(count = recovered.len(), "Recovery sweep complete");
    }
    Ok(recovered)
}
