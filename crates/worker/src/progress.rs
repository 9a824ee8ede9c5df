//! Progress Reporter: turns worker lines into snapshots.
//!
//! The in-memory snapshot map is what `status` polls read, so
//! [`ProgressReporter::snapshot`] never waits on the store. The store copy is
//! written on every update and is what other processes (and this one after a
//! restart) see.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use atelier_core::progress::{parse_worker_line, JobProgress, WorkerEvent};
use atelier_core::types::DbId;
use atelier_db::JobStore;

pub struct ProgressReporter {
    store: Arc<dyn JobStore>,
    snapshots: RwLock<HashMap<DbId, JobProgress>>,
}

impl ProgressReporter {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    /// Parse one worker line and fold any progress into the job's snapshot.
    ///
    /// Returns the parsed event so the caller can refresh its idle timer or
    /// remember a result marker. Store write failures are logged and do not
    /// interrupt the job.
    pub async fn on_line(&self, job_id: DbId, line: &str) -> Option<WorkerEvent> {
        let event = parse_worker_line(line)?;

        if let WorkerEvent::Progress(update) = &event {
            let snapshot = {
                let mut snapshots = self.snapshots.write().unwrap_or_else(PoisonError::into_inner);
                let entry = snapshots.entry(job_id).or_default();
                entry.apply(update);
                entry.clone()
            };

            if let Err(e) = self.store.update_progress(job_id, &snapshot).await {
                tracing::warn!(job_id, error = %e, "Failed to persist job progress");
            }
        }

        Some(event)
    }

    /// Latest known progress. Empty before the first update.
    pub fn snapshot(&self, job_id: DbId) -> JobProgress {
        self.snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether a live snapshot exists for the job.
    pub fn is_tracking(&self, job_id: DbId) -> bool {
        self.snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&job_id)
    }

    /// Drop the live snapshot once the job is terminal.
    pub fn forget(&self, job_id: DbId) {
        self.snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_core::job_class::JobClass;
    use atelier_db::models::job::NewJob;
    use atelier_db::MemoryJobStore;
    use serde_json::json;
    use std::path::Path;

    async fn running_job(store: &MemoryJobStore) -> DbId {
        let job = store
            .insert(&NewJob {
                job_class: JobClass::Training,
                parameters: json!({"dataset": "d"}),
            })
            .await
            .unwrap();
        store
            .claim_next(JobClass::Training, 1, Path::new("/tmp"))
            .await
            .unwrap();
        job.id
    }

    #[tokio::test]
    async fn progress_lines_update_snapshot_and_store() {
        let store = Arc::new(MemoryJobStore::new());
        let id = running_job(&store).await;
        let reporter = ProgressReporter::new(store.clone());

        assert!(reporter.snapshot(id).is_empty());
        assert!(reporter.on_line(id, "loading weights").await.is_none());

        let event = reporter.on_line(id, "epoch 1/4").await;
        assert!(matches!(event, Some(WorkerEvent::Progress(_))));
        assert_eq!(reporter.snapshot(id).percent, Some(25.0));

        let stored = store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(stored.progress().step, Some(1));
        assert_eq!(stored.progress().total_steps, Some(4));
    }

    #[tokio::test]
    async fn result_marker_is_returned_without_store_write() {
        let store = Arc::new(MemoryJobStore::new());
        let id = running_job(&store).await;
        let reporter = ProgressReporter::new(store.clone());

        let event = reporter.on_line(id, "RESULT: ckpt.safetensors").await;
        assert_eq!(event, Some(WorkerEvent::Result("ckpt.safetensors".into())));
        assert!(!reporter.is_tracking(id));
    }

    #[tokio::test]
    async fn forget_clears_snapshot() {
        let store = Arc::new(MemoryJobStore::new());
        let id = running_job(&store).await;
        let reporter = ProgressReporter::new(store);
        reporter.on_line(id, "PROGRESS: 10%").await;
        reporter.forget(id);
        assert!(reporter.snapshot(id).is_empty());
    }
}
