//! Engine lifecycle: recovery, dispatchers, shutdown.

use std::sync::Arc;
use std::time::Duration;

use atelier_core::job_class::JobClass;
use atelier_db::JobStore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::WorkerConfig;
use crate::dispatcher::ClassDispatcher;
use crate::error::WorkerResult;
use crate::hooks::HookRegistry;
use crate::queue::QueueManager;
use crate::recovery::recover_orphans;
use crate::retry::RetryPolicy;

/// Upper bound on waiting for dispatcher loops to exit.
const DISPATCHER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// A running orchestrator.
pub struct Engine {
    manager: Arc<QueueManager>,
    dispatchers: TaskTracker,
    cancel: CancellationToken,
}

impl Engine {
    /// Recover orphans, then start one dispatcher per class.
    pub async fn start(
        config: Arc<WorkerConfig>,
        store: Arc<dyn JobStore>,
        hooks: HookRegistry,
    ) -> WorkerResult<Self> {
        Self::start_with_retry_policy(config, store, hooks, RetryPolicy::default()).await
    }

    pub async fn start_with_retry_policy(
        config: Arc<WorkerConfig>,
        store: Arc<dyn JobStore>,
        hooks: HookRegistry,
        retry: RetryPolicy,
    ) -> WorkerResult<Self> {
        config.validate()?;
        let manager = Arc::new(QueueManager::with_retry_policy(config, store, hooks, retry));

        let recovered = recover_orphans(
            manager.store(),
            manager.hooks(),
            manager.config(),
            manager.retry_policy(),
        )
        .await?;
        tracing::info!(recovered = recovered.len(), "Startup recovery finished");

        let cancel = CancellationToken::new();
        let dispatchers = TaskTracker::new();
        for class in JobClass::ALL {
            let dispatcher = ClassDispatcher::new(class, Arc::clone(&manager));
            dispatchers.spawn(dispatcher.run(cancel.child_token()));
        }
        dispatchers.close();

        Ok(Self {
            manager,
            dispatchers,
            cancel,
        })
    }

    pub fn manager(&self) -> &Arc<QueueManager> {
        &self.manager
    }

    /// Stop dispatching, interrupt running workers and wait for them.
    pub async fn shutdown(self) {
        tracing::info!("Engine shutting down");
        self.cancel.cancel();
        if tokio::time::timeout(DISPATCHER_STOP_TIMEOUT, self.dispatchers.wait())
            .await
            .is_err()
        {
            tracing::warn!("Dispatchers did not stop in time");
        }
        self.manager.shutdown().await;
        tracing::info!("Engine stopped");
    }
}
