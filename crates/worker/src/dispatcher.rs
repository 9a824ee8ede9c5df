//! Per-class dispatcher loop.
//!
//! Wakes on submission, on a freed slot and on a periodic tick (which
//! also picks up rows inserted by other processes), and runs one
//! [`QueueManager::try_dispatch`] round each time.

use std::sync::Arc;
use std::time::Duration;

use atelier_core::job_class::JobClass;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::queue::QueueManager;

pub struct ClassDispatcher {
    class: JobClass,
    manager: Arc<QueueManager>,
    poll_interval: Duration,
}

impl ClassDispatcher {
    pub fn new(class: JobClass, manager: Arc<QueueManager>) -> Self {
        let poll_interval = manager.config().poll_interval;
        Self {
            class,
            manager,
            poll_interval,
        }
    }

    /// Run the dispatcher loop until the cancellation token is triggered.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let wake = self.manager.wakeup_signal(self.class);
        tracing::info!(
            job_class = %self.class,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Dispatcher started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(job_class = %self.class, "Dispatcher shutting down");
                    break;
                }
                _ = ticker.tick() => self.dispatch_round().await,
                _ = wake.notified() => self.dispatch_round().await,
            }
        }
    }

    async fn dispatch_round(&self) {
        match self.manager.try_dispatch(self.class).await {
            Ok(0) => {}
            Ok(started) => {
                tracing::debug!(job_class = %self.class, started, "Dispatch round started jobs");
            }
            Err(e) => {
                tracing::error!(job_class = %self.class, error = %e, "Dispatch cycle failed");
            }
        }
    }
}
