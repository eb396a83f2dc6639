//! Background-task facility. Work spawned from a handler (CRM enqueue,
//! newsletter call) must outlive the request and finish before process
//! exit; dropping that guarantee loses form submissions silently.

use std::future::Future;

use tokio_util::task::TaskTracker;
use tracing::debug;

#[derive(Clone, Default)]
pub struct TaskSpawner {
    tracker: TaskTracker,
}

impl TaskSpawner {
    pub fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
        }
    }

    /// Spawn work tied to the process lifetime, not the request's.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(fut);
        metrics::counter!("tasks.spawned").increment(1);
    }

    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting work and wait for everything in flight. Called from
    /// the binary's shutdown path.
    pub async fn drain(&self) {
        self.tracker.close();
        debug!(pending = self.tracker.len(), "draining background tasks");
        self.tracker.wait().await;
    }
}
