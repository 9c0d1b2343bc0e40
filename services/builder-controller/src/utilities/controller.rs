use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::{sync::watch, task::JoinSet};
use tracing::{error, info, warn};

use crate::{
    error::AppError,
    utilities::{notifier::WorkKey, reconciler::Reconcile, work_queue::WorkQueue},
};

/// Drains the work queue with a fixed pool of workers.
pub struct Controller {
    queue: Arc<WorkQueue<WorkKey>>,
    reconciler: Arc<dyn Reconcile>,
    max_retries: u32,
    ready: Arc<AtomicBool>,
}

impl Controller {
    pub fn new(
        queue: Arc<WorkQueue<WorkKey>>,
        reconciler: Arc<dyn Reconcile>,
        max_retries: u32,
        ready: Arc<AtomicBool>,
    ) -> Self {
        Self {
            queue,
            reconciler,
            max_retries,
            ready,
        }
    }

    /// Waits for the caches, then runs `workers` workers until shutdown.
    /// In-flight items finish before this returns.
    pub async fn run(
        self: Arc<Self>,
        workers: usize,
        caches_synced: impl Future<Output = bool>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), AppError> {
        info!("⏳ Waiting for informer caches to sync");
        tokio::select! {
            synced = caches_synced => {
                if !synced {
                    self.queue.shut_down();
                    return Err(AppError::InternalServerError(
                        "failed to wait for caches to sync".to_string(),
                    ));
                }
            }
            _ = wait_for_shutdown(&mut shutdown) => {
                self.queue.shut_down();
                return Ok(());
            }
        }

        self.ready.store(true, Ordering::SeqCst);
        info!(workers, "🚀 Starting workers");

        let mut pool = JoinSet::new();
        for worker in 0..workers.max(1) {
            let controller = Arc::clone(&self);
            pool.spawn(async move {
                while controller.process_next_item().await {}
                info!(worker, "Worker stopped");
            });
        }

        wait_for_shutdown(&mut shutdown).await;
        info!("🛑 Shutting down workers");
        self.ready.store(false, Ordering::SeqCst);
        self.queue.shut_down();

        while let Some(result) = pool.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "❌ Worker panicked");
            }
        }

        Ok(())
    }

    /// Handles one item; `false` once the queue has shut down.
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        match self.reconciler.sync(&key).await {
            Ok(()) => {
                self.queue.forget(&key);
                info!(name = %key.name, "✅ Successfully synced");
            }
            Err(e) => self.handle_error(&key, e).await,
        }

        self.queue.done(&key);
        true
    }

    async fn handle_error(&self, key: &WorkKey, err: AppError) {
        let attempt = self.queue.num_requeues(key) + 1;

        if attempt < self.max_retries {
            warn!(name = %key.name, attempt, error = %err, "🔁 Sync failed, requeueing");
            self.queue.add_rate_limited(key.clone());
            return;
        }

        error!(name = %key.name, attempt, error = %err, "❌ Sync failed, giving up");
        if let Err(e) = self.reconciler.mark_failed(key).await {
            error!(name = %key.name, error = %e, "❌ Failed to record Failed state");
        }
        self.queue.forget(key);
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
