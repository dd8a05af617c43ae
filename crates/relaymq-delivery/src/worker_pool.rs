//! Worker pool management with structured concurrency.
//!
//! Spawns the configured number of delivery workers sharing one
//! cancellation token, and joins them on shutdown within a timeout.

use std::{sync::Arc, time::Duration};

use relaymq_core::{storage::Storage, Clock};
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::{DeliveryError, Result},
    registry::ConsumerRegistry,
    worker::{DeliveryConfig, DeliveryWorker, EngineStats},
};

/// Worker pool that manages delivery worker tasks with supervision.
pub struct WorkerPool {
    storage: Arc<Storage>,
    registry: Arc<ConsumerRegistry>,
    config: DeliveryConfig,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<Result<()>>>,
    clock: Arc<dyn Clock>,
}

impl WorkerPool {
    /// Create a new worker pool with the given configuration.
    pub fn new(
        storage: Arc<Storage>,
        registry: Arc<ConsumerRegistry>,
        config: DeliveryConfig,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            registry,
            config,
            stats,
            cancellation_token,
            worker_handles: Vec::new(),
            clock,
        }
    }

    /// Spawn all configured workers and begin processing.
    ///
    /// Workers run until the cancellation token fires. Returns immediately
    /// after spawning.
    pub async fn spawn_workers(&mut self) {
        info!(worker_count = self.config.worker_count, "spawning delivery workers");

        self.stats.write().await.active_workers = self.config.worker_count;

        for worker_id in 0..self.config.worker_count {
            let worker = DeliveryWorker::new(
                worker_id,
                self.storage.clone(),
                self.registry.clone(),
                self.config.clone(),
                self.stats.clone(),
                self.cancellation_token.clone(),
                self.clock.clone(),
            );

            let handle = tokio::spawn(async move {
                let result = worker.run().await;

                if let Err(ref error) = result {
                    error!(worker_id, error = %error, "delivery worker terminated with error");
                }

                result
            });

            self.worker_handles.push(handle);
        }

        info!(spawned_workers = self.worker_handles.len(), "all delivery workers spawned");
    }

    /// Gracefully shutdown all workers, waiting for in-flight iterations to
    /// commit or roll back.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if workers do not stop in
    /// time, or `DeliveryError::WorkerPanic` for the first worker task that
    /// panicked.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.worker_handles);
        let stats = self.stats.clone();
        let shutdown_future = async move {
            let mut first_panic = None;

            for (worker_id, handle) in handles.into_iter().enumerate() {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(worker_id, error = %error, "worker completed with error during shutdown");
                    },
                    Err(join_error) => {
                        error!(worker_id, error = %join_error, "worker task panicked during shutdown");
                        first_panic.get_or_insert(DeliveryError::WorkerPanic {
                            worker_id,
                            error: join_error.to_string(),
                        });
                    },
                }
            }

            stats.write().await.active_workers = 0;
            first_panic
        };

        match tokio::time::timeout(timeout, shutdown_future).await {
            Ok(None) => {
                info!("worker pool shutdown completed");
                Ok(())
            },
            Ok(Some(panic)) => Err(panic),
            Err(_timeout) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }

    /// Number of spawned workers that have not finished.
    pub fn active_workers(&self) -> usize {
        self.worker_handles.iter().filter(|h| !h.is_finished()).count()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active_count = self.active_workers();

        if active_count > 0 && !self.cancellation_token.is_cancelled() {
            error!(
                active_workers = active_count,
                "worker pool dropped without shutdown, cancelling workers"
            );
            self.cancellation_token.cancel();
        }
    }
}
