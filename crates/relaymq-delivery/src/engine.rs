//! Delivery engine coordinating the worker pool.

use std::sync::Arc;

use relaymq_core::{storage::Storage, Clock, RealClock};
use sqlx::PgPool;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    error::Result,
    registry::ConsumerRegistry,
    worker::{DeliveryConfig, DeliveryWorker, EngineStats, IterationOutcome},
    worker_pool::WorkerPool,
};

/// Main delivery engine coordinating delivery workers.
///
/// The engine receives the frozen consumer registry explicitly; it never
/// consults process-wide state to resolve a row's consumer.
pub struct DeliveryEngine {
    storage: Arc<Storage>,
    registry: Arc<ConsumerRegistry>,
    config: DeliveryConfig,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
    clock: Arc<dyn Clock>,
}

impl DeliveryEngine {
    /// Creates a delivery engine using the system clock.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if `config` is invalid.
    pub fn new(pool: PgPool, registry: Arc<ConsumerRegistry>, config: DeliveryConfig) -> Result<Self> {
        Self::with_clock(Arc::new(Storage::new(pool)), registry, config, Arc::new(RealClock::new()))
    }

    /// Creates a delivery engine over existing storage with an injected
    /// clock.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if `config` is invalid.
    pub fn with_clock(
        storage: Arc<Storage>,
        registry: Arc<ConsumerRegistry>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            storage,
            registry,
            config,
            stats: Arc::new(RwLock::new(EngineStats::default())),
            cancellation_token: CancellationToken::new(),
            worker_pool: None,
            clock,
        })
    }

    /// Starts the delivery engine with configured worker pool.
    ///
    /// Returns immediately after spawning workers. Use `shutdown()` to stop
    /// gracefully.
    pub async fn start(&mut self) {
        info!(
            worker_count = self.config.worker_count,
            consumers = self.registry.len(),
            "starting delivery engine"
        );

        let mut worker_pool = WorkerPool::new(
            self.storage.clone(),
            self.registry.clone(),
            self.config.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.clock.clone(),
        );
        worker_pool.spawn_workers().await;
        self.worker_pool = Some(worker_pool);

        info!("delivery engine started");
    }

    /// Gracefully shuts down the delivery engine.
    ///
    /// Signals all workers to stop claiming and waits for in-flight
    /// iterations to finish.
    ///
    /// # Errors
    ///
    /// Returns error if graceful shutdown fails or times out.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");

        if let Some(worker_pool) = self.worker_pool.take() {
            worker_pool.shutdown_graceful(self.config.shutdown_timeout).await?;
        } else {
            info!("delivery engine was not started, shutdown completed immediately");
        }
        Ok(())
    }

    /// Returns current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Runs exactly one claim/dispatch iteration on the calling task.
    ///
    /// Does not start background workers. Intended for tests and for
    /// callers that drive delivery themselves.
    ///
    /// # Errors
    ///
    /// Returns the iteration's transient or internal error.
    pub async fn process_once(&self) -> Result<IterationOutcome> {
        self.worker(0).process_next().await
    }

    /// Runs iterations until one finds nothing eligible, at most `limit`.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first failed iteration.
    pub async fn process_until_idle(&self, limit: usize) -> Result<Vec<IterationOutcome>> {
        let worker = self.worker(0);
        let mut outcomes = Vec::new();

        for _ in 0..limit {
            let outcome = worker.process_next().await?;
            if outcome.is_idle() {
                break;
            }
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    /// Storage the engine claims from.
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    fn worker(&self, id: usize) -> DeliveryWorker {
        DeliveryWorker::new(
            id,
            self.storage.clone(),
            self.registry.clone(),
            self.config.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.clock.clone(),
        )
    }
}
