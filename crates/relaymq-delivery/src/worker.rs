//! Delivery workers: claim one row, run its consumer, settle the row.
//!
//! Each iteration runs in its own outer transaction that holds the claimed
//! row's lock (`FOR UPDATE SKIP LOCKED`), so concurrent workers never see
//! the same row. The consumer runs in a nested transaction (a savepoint) on
//! the same connection. Its writes commit together with the row's deletion
//! or retry bookkeeping, and are discarded on failure while the bookkeeping
//! still commits. A row whose payload is not a message envelope is
//! dead-lettered without reaching its consumer.

use std::{any::Any, fmt, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use relaymq_core::{storage::Storage, Clock, CoreError, QueueId, QueueRow};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, Postgres, Transaction};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    consumer::{Consumer, Delivery},
    error::{DeliveryError, Result},
    registry::ConsumerRegistry,
    retry::{idle_backoff, RetryContext, RetryDecision, RetryPolicy},
};

/// `failed_reason` recorded for rows whose consumer is not registered.
pub const CONSUMER_NOT_FOUND: &str = "consumer not found";

/// `failed_reason` prefix for rows whose payload is not a message envelope.
pub const MESSAGE_DECODE_FAILED: &str = "message decode failed";

const SAVEPOINT: &str = "SAVEPOINT relaymq_consume";
const RELEASE_SAVEPOINT: &str = "RELEASE SAVEPOINT relaymq_consume";
const ROLLBACK_TO_SAVEPOINT: &str = "ROLLBACK TO SAVEPOINT relaymq_consume";

/// Configuration for the delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Number of concurrent delivery workers.
    pub worker_count: usize,

    /// Deadline for one claim/dispatch iteration, consumer included.
    pub claim_timeout: Duration,

    /// Upper bound of the random pause after an idle poll or a transient
    /// failure.
    pub idle_backoff_max: Duration,

    /// Retry schedule applied to failed consumer attempts.
    pub retry_policy: RetryPolicy,

    /// Shutdown timeout - maximum time to wait for workers to complete.
    pub shutdown_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            claim_timeout: Duration::from_secs(60),
            idle_backoff_max: Duration::from_secs(3),
            retry_policy: RetryPolicy::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl DeliveryConfig {
    /// Checks the configuration can run.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` for a zero worker count,
    /// a zero claim timeout, or an invalid retry policy.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(DeliveryError::configuration("worker_count must be at least 1"));
        }
        if self.claim_timeout.is_zero() {
            return Err(DeliveryError::configuration("claim_timeout must be positive"));
        }
        self.retry_policy.validate()
    }
}

/// Statistics for delivery engine monitoring.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Number of active delivery workers.
    pub active_workers: usize,
    /// Rows claimed since startup.
    pub rows_claimed: u64,
    /// Rows whose consumer succeeded (row deleted).
    pub rows_delivered: u64,
    /// Failed attempts that were rescheduled.
    pub rows_rescheduled: u64,
    /// Rows marked dead.
    pub rows_dead_lettered: u64,
    /// Iterations aborted by a store fault or the deadline.
    pub transient_failures: u64,
    /// Panics caught at the iteration boundary.
    pub panics_caught: u64,
}

/// What a single iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    /// No eligible row.
    Idle,
    /// Consumer succeeded, row deleted.
    Delivered {
        /// Deleted row
        id: QueueId,
    },
    /// Consumer failed, row deferred.
    Rescheduled {
        /// Deferred row
        id: QueueId,
        /// Failed attempts recorded on the row
        retry: u32,
        /// When the row becomes eligible again
        next_attempt_at: DateTime<Utc>,
    },
    /// Row marked dead.
    DeadLettered {
        /// Dead row
        id: QueueId,
        /// Recorded `failed_reason`
        reason: String,
    },
}

impl IterationOutcome {
    /// Whether the iteration found nothing to do.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

/// Bookkeeping applied to a claimed row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Delete the row.
    Delete,
    /// Count the failed attempt and defer the row.
    Reschedule {
        /// New `check_at`
        next_attempt_at: DateTime<Utc>,
        /// Consumer error text, for logging
        reason: String,
    },
    /// Mark the row dead.
    DeadLetter {
        /// Recorded `failed_reason`
        reason: String,
        /// Whether an attempt was made and must be counted
        count_attempt: bool,
    },
}

impl Transition {
    /// Transition for a row naming an unregistered consumer.
    pub fn consumer_missing() -> Self {
        Self::DeadLetter { reason: CONSUMER_NOT_FOUND.to_string(), count_attempt: false }
    }

    /// Transition for a row whose payload cannot be decoded.
    ///
    /// No attempt is made, so the retry count stays untouched.
    pub fn undecodable(detail: impl fmt::Display) -> Self {
        Self::DeadLetter {
            reason: format!("{MESSAGE_DECODE_FAILED}: {detail}"),
            count_attempt: false,
        }
    }

    /// Transition after an attempt on a row that had failed `retry` times.
    pub fn after_attempt(
        policy: &RetryPolicy,
        retry: u32,
        outcome: std::result::Result<(), String>,
        now: DateTime<Utc>,
    ) -> Self {
        let Err(reason) = outcome else {
            return Self::Delete;
        };

        match RetryContext::new(retry, reason.clone(), now).decide_retry(policy) {
            RetryDecision::Retry { next_attempt_at } => Self::Reschedule { next_attempt_at, reason },
            RetryDecision::GiveUp { reason } => Self::DeadLetter { reason, count_attempt: true },
        }
    }
}

/// Individual worker that processes queue rows one at a time.
pub struct DeliveryWorker {
    id: usize,
    storage: Arc<Storage>,
    registry: Arc<ConsumerRegistry>,
    config: DeliveryConfig,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl DeliveryWorker {
    /// Creates a new delivery worker with the given configuration.
    pub fn new(
        id: usize,
        storage: Arc<Storage>,
        registry: Arc<ConsumerRegistry>,
        config: DeliveryConfig,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { id, storage, registry, config, stats, cancellation_token, clock }
    }

    /// Main worker loop - processes rows until cancelled.
    ///
    /// Busy iterations follow each other immediately; an idle poll or a
    /// failed iteration is followed by a random pause. Cancellation is only
    /// observed between iterations, so an in-flight row is always committed
    /// or rolled back before the worker exits.
    ///
    /// # Errors
    ///
    /// Never returns an error; iteration failures are logged and retried.
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, "delivery worker starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                info!(worker_id = self.id, "delivery worker received shutdown signal");
                break;
            }

            match self.process_next().await {
                Ok(outcome) if !outcome.is_idle() => continue,
                Ok(_) => {},
                Err(error) => {
                    warn!(
                        worker_id = self.id,
                        error = %error,
                        transient = error.is_transient(),
                        "delivery iteration failed"
                    );
                },
            }

            let pause = idle_backoff(self.config.idle_backoff_max);
            tokio::select! {
                () = self.clock.sleep(pause) => {}
                () = self.cancellation_token.cancelled() => break,
            }
        }

        info!(worker_id = self.id, "delivery worker stopped");
        Ok(())
    }

    /// Runs one claim/dispatch iteration under the configured deadline.
    ///
    /// A panic anywhere in the iteration is caught here; the iteration's
    /// transaction is dropped and therefore rolled back.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` or
    /// `DeliveryError::DeadlineExceeded` for transient faults, and
    /// `DeliveryError::InternalError` for a caught panic.
    pub async fn process_next(&self) -> Result<IterationOutcome> {
        let timeout = self.config.claim_timeout;
        let iteration = tokio::time::timeout(timeout, self.claim_and_dispatch());

        let result = match AssertUnwindSafe(iteration).catch_unwind().await {
            Ok(Ok(result)) => result,
            Ok(Err(_elapsed)) => Err(DeliveryError::DeadlineExceeded { timeout }),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(worker_id = self.id, panic = %message, "delivery iteration panicked");
                self.stats.write().await.panics_caught += 1;
                return Err(DeliveryError::internal(format!("delivery iteration panicked: {message}")));
            },
        };

        if let Err(ref error) = result {
            if error.is_transient() {
                self.stats.write().await.transient_failures += 1;
            }
        }

        result
    }

    async fn claim_and_dispatch(&self) -> Result<IterationOutcome> {
        let pool = self.storage.queues.pool();
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| DeliveryError::database(format!("failed to open transaction: {e}")))?;

        let now = self.clock.now_utc();
        let Some(row) = self.storage.queues.claim_next_in_tx(&mut tx, now).await? else {
            tx.rollback().await?;
            return Ok(IterationOutcome::Idle);
        };

        self.stats.write().await.rows_claimed += 1;

        let decoded = row.decode_message();
        let span = info_span!(
            "consume",
            worker_id = self.id,
            queue_id = %row.id,
            consumer = %row.consumer_name,
            attempt = row.attempt_number(),
            request_id = decoded.as_ref().ok().and_then(|message| message.request_id()),
        );

        async move {
            let message = match decoded {
                Ok(message) => message,
                Err(CoreError::Serialization(detail)) => {
                    warn!(error = %detail, "queued row holds an undecodable message");
                    return self.settle(tx, &row, Transition::undecodable(detail)).await;
                },
                Err(other) => return Err(other.into()),
            };

            let Some(consumer) = self.registry.lookup(&row.consumer_name).cloned() else {
                warn!("queued row names an unregistered consumer");
                return self.settle(tx, &row, Transition::consumer_missing()).await;
            };

            let delivery = Delivery::from_row(&row, message);
            let outcome = self.invoke(&mut tx, consumer.as_ref(), &delivery).await?;
            let transition = Transition::after_attempt(
                &self.config.retry_policy,
                row.retry_count(),
                outcome,
                self.clock.now_utc(),
            );

            self.settle(tx, &row, transition).await
        }
        .instrument(span)
        .await
    }

    /// Runs the consumer inside a savepoint and reports its outcome.
    ///
    /// The savepoint is released on success and rolled back on failure or
    /// panic. A consumer that returns `Ok` after swallowing a database error
    /// leaves the transaction aborted; its release fails, so the attempt is
    /// rolled back and counted as failed. Failing to roll back aborts the
    /// iteration.
    async fn invoke(
        &self,
        conn: &mut PgConnection,
        consumer: &dyn Consumer,
        delivery: &Delivery,
    ) -> Result<std::result::Result<(), String>> {
        sqlx::query(SAVEPOINT).execute(&mut *conn).await?;

        let result = AssertUnwindSafe(consumer.consume(&mut *conn, delivery)).catch_unwind().await;
        let mut outcome = match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(format!("{error:#}")),
            Err(panic) => {
                self.stats.write().await.panics_caught += 1;
                Err(format!("consumer panicked: {}", panic_message(panic.as_ref())))
            },
        };

        if outcome.is_ok() {
            if let Err(error) = sqlx::query(RELEASE_SAVEPOINT).execute(&mut *conn).await {
                outcome = Err(format!("consumer left its transaction aborted: {error}"));
            }
        }

        if let Err(ref reason) = outcome {
            debug!(reason = %reason, "consumer failed, rolling back its writes");
            sqlx::query(ROLLBACK_TO_SAVEPOINT).execute(&mut *conn).await?;
        }

        Ok(outcome)
    }

    async fn settle(
        &self,
        mut tx: Transaction<'_, Postgres>,
        row: &QueueRow,
        transition: Transition,
    ) -> Result<IterationOutcome> {
        let queues = &self.storage.queues;

        let outcome = match transition {
            Transition::Delete => {
                queues.delete_in_tx(&mut tx, row.id).await?;
                IterationOutcome::Delivered { id: row.id }
            },
            Transition::Reschedule { next_attempt_at, reason } => {
                queues.reschedule_in_tx(&mut tx, row.id, next_attempt_at).await?;
                warn!(
                    retry = row.retry_count() + 1,
                    next_attempt_at = %next_attempt_at,
                    reason = %reason,
                    "consumer failed, delivery rescheduled"
                );
                IterationOutcome::Rescheduled {
                    id: row.id,
                    retry: row.retry_count() + 1,
                    next_attempt_at,
                }
            },
            Transition::DeadLetter { reason, count_attempt } => {
                if count_attempt {
                    queues.mark_exhausted_in_tx(&mut tx, row.id, &reason).await?;
                } else {
                    queues.mark_dead_in_tx(&mut tx, row.id, &reason).await?;
                }
                error!(reason = %reason, "delivery dead-lettered");
                IterationOutcome::DeadLettered { id: row.id, reason }
            },
        };

        tx.commit().await?;

        let mut stats = self.stats.write().await;
        match outcome {
            IterationOutcome::Delivered { .. } => {
                stats.rows_delivered += 1;
                debug!("message delivered");
            },
            IterationOutcome::Rescheduled { .. } => stats.rows_rescheduled += 1,
            IterationOutcome::DeadLettered { .. } => stats.rows_dead_lettered += 1,
            IterationOutcome::Idle => {},
        }

        Ok(outcome)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
