//! Publishing: fan a message out to every subscribed consumer.
//!
//! A publish writes one queue row per subscriber on the caller's connection.
//! The rows commit or roll back together with the caller's business writes,
//! which is what makes the outbox transactional.

use std::sync::Arc;

use relaymq_core::{storage::Storage, Clock, Message, NewQueueRow, QueueId};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use tracing::{debug, warn};

use crate::{
    error::{DeliveryError, Result},
    registry::ConsumerRegistry,
};

/// Publisher behaviour toggles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Treat publishing an event nobody subscribes to as a logged no-op
    /// instead of an error.
    pub tolerate_unsubscribed: bool,
}

/// Publishes messages into the outbox.
#[derive(Clone)]
pub struct Provider {
    registry: Arc<ConsumerRegistry>,
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
    config: ProviderConfig,
}

impl Provider {
    /// Creates a publisher over a frozen registry.
    pub fn new(
        registry: Arc<ConsumerRegistry>,
        storage: Arc<Storage>,
        clock: Arc<dyn Clock>,
        config: ProviderConfig,
    ) -> Self {
        Self { registry, storage, clock, config }
    }

    /// Computes the rows a publish of `message` writes.
    ///
    /// One row per subscriber of the message's event, each eligible at the
    /// current time plus that consumer's delay. Every row carries the same
    /// envelope.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::UnsubscribedEvent` when nothing subscribes to
    /// the event and the provider is not configured to tolerate that.
    pub fn plan(&self, message: &Message) -> Result<Vec<NewQueueRow>> {
        let subscribers = self.registry.subscribers(message.event());

        if subscribers.is_empty() && !self.config.tolerate_unsubscribed {
            return Err(DeliveryError::unsubscribed(message.event().as_str()));
        }

        let published_at = self.clock.now_utc();
        let rows = subscribers
            .iter()
            .map(|consumer| {
                NewQueueRow::new(consumer.name(), message.clone(), published_at, consumer.delay())
            })
            .collect();

        Ok(rows)
    }

    /// Publishes `message` inside the caller's transaction.
    ///
    /// Pass `&mut *tx` for a `sqlx::Transaction`. Nothing is committed here:
    /// the rows become visible when the caller commits and vanish if the
    /// caller rolls back.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::UnsubscribedEvent` as for [`Provider::plan`],
    /// or `DeliveryError::DatabaseError` if the insert fails. On error the
    /// caller should roll back its transaction.
    pub async fn publish(&self, conn: &mut PgConnection, message: &Message) -> Result<Vec<QueueId>> {
        let rows = self.plan(message)?;

        if rows.is_empty() {
            warn!(
                event = %message.event(),
                request_id = message.request_id(),
                "published event has no subscribers, nothing queued"
            );
            return Ok(Vec::new());
        }

        let ids = self
            .storage
            .queues
            .insert_batch_in_tx(conn, &rows)
            .await
            .map_err(|e| DeliveryError::database(format!("error inserting message queue: {e}")))?;

        debug!(
            event = %message.event(),
            request_id = message.request_id(),
            row_count = ids.len(),
            "message queued for subscribers"
        );

        Ok(ids)
    }

    /// The registry this provider fans out over.
    pub fn registry(&self) -> &Arc<ConsumerRegistry> {
        &self.registry
    }
}
