//! The consumer capability: a named subscriber to one event.

use std::time::Duration;

use async_trait::async_trait;
use relaymq_core::{Event, Message, QueueId, QueueRow, RequestContext};
use sqlx::PgConnection;

/// A named unit of work that reacts to one event.
///
/// Names must be unique across the process; the recommended convention is
/// `{service}:{internal}:{event}`, e.g. `notify:order:order_created`. A
/// consumer is invoked at least once per published message and must be
/// idempotent.
///
/// `consume` runs inside a nested transaction on `conn`. Everything written
/// through `conn` commits with the queue bookkeeping when `consume` returns
/// `Ok`, and is rolled back when it returns `Err` or panics. Returning `Ok`
/// after a statement on `conn` failed still counts as a failed attempt,
/// since the transaction can no longer commit. The returned
/// error text (alternate form, i.e. with its context chain) is recorded as
/// the row's `failed_reason` once retries are exhausted.
#[async_trait]
pub trait Consumer: Send + Sync + 'static {
    /// Unique consumer name.
    fn name(&self) -> &str;

    /// Event this consumer subscribes to.
    fn event(&self) -> Event;

    /// How long after publish the first delivery becomes eligible.
    fn delay(&self) -> Duration {
        Duration::ZERO
    }

    /// Handles one delivery.
    async fn consume(&self, conn: &mut PgConnection, delivery: &Delivery) -> anyhow::Result<()>;
}

/// One delivery attempt of a queued message.
#[derive(Debug, Clone)]
pub struct Delivery {
    queue_id: QueueId,
    attempt: u32,
    message: Message,
    context: RequestContext,
}

impl Delivery {
    /// Creates a delivery of `message` for the given attempt.
    ///
    /// The request context is restored from the envelope.
    pub fn new(queue_id: QueueId, attempt: u32, message: Message) -> Self {
        let context = RequestContext::from_message(&message);
        Self { queue_id, attempt, message, context }
    }

    /// Creates the delivery a claim of `row` performs, given its decoded
    /// envelope.
    pub fn from_row(row: &QueueRow, message: Message) -> Self {
        Self::new(row.id, row.attempt_number(), message)
    }

    /// Row being delivered.
    pub fn queue_id(&self) -> QueueId {
        self.queue_id
    }

    /// One-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The published envelope.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Context of the request that published the message.
    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    /// Correlation id of the request that published the message.
    pub fn request_id(&self) -> Option<&str> {
        self.context.request_id()
    }
}
