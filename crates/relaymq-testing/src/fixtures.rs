//! Scripted consumers for exercising the delivery engine.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use relaymq_core::{Event, Message, QueueId};
use relaymq_delivery::{Consumer, Delivery};
use sqlx::PgConnection;

/// What a scripted consumer does on one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Return `Ok(())`.
    Succeed,
    /// Return an error with this text.
    Fail(String),
    /// Panic with this text.
    Panic(String),
}

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// Row being delivered.
    pub queue_id: QueueId,
    /// One-based attempt number.
    pub attempt: u32,
    /// Correlation id restored from the envelope.
    pub request_id: Option<String>,
    /// Delivered envelope.
    pub message: Message,
}

/// Shared view of a consumer's invocations, usable after the consumer was
/// moved into a registry.
#[derive(Debug, Clone, Default)]
pub struct InvocationLog {
    inner: Arc<Mutex<Vec<Invocation>>>,
}

impl InvocationLog {
    fn push(&self, invocation: Invocation) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).push(invocation);
    }

    /// All invocations so far, in order.
    pub fn all(&self) -> Vec<Invocation> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of invocations so far.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the consumer was never invoked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue ids in invocation order.
    pub fn queue_ids(&self) -> Vec<QueueId> {
        self.all().into_iter().map(|invocation| invocation.queue_id).collect()
    }
}

/// Consumer whose behaviour is fixed up front.
///
/// Steps are taken in order; once the script is exhausted every further
/// invocation takes the fallback step (succeed unless configured otherwise).
pub struct ScriptedConsumer {
    name: String,
    event: Event,
    delay: Duration,
    latency: Duration,
    record_effects: bool,
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    log: InvocationLog,
}

impl ScriptedConsumer {
    /// Consumer of `event` that always succeeds.
    pub fn new(name: impl Into<String>, event: Event) -> Self {
        Self {
            name: name.into(),
            event,
            delay: Duration::ZERO,
            latency: Duration::ZERO,
            record_effects: false,
            script: Mutex::new(VecDeque::new()),
            fallback: Step::Succeed,
            log: InvocationLog::default(),
        }
    }

    /// Consumer of `event` that always fails with `reason`.
    pub fn failing(name: impl Into<String>, event: Event, reason: impl Into<String>) -> Self {
        Self::new(name, event).otherwise(Step::Fail(reason.into()))
    }

    /// Sets the publish delay.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sleeps this long inside every invocation.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Writes a `consumer_effects` row through the nested transaction before
    /// taking the step.
    #[must_use]
    pub fn recording_effects(mut self) -> Self {
        self.record_effects = true;
        self
    }

    /// Appends a step to the script.
    #[must_use]
    pub fn then(self, step: Step) -> Self {
        self.script.lock().unwrap_or_else(PoisonError::into_inner).push_back(step);
        self
    }

    /// Sets the step taken once the script is exhausted.
    #[must_use]
    pub fn otherwise(mut self, step: Step) -> Self {
        self.fallback = step;
        self
    }

    /// Handle to the invocation log.
    pub fn log(&self) -> InvocationLog {
        self.log.clone()
    }

    fn next_step(&self) -> Step {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl Consumer for ScriptedConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    fn event(&self) -> Event {
        self.event.clone()
    }

    fn delay(&self) -> Duration {
        self.delay
    }

    async fn consume(&self, conn: &mut PgConnection, delivery: &Delivery) -> anyhow::Result<()> {
        self.log.push(Invocation {
            queue_id: delivery.queue_id(),
            attempt: delivery.attempt(),
            request_id: delivery.request_id().map(str::to_owned),
            message: delivery.message().clone(),
        });

        if self.record_effects {
            sqlx::query(
                "INSERT INTO consumer_effects (consumer_name, queue_id, attempt, request_id) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(&self.name)
            .bind(delivery.queue_id())
            .bind(i32::try_from(delivery.attempt()).unwrap_or(i32::MAX))
            .bind(delivery.request_id())
            .execute(&mut *conn)
            .await?;
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match self.next_step() {
            Step::Succeed => Ok(()),
            Step::Fail(reason) => Err(anyhow::anyhow!(reason)),
            Step::Panic(reason) => panic!("{reason}"),
        }
    }
}
