//! Publishing and delivery for the relaymq transactional outbox.
//!
//! Producers publish a [`Message`](relaymq_core::Message) through a
//! [`Provider`] inside their own database transaction; one queue row is
//! written per subscribed [`Consumer`]. The [`DeliveryEngine`] runs workers
//! that claim eligible rows one at a time and invoke the row's consumer.
//!
//! # Architecture
//!
//! Each worker iteration:
//!
//! 1. **Claim** - lock the oldest eligible row with `FOR UPDATE SKIP LOCKED`
//! 2. **Resolve** - look the row's consumer up in the [`ConsumerRegistry`];
//!    unknown names are dead-lettered
//! 3. **Consume** - run the consumer inside a nested transaction
//! 4. **Settle** - delete the row, reschedule it per the [`RetryPolicy`], or
//!    mark it dead, then commit
//!
//! Delivery is at-least-once: a crash between a consumer's side effects and
//! the commit re-delivers the row, so consumers must be idempotent.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use relaymq_delivery::{ConsumerRegistry, DeliveryConfig, DeliveryEngine, DeliveryError};
//! use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> std::result::Result<(), DeliveryError> {
//! let registry = Arc::new(ConsumerRegistry::builder().build());
//! let mut engine = DeliveryEngine::new(pool, registry, DeliveryConfig::default())?;
//!
//! engine.start().await;
//! # engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod consumer;
pub mod engine;
pub mod error;
pub mod provider;
pub mod registry;
pub mod retry;
pub mod worker;
pub mod worker_pool;

pub use consumer::{Consumer, Delivery};
pub use engine::DeliveryEngine;
pub use error::{DeliveryError, Result};
pub use provider::{Provider, ProviderConfig};
pub use registry::{ConsumerRegistry, RegistryBuilder};
pub use retry::RetryPolicy;
pub use worker::{
    DeliveryConfig, EngineStats, IterationOutcome, Transition, CONSUMER_NOT_FOUND,
    MESSAGE_DECODE_FAILED,
};

/// Default number of concurrent delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 1;

/// Default attempt budget per queued row.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
