//! Test infrastructure for relaymq.
//!
//! Provides per-test schema isolation on a real PostgreSQL server,
//! deterministic time through a shared [`TestClock`], and scripted consumers
//! whose invocations can be inspected after they were moved into a
//! registry.
//!
//! Database tests are written against [`TestEnv::run_isolated_test`]. When
//! `DATABASE_URL` is not set they are skipped, so the suite passes on
//! machines without a database.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::{future::Future, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use relaymq_core::{storage::Storage, Clock, Message, NewQueueRow, QueueId, QueueRow};
use relaymq_delivery::{
    ConsumerRegistry, DeliveryConfig, DeliveryEngine, Provider, ProviderConfig,
};
use sqlx::PgPool;
use tracing::warn;

pub mod database;
pub mod fixtures;

pub use database::{database_url, TestDatabase};
pub use fixtures::{Invocation, InvocationLog, ScriptedConsumer, Step};
pub use relaymq_core::TestClock;

/// Row written by a consumer created with
/// [`ScriptedConsumer::recording_effects`].
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ConsumerEffect {
    /// Consumer that wrote the row
    pub consumer_name: String,
    /// Queue row being delivered at the time
    pub queue_id: QueueId,
    /// Attempt number
    pub attempt: i32,
    /// Correlation id seen by the consumer
    pub request_id: Option<String>,
}

/// Test environment bound to one isolated schema.
pub struct TestEnv {
    /// Deterministic clock shared with every provider and engine built here
    pub clock: TestClock,
    database: TestDatabase,
    storage: Arc<Storage>,
}

impl TestEnv {
    /// Runs `test` against a fresh schema and drops the schema afterwards.
    ///
    /// Skips the test (returning `Ok`) when `DATABASE_URL` is not set.
    pub async fn run_isolated_test<F, Fut>(test: F) -> Result<()>
    where
        F: FnOnce(TestEnv) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        init_test_tracing();

        let Some(url) = database_url() else {
            warn!("DATABASE_URL is not set, skipping database test");
            return Ok(());
        };

        let env = Self::connect(&url).await?;
        let pool = env.pool().clone();
        let schema = env.database.schema().to_owned();

        let result = test(env).await;

        pool.close().await;
        let cleanup = TestDatabase::drop_by_name(&url, &schema).await;

        result.and(cleanup)
    }

    /// Connects to `url` and creates an isolated schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let database = TestDatabase::isolated(url).await?;
        let storage = Arc::new(Storage::new(database.pool().clone()));

        Ok(Self { clock: TestClock::new(), database, storage })
    }

    /// Pool scoped to this test's schema.
    pub fn pool(&self) -> &PgPool {
        self.database.pool()
    }

    /// Storage over this test's schema.
    pub fn storage(&self) -> Arc<Storage> {
        self.storage.clone()
    }

    /// The test clock as a trait object.
    pub fn clock_arc(&self) -> Arc<dyn Clock> {
        Arc::new(self.clock.clone())
    }

    /// Advances the test clock.
    pub fn advance(&self, duration: Duration) {
        self.clock.advance(duration);
    }

    /// Publisher over `registry` that rejects unsubscribed events.
    pub fn provider(&self, registry: Arc<ConsumerRegistry>) -> Provider {
        self.provider_with(registry, ProviderConfig::default())
    }

    /// Publisher over `registry` with explicit configuration.
    pub fn provider_with(&self, registry: Arc<ConsumerRegistry>, config: ProviderConfig) -> Provider {
        Provider::new(registry, self.storage(), self.clock_arc(), config)
    }

    /// Delivery engine over `registry` driven by the test clock.
    pub fn engine(&self, registry: Arc<ConsumerRegistry>, config: DeliveryConfig) -> Result<DeliveryEngine> {
        DeliveryEngine::with_clock(self.storage(), registry, config, self.clock_arc())
            .context("failed to build delivery engine")
    }

    /// Publishes `message` in its own committed transaction.
    pub async fn publish(&self, provider: &Provider, message: &Message) -> Result<Vec<QueueId>> {
        let mut tx = self.pool().begin().await?;
        let ids = provider.publish(&mut tx, message).await?;
        tx.commit().await?;
        Ok(ids)
    }

    /// Inserts a row directly, bypassing the registry.
    pub async fn insert_row(&self, consumer_name: &str, message: Message) -> Result<QueueId> {
        let row = NewQueueRow::new(consumer_name, message, self.clock.now_utc(), Duration::ZERO);
        let ids = self.storage.queues.insert_batch(&[row]).await?;
        ids.into_iter().next().context("insert returned no id")
    }

    /// Inserts a row whose payload is stored verbatim, envelope or not.
    pub async fn insert_raw_row(&self, consumer_name: &str, payload: serde_json::Value) -> Result<QueueId> {
        let id = sqlx::query_scalar::<_, QueueId>(
            "INSERT INTO queues (consumer_name, message, check_at) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(consumer_name)
        .bind(sqlx::types::Json(payload))
        .bind(self.clock.now_utc())
        .fetch_one(self.pool())
        .await?;

        Ok(id)
    }

    /// Looks a row up by id.
    pub async fn find_row(&self, id: QueueId) -> Result<Option<QueueRow>> {
        Ok(self.storage.queues.find_by_id(id).await?)
    }

    /// Every row in the schema, in id order.
    pub async fn all_rows(&self) -> Result<Vec<QueueRow>> {
        let rows = sqlx::query_as::<_, QueueRow>(
            r#"
            SELECT id, consumer_name, message, retry, is_dead, failed_reason, check_at, created_at
            FROM queues
            ORDER BY id ASC
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }

    /// Effects committed by `consumer_name`, in write order.
    pub async fn effects_for(&self, consumer_name: &str) -> Result<Vec<ConsumerEffect>> {
        let effects = sqlx::query_as::<_, ConsumerEffect>(
            r#"
            SELECT consumer_name, queue_id, attempt, request_id
            FROM consumer_effects
            WHERE consumer_name = $1
            ORDER BY id ASC
            "#,
        )
        .bind(consumer_name)
        .fetch_all(self.pool())
        .await?;

        Ok(effects)
    }
}

/// Installs a test-writer tracing subscriber once per process.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error")),
        )
        .with_test_writer()
        .try_init();
}
