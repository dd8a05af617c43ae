//! Integration tests for the delivery engine.
//!
//! Drives claim/dispatch iterations against an isolated schema with a
//! deterministic clock. Skipped when `DATABASE_URL` is not set.

use std::{collections::HashSet, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use relaymq_core::{Clock, Event, Message, RequestContext, RowState};
use relaymq_delivery::{
    Consumer, ConsumerRegistry, Delivery, DeliveryConfig, DeliveryError, IterationOutcome,
    RetryPolicy, CONSUMER_NOT_FOUND, MESSAGE_DECODE_FAILED,
};
use relaymq_testing::{ScriptedConsumer, Step, TestEnv};
use serde_json::json;
use sqlx::PgConnection;

const NOTIFY: &str = "notify:order:order_created";

fn order_created(order_id: i64) -> Message {
    Message::new(Event::ORDER_CREATED).with_field("order_id", order_id).unwrap()
}

fn registry_with(consumer: impl Consumer) -> Arc<ConsumerRegistry> {
    let mut builder = ConsumerRegistry::builder();
    builder.register(consumer).unwrap();
    Arc::new(builder.build())
}

/// Reports success after a statement of its own failed.
struct SwallowsSqlError;

#[async_trait]
impl Consumer for SwallowsSqlError {
    fn name(&self) -> &str {
        NOTIFY
    }

    fn event(&self) -> Event {
        Event::ORDER_CREATED
    }

    async fn consume(&self, conn: &mut PgConnection, _delivery: &Delivery) -> anyhow::Result<()> {
        let _ = sqlx::query("SELECT 1 / 0").execute(&mut *conn).await;
        Ok(())
    }
}

#[tokio::test]
async fn successful_delivery_deletes_row() -> Result<()> {
    TestEnv::run_isolated_test(|env| async move {
        let consumer = ScriptedConsumer::new(NOTIFY, Event::ORDER_CREATED);
        let log = consumer.log();
        let registry = registry_with(consumer);
        let provider = env.provider(registry.clone());
        let engine = env.engine(registry, DeliveryConfig::default())?;

        let ctx = RequestContext::new().with_request_id("req-42");
        let ids = env.publish(&provider, &order_created(7).encode(&ctx)).await?;

        let outcome = engine.process_once().await?;
        assert_eq!(outcome, IterationOutcome::Delivered { id: ids[0] });
        assert!(env.find_row(ids[0]).await?.is_none());

        let invocations = log.all();
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].attempt, 1);
        assert_eq!(invocations[0].request_id.as_deref(), Some("req-42"));
        assert_eq!(invocations[0].message.field::<i64>("order_id")?, Some(7));

        assert!(engine.process_once().await?.is_idle());

        let stats = engine.stats().await;
        assert_eq!(stats.rows_claimed, 1);
        assert_eq!(stats.rows_delivered, 1);
        Ok(())
    })
    .await
}

#[tokio::test]
async fn failed_delivery_is_rescheduled_by_schedule() -> Result<()> {
    TestEnv::run_isolated_test(|env| async move {
        let consumer = ScriptedConsumer::new(NOTIFY, Event::ORDER_CREATED)
            .then(Step::Fail("smtp unavailable".into()));
        let log = consumer.log();
        let registry = registry_with(consumer);
        let provider = env.provider(registry.clone());
        let engine = env.engine(registry, DeliveryConfig::default())?;

        let ids = env.publish(&provider, &order_created(1)).await?;
        let failed_at = env.clock.now_utc();

        let outcome = engine.process_once().await?;
        assert_eq!(outcome, IterationOutcome::Rescheduled {
            id: ids[0],
            retry: 1,
            next_attempt_at: failed_at + chrono::Duration::seconds(2),
        });

        let row = env.find_row(ids[0]).await?.expect("row is kept for retry");
        assert_eq!(row.retry_count(), 1);
        assert_eq!(row.state(), RowState::Pending);

        // Not eligible until the first scheduled delay has passed.
        env.advance(Duration::from_secs(1));
        assert!(engine.process_once().await?.is_idle());

        env.advance(Duration::from_secs(1));
        assert_eq!(engine.process_once().await?, IterationOutcome::Delivered { id: ids[0] });

        let attempts: Vec<u32> = log.all().iter().map(|i| i.attempt).collect();
        assert_eq!(attempts, vec![1, 2]);
        Ok(())
    })
    .await
}

#[tokio::test]
async fn exhausted_row_is_dead_lettered_with_reason() -> Result<()> {
    TestEnv::run_isolated_test(|env| async move {
        let consumer = ScriptedConsumer::failing(NOTIFY, Event::ORDER_CREATED, "gateway down");
        let log = consumer.log();
        let registry = registry_with(consumer);
        let provider = env.provider(registry.clone());
        let engine = env.engine(registry, DeliveryConfig::default())?;
        let policy = RetryPolicy::default();

        let ids = env.publish(&provider, &order_created(1)).await?;

        let mut outcomes = Vec::new();
        for retry in 0..policy.max_attempts {
            outcomes.push(engine.process_once().await?);
            env.advance(policy.delay_for(retry));
        }

        assert!(matches!(outcomes[3], IterationOutcome::Rescheduled { retry: 4, .. }));
        assert_eq!(outcomes[4], IterationOutcome::DeadLettered {
            id: ids[0],
            reason: "gateway down".into()
        });

        let row = env.find_row(ids[0]).await?.expect("dead rows are kept");
        assert_eq!(row.state(), RowState::Dead);
        assert_eq!(row.retry_count(), policy.max_attempts);
        assert_eq!(row.failed_reason.as_deref(), Some("gateway down"));
        assert_eq!(log.len(), 5);

        // Dead rows are never claimed again.
        env.advance(Duration::from_secs(24 * 3600));
        assert!(engine.process_once().await?.is_idle());
        assert_eq!(log.len(), 5);
        assert_eq!(engine.stats().await.rows_dead_lettered, 1);
        Ok(())
    })
    .await
}

#[tokio::test]
async fn row_for_unknown_consumer_is_dead_lettered_without_attempt() -> Result<()> {
    TestEnv::run_isolated_test(|env| async move {
        let registry = registry_with(ScriptedConsumer::new(NOTIFY, Event::ORDER_CREATED));
        let engine = env.engine(registry, DeliveryConfig::default())?;

        let id = env.insert_row("retired:order:order_created", order_created(1)).await?;

        let outcome = engine.process_once().await?;
        assert_eq!(outcome, IterationOutcome::DeadLettered {
            id,
            reason: CONSUMER_NOT_FOUND.into()
        });

        let row = env.find_row(id).await?.expect("dead rows are kept");
        assert_eq!(row.state(), RowState::Dead);
        assert_eq!(row.retry_count(), 0);
        assert_eq!(row.failed_reason.as_deref(), Some("consumer not found"));
        Ok(())
    })
    .await
}

#[tokio::test]
async fn consumer_writes_commit_with_success() -> Result<()> {
    TestEnv::run_isolated_test(|env| async move {
        let consumer = ScriptedConsumer::new(NOTIFY, Event::ORDER_CREATED).recording_effects();
        let registry = registry_with(consumer);
        let provider = env.provider(registry.clone());
        let engine = env.engine(registry, DeliveryConfig::default())?;

        let ctx = RequestContext::new().with_request_id("req-effects");
        let ids = env.publish(&provider, &order_created(3).encode(&ctx)).await?;
        engine.process_once().await?;

        let effects = env.effects_for(NOTIFY).await?;
        assert_eq!(effects.len(), 1);
        assert_eq!(effects[0].queue_id, ids[0]);
        assert_eq!(effects[0].attempt, 1);
        assert_eq!(effects[0].request_id.as_deref(), Some("req-effects"));
        Ok(())
    })
    .await
}

#[tokio::test]
async fn consumer_writes_roll_back_but_bookkeeping_commits() -> Result<()> {
    TestEnv::run_isolated_test(|env| async move {
        let consumer = ScriptedConsumer::new(NOTIFY, Event::ORDER_CREATED)
            .recording_effects()
            .then(Step::Fail("downstream rejected".into()));
        let registry = registry_with(consumer);
        let provider = env.provider(registry.clone());
        let engine = env.engine(registry, DeliveryConfig::default())?;

        let ids = env.publish(&provider, &order_created(3)).await?;
        engine.process_once().await?;

        assert!(env.effects_for(NOTIFY).await?.is_empty());
        let row = env.find_row(ids[0]).await?.expect("row is kept for retry");
        assert_eq!(row.retry_count(), 1);

        env.advance(Duration::from_secs(2));
        engine.process_once().await?;

        let effects = env.effects_for(NOTIFY).await?;
        assert_eq!(effects.len(), 1);
        assert_eq!(effects[0].attempt, 2);
        Ok(())
    })
    .await
}

#[tokio::test]
async fn swallowed_sql_error_counts_as_failure() -> Result<()> {
    TestEnv::run_isolated_test(|env| async move {
        let registry = registry_with(SwallowsSqlError);
        let provider = env.provider(registry.clone());
        let config = DeliveryConfig {
            retry_policy: RetryPolicy { max_attempts: 2, ..RetryPolicy::default() },
            ..DeliveryConfig::default()
        };
        let engine = env.engine(registry, config)?;

        let ids = env.publish(&provider, &order_created(5)).await?;

        let outcome = engine.process_once().await?;
        assert!(matches!(outcome, IterationOutcome::Rescheduled { retry: 1, .. }));
        let row = env.find_row(ids[0]).await?.expect("row is kept for retry");
        assert_eq!(row.retry_count(), 1);
        assert_eq!(row.state(), RowState::Pending);

        env.advance(Duration::from_secs(2));
        let outcome = engine.process_once().await?;
        assert!(matches!(outcome, IterationOutcome::DeadLettered { .. }));

        let row = env.find_row(ids[0]).await?.expect("dead rows are kept");
        assert_eq!(row.state(), RowState::Dead);
        assert_eq!(row.retry_count(), 2);
        let reason = row.failed_reason.unwrap_or_default();
        assert!(reason.contains("aborted"), "unexpected reason: {reason}");
        Ok(())
    })
    .await
}

#[tokio::test]
async fn undecodable_row_is_dead_lettered_and_others_still_flow() -> Result<()> {
    TestEnv::run_isolated_test(|env| async move {
        let consumer = ScriptedConsumer::new(NOTIFY, Event::ORDER_CREATED);
        let log = consumer.log();
        let registry = registry_with(consumer);
        let provider = env.provider(registry.clone());
        let engine = env.engine(registry, DeliveryConfig::default())?;

        let bad = env.insert_raw_row(NOTIFY, json!({ "order_id": 1 })).await?;
        let good = env.publish(&provider, &order_created(2)).await?;

        let outcomes = engine.process_until_idle(10).await?;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.contains(&IterationOutcome::Delivered { id: good[0] }));
        assert!(outcomes.iter().any(|outcome| matches!(
            outcome,
            IterationOutcome::DeadLettered { id, reason }
                if *id == bad && reason.starts_with(MESSAGE_DECODE_FAILED)
        )));

        let row = env.find_row(bad).await?.expect("dead rows are kept");
        assert_eq!(row.state(), RowState::Dead);
        assert_eq!(row.retry_count(), 0);
        assert!(row.decode_message().is_err());
        assert_eq!(log.len(), 1);
        Ok(())
    })
    .await
}

#[tokio::test]
async fn consumer_panic_counts_as_failure() -> Result<()> {
    TestEnv::run_isolated_test(|env| async move {
        let consumer = ScriptedConsumer::new(NOTIFY, Event::ORDER_CREATED)
            .recording_effects()
            .then(Step::Panic("template missing".into()));
        let registry = registry_with(consumer);
        let provider = env.provider(registry.clone());
        let engine = env.engine(registry, DeliveryConfig::default())?;

        let ids = env.publish(&provider, &order_created(9)).await?;

        let outcome = engine.process_once().await?;
        assert!(matches!(outcome, IterationOutcome::Rescheduled { retry: 1, .. }));
        assert!(env.effects_for(NOTIFY).await?.is_empty());
        assert_eq!(engine.stats().await.panics_caught, 1);

        env.advance(Duration::from_secs(2));
        assert_eq!(engine.process_once().await?, IterationOutcome::Delivered { id: ids[0] });
        Ok(())
    })
    .await
}

#[tokio::test]
async fn panics_on_every_attempt_end_dead_with_panic_reason() -> Result<()> {
    TestEnv::run_isolated_test(|env| async move {
        let consumer =
            ScriptedConsumer::new(NOTIFY, Event::ORDER_CREATED).otherwise(Step::Panic("boom".into()));
        let registry = registry_with(consumer);
        let provider = env.provider(registry.clone());
        let config = DeliveryConfig {
            retry_policy: RetryPolicy { max_attempts: 2, ..RetryPolicy::default() },
            ..DeliveryConfig::default()
        };
        let engine = env.engine(registry, config)?;

        let ids = env.publish(&provider, &order_created(9)).await?;
        engine.process_once().await?;
        env.advance(Duration::from_secs(2));
        engine.process_once().await?;

        let row = env.find_row(ids[0]).await?.expect("dead rows are kept");
        assert_eq!(row.state(), RowState::Dead);
        assert_eq!(row.retry_count(), 2);
        assert_eq!(row.failed_reason.as_deref(), Some("consumer panicked: boom"));
        Ok(())
    })
    .await
}

#[tokio::test]
async fn iteration_deadline_rolls_back_claim() -> Result<()> {
    TestEnv::run_isolated_test(|env| async move {
        let consumer = ScriptedConsumer::new(NOTIFY, Event::ORDER_CREATED)
            .with_latency(Duration::from_millis(500));
        let registry = registry_with(consumer);
        let provider = env.provider(registry.clone());
        let config =
            DeliveryConfig { claim_timeout: Duration::from_millis(50), ..DeliveryConfig::default() };
        let engine = env.engine(registry, config)?;

        let ids = env.publish(&provider, &order_created(5)).await?;

        let err = engine.process_once().await.unwrap_err();
        assert!(matches!(err, DeliveryError::DeadlineExceeded { .. }));
        assert!(err.is_transient());

        let row = env.find_row(ids[0]).await?.expect("row is untouched");
        assert_eq!(row.retry_count(), 0);
        assert_eq!(row.state(), RowState::Pending);
        assert_eq!(engine.stats().await.transient_failures, 1);
        Ok(())
    })
    .await
}

#[tokio::test]
async fn delayed_rows_wait_for_their_check_at() -> Result<()> {
    TestEnv::run_isolated_test(|env| async move {
        let consumer = ScriptedConsumer::new("order:order:order_created", Event::ORDER_CREATED)
            .with_delay(Duration::from_secs(300));
        let log = consumer.log();
        let registry = registry_with(consumer);
        let provider = env.provider(registry.clone());
        let engine = env.engine(registry, DeliveryConfig::default())?;

        env.publish(&provider, &order_created(11)).await?;

        assert!(engine.process_until_idle(10).await?.is_empty());
        env.advance(Duration::from_secs(299));
        assert!(engine.process_until_idle(10).await?.is_empty());
        env.advance(Duration::from_secs(1));
        assert_eq!(engine.process_until_idle(10).await?.len(), 1);
        assert_eq!(log.len(), 1);
        Ok(())
    })
    .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_deliver_each_row_once() -> Result<()> {
    TestEnv::run_isolated_test(|env| async move {
        let consumer = ScriptedConsumer::new(NOTIFY, Event::ORDER_CREATED)
            .with_latency(Duration::from_millis(5));
        let log = consumer.log();
        let registry = registry_with(consumer);
        let provider = env.provider(registry.clone());
        let config = DeliveryConfig {
            worker_count: 4,
            idle_backoff_max: Duration::from_millis(20),
            shutdown_timeout: Duration::from_secs(5),
            ..DeliveryConfig::default()
        };
        let mut engine = env.engine(registry, config)?;

        for order_id in 0..20 {
            env.publish(&provider, &order_created(order_id)).await?;
        }

        engine.start().await;
        assert_eq!(engine.stats().await.active_workers, 4);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        while env.storage().queues.count_pending().await? > 0 {
            assert!(tokio::time::Instant::now() < deadline, "queue did not drain in time");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        engine.shutdown().await?;

        let ids = log.queue_ids();
        let unique: HashSet<_> = ids.iter().copied().collect();
        assert_eq!(ids.len(), 20);
        assert_eq!(unique.len(), 20);
        Ok(())
    })
    .await
}

#[tokio::test]
async fn shutdown_without_start_is_immediate() -> Result<()> {
    TestEnv::run_isolated_test(|env| async move {
        let registry = registry_with(ScriptedConsumer::new(NOTIFY, Event::ORDER_CREATED));
        let engine = env.engine(registry, DeliveryConfig::default())?;

        assert_eq!(engine.stats().await.active_workers, 0);
        engine.shutdown().await?;
        Ok(())
    })
    .await
}
