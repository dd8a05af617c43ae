//! Order workflow consumers served by the binary.
//!
//! Placing an order publishes `order_created` in the same transaction
//! that inserts the order. Two consumers subscribe: one sends a confirmation
//! right away, the other cancels the order if it is still unpaid once the
//! payment window has passed.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use relaymq_core::{Event, Message, OrderMessage, RequestContext};
use relaymq_delivery::{Consumer, Delivery, Provider, RegistryBuilder};
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info, warn};

/// Consumer name of the unpaid-order cancellation.
pub const ORDER_CANCELLATION: &str = "order:order:order_created";

/// Consumer name of the confirmation notification.
pub const ORDER_NOTIFICATION: &str = "notify:order:order_created";

/// How long an order may stay unpaid before it is canceled.
pub const PAYMENT_WINDOW: Duration = Duration::from_secs(5 * 60);

const STATUS_PENDING_PAYMENT: &str = "pending_payment";
const STATUS_CANCELED: &str = "canceled";

/// Cancels orders that are still awaiting payment after [`PAYMENT_WINDOW`].
#[derive(Debug, Default)]
pub struct OrderCancellationConsumer;

#[async_trait]
impl Consumer for OrderCancellationConsumer {
    fn name(&self) -> &str {
        ORDER_CANCELLATION
    }

    fn event(&self) -> Event {
        Event::ORDER_CREATED
    }

    fn delay(&self) -> Duration {
        PAYMENT_WINDOW
    }

    async fn consume(&self, conn: &mut PgConnection, delivery: &Delivery) -> anyhow::Result<()> {
        let order_id = delivery.message().order_id().context("message carries no order_id")?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM orders WHERE id = $1 FOR UPDATE")
                .bind(order_id)
                .fetch_optional(&mut *conn)
                .await?;

        match status.as_deref() {
            None => anyhow::bail!("order {order_id} not found"),
            Some(STATUS_PENDING_PAYMENT) => {
                sqlx::query("UPDATE orders SET status = $1, updated_at = NOW() WHERE id = $2")
                    .bind(STATUS_CANCELED)
                    .bind(order_id)
                    .execute(&mut *conn)
                    .await?;

                info!(order_id, request_id = ?delivery.request_id(), "unpaid order canceled");
            },
            Some(other) => {
                debug!(order_id, status = other, "order already settled, nothing to cancel");
            },
        }

        Ok(())
    }
}

/// Sends the order confirmation.
#[derive(Debug, Default)]
pub struct OrderNotificationConsumer;

#[async_trait]
impl Consumer for OrderNotificationConsumer {
    fn name(&self) -> &str {
        ORDER_NOTIFICATION
    }

    fn event(&self) -> Event {
        Event::ORDER_CREATED
    }

    async fn consume(&self, _conn: &mut PgConnection, delivery: &Delivery) -> anyhow::Result<()> {
        let Some(order_id) = delivery.message().order_id() else {
            warn!(queue_id = %delivery.queue_id(), "confirmation skipped, message carries no order_id");
            return Ok(());
        };

        info!(
            order_id,
            attempt = delivery.attempt(),
            request_id = ?delivery.request_id(),
            "sending order confirmation email"
        );

        Ok(())
    }
}

/// Registers both order consumers.
pub fn register(builder: &mut RegistryBuilder) -> Result<()> {
    builder.register(OrderCancellationConsumer)?.register(OrderNotificationConsumer)?;
    Ok(())
}

/// Creates the `orders` table if it does not exist.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS orders (
            id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
            product TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending_payment'
                CHECK (status IN ('pending_payment', 'paid', 'canceled')),
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create orders table")?;

    Ok(())
}

/// Inserts an order and publishes `order_created` atomically.
///
/// Returns the new order id. If the publish fails the order insert rolls
/// back with it.
pub async fn place_order(
    pool: &PgPool,
    provider: &Provider,
    product: &str,
    ctx: &RequestContext,
) -> Result<i64> {
    let mut tx = pool.begin().await.context("failed to begin order transaction")?;

    let order_id: i64 =
        sqlx::query_scalar("INSERT INTO orders (product) VALUES ($1) RETURNING id")
            .bind(product)
            .fetch_one(&mut *tx)
            .await
            .context("failed to insert order")?;

    let message = Message::new(Event::ORDER_CREATED).with_order_id(order_id).encode(ctx);
    provider.publish(&mut tx, &message).await?;

    tx.commit().await.context("failed to commit order")?;

    info!(order_id, product, request_id = ?ctx.request_id(), "order placed");
    Ok(order_id)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use relaymq_delivery::{ConsumerRegistry, DeliveryConfig};
    use relaymq_testing::TestEnv;

    use super::*;

    fn registry() -> Arc<ConsumerRegistry> {
        let mut builder = ConsumerRegistry::builder();
        register(&mut builder).expect("order consumers register once");
        Arc::new(builder.build())
    }

    async fn order_status(pool: &PgPool, order_id: i64) -> Result<String> {
        Ok(sqlx::query_scalar("SELECT status FROM orders WHERE id = $1")
            .bind(order_id)
            .fetch_one(pool)
            .await?)
    }

    #[test]
    fn registering_twice_is_rejected() {
        let mut builder = ConsumerRegistry::builder();
        register(&mut builder).unwrap();
        assert!(register(&mut builder).is_err());
    }

    #[test]
    fn consumers_subscribe_to_order_created() {
        let registry = registry();
        let names: Vec<&str> =
            registry.subscribers(&Event::ORDER_CREATED).iter().map(|c| c.name()).collect();

        assert_eq!(names, vec![ORDER_CANCELLATION, ORDER_NOTIFICATION]);
        assert_eq!(registry.lookup(ORDER_CANCELLATION).unwrap().delay(), PAYMENT_WINDOW);
        assert_eq!(registry.lookup(ORDER_NOTIFICATION).unwrap().delay(), Duration::ZERO);
    }

    #[tokio::test]
    async fn unpaid_order_is_canceled_after_payment_window() -> Result<()> {
        TestEnv::run_isolated_test(|env| async move {
            migrate(env.pool()).await?;
            let registry = registry();
            let provider = env.provider(registry.clone());
            let engine = env.engine(registry, DeliveryConfig::default())?;

            let ctx = RequestContext::new().with_request_id("req-order-1");
            let order_id = place_order(env.pool(), &provider, "keyboard", &ctx).await?;

            let rows = env.all_rows().await?;
            assert_eq!(rows.len(), 2);
            for row in &rows {
                let message = row.decode_message()?;
                assert_eq!(message.order_id(), Some(order_id));
                assert_eq!(message.request_id(), Some("req-order-1"));
            }

            // Only the notification is due immediately.
            let outcomes = engine.process_until_idle(10).await?;
            assert_eq!(outcomes.len(), 1);
            assert_eq!(order_status(env.pool(), order_id).await?, STATUS_PENDING_PAYMENT);

            env.advance(PAYMENT_WINDOW);
            engine.process_until_idle(10).await?;

            assert_eq!(order_status(env.pool(), order_id).await?, STATUS_CANCELED);
            assert!(env.all_rows().await?.is_empty());
            Ok(())
        })
        .await
    }

    #[tokio::test]
    async fn paid_order_is_left_alone() -> Result<()> {
        TestEnv::run_isolated_test(|env| async move {
            migrate(env.pool()).await?;
            let registry = registry();
            let provider = env.provider(registry.clone());
            let engine = env.engine(registry, DeliveryConfig::default())?;

            let order_id =
                place_order(env.pool(), &provider, "monitor", &RequestContext::new()).await?;
            sqlx::query("UPDATE orders SET status = 'paid' WHERE id = $1")
                .bind(order_id)
                .execute(env.pool())
                .await?;

            env.advance(PAYMENT_WINDOW + Duration::from_secs(1));
            engine.process_until_idle(10).await?;

            assert_eq!(order_status(env.pool(), order_id).await?, "paid");
            assert!(env.all_rows().await?.is_empty());
            Ok(())
        })
        .await
    }

    #[tokio::test]
    async fn failed_publish_rolls_back_the_order() -> Result<()> {
        TestEnv::run_isolated_test(|env| async move {
            migrate(env.pool()).await?;
            let empty = Arc::new(ConsumerRegistry::builder().build());
            let provider = env.provider(empty);

            let result = place_order(env.pool(), &provider, "mouse", &RequestContext::new()).await;
            assert!(result.is_err());

            let orders: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM orders")
                .fetch_one(env.pool())
                .await?;
            assert_eq!(orders, 0);
            assert!(env.all_rows().await?.is_empty());
            Ok(())
        })
        .await
    }

    #[tokio::test]
    async fn cancellation_of_missing_order_fails() -> Result<()> {
        TestEnv::run_isolated_test(|env| async move {
            migrate(env.pool()).await?;
            let mut conn = env.pool().acquire().await?;
            let message = Message::new(Event::ORDER_CREATED).with_order_id(4242);
            let delivery = Delivery::new(relaymq_core::QueueId(1), 1, message);

            let err = OrderCancellationConsumer.consume(&mut conn, &delivery).await.unwrap_err();
            assert!(err.to_string().contains("4242"));

            Ok(())
        })
        .await
    }
}
