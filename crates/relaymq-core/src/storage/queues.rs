//! Repository for queue row database operations.
//!
//! Write operations used by producers and the delivery engine run on the
//! caller's connection so they commit or roll back with the caller's
//! transaction. Read operations for inspection run on the pool.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{types::Json, Executor, PgConnection, PgPool, Postgres, QueryBuilder};

use crate::{
    error::{CoreError, Result},
    models::{NewQueueRow, QueueId, QueueRow},
};

/// Repository for queue row database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts rows in a single multi-row statement outside any caller
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn insert_batch(&self, rows: &[NewQueueRow]) -> Result<Vec<QueueId>> {
        self.insert_batch_impl(&*self.pool, rows).await
    }

    /// Inserts rows on the caller's connection.
    ///
    /// This is the outbox write: the rows become visible exactly when the
    /// caller's transaction commits.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn insert_batch_in_tx(
        &self,
        conn: &mut PgConnection,
        rows: &[NewQueueRow],
    ) -> Result<Vec<QueueId>> {
        self.insert_batch_impl(conn, rows).await
    }

    async fn insert_batch_impl<'e, E>(&self, executor: E, rows: &[NewQueueRow]) -> Result<Vec<QueueId>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder =
            QueryBuilder::<Postgres>::new("INSERT INTO queues (consumer_name, message, check_at) ");
        builder.push_values(rows, |mut values, row| {
            values
                .push_bind(row.consumer_name.as_str())
                .push_bind(Json(&row.message))
                .push_bind(row.check_at);
        });
        builder.push(" RETURNING id");

        let ids = builder.build_query_scalar::<QueueId>().fetch_all(executor).await?;

        Ok(ids)
    }

    /// Locks the oldest eligible row for the caller's transaction.
    ///
    /// A row is eligible when it is not dead and `check_at <= now`. Rows
    /// locked by other transactions are skipped, so concurrent workers never
    /// claim the same row. The lock is held until the caller's transaction
    /// ends.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn claim_next_in_tx(
        &self,
        conn: &mut PgConnection,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueRow>> {
        let row = sqlx::query_as::<_, QueueRow>(
            r#"
            SELECT id, consumer_name, message, retry, is_dead, failed_reason, check_at, created_at
            FROM queues
            WHERE is_dead = false
              AND check_at <= $1
            ORDER BY check_at ASC, id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .fetch_optional(conn)
        .await?;

        Ok(row)
    }

    /// Deletes a row after its consumer succeeded.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the row no longer exists.
    pub async fn delete_in_tx(&self, conn: &mut PgConnection, id: QueueId) -> Result<()> {
        let result = sqlx::query("DELETE FROM queues WHERE id = $1").bind(id).execute(conn).await?;

        expect_one(result.rows_affected(), id)
    }

    /// Records a failed attempt and defers the row until `check_at`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the row does not exist or is dead.
    pub async fn reschedule_in_tx(
        &self,
        conn: &mut PgConnection,
        id: QueueId,
        check_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE queues
            SET retry = retry + 1, check_at = $2
            WHERE id = $1 AND is_dead = false
            "#,
        )
        .bind(id)
        .bind(check_at)
        .execute(conn)
        .await?;

        expect_one(result.rows_affected(), id)
    }

    /// Records the final failed attempt and marks the row dead.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the row does not exist or is dead.
    pub async fn mark_exhausted_in_tx(
        &self,
        conn: &mut PgConnection,
        id: QueueId,
        reason: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE queues
            SET retry = retry + 1, is_dead = true, failed_reason = $2
            WHERE id = $1 AND is_dead = false
            "#,
        )
        .bind(id)
        .bind(reason)
        .execute(conn)
        .await?;

        expect_one(result.rows_affected(), id)
    }

    /// Marks a row dead without counting an attempt.
    ///
    /// Used when no attempt could be made, e.g. the row names a consumer
    /// that is not registered.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the row does not exist or is dead.
    pub async fn mark_dead_in_tx(
        &self,
        conn: &mut PgConnection,
        id: QueueId,
        reason: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE queues
            SET is_dead = true, failed_reason = $2
            WHERE id = $1 AND is_dead = false
            "#,
        )
        .bind(id)
        .bind(reason)
        .execute(conn)
        .await?;

        expect_one(result.rows_affected(), id)
    }

    /// Finds a row by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: QueueId) -> Result<Option<QueueRow>> {
        let row = sqlx::query_as::<_, QueueRow>(
            r#"
            SELECT id, consumer_name, message, retry, is_dead, failed_reason, check_at, created_at
            FROM queues
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(row)
    }

    /// All rows addressed to a consumer, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_consumer(&self, consumer_name: &str) -> Result<Vec<QueueRow>> {
        let rows = sqlx::query_as::<_, QueueRow>(
            r#"
            SELECT id, consumer_name, message, retry, is_dead, failed_reason, check_at, created_at
            FROM queues
            WHERE consumer_name = $1
            ORDER BY id ASC
            "#,
        )
        .bind(consumer_name)
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows)
    }

    /// Dead rows, most recently published first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_dead(&self, limit: i64) -> Result<Vec<QueueRow>> {
        let rows = sqlx::query_as::<_, QueueRow>(
            r#"
            SELECT id, consumer_name, message, retry, is_dead, failed_reason, check_at, created_at
            FROM queues
            WHERE is_dead = true
            ORDER BY created_at DESC, id DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows)
    }

    /// Number of rows still awaiting delivery, eligible or not.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_pending(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queues WHERE is_dead = false")
            .fetch_one(&*self.pool)
            .await?;

        Ok(count)
    }

    /// Number of dead rows.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_dead(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queues WHERE is_dead = true")
            .fetch_one(&*self.pool)
            .await?;

        Ok(count)
    }
}

fn expect_one(rows_affected: u64, id: QueueId) -> Result<()> {
    if rows_affected == 0 {
        return Err(CoreError::NotFound(format!("live queue row {id}")));
    }
    Ok(())
}
