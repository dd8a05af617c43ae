//! Database access layer for the outbox queue.
//!
//! All SQL against the `queues` table lives in [`queues`]; the table itself
//! is created by [`schema::migrate`]. Operations that must share a caller's
//! transaction take `&mut PgConnection`; pass `&mut *tx` for a
//! `sqlx::Transaction`.

use std::sync::Arc;

use sqlx::PgPool;

pub mod queues;
pub mod schema;

use crate::error::Result;

/// Container for repository instances sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Repository for queue rows.
    pub queues: Arc<queues::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self { queues: Arc::new(queues::Repository::new(pool)) }
    }

    /// The shared connection pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.queues.pool()
    }

    /// Performs a health check on the database connection.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.queues.pool()).await?;

        Ok(())
    }
}
