//! Per-test PostgreSQL schemas.
//!
//! Every database test gets a fresh schema on the server named by
//! `DATABASE_URL`. The test's pool pins `search_path` to that schema, so the
//! unqualified `queues` table of one test is invisible to every other test
//! running in parallel.

use std::{str::FromStr, time::Duration};

use anyhow::{Context, Result};
use relaymq_core::storage::schema;
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    Connection, PgConnection, PgPool,
};
use tracing::{debug, warn};
use uuid::Uuid;

/// Environment variable naming the test server.
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

const SCHEMA_PREFIX: &str = "relaymq_test_";

const CREATE_CONSUMER_EFFECTS: &str = r#"
    CREATE TABLE IF NOT EXISTS consumer_effects (
        id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
        consumer_name TEXT NOT NULL,
        queue_id BIGINT NOT NULL,
        attempt INTEGER NOT NULL,
        request_id TEXT
    )
"#;

/// Connection string of the test server, if one is configured.
pub fn database_url() -> Option<String> {
    std::env::var(DATABASE_URL_ENV).ok().filter(|url| !url.trim().is_empty())
}

/// Isolated schema with its own pool.
#[derive(Debug)]
pub struct TestDatabase {
    pool: PgPool,
    schema: String,
    url: String,
}

impl TestDatabase {
    /// Creates a fresh schema and bootstraps the queue tables inside it.
    pub async fn isolated(url: &str) -> Result<Self> {
        let schema = format!("{SCHEMA_PREFIX}{}", Uuid::new_v4().simple());

        let mut admin = PgConnection::connect(url).await.context("failed to connect to test server")?;
        sqlx::query(&format!("CREATE SCHEMA \"{schema}\""))
            .execute(&mut admin)
            .await
            .with_context(|| format!("failed to create schema {schema}"))?;
        admin.close().await?;

        let options = PgConnectOptions::from_str(url)
            .context("invalid DATABASE_URL")?
            .options([("search_path", schema.as_str())]);
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .context("failed to open test pool")?;

        schema::migrate(&pool).await.context("failed to bootstrap queue schema")?;
        sqlx::query(CREATE_CONSUMER_EFFECTS)
            .execute(&pool)
            .await
            .context("failed to create consumer_effects table")?;

        debug!(schema = %schema, "created isolated test schema");
        Ok(Self { pool, schema, url: url.to_owned() })
    }

    /// Pool whose connections resolve tables in this schema.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Name of the schema.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Closes the pool and drops the schema with everything in it.
    pub async fn drop_schema(self) -> Result<()> {
        self.pool.close().await;
        Self::drop_by_name(&self.url, &self.schema).await
    }

    /// Drops a test schema by name.
    ///
    /// Refuses names that were not created by [`TestDatabase::isolated`].
    pub async fn drop_by_name(url: &str, schema: &str) -> Result<()> {
        anyhow::ensure!(schema.starts_with(SCHEMA_PREFIX), "refusing to drop schema {schema}");

        let mut admin = PgConnection::connect(url).await?;
        if let Err(e) = sqlx::query(&format!("DROP SCHEMA IF EXISTS \"{schema}\" CASCADE"))
            .execute(&mut admin)
            .await
        {
            warn!(schema = %schema, error = %e, "failed to drop test schema");
        }
        admin.close().await?;

        Ok(())
    }
}
