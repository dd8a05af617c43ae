//! Schema bootstrap for the `queues` table.

use sqlx::PgPool;
use tracing::debug;

use crate::error::Result;

const CREATE_QUEUES: &str = r#"
    CREATE TABLE IF NOT EXISTS queues (
        id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
        consumer_name TEXT NOT NULL,
        message JSONB NOT NULL,
        retry INTEGER NOT NULL DEFAULT 0 CHECK (retry >= 0),
        is_dead BOOLEAN NOT NULL DEFAULT false,
        failed_reason TEXT,
        check_at TIMESTAMPTZ NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
"#;

const CREATE_CLAIM_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_queues_claimable
    ON queues (check_at, id)
    WHERE is_dead = false
"#;

const CREATE_DEAD_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_queues_dead
    ON queues (created_at DESC)
    WHERE is_dead = true
"#;

const COLUMN_COMMENTS: [&str; 5] = [
    "COMMENT ON COLUMN queues.consumer_name IS 'registered consumer this row is delivered to'",
    "COMMENT ON COLUMN queues.message IS 'published message envelope'",
    "COMMENT ON COLUMN queues.retry IS 'failed delivery attempts so far'",
    "COMMENT ON COLUMN queues.is_dead IS 'terminal failure, never claimed again'",
    "COMMENT ON COLUMN queues.check_at IS 'earliest time the row may be claimed'",
];

/// Creates the `queues` table and its indexes if they do not exist.
///
/// Safe to run on every startup. Objects are created in the first schema on
/// the connection's `search_path`.
///
/// # Errors
///
/// Returns `CoreError::Database` if any statement fails.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::query(CREATE_QUEUES).execute(pool).await?;
    sqlx::query(CREATE_CLAIM_INDEX).execute(pool).await?;
    sqlx::query(CREATE_DEAD_INDEX).execute(pool).await?;

    for comment in COLUMN_COMMENTS {
        sqlx::query(comment).execute(pool).await?;
    }

    debug!("queues schema is up to date");
    Ok(())
}
