//! Persisted queue rows and their identifiers.
//!
//! One row exists per (published message, subscribed consumer). A row is
//! pending until its consumer succeeds (the row is deleted) or gives up (the
//! row becomes dead and stays for inspection).

use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;

use crate::{error::Result, message::Message};

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    std::result::Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed queue row identifier.
///
/// Assigned by the database identity column; monotonically increasing in
/// insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueId(pub i64);

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for QueueId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl sqlx::Type<PgDb> for QueueId {
    fn type_info() -> PgTypeInfo {
        <i64 as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for QueueId {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let id = <i64 as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(id))
    }
}

impl sqlx::Encode<'_, PgDb> for QueueId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <i64 as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Lifecycle state of a row that still exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowState {
    /// Eligible for delivery once `check_at` has passed.
    Pending,
    /// Terminal: never claimed again, kept until external cleanup.
    Dead,
}

impl fmt::Display for RowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

/// A row of the `queues` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueueRow {
    /// Row identifier.
    pub id: QueueId,

    /// Name of the consumer this delivery targets.
    pub consumer_name: String,

    /// Envelope as stored. Kept undecoded so a malformed payload does not
    /// fail the whole row read; see [`QueueRow::decode_message`].
    pub message: Json<serde_json::Value>,

    /// Failed attempts so far.
    pub retry: i32,

    /// Set once the row reached a terminal failure.
    pub is_dead: bool,

    /// Error text of the last failure that made the row dead.
    pub failed_reason: Option<String>,

    /// Earliest instant at which the row may be claimed.
    pub check_at: DateTime<Utc>,

    /// When the row was published.
    pub created_at: DateTime<Utc>,
}

impl QueueRow {
    /// Decodes the stored payload into an envelope.
    ///
    /// Fails with [`crate::CoreError::Serialization`] when the payload does not
    /// have the envelope shape.
    pub fn decode_message(&self) -> Result<Message> {
        Ok(serde_json::from_value(self.message.0.clone())?)
    }

    /// Failed attempts so far as an unsigned count.
    pub fn retry_count(&self) -> u32 {
        u32::try_from(self.retry).unwrap_or_default()
    }

    /// One-based number of the attempt a claim of this row would make.
    pub fn attempt_number(&self) -> u32 {
        self.retry_count().saturating_add(1)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RowState {
        if self.is_dead {
            RowState::Dead
        } else {
            RowState::Pending
        }
    }

    /// Whether a claim at `now` may pick this row.
    pub fn is_eligible_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_dead && self.check_at <= now
    }
}

/// A row about to be inserted by a publish.
#[derive(Debug, Clone, PartialEq)]
pub struct NewQueueRow {
    /// Subscribed consumer.
    pub consumer_name: String,

    /// Envelope shared by every row of the same publish.
    pub message: Message,

    /// Publish time plus the consumer's delay.
    pub check_at: DateTime<Utc>,
}

impl NewQueueRow {
    /// Builds a row eligible `delay` after `published_at`.
    ///
    /// Delays too large to represent saturate at the latest representable
    /// instant.
    pub fn new(
        consumer_name: impl Into<String>,
        message: Message,
        published_at: DateTime<Utc>,
        delay: Duration,
    ) -> Self {
        let check_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| published_at.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self { consumer_name: consumer_name.into(), message, check_at }
    }
}
