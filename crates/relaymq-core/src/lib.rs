//! Core domain types and storage for the relaymq outbox queue.
//!
//! Provides the event and message envelope types that producers publish,
//! the request context carried through every message, the persisted queue
//! row model, and the PostgreSQL repository that owns the `queues` table.
//! The delivery crate and the service binary build on these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod context;
pub mod error;
pub mod event;
pub mod message;
pub mod models;
pub mod storage;
pub mod time;

pub use context::RequestContext;
pub use error::{CoreError, Result};
pub use event::Event;
pub use message::{Message, OrderMessage};
pub use models::{NewQueueRow, QueueId, QueueRow, RowState};
pub use time::{Clock, RealClock, TestClock};
