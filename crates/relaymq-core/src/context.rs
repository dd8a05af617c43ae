//! Request context carried from producers to consumers.
//!
//! The correlation id is explicit data: a producer hands its context to
//! [`Message::encode`](crate::Message::encode), the id travels inside the
//! persisted envelope, and the delivery engine rebuilds a context from the
//! envelope before it invokes a consumer.

use serde::{Deserialize, Serialize};

use crate::message::Message;

/// Envelope key and tracing field name for the correlation id.
pub const REQUEST_ID_KEY: &str = "request_id";

/// Ambient request-scoped data that follows a unit of work.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    request_id: Option<String>,
}

impl RequestContext {
    /// Creates an empty context without a correlation id.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the correlation id. Empty ids are treated as absent.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        let request_id = request_id.into();
        self.request_id = (!request_id.is_empty()).then_some(request_id);
        self
    }

    /// Correlation id of the originating request, if any.
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Restores the context that was stamped into a message at encode time.
    pub fn from_message(message: &Message) -> Self {
        Self { request_id: message.request_id().map(str::to_owned) }
    }
}
