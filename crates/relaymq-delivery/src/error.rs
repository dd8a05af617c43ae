//! Error types for publishing and delivery operations.
//!
//! Faults fall into three groups. Configuration faults (unsubscribed event,
//! duplicate consumer) indicate a programming error and must surface to the
//! caller. Transient faults (store unavailable, deadline exceeded) only ever
//! pause a worker. Internal faults cover panics caught at the iteration
//! boundary and worker lifecycle failures.
//!
//! Consumer failures are not errors of this crate: they are outcomes that
//! drive a row through its retry schedule.

use std::{fmt, time::Duration};

use relaymq_core::CoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error types for publishing and delivery operations.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// An event was published but no consumer subscribes to it.
    #[error("event {event} does not have any subscribed consumers")]
    UnsubscribedEvent {
        /// Name of the published event
        event: String,
    },

    /// Two consumers were registered under the same name.
    #[error("consumer registered twice: {name}")]
    DuplicateConsumer {
        /// The conflicting consumer name
        name: String,
    },

    /// Invalid registry or engine configuration.
    #[error("invalid configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// Message envelope could not be encoded or decoded.
    #[error("message serialization failed: {message}")]
    SerializationError {
        /// Codec error message
        message: String,
    },

    /// Database operation failed.
    #[error("database error: {message}")]
    DatabaseError {
        /// Database error message
        message: String,
    },

    /// A claim/dispatch iteration exceeded its deadline.
    #[error("delivery iteration exceeded deadline of {timeout:?}")]
    DeadlineExceeded {
        /// The configured deadline
        timeout: Duration,
    },

    /// Worker task panicked outside the iteration boundary.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Worker that panicked
        worker_id: usize,
        /// Panic description
        error: String,
    },

    /// Workers did not stop within the shutdown timeout.
    #[error("worker shutdown exceeded timeout of {timeout:?}")]
    ShutdownTimeout {
        /// The configured shutdown timeout
        timeout: Duration,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    InternalError {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates an unsubscribed event error.
    pub fn unsubscribed(event: impl Into<String>) -> Self {
        Self::UnsubscribedEvent { event: event.into() }
    }

    /// Creates a duplicate consumer error.
    pub fn duplicate_consumer(name: impl Into<String>) -> Self {
        Self::DuplicateConsumer { name: name.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::DatabaseError { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Whether the failure is expected to clear on its own.
    ///
    /// Workers pause and retry on transient errors; everything else points
    /// at a defect or misconfiguration.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::DatabaseError { .. } | Self::DeadlineExceeded { .. } => true,

            Self::UnsubscribedEvent { .. }
            | Self::DuplicateConsumer { .. }
            | Self::ConfigurationError { .. }
            | Self::SerializationError { .. }
            | Self::WorkerPanic { .. }
            | Self::ShutdownTimeout { .. }
            | Self::InternalError { .. } => false,
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::Serialization(message) => Self::SerializationError { message },
            CoreError::InvalidInput(message) => Self::ConfigurationError { message },
            CoreError::Database(message) => Self::database(message),
            other => Self::database(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for DeliveryError {
    fn from(error: sqlx::Error) -> Self {
        Self::from(CoreError::from(error))
    }
}

/// Category of delivery error for log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Programming or deployment error.
    Configuration,
    /// Store unavailable or slow.
    Transient,
    /// Internal system errors.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::UnsubscribedEvent { .. }
            | DeliveryError::DuplicateConsumer { .. }
            | DeliveryError::ConfigurationError { .. }
            | DeliveryError::SerializationError { .. } => Self::Configuration,
            DeliveryError::DatabaseError { .. } | DeliveryError::DeadlineExceeded { .. } => {
                Self::Transient
            },
            DeliveryError::WorkerPanic { .. }
            | DeliveryError::ShutdownTimeout { .. }
            | DeliveryError::InternalError { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Transient => write!(f, "transient"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
