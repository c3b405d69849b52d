//! Error types shared by the codec and the session layer.

use thiserror::Error;

use crate::traits::{EngineError, ResultCode};

/// Property encode/decode error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PropertyError {
    #[error("Property values of type {0} are not supported")]
    UnsupportedType(String),
    #[error("Received override for non-existent property '{0}'")]
    UnknownOverride(String),
    #[error("'{name}' value is of the incorrect type, '{provided}' provided, '{expected}' expected.")]
    IncorrectType {
        name: String,
        provided: &'static str,
        expected: &'static str,
    },
    #[error("'{name}' value does not have exactly 1 byte, {len} bytes provided.")]
    CharLength { name: String, len: usize },
    #[error("Property {name} value must be between [{min}, {max}], inclusive")]
    OutOfRange { name: String, min: i64, max: i64 },
    #[error("STRING property '{0}' has non-UTF-8 data")]
    NonUtf8String(String),
    #[error("'{name}' property type is unrecognized, type {code} received.")]
    UnrecognizedType { name: String, code: i32 },
}

/// Session operation error.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Timeout must be a positive number of seconds below 2^63, got {0}")]
    InvalidTimeout(String),
    #[error("Interval must be a non-negative number of seconds below 2^63, got {0}")]
    InvalidInterval(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Property(#[from] PropertyError),
    #[error("Invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
    #[error("Method called after session was stopped")]
    SessionStopped,
    #[error("Queue not opened: {0}")]
    QueueNotOpened(String),
    #[error("Queue {0} was not opened for writing")]
    QueueNotWritable(String),
    #[error("Queue {0} is suspended due to bad host health")]
    QueueSuspended(String),
    #[error(
        "Attempting to confirm message on a closing queue. Please ensure that you are invoking \
         configure with 0 max unconfirmed messages before closing the queue {0}"
    )]
    QueueClosing(String),
    #[error("Queue {0} is already being closed")]
    CloseInProgress(String),
    #[error("Failed to {operation}: {source}")]
    Broker {
        operation: String,
        #[source]
        source: EngineError,
    },
    #[error("Timed out trying to {operation}: {source}")]
    BrokerTimeout {
        operation: String,
        #[source]
        source: EngineError,
    },
    #[error("{0} must not be awaited from a session callback, use SessionHandle::defer")]
    CalledFromDispatch(&'static str),
    #[error("Failed to spawn dispatch thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Wrap an engine failure, splitting timeouts from other broker errors.
    #[must_use]
    pub fn engine(operation: impl Into<String>, source: EngineError) -> Self {
        let operation = operation.into();
        if source.code == ResultCode::Timeout {
            Self::BrokerTimeout { operation, source }
        } else {
            Self::Broker { operation, source }
        }
    }

    /// True for errors raised before anything reached the broker.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidTimeout(_)
                | Self::InvalidInterval(_)
                | Self::InvalidArgument(_)
                | Self::Property(_)
                | Self::Config(_)
        )
    }

    /// True if the broker did not answer in time.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::BrokerTimeout { .. })
    }
}
