//! Broker engine seam and the raw event surface it reports through.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    event::SessionEventType,
    message::MessageGuid,
    options::{CompressionAlgorithm, QueueOptions},
    properties::WireProperties,
};

/// Failure codes reported by a broker engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultCode {
    /// Failure the engine could not classify.
    Unknown,
    /// The request did not complete in time.
    Timeout,
    /// No connection to the broker.
    NotConnected,
    /// The request was canceled before completing.
    Canceled,
    /// The broker does not support the request.
    NotSupported,
    /// The broker refused the request.
    Refused,
    /// The request carried an invalid argument.
    InvalidArgument,
    /// The engine is not ready for the request.
    NotReady,
    /// The queue is already open.
    AlreadyOpened,
    /// The queue URI is malformed.
    InvalidUri,
    /// The queue flags are not a valid combination.
    InvalidFlags,
    /// The broker does not know the queue.
    UnknownQueue,
}

impl ResultCode {
    /// Numeric code as reported on the wire.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Unknown => -1,
            Self::Timeout => -2,
            Self::NotConnected => -3,
            Self::Canceled => -4,
            Self::NotSupported => -5,
            Self::Refused => -6,
            Self::InvalidArgument => -7,
            Self::NotReady => -8,
            Self::AlreadyOpened => -100,
            Self::InvalidUri | Self::UnknownQueue => -102,
            Self::InvalidFlags => -103,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Timeout => "TIMEOUT",
            Self::NotConnected => "NOT_CONNECTED",
            Self::Canceled => "CANCELED",
            Self::NotSupported => "NOT_SUPPORTED",
            Self::Refused => "REFUSED",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::NotReady => "NOT_READY",
            Self::AlreadyOpened => "ALREADY_OPENED",
            Self::InvalidUri => "INVALID_URI",
            Self::InvalidFlags => "INVALID_FLAGS",
            Self::UnknownQueue => "UNKNOWN_QUEUE",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Engine error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {description}")]
pub struct EngineError {
    pub code: ResultCode,
    pub description: String,
}

impl EngineError {
    #[must_use]
    pub fn new(code: ResultCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }
}

/// Read/write mode a queue is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct QueueFlags {
    pub read: bool,
    pub write: bool,
}

impl QueueFlags {
    pub const READ: Self = Self {
        read: true,
        write: false,
    };
    pub const WRITE: Self = Self {
        read: false,
        write: true,
    };
    pub const READ_WRITE: Self = Self {
        read: true,
        write: true,
    };

    /// Neither read nor write.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        !self.read && !self.write
    }
}

/// Identity used to pair an ack with the callback registered at post time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(pub u64);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An encoded message handed to the engine for publishing.
#[derive(Debug, Clone)]
pub struct PostRequest {
    pub queue_uri: String,
    pub payload: Bytes,
    pub properties: WireProperties,
    /// Present when the caller asked to be told about the ack.
    pub correlation: Option<CorrelationId>,
    pub compression: CompressionAlgorithm,
}

/// Everything an engine needs to establish the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectSettings {
    /// Address of the broker, e.g. `tcp://localhost:30114`.
    pub broker_uri: String,
    /// Bound on establishing the connection.
    pub timeout: Duration,
    /// Bound on tearing the connection down.
    pub disconnect_timeout: Duration,
    /// Number of dispatch lanes.
    pub num_processing_threads: usize,
    /// Size of the engine's payload buffers, in bytes.
    pub blob_buffer_size: Option<u64>,
    /// Outbound channel size, in bytes, above which posting backs off.
    pub channel_high_watermark: Option<u64>,
    /// Low and high marks of the inbound event queue.
    pub event_queue_watermarks: Option<(u64, u64)>,
    /// How often the engine logs its statistics.
    pub stats_dump_interval: Option<Duration>,
    /// Whether a host-health monitor is attached.
    pub host_health_monitoring: bool,
    /// Engines surface their low-level logs when set.
    pub diagnostics: bool,
}

/// Session event as reported by the engine, before interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSessionEvent {
    pub event_type: i32,
    pub event_name: String,
    pub status_code: i32,
    pub status_name: String,
    pub queue_uri: Option<String>,
    pub error_description: Option<String>,
}

impl RawSessionEvent {
    /// A successful event of the given type.
    #[must_use]
    pub fn new(event_type: SessionEventType) -> Self {
        Self {
            event_type: event_type.code(),
            event_name: event_type.name().to_string(),
            status_code: 0,
            status_name: "SUCCESS".to_string(),
            queue_uri: None,
            error_description: None,
        }
    }

    #[must_use]
    pub fn queue(mut self, uri: impl Into<String>) -> Self {
        self.queue_uri = Some(uri.into());
        self
    }

    /// Mark the event as failed with the engine's error.
    #[must_use]
    pub fn failed(mut self, error: &EngineError) -> Self {
        self.status_code = error.code.code();
        self.status_name = error.code.name().to_string();
        self.error_description = Some(error.description.clone());
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.error_description = Some(description.into());
        self
    }
}

/// Delivered message as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub payload: Bytes,
    pub guid: MessageGuid,
    pub queue_uri: String,
    pub properties: WireProperties,
}

/// Acknowledgment as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAck {
    pub status: i32,
    pub status_name: String,
    pub guid: Option<MessageGuid>,
    pub queue_uri: String,
    pub correlation: Option<CorrelationId>,
}

/// Receives everything the engine pushes towards the session.
///
/// Implementations must return quickly: engines call these from their
/// own I/O threads.
pub trait EventSink: Send + Sync {
    fn on_session_event(&self, event: RawSessionEvent);

    fn on_messages(&self, messages: Vec<RawMessage>);

    fn on_acks(&self, acks: Vec<RawAck>);
}

/// Trait for broker engines.
#[async_trait]
pub trait BrokerEngine: Send + Sync {
    /// Connect and start reporting to `sink`.
    ///
    /// # Errors
    /// Returns error if the connection cannot be established within
    /// `settings.timeout`.
    async fn start(
        &self,
        settings: &ConnectSettings,
        sink: Arc<dyn EventSink>,
    ) -> Result<(), EngineError>;

    /// Disconnect, blocking until the engine has released the sink.
    fn stop(&self);

    /// Open a queue.
    async fn open_queue(
        &self,
        uri: &str,
        flags: QueueFlags,
        options: &QueueOptions,
        timeout: Duration,
    ) -> Result<(), EngineError>;

    /// Apply a complete set of options to an open queue.
    async fn configure_queue(
        &self,
        uri: &str,
        options: &QueueOptions,
        timeout: Duration,
    ) -> Result<(), EngineError>;

    /// Close a queue.
    async fn close_queue(&self, uri: &str, timeout: Duration) -> Result<(), EngineError>;

    /// The engine's view of a queue's options, if it has one.
    fn queue_options(&self, uri: &str) -> Option<QueueOptions>;

    /// Hand a message over for publishing.
    ///
    /// # Errors
    /// Returns error if the message could not be queued for sending.
    fn post(&self, request: PostRequest) -> Result<(), EngineError>;

    /// Confirm a delivered message.
    ///
    /// # Errors
    /// Returns error if the confirmation could not be queued for sending.
    fn confirm(&self, uri: &str, guid: MessageGuid) -> Result<(), EngineError>;

    /// Stop delivery and publishing on a queue without closing it.
    async fn suspend_queue(&self, uri: &str, timeout: Duration) -> Result<(), EngineError>;

    /// Undo [`BrokerEngine::suspend_queue`].
    async fn resume_queue(&self, uri: &str, timeout: Duration) -> Result<(), EngineError>;

    /// Drop and re-establish the connection.
    fn request_reconnect(&self);
}
