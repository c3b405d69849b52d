//! Session events.

use std::fmt;

use crate::traits::RawSessionEvent;

/// Engine-level event type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEventType {
    Error,
    Timeout,
    Canceled,
    Undefined,
    Connected,
    Disconnected,
    ConnectionLost,
    Reconnected,
    StateRestored,
    ConnectionTimeout,
    QueueOpenResult,
    QueueReopenResult,
    QueueCloseResult,
    SlowConsumerNormal,
    SlowConsumerHighWatermark,
    QueueConfigureResult,
    HostUnhealthy,
    HostHealthRestored,
    QueueSuspended,
    QueueResumed,
}

impl SessionEventType {
    const ALL: [Self; 20] = [
        Self::Error,
        Self::Timeout,
        Self::Canceled,
        Self::Undefined,
        Self::Connected,
        Self::Disconnected,
        Self::ConnectionLost,
        Self::Reconnected,
        Self::StateRestored,
        Self::ConnectionTimeout,
        Self::QueueOpenResult,
        Self::QueueReopenResult,
        Self::QueueCloseResult,
        Self::SlowConsumerNormal,
        Self::SlowConsumerHighWatermark,
        Self::QueueConfigureResult,
        Self::HostUnhealthy,
        Self::HostHealthRestored,
        Self::QueueSuspended,
        Self::QueueResumed,
    ];

    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Error => -1,
            Self::Timeout => -2,
            Self::Canceled => -3,
            Self::Undefined => 0,
            Self::Connected => 1,
            Self::Disconnected => 2,
            Self::ConnectionLost => 3,
            Self::Reconnected => 4,
            Self::StateRestored => 5,
            Self::ConnectionTimeout => 6,
            Self::QueueOpenResult => 7,
            Self::QueueReopenResult => 8,
            Self::QueueCloseResult => 9,
            Self::SlowConsumerNormal => 10,
            Self::SlowConsumerHighWatermark => 11,
            Self::QueueConfigureResult => 12,
            Self::HostUnhealthy => 13,
            Self::HostHealthRestored => 14,
            Self::QueueSuspended => 15,
            Self::QueueResumed => 16,
        }
    }

    #[must_use]
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Canceled => "CANCELED",
            Self::Undefined => "UNDEFINED",
            Self::Connected => "CONNECTED",
            Self::Disconnected => "DISCONNECTED",
            Self::ConnectionLost => "CONNECTION_LOST",
            Self::Reconnected => "RECONNECTED",
            Self::StateRestored => "STATE_RESTORED",
            Self::ConnectionTimeout => "CONNECTION_TIMEOUT",
            Self::QueueOpenResult => "QUEUE_OPEN_RESULT",
            Self::QueueReopenResult => "QUEUE_REOPEN_RESULT",
            Self::QueueCloseResult => "QUEUE_CLOSE_RESULT",
            Self::SlowConsumerNormal => "SLOWCONSUMER_NORMAL",
            Self::SlowConsumerHighWatermark => "SLOWCONSUMER_HIGHWATERMARK",
            Self::QueueConfigureResult => "QUEUE_CONFIGURE_RESULT",
            Self::HostUnhealthy => "HOST_UNHEALTHY",
            Self::HostHealthRestored => "HOST_HEALTH_RESTORED",
            Self::QueueSuspended => "QUEUE_SUSPENDED",
            Self::QueueResumed => "QUEUE_RESUMED",
        }
    }
}

/// Payload of an event about one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEvent {
    pub queue_uri: String,
    pub message: Option<String>,
}

impl QueueEvent {
    #[must_use]
    pub fn new(queue_uri: impl Into<String>) -> Self {
        Self {
            queue_uri: queue_uri.into(),
            message: None,
        }
    }

    #[must_use]
    pub fn with_message(queue_uri: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            queue_uri: queue_uri.into(),
            message: Some(message.into()),
        }
    }
}

/// Event delivered to the session event callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected(Option<String>),
    Disconnected(Option<String>),
    ConnectionLost(Option<String>),
    Reconnected(Option<String>),
    StateRestored(Option<String>),
    ConnectionTimeout(Option<String>),
    HostUnhealthy(Option<String>),
    HostHealthRestored(Option<String>),
    QueueSuspended(QueueEvent),
    QueueSuspendFailed(QueueEvent),
    QueueResumed(QueueEvent),
    QueueResumeFailed(QueueEvent),
    QueueReopened(QueueEvent),
    QueueReopenFailed(QueueEvent),
    SlowConsumerNormal(Option<String>),
    SlowConsumerHighWaterMark(Option<String>),
    /// The engine reported a failure.
    Error(Option<String>),
    /// The session layer could not process something the engine delivered.
    InterfaceError(Option<String>),
}

impl SessionEvent {
    /// Interpret a raw engine event.
    #[must_use]
    pub fn from_raw(raw: &RawSessionEvent) -> Self {
        let description = raw
            .error_description
            .as_deref()
            .filter(|d| !d.is_empty());
        // Successful events carry no message, whatever the engine attached.
        let failed = raw.status_code != 0;
        let message = failed.then(|| match description {
            Some(d) => format!("{d}: {} ({})", raw.status_name, raw.status_code),
            None => format!("{} ({})", raw.status_name, raw.status_code),
        });
        let queue = |message| QueueEvent {
            queue_uri: raw.queue_uri.clone().unwrap_or_default(),
            message,
        };

        let Some(event_type) = SessionEventType::from_code(raw.event_type) else {
            return Self::unexpected(&raw.event_name);
        };
        match event_type {
            SessionEventType::Connected => Self::Connected(message),
            SessionEventType::Disconnected => Self::Disconnected(message),
            SessionEventType::ConnectionLost => Self::ConnectionLost(message),
            SessionEventType::Reconnected => Self::Reconnected(message),
            SessionEventType::StateRestored => Self::StateRestored(message),
            SessionEventType::ConnectionTimeout => Self::ConnectionTimeout(message),
            SessionEventType::SlowConsumerNormal => Self::SlowConsumerNormal(message),
            SessionEventType::SlowConsumerHighWatermark => Self::SlowConsumerHighWaterMark(message),
            SessionEventType::HostUnhealthy => Self::HostUnhealthy(message),
            SessionEventType::HostHealthRestored => Self::HostHealthRestored(message),
            SessionEventType::Error => Self::Error(message),
            SessionEventType::QueueReopenResult if failed => Self::QueueReopenFailed(queue(message)),
            SessionEventType::QueueReopenResult => Self::QueueReopened(queue(message)),
            SessionEventType::QueueSuspended if failed => Self::QueueSuspendFailed(queue(message)),
            SessionEventType::QueueSuspended => Self::QueueSuspended(queue(message)),
            SessionEventType::QueueResumed if failed => Self::QueueResumeFailed(queue(message)),
            SessionEventType::QueueResumed => Self::QueueResumed(queue(message)),
            other => Self::unexpected(other.name()),
        }
    }

    /// The engine reported an event type the session never expects.
    fn unexpected(event_name: &str) -> Self {
        Self::InterfaceError(Some(format!("Unexpected event type: {event_name}")))
    }

    /// Variant name, e.g. `QueueSuspended`.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Connected(_) => "Connected",
            Self::Disconnected(_) => "Disconnected",
            Self::ConnectionLost(_) => "ConnectionLost",
            Self::Reconnected(_) => "Reconnected",
            Self::StateRestored(_) => "StateRestored",
            Self::ConnectionTimeout(_) => "ConnectionTimeout",
            Self::HostUnhealthy(_) => "HostUnhealthy",
            Self::HostHealthRestored(_) => "HostHealthRestored",
            Self::QueueSuspended(_) => "QueueSuspended",
            Self::QueueSuspendFailed(_) => "QueueSuspendFailed",
            Self::QueueResumed(_) => "QueueResumed",
            Self::QueueResumeFailed(_) => "QueueResumeFailed",
            Self::QueueReopened(_) => "QueueReopened",
            Self::QueueReopenFailed(_) => "QueueReopenFailed",
            Self::SlowConsumerNormal(_) => "SlowConsumerNormal",
            Self::SlowConsumerHighWaterMark(_) => "SlowConsumerHighWaterMark",
            Self::Error(_) => "Error",
            Self::InterfaceError(_) => "InterfaceError",
        }
    }

    /// The queue this event is about, if any.
    #[must_use]
    pub fn queue_uri(&self) -> Option<&str> {
        self.queue_event().map(|q| q.queue_uri.as_str())
    }

    #[must_use]
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Connected(m)
            | Self::Disconnected(m)
            | Self::ConnectionLost(m)
            | Self::Reconnected(m)
            | Self::StateRestored(m)
            | Self::ConnectionTimeout(m)
            | Self::HostUnhealthy(m)
            | Self::HostHealthRestored(m)
            | Self::SlowConsumerNormal(m)
            | Self::SlowConsumerHighWaterMark(m)
            | Self::Error(m)
            | Self::InterfaceError(m) => m.as_deref(),
            _ => self.queue_event().and_then(|q| q.message.as_deref()),
        }
    }

    const fn queue_event(&self) -> Option<&QueueEvent> {
        match self {
            Self::QueueSuspended(q)
            | Self::QueueSuspendFailed(q)
            | Self::QueueResumed(q)
            | Self::QueueResumeFailed(q)
            | Self::QueueReopened(q)
            | Self::QueueReopenFailed(q) => Some(q),
            _ => None,
        }
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.queue_uri(), self.message()) {
            (Some(uri), Some(msg)) => write!(f, "<{}: {uri} {msg}>", self.name()),
            (Some(uri), None) => write!(f, "<{}: {uri}>", self.name()),
            (None, Some(msg)) => write!(f, "<{}: {msg}>", self.name()),
            (None, None) => write!(f, "<{}>", self.name()),
        }
    }
}

/// Default session event callback: log at a level matching the event.
pub fn log_session_event(event: SessionEvent) {
    match event {
        SessionEvent::Connected(_)
        | SessionEvent::Disconnected(_)
        | SessionEvent::StateRestored(_)
        | SessionEvent::SlowConsumerNormal(_)
        | SessionEvent::QueueReopened(_)
        | SessionEvent::HostUnhealthy(_)
        | SessionEvent::HostHealthRestored(_)
        | SessionEvent::QueueSuspended(_)
        | SessionEvent::QueueResumed(_) => tracing::info!("Received session event: {event}"),
        SessionEvent::ConnectionLost(_)
        | SessionEvent::Reconnected(_)
        | SessionEvent::SlowConsumerHighWaterMark(_) => {
            tracing::warn!("Received session event: {event}");
        }
        _ => tracing::error!("Received session event: {event}"),
    }
}
