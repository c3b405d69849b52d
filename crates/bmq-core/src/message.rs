//! Delivered messages and publish acknowledgments.

use std::fmt;

use bytes::Bytes;
use uuid::Uuid;

use crate::{
    properties::{Properties, PropertyTypes},
    traits::RawAck,
};

/// 128-bit message identifier assigned by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageGuid([u8; 16]);

impl MessageGuid {
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<Uuid> for MessageGuid {
    fn from(uuid: Uuid) -> Self {
        Self(uuid.into_bytes())
    }
}

impl fmt::Display for MessageGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

/// A message delivered from a queue opened for reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    payload: Bytes,
    guid: MessageGuid,
    queue_uri: String,
    properties: Properties,
    property_types: PropertyTypes,
}

impl Message {
    #[must_use]
    pub const fn new(
        payload: Bytes,
        guid: MessageGuid,
        queue_uri: String,
        properties: Properties,
        property_types: PropertyTypes,
    ) -> Self {
        Self {
            payload,
            guid,
            queue_uri,
            properties,
            property_types,
        }
    }

    #[must_use]
    pub const fn data(&self) -> &Bytes {
        &self.payload
    }

    #[must_use]
    pub const fn guid(&self) -> MessageGuid {
        self.guid
    }

    #[must_use]
    pub fn queue_uri(&self) -> &str {
        &self.queue_uri
    }

    #[must_use]
    pub const fn properties(&self) -> &Properties {
        &self.properties
    }

    #[must_use]
    pub const fn property_types(&self) -> &PropertyTypes {
        &self.property_types
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Message[{}] for {}>", self.guid, self.queue_uri)
    }
}

/// Outcome of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckStatus {
    /// The broker stored the message.
    Success,
    /// Failure the broker could not classify.
    Unknown,
    /// No acknowledgement arrived in time.
    Timeout,
    /// The message was posted while disconnected.
    NotConnected,
    /// The post was canceled, e.g. by closing the queue.
    Canceled,
    /// The broker does not support the post.
    NotSupported,
    /// The broker refused the message.
    Refused,
    /// The message was malformed.
    InvalidArgument,
    /// The queue was not ready to accept messages.
    NotReady,
    /// The queue holds its maximum number of messages.
    LimitMessages,
    /// The queue holds its maximum number of bytes.
    LimitBytes,
    /// The broker failed to persist the message.
    StorageFailure,
    /// A status code this client does not know about.
    Unrecognized,
}

impl AckStatus {
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Success,
            -1 => Self::Unknown,
            -2 => Self::Timeout,
            -3 => Self::NotConnected,
            -4 => Self::Canceled,
            -5 => Self::NotSupported,
            -6 => Self::Refused,
            -7 => Self::InvalidArgument,
            -8 => Self::NotReady,
            -100 => Self::LimitMessages,
            -101 => Self::LimitBytes,
            -104 => Self::StorageFailure,
            _ => Self::Unrecognized,
        }
    }

    /// Wire code; `None` for [`AckStatus::Unrecognized`].
    #[must_use]
    pub const fn code(self) -> Option<i32> {
        match self {
            Self::Success => Some(0),
            Self::Unknown => Some(-1),
            Self::Timeout => Some(-2),
            Self::NotConnected => Some(-3),
            Self::Canceled => Some(-4),
            Self::NotSupported => Some(-5),
            Self::Refused => Some(-6),
            Self::InvalidArgument => Some(-7),
            Self::NotReady => Some(-8),
            Self::LimitMessages => Some(-100),
            Self::LimitBytes => Some(-101),
            Self::StorageFailure => Some(-104),
            Self::Unrecognized => None,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Unknown => "UNKNOWN",
            Self::Timeout => "TIMEOUT",
            Self::NotConnected => "NOT_CONNECTED",
            Self::Canceled => "CANCELED",
            Self::NotSupported => "NOT_SUPPORTED",
            Self::Refused => "REFUSED",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::NotReady => "NOT_READY",
            Self::LimitMessages => "LIMIT_MESSAGES",
            Self::LimitBytes => "LIMIT_BYTES",
            Self::StorageFailure => "STORAGE_FAILURE",
            Self::Unrecognized => "UNRECOGNIZED",
        }
    }
}

impl fmt::Display for AckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Acknowledgment of a posted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    guid: Option<MessageGuid>,
    status: AckStatus,
    status_description: String,
    queue_uri: String,
}

impl Ack {
    #[must_use]
    pub fn from_raw(raw: &RawAck) -> Self {
        Self {
            guid: raw.guid,
            status: AckStatus::from_code(raw.status),
            status_description: raw.status_name.clone(),
            queue_uri: raw.queue_uri.clone(),
        }
    }

    /// Set only when the broker accepted the message.
    #[must_use]
    pub const fn guid(&self) -> Option<MessageGuid> {
        self.guid
    }

    #[must_use]
    pub const fn status(&self) -> AckStatus {
        self.status
    }

    /// Status as reported by the engine, including codes this client does
    /// not recognize.
    #[must_use]
    pub fn status_description(&self) -> &str {
        &self.status_description
    }

    #[must_use]
    pub fn queue_uri(&self) -> &str {
        &self.queue_uri
    }
}

impl fmt::Display for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.guid {
            Some(guid) => write!(f, "<Ack[{guid}] {} for {}>", self.status, self.queue_uri),
            None => write!(f, "<Ack {} for {}>", self.status, self.queue_uri),
        }
    }
}
