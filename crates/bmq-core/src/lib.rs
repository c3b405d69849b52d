//! Core types and engine abstractions for the broker client session layer.
//!
//! This crate provides:
//! - `properties` - Typed message properties and their wire codec
//! - `SessionEvent`, `Message`, `Ack` - What the session hands to callbacks
//! - `QueueOptions`, `Timeouts`, `SessionOptions` - Configuration and validation
//! - `HostHealthMonitor` - Host-health signal source
//! - `BrokerEngine` and `EventSink` traits - The seam to the broker engine

pub mod error;
pub mod event;
pub mod health;
pub mod message;
pub mod options;
pub mod properties;
pub mod traits;

pub use error::{PropertyError, SessionError};
pub use event::{QueueEvent, SessionEvent, SessionEventType, log_session_event};
pub use health::{HostHealth, HostHealthMonitor};
pub use message::{Ack, AckStatus, Message, MessageGuid};
pub use options::{CompressionAlgorithm, QueueOptions, ResolvedTimeouts, SessionOptions, Timeouts};
pub use properties::{PropertyType, PropertyValue};
pub use traits::{BrokerEngine, EngineError, EventSink, QueueFlags, ResultCode};
