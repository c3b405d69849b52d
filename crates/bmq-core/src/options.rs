//! Queue options, timeouts and session configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{error::SessionError, health::HostHealthMonitor, traits::ConnectSettings};

pub const DEFAULT_MAX_UNCONFIRMED_MESSAGES: u64 = 1024;
pub const DEFAULT_MAX_UNCONFIRMED_BYTES: u64 = 33_554_432;
pub const DEFAULT_CONSUMER_PRIORITY: i32 = 0;
pub const DEFAULT_SUSPENDS_ON_BAD_HOST_HEALTH: bool = false;

pub const DEFAULT_BROKER_URI: &str = "tcp://localhost:30114";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_OPEN_QUEUE_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_CONFIGURE_QUEUE_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_CLOSE_QUEUE_TIMEOUT: Duration = Duration::from_secs(300);

/// Overrides the configured broker address when set.
pub const BROKER_URI_ENV: &str = "BMQ_BROKER_URI";
/// Enables engine diagnostics when set to anything but `0`.
pub const DIAGNOSTICS_ENV: &str = "BMQ_ENABLE_DIAGNOSTICS";

// 2^63 seconds
const MAX_SECONDS: f64 = 9_223_372_036_854_775_808.0;
const MAX_WHOLE_SECONDS: u64 = 1 << 63;

/// Convert a number of seconds into a timeout.
///
/// # Errors
/// Returns error unless `0 < secs < 2^63`.
pub fn timeout_from_secs_f64(secs: f64) -> Result<Duration, SessionError> {
    if !(secs > 0.0 && secs < MAX_SECONDS) {
        return Err(SessionError::InvalidTimeout(secs.to_string()));
    }
    Duration::try_from_secs_f64(secs).map_err(|_| SessionError::InvalidTimeout(secs.to_string()))
}

/// Check a timeout given as a duration.
///
/// # Errors
/// Returns error for zero or for 2^63 seconds and above.
pub fn validate_timeout(timeout: Duration) -> Result<Duration, SessionError> {
    if timeout.is_zero() || timeout.as_secs() >= MAX_WHOLE_SECONDS {
        return Err(SessionError::InvalidTimeout(format!("{timeout:?}")));
    }
    Ok(timeout)
}

/// Convert a number of seconds into an interval, where zero is allowed.
///
/// # Errors
/// Returns error unless `0 <= secs < 2^63`.
pub fn interval_from_secs_f64(secs: f64) -> Result<Duration, SessionError> {
    if !(secs >= 0.0 && secs < MAX_SECONDS) {
        return Err(SessionError::InvalidInterval(secs.to_string()));
    }
    Duration::try_from_secs_f64(secs).map_err(|_| SessionError::InvalidInterval(secs.to_string()))
}

mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(d)?
            .map(super::timeout_from_secs_f64)
            .transpose()
            .map_err(D::Error::custom)
    }
}

mod opt_interval {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, de::Error};

    pub use super::opt_secs::serialize;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(d)?
            .map(super::interval_from_secs_f64)
            .transpose()
            .map_err(D::Error::custom)
    }
}

/// Per-queue options. Unset fields mean "keep" on configure and
/// "default" on open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    pub max_unconfirmed_messages: Option<u64>,
    pub max_unconfirmed_bytes: Option<u64>,
    pub consumer_priority: Option<i32>,
    pub suspends_on_bad_host_health: Option<bool>,
}

impl QueueOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn max_unconfirmed_messages(mut self, value: u64) -> Self {
        self.max_unconfirmed_messages = Some(value);
        self
    }

    #[must_use]
    pub const fn max_unconfirmed_bytes(mut self, value: u64) -> Self {
        self.max_unconfirmed_bytes = Some(value);
        self
    }

    #[must_use]
    pub const fn consumer_priority(mut self, value: i32) -> Self {
        self.consumer_priority = Some(value);
        self
    }

    #[must_use]
    pub const fn suspends_on_bad_host_health(mut self, value: bool) -> Self {
        self.suspends_on_bad_host_health = Some(value);
        self
    }

    /// Fields set in `update` win.
    #[must_use]
    pub fn merge(&self, update: &Self) -> Self {
        Self {
            max_unconfirmed_messages: update
                .max_unconfirmed_messages
                .or(self.max_unconfirmed_messages),
            max_unconfirmed_bytes: update.max_unconfirmed_bytes.or(self.max_unconfirmed_bytes),
            consumer_priority: update.consumer_priority.or(self.consumer_priority),
            suspends_on_bad_host_health: update
                .suspends_on_bad_host_health
                .or(self.suspends_on_bad_host_health),
        }
    }

    /// Every field set, missing ones taking the broker defaults.
    #[must_use]
    pub fn with_defaults(&self) -> Self {
        Self {
            max_unconfirmed_messages: Some(
                self.max_unconfirmed_messages
                    .unwrap_or(DEFAULT_MAX_UNCONFIRMED_MESSAGES),
            ),
            max_unconfirmed_bytes: Some(
                self.max_unconfirmed_bytes
                    .unwrap_or(DEFAULT_MAX_UNCONFIRMED_BYTES),
            ),
            consumer_priority: Some(self.consumer_priority.unwrap_or(DEFAULT_CONSUMER_PRIORITY)),
            suspends_on_bad_host_health: Some(
                self.suspends_on_bad_host_health
                    .unwrap_or(DEFAULT_SUSPENDS_ON_BAD_HOST_HEALTH),
            ),
        }
    }

    /// Drop the fields that only matter to consumers.
    #[must_use]
    pub const fn without_consumer_fields(mut self) -> Self {
        self.max_unconfirmed_messages = None;
        self.max_unconfirmed_bytes = None;
        self.consumer_priority = None;
        self
    }

    #[must_use]
    pub fn suspends(&self) -> bool {
        self.suspends_on_bad_host_health
            .unwrap_or(DEFAULT_SUSPENDS_ON_BAD_HOST_HEALTH)
    }
}

/// Session-wide timeouts. Unset entries take the defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    #[serde(with = "opt_secs")]
    pub connect: Option<Duration>,
    #[serde(with = "opt_secs")]
    pub disconnect: Option<Duration>,
    #[serde(with = "opt_secs")]
    pub open_queue: Option<Duration>,
    #[serde(with = "opt_secs")]
    pub configure_queue: Option<Duration>,
    #[serde(with = "opt_secs")]
    pub close_queue: Option<Duration>,
}

impl Timeouts {
    /// Same timeout for opening, configuring and closing queues.
    #[must_use]
    pub const fn uniform(timeout: Duration) -> Self {
        Self {
            connect: None,
            disconnect: None,
            open_queue: Some(timeout),
            configure_queue: Some(timeout),
            close_queue: Some(timeout),
        }
    }

    #[must_use]
    pub const fn connect(mut self, timeout: Duration) -> Self {
        self.connect = Some(timeout);
        self
    }

    #[must_use]
    pub const fn disconnect(mut self, timeout: Duration) -> Self {
        self.disconnect = Some(timeout);
        self
    }

    /// Validate and fill in defaults.
    ///
    /// # Errors
    /// Returns error if any configured timeout is out of range.
    pub fn resolve(&self) -> Result<ResolvedTimeouts, SessionError> {
        let pick = |value: Option<Duration>, default| value.map_or(Ok(default), validate_timeout);
        Ok(ResolvedTimeouts {
            connect: pick(self.connect, DEFAULT_CONNECT_TIMEOUT)?,
            disconnect: pick(self.disconnect, DEFAULT_DISCONNECT_TIMEOUT)?,
            open_queue: pick(self.open_queue, DEFAULT_OPEN_QUEUE_TIMEOUT)?,
            configure_queue: pick(self.configure_queue, DEFAULT_CONFIGURE_QUEUE_TIMEOUT)?,
            close_queue: pick(self.close_queue, DEFAULT_CLOSE_QUEUE_TIMEOUT)?,
        })
    }
}

/// Timeouts with every category filled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedTimeouts {
    pub connect: Duration,
    pub disconnect: Duration,
    pub open_queue: Duration,
    pub configure_queue: Duration,
    pub close_queue: Duration,
}

/// Compression applied to posted payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    #[default]
    None,
    Zlib,
}

/// Session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    pub broker_uri: String,
    pub timeouts: Timeouts,
    pub num_processing_threads: usize,
    pub blob_buffer_size: Option<u64>,
    pub channel_high_watermark: Option<u64>,
    pub event_queue_watermarks: Option<(u64, u64)>,
    #[serde(with = "opt_interval")]
    pub stats_dump_interval: Option<Duration>,
    pub message_compression_algorithm: CompressionAlgorithm,
    /// Enables host-health driven suspension when set.
    #[serde(skip)]
    pub host_health_monitor: Option<HostHealthMonitor>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            broker_uri: DEFAULT_BROKER_URI.to_string(),
            timeouts: Timeouts::default(),
            num_processing_threads: 1,
            blob_buffer_size: None,
            channel_high_watermark: None,
            event_queue_watermarks: None,
            stats_dump_interval: None,
            message_compression_algorithm: CompressionAlgorithm::None,
            host_health_monitor: None,
        }
    }
}

impl SessionOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load options from JSON; seconds fields are validated on the way in.
    ///
    /// # Errors
    /// Returns error on malformed JSON or out-of-range values.
    pub fn from_json(json: &str) -> Result<Self, SessionError> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    #[must_use]
    pub fn broker_uri(mut self, uri: impl Into<String>) -> Self {
        self.broker_uri = uri.into();
        self
    }

    #[must_use]
    pub const fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    #[must_use]
    pub const fn num_processing_threads(mut self, threads: usize) -> Self {
        self.num_processing_threads = threads;
        self
    }

    #[must_use]
    pub const fn message_compression_algorithm(mut self, algorithm: CompressionAlgorithm) -> Self {
        self.message_compression_algorithm = algorithm;
        self
    }

    #[must_use]
    pub fn host_health_monitor(mut self, monitor: HostHealthMonitor) -> Self {
        self.host_health_monitor = Some(monitor);
        self
    }

    /// # Errors
    /// Returns error describing the first invalid setting.
    pub fn validate(&self) -> Result<(), SessionError> {
        self.timeouts.resolve()?;
        if self.num_processing_threads == 0 {
            return Err(SessionError::InvalidArgument(
                "num_processing_threads must be at least 1".into(),
            ));
        }
        if let Some((low, high)) = self.event_queue_watermarks {
            if low >= high {
                return Err(SessionError::InvalidArgument(format!(
                    "event_queue_watermarks low ({low}) must be below high ({high})"
                )));
            }
        }
        Ok(())
    }

    /// Build the settings handed to the engine, applying environment
    /// overrides.
    ///
    /// # Errors
    /// Returns error if the options are invalid.
    pub fn connect_settings(&self) -> Result<ConnectSettings, SessionError> {
        self.validate()?;
        let timeouts = self.timeouts.resolve()?;
        Ok(ConnectSettings {
            broker_uri: effective_broker_uri(&self.broker_uri, std::env::var(BROKER_URI_ENV).ok()),
            timeout: timeouts.connect,
            disconnect_timeout: timeouts.disconnect,
            num_processing_threads: self.num_processing_threads,
            blob_buffer_size: self.blob_buffer_size,
            channel_high_watermark: self.channel_high_watermark,
            event_queue_watermarks: self.event_queue_watermarks,
            stats_dump_interval: self.stats_dump_interval,
            host_health_monitoring: self.host_health_monitor.is_some(),
            diagnostics: diagnostics_enabled(std::env::var(DIAGNOSTICS_ENV).ok().as_deref()),
        })
    }
}

fn effective_broker_uri(configured: &str, from_env: Option<String>) -> String {
    from_env
        .filter(|uri| !uri.is_empty())
        .unwrap_or_else(|| configured.to_string())
}

fn diagnostics_enabled(value: Option<&str>) -> bool {
    value.is_some_and(|v| !v.is_empty() && v != "0")
}
