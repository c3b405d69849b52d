//! Session lifecycle and queue operations.

use std::{
    fmt,
    sync::Arc,
    thread::JoinHandle,
    time::Duration,
};

use bmq_core::{
    Ack, BrokerEngine, CompressionAlgorithm, HostHealth, Message, MessageGuid, QueueFlags,
    QueueOptions, ResolvedTimeouts, SessionError, SessionEvent, SessionOptions,
    log_session_event,
    options::validate_timeout,
    properties::{self, Properties, PropertyType, PropertyTypes, PropertyValue},
    traits::{EventSink, PostRequest},
};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::{runtime::Handle, sync::oneshot};
use uuid::Uuid;

use crate::{
    dispatch::{self, Dispatcher},
    handle::{MessageHandle, SessionHandle},
    health,
    ledger::{AckCallback, CallbackLedger},
    registry::QueueRegistry,
};

/// Callback receiving session events.
pub type SessionEventCallback = Arc<dyn Fn(SessionEvent) + Send + Sync>;

/// Callback receiving messages from queues opened for reading.
pub type MessageCallback = Arc<dyn Fn(Message, MessageHandle) + Send + Sync>;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Stopping,
    Stopped,
}

pub(crate) struct Callbacks {
    pub(crate) on_session_event: SessionEventCallback,
    pub(crate) on_message: Option<MessageCallback>,
}

/// State shared by the session, its handles and its dispatch threads.
pub(crate) struct Shared {
    pub(crate) id: Uuid,
    state: RwLock<SessionState>,
    pub(crate) registry: Mutex<QueueRegistry>,
    pub(crate) ledger: Mutex<CallbackLedger>,
    pub(crate) engine: Arc<dyn BrokerEngine>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) callbacks: Callbacks,
    pub(crate) timeouts: ResolvedTimeouts,
    compression: CompressionAlgorithm,
    pub(crate) monitor_host_health: bool,
    pub(crate) host_health: Mutex<HostHealth>,
    pub(crate) runtime: Handle,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) bridge_stop: Mutex<Option<oneshot::Sender<()>>>,
}

fn resolve_timeout(explicit: Option<Duration>, default: Duration) -> Result<Duration, SessionError> {
    explicit.map_or(Ok(default), validate_timeout)
}

impl Shared {
    pub(crate) fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    fn ensure_connected(&self) -> Result<(), SessionError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SessionError::SessionStopped)
        }
    }

    pub(crate) async fn open_queue(
        &self,
        uri: &str,
        flags: QueueFlags,
        options: QueueOptions,
        timeout: Option<Duration>,
    ) -> Result<(), SessionError> {
        dispatch::ensure_not_dispatching(self.id, "open_queue")?;
        self.ensure_connected()?;
        let timeout = resolve_timeout(timeout, self.timeouts.open_queue)?;
        if flags.is_empty() {
            return Err(SessionError::InvalidArgument(format!(
                "Can't open queue {uri}: at least one of read or write is required"
            )));
        }
        if flags.read && self.callbacks.on_message.is_none() {
            return Err(SessionError::InvalidArgument(format!(
                "Can't open queue {uri} in read mode: no on_message callback was provided \
                 at Session construction"
            )));
        }
        self.check_host_health_option(&options)?;

        tracing::debug!("Opening queue {uri} with {flags:?}");
        self.engine
            .open_queue(uri, flags, &options, timeout)
            .await
            .map_err(|e| SessionError::engine(format!("open {uri} queue"), e))?;

        let effective = self.engine.queue_options(uri).unwrap_or(options);
        self.registry.lock().insert(uri, flags, effective);
        tracing::info!("Opened queue {uri}");

        self.reconcile_suspension(uri).await;
        Ok(())
    }

    pub(crate) async fn configure_queue(
        &self,
        uri: &str,
        update: QueueOptions,
        timeout: Option<Duration>,
    ) -> Result<(), SessionError> {
        dispatch::ensure_not_dispatching(self.id, "configure_queue")?;
        self.ensure_connected()?;
        let timeout = resolve_timeout(timeout, self.timeouts.configure_queue)?;
        self.check_host_health_option(&update)?;

        let merged = self
            .registry
            .lock()
            .options(uri)
            .ok_or_else(|| SessionError::QueueNotOpened(uri.to_string()))?
            .merge(&update);

        self.engine
            .configure_queue(uri, &merged, timeout)
            .await
            .map_err(|e| SessionError::engine(format!("configure {uri} queue"), e))?;

        self.registry.lock().apply(uri, &update);
        tracing::debug!("Configured queue {uri}: {merged:?}");

        self.reconcile_suspension(uri).await;
        Ok(())
    }

    pub(crate) async fn close_queue(
        &self,
        uri: &str,
        timeout: Option<Duration>,
    ) -> Result<(), SessionError> {
        dispatch::ensure_not_dispatching(self.id, "close_queue")?;
        self.ensure_connected()?;
        let timeout = resolve_timeout(timeout, self.timeouts.close_queue)?;

        self.registry.lock().begin_close(uri)?;

        let result = self.engine.close_queue(uri, timeout).await;
        let mut registry = self.registry.lock();
        match result {
            Ok(()) => {
                registry.remove(uri);
                tracing::info!("Closed queue {uri}");
                Ok(())
            }
            Err(e) => {
                registry.abort_close(uri);
                Err(SessionError::engine(format!("close {uri} queue"), e))
            }
        }
    }

    pub(crate) fn get_queue_options(&self, uri: &str) -> Result<QueueOptions, SessionError> {
        self.ensure_connected()?;
        self.registry
            .lock()
            .options(uri)
            .ok_or_else(|| SessionError::QueueNotOpened(uri.to_string()))
    }

    pub(crate) fn post(&self, message: PostMessage) -> Result<(), SessionError> {
        self.ensure_connected()?;
        let PostMessage {
            queue_uri,
            payload,
            properties,
            property_types,
            on_ack,
        } = message;

        if payload.is_empty() {
            return Err(SessionError::InvalidArgument(format!(
                "Can't post an empty message to {queue_uri}"
            )));
        }
        let wire = properties::encode(&properties, &property_types)?;
        self.registry.lock().check_postable(&queue_uri)?;

        let correlation = on_ack.map(|callback| self.ledger.lock().register(callback));
        let request = PostRequest {
            queue_uri,
            payload,
            properties: wire,
            correlation,
            compression: self.compression,
        };
        let uri = request.queue_uri.clone();

        if let Err(e) = self.engine.post(request) {
            let released = correlation.and_then(|id| self.ledger.lock().take(id));
            drop(released);
            return Err(SessionError::engine(format!("post to {uri}"), e));
        }
        Ok(())
    }

    pub(crate) fn confirm(&self, uri: &str, guid: MessageGuid) -> Result<(), SessionError> {
        self.ensure_connected()?;
        self.registry.lock().check_confirmable(uri)?;
        self.engine
            .confirm(uri, guid)
            .map_err(|e| SessionError::engine(format!("confirm {guid} on {uri}"), e))
    }

    fn check_host_health_option(&self, options: &QueueOptions) -> Result<(), SessionError> {
        if options.suspends_on_bad_host_health == Some(true) && !self.monitor_host_health {
            return Err(SessionError::InvalidArgument(
                "Queues cannot use suspends_on_bad_host_health if host health monitoring was \
                 disabled when the Session was created"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Bring a queue's suspension in line with its options and the
    /// current host health.
    async fn reconcile_suspension(&self, uri: &str) {
        if !self.monitor_host_health {
            return;
        }
        let unhealthy = *self.host_health.lock() == HostHealth::Unhealthy;
        let Some((suspends, suspended)) = self
            .registry
            .lock()
            .get(uri)
            .map(|entry| (entry.options().suspends(), entry.suspended))
        else {
            return;
        };
        let timeout = self.timeouts.configure_queue;

        if unhealthy && suspends && !suspended {
            match self.engine.suspend_queue(uri, timeout).await {
                Ok(()) => {
                    self.registry.lock().set_suspended(uri, true);
                    tracing::info!("Queue {uri} suspended while host is unhealthy");
                }
                Err(e) => tracing::warn!("Failed to suspend queue {uri}: {e}"),
            }
        } else if suspended && !suspends {
            match self.engine.resume_queue(uri, timeout).await {
                Ok(()) => {
                    self.registry.lock().set_suspended(uri, false);
                    tracing::info!("Queue {uri} resumed");
                }
                Err(e) => tracing::warn!("Failed to resume queue {uri}: {e}"),
            }
        }
    }

    /// Stop the engine and drain the dispatch threads.
    ///
    /// Returns false if the session was not connected.
    pub(crate) fn shutdown(&self) -> bool {
        {
            let mut state = self.state.write();
            if *state != SessionState::Connected {
                return false;
            }
            *state = SessionState::Stopping;
        }
        tracing::info!("Stopping session {}", self.id);

        if let Some(stop) = self.bridge_stop.lock().take() {
            let _ = stop.send(());
        }
        self.teardown();
        tracing::info!("Session {} stopped", self.id);
        true
    }

    fn teardown(&self) {
        self.engine.stop();
        self.dispatcher.shutdown();

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                tracing::error!("Dispatch thread of session {} panicked", self.id);
            }
        }

        let dropped = self.ledger.lock().drain();
        if !dropped.is_empty() {
            tracing::debug!(
                "Dropping {} ack callbacks pending at stop of session {}",
                dropped.len(),
                self.id
            );
        }
        drop(dropped);
        *self.state.write() = SessionState::Stopped;
    }
}

/// Builder for [`Session`].
pub struct SessionBuilder {
    engine: Arc<dyn BrokerEngine>,
    on_session_event: SessionEventCallback,
    on_message: Option<MessageCallback>,
    options: SessionOptions,
}

impl SessionBuilder {
    /// Callback for session events. Defaults to [`log_session_event`].
    #[must_use]
    pub fn on_session_event(
        mut self,
        callback: impl Fn(SessionEvent) + Send + Sync + 'static,
    ) -> Self {
        self.on_session_event = Arc::new(callback);
        self
    }

    /// Callback for delivered messages; required to open queues for reading.
    #[must_use]
    pub fn on_message(
        mut self,
        callback: impl Fn(Message, MessageHandle) + Send + Sync + 'static,
    ) -> Self {
        self.on_message = Some(Arc::new(callback));
        self
    }

    #[must_use]
    pub fn options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Start dispatching and connect to the broker.
    ///
    /// # Errors
    /// Returns error if the options are invalid, a dispatch thread cannot
    /// be spawned, or the engine fails to connect. Nothing is left running
    /// on failure.
    pub async fn connect(self) -> Result<Session, SessionError> {
        let settings = self.options.connect_settings()?;
        let timeouts = self.options.timeouts.resolve()?;
        let runtime = Handle::try_current().map_err(|e| SessionError::Internal(e.to_string()))?;

        let monitor = self.options.host_health_monitor.clone();
        let health_rx = monitor.as_ref().map(|m| (m.subscribe(), m.state()));

        let (dispatcher, lanes) = Dispatcher::new(settings.num_processing_threads);
        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            state: RwLock::new(SessionState::Connecting),
            registry: Mutex::new(QueueRegistry::new()),
            ledger: Mutex::new(CallbackLedger::new()),
            engine: self.engine,
            dispatcher: Arc::new(dispatcher),
            callbacks: Callbacks {
                on_session_event: self.on_session_event,
                on_message: self.on_message,
            },
            timeouts,
            compression: self.options.message_compression_algorithm,
            monitor_host_health: monitor.is_some(),
            host_health: Mutex::new(HostHealth::Healthy),
            runtime,
            workers: Mutex::new(Vec::new()),
            bridge_stop: Mutex::new(None),
        });

        let workers = dispatch::spawn_workers(&shared, lanes)?;
        *shared.workers.lock() = workers;

        tracing::info!(
            "Starting session {} against {}",
            shared.id,
            settings.broker_uri
        );
        let sink: Arc<dyn EventSink> = shared.dispatcher.clone();
        if let Err(e) = shared.engine.start(&settings, sink).await {
            tracing::error!("Failed to start session {}: {e}", shared.id);
            let abandoned = Arc::clone(&shared);
            tokio::task::spawn_blocking(move || abandoned.teardown())
                .await
                .map_err(|join| SessionError::Internal(join.to_string()))?;
            return Err(SessionError::engine("start session", e));
        }

        *shared.state.write() = SessionState::Connected;
        if let (Some(monitor), Some((rx, initial))) = (monitor, health_rx) {
            health::start_bridge(&shared, monitor, rx, initial);
        }
        tracing::info!("Session {} connected", shared.id);

        Ok(Session { shared })
    }
}

/// A connection to the broker.
///
/// Dropping a connected session stops it; prefer calling
/// [`Session::stop`] explicitly.
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Start building a session on top of `engine`.
    #[must_use]
    pub fn builder(engine: Arc<dyn BrokerEngine>) -> SessionBuilder {
        SessionBuilder {
            engine,
            on_session_event: Arc::new(log_session_event),
            on_message: None,
            options: SessionOptions::default(),
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Handle usable from callbacks; does not keep the session alive.
    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        SessionHandle::new(&self.shared)
    }

    #[must_use]
    pub fn monitors_host_health(&self) -> bool {
        self.shared.monitor_host_health
    }

    /// Ack callbacks still waiting for their ack.
    #[must_use]
    pub fn pending_acks(&self) -> usize {
        self.shared.ledger.lock().pending()
    }

    /// Message handles not yet dropped.
    #[must_use]
    pub fn live_message_handles(&self) -> usize {
        self.shared.ledger.lock().live_handles()
    }

    /// Open a queue.
    ///
    /// # Errors
    /// Returns error if the session is stopped, the arguments are invalid,
    /// or the broker refuses or does not answer within `timeout`.
    pub async fn open_queue(
        &self,
        uri: &str,
        flags: QueueFlags,
        options: QueueOptions,
        timeout: Option<Duration>,
    ) -> Result<(), SessionError> {
        self.shared.open_queue(uri, flags, options, timeout).await
    }

    /// Change some options of an open queue.
    ///
    /// # Errors
    /// Returns error if the queue is not open or the broker refuses; the
    /// queue's options are unchanged then.
    pub async fn configure_queue(
        &self,
        uri: &str,
        options: QueueOptions,
        timeout: Option<Duration>,
    ) -> Result<(), SessionError> {
        self.shared.configure_queue(uri, options, timeout).await
    }

    /// Close a queue.
    ///
    /// # Errors
    /// Returns error if the queue is not open or the broker refuses; the
    /// queue stays open then.
    pub async fn close_queue(
        &self,
        uri: &str,
        timeout: Option<Duration>,
    ) -> Result<(), SessionError> {
        self.shared.close_queue(uri, timeout).await
    }

    /// Effective options of an open queue.
    ///
    /// # Errors
    /// Returns error if the queue is not open.
    pub fn get_queue_options(&self, uri: &str) -> Result<QueueOptions, SessionError> {
        self.shared.get_queue_options(uri)
    }

    /// Publish a message.
    ///
    /// # Errors
    /// Returns error if the message is invalid or the queue cannot take
    /// it; the ack callback is released before returning.
    pub fn post(&self, message: PostMessage) -> Result<(), SessionError> {
        self.shared.post(message)
    }

    /// Confirm a delivered message.
    ///
    /// # Errors
    /// Returns error if its queue is no longer open or is closing.
    pub fn confirm(&self, message: &Message) -> Result<(), SessionError> {
        self.shared.confirm(message.queue_uri(), message.guid())
    }

    /// Disconnect and wait for in-flight callbacks to finish.
    ///
    /// # Errors
    /// Returns error if awaited from one of this session's callbacks.
    pub async fn stop(&self) -> Result<(), SessionError> {
        stop_shared(&self.shared).await
    }
}

pub(crate) async fn stop_shared(shared: &Arc<Shared>) -> Result<(), SessionError> {
    dispatch::ensure_not_dispatching(shared.id, "stop")?;
    let stopping = Arc::clone(shared);
    tokio::task::spawn_blocking(move || stopping.shutdown())
        .await
        .map_err(|e| SessionError::Internal(e.to_string()))?;
    Ok(())
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("state", &self.shared.state())
            .finish_non_exhaustive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.shared.is_connected() {
            return;
        }
        if dispatch::on_dispatch_thread(self.shared.id) {
            tracing::error!(
                "Session {} dropped from its own callback while connected; stopping would \
                 join the current thread",
                self.shared.id
            );
            std::process::abort();
        }
        tracing::warn!("stop() not invoked before destruction of Session");
        self.shared.shutdown();
    }
}

/// A message to publish.
pub struct PostMessage {
    queue_uri: String,
    payload: Bytes,
    properties: Properties,
    property_types: PropertyTypes,
    on_ack: Option<AckCallback>,
}

impl PostMessage {
    #[must_use]
    pub fn new(queue_uri: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            queue_uri: queue_uri.into(),
            payload: payload.into(),
            properties: Properties::new(),
            property_types: PropertyTypes::new(),
            on_ack: None,
        }
    }

    #[must_use]
    pub fn property(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Override the wire type of a property.
    #[must_use]
    pub fn property_type(mut self, name: impl Into<String>, ty: PropertyType) -> Self {
        self.property_types.insert(name.into(), ty);
        self
    }

    #[must_use]
    pub fn properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    /// Ask for the ack; `callback` runs on a dispatch thread.
    #[must_use]
    pub fn on_ack(mut self, callback: impl FnOnce(Ack) + Send + 'static) -> Self {
        self.on_ack = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for PostMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostMessage")
            .field("queue_uri", &self.queue_uri)
            .field("payload_len", &self.payload.len())
            .field("properties", &self.properties)
            .field("property_types", &self.property_types)
            .field("on_ack", &self.on_ack.is_some())
            .finish()
    }
}
