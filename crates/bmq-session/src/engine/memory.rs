//! In-memory broker engine.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bmq_core::{
    AckStatus, EngineError, MessageGuid, QueueFlags, QueueOptions, ResultCode, SessionEventType,
    properties::WireProperties,
    traits::{
        BrokerEngine, ConnectSettings, EventSink, PostRequest, RawAck, RawMessage,
        RawSessionEvent,
    },
};
use bytes::Bytes;
use parking_lot::Mutex;
use uuid::Uuid;

/// Engine operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Start,
    Open,
    Configure,
    Close,
    Post,
    Confirm,
    Suspend,
    Resume,
}

type ConsumerKey = (u64, String);

#[derive(Debug, Clone)]
struct Stored {
    guid: MessageGuid,
    payload: Bytes,
    properties: WireProperties,
}

#[derive(Debug)]
struct Consumer {
    priority: i32,
    max_messages: u64,
    max_bytes: u64,
    suspended: bool,
    inflight: Vec<Stored>,
}

impl Consumer {
    fn new(options: &QueueOptions) -> Self {
        let mut consumer = Self {
            priority: 0,
            max_messages: 0,
            max_bytes: 0,
            suspended: false,
            inflight: Vec::new(),
        };
        consumer.configure(options);
        consumer
    }

    fn configure(&mut self, options: &QueueOptions) {
        let options = options.with_defaults();
        self.priority = options.consumer_priority.unwrap_or_default();
        self.max_messages = options.max_unconfirmed_messages.unwrap_or_default();
        self.max_bytes = options.max_unconfirmed_bytes.unwrap_or_default();
    }

    fn accepts(&self, len: u64) -> bool {
        let bytes: u64 = self.inflight.iter().map(|m| m.payload.len() as u64).sum();
        (self.inflight.len() as u64) < self.max_messages
            && (self.inflight.is_empty() || bytes + len <= self.max_bytes)
    }
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<Stored>>,
    consumers: BTreeMap<ConsumerKey, Consumer>,
    sinks: HashMap<u64, Arc<dyn EventSink>>,
}

type Deliveries = Vec<(Arc<dyn EventSink>, RawMessage)>;

impl BrokerState {
    /// Hand out pending messages of `uri` to the best consumers.
    fn pump(&mut self, uri: &str) -> Deliveries {
        let mut out = Vec::new();
        loop {
            let Some(len) = self
                .queues
                .get(uri)
                .and_then(VecDeque::front)
                .map(|m| m.payload.len() as u64)
            else {
                break;
            };
            let chosen = self
                .consumers
                .iter()
                .filter(|((engine, queue), consumer)| {
                    queue == uri
                        && !consumer.suspended
                        && consumer.accepts(len)
                        && self.sinks.contains_key(engine)
                })
                .max_by_key(|(_, consumer)| {
                    (consumer.priority, std::cmp::Reverse(consumer.inflight.len()))
                })
                .map(|(key, _)| key.clone());
            let Some(key) = chosen else {
                break;
            };
            let (Some(message), Some(sink)) = (
                self.queues.get_mut(uri).and_then(VecDeque::pop_front),
                self.sinks.get(&key.0).cloned(),
            ) else {
                break;
            };
            out.push((
                sink,
                RawMessage {
                    payload: message.payload.clone(),
                    guid: message.guid,
                    queue_uri: uri.to_string(),
                    properties: message.properties.clone(),
                },
            ));
            if let Some(consumer) = self.consumers.get_mut(&key) {
                consumer.inflight.push(message);
            }
        }
        out
    }

    /// Put unconfirmed messages back at the head of their queue.
    fn requeue(&mut self, key: &ConsumerKey) {
        if let Some(consumer) = self.consumers.get_mut(key) {
            let returned = std::mem::take(&mut consumer.inflight);
            let queue = self.queues.entry(key.1.clone()).or_default();
            for message in returned.into_iter().rev() {
                queue.push_front(message);
            }
        }
    }
}

fn deliver(deliveries: Deliveries) {
    let mut batch: Vec<RawMessage> = Vec::new();
    let mut current: Option<Arc<dyn EventSink>> = None;
    for (sink, message) in deliveries {
        if let Some(previous) = current.as_ref() {
            if !Arc::ptr_eq(previous, &sink) {
                previous.on_messages(std::mem::take(&mut batch));
            }
        }
        current = Some(sink);
        batch.push(message);
    }
    if let Some(sink) = current {
        sink.on_messages(batch);
    }
}

/// Broker shared by any number of [`MemoryEngine`]s.
///
/// Useful for tests and local development. Messages are lost when the
/// broker is dropped.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    next_engine: Arc<AtomicU64>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A new engine connected to this broker, one per session.
    #[must_use]
    pub fn engine(&self) -> Arc<MemoryEngine> {
        let id = self.next_engine.fetch_add(1, Ordering::SeqCst);
        Arc::new(MemoryEngine {
            id,
            broker: self.clone(),
            inner: Mutex::new(EngineState::default()),
            requests: AtomicUsize::new(0),
        })
    }

    /// Messages waiting for a consumer on `uri`.
    #[must_use]
    pub fn pending(&self, uri: &str) -> usize {
        self.state.lock().queues.get(uri).map_or(0, VecDeque::len)
    }

    /// Messages delivered on `uri` but not confirmed yet.
    #[must_use]
    pub fn unconfirmed(&self, uri: &str) -> usize {
        self.state
            .lock()
            .consumers
            .iter()
            .filter(|((_, queue), _)| queue == uri)
            .map(|(_, consumer)| consumer.inflight.len())
            .sum()
    }
}

#[derive(Debug, Clone, Copy)]
struct OpenQueue {
    flags: QueueFlags,
    options: QueueOptions,
}

#[derive(Default)]
struct EngineState {
    sink: Option<Arc<dyn EventSink>>,
    queues: BTreeMap<String, OpenQueue>,
    failures: HashMap<Operation, ResultCode>,
    ack_failure: Option<AckStatus>,
    latency: Duration,
    reconnects: usize,
}

/// Broker engine backed by a [`MemoryBroker`].
pub struct MemoryEngine {
    id: u64,
    broker: MemoryBroker,
    inner: Mutex<EngineState>,
    requests: AtomicUsize,
}

impl MemoryEngine {
    /// Make the next call of `operation` fail with `code`.
    pub fn fail_next(&self, operation: Operation, code: ResultCode) {
        self.inner.lock().failures.insert(operation, code);
    }

    /// Make the ack of the next post carry `status`; the message is
    /// dropped.
    pub fn fail_next_ack(&self, status: AckStatus) {
        self.inner.lock().ack_failure = Some(status);
    }

    /// Delay every round trip; a round trip slower than its timeout fails
    /// with [`ResultCode::Timeout`].
    pub fn set_latency(&self, latency: Duration) {
        self.inner.lock().latency = latency;
    }

    /// Number of operations the session has issued.
    #[must_use]
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn reconnects(&self) -> usize {
        self.inner.lock().reconnects
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.lock().sink.is_some()
    }

    /// Push messages straight to the session, bypassing the broker.
    pub fn inject_messages(&self, messages: Vec<RawMessage>) {
        if let Some(sink) = self.sink() {
            sink.on_messages(messages);
        }
    }

    /// Push a session event straight to the session.
    pub fn inject_session_event(&self, event: RawSessionEvent) {
        if let Some(sink) = self.sink() {
            sink.on_session_event(event);
        }
    }

    /// Push acks straight to the session.
    pub fn inject_acks(&self, acks: Vec<RawAck>) {
        if let Some(sink) = self.sink() {
            sink.on_acks(acks);
        }
    }

    fn sink(&self) -> Option<Arc<dyn EventSink>> {
        self.inner.lock().sink.clone()
    }

    fn key(&self, uri: &str) -> ConsumerKey {
        (self.id, uri.to_string())
    }

    /// Count the request and apply injected failures.
    fn check(&self, operation: Operation) -> Result<(), EngineError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let failure = self.inner.lock().failures.remove(&operation);
        match failure {
            Some(code) => Err(EngineError::new(
                code,
                format!("injected {operation:?} failure"),
            )),
            None => Ok(()),
        }
    }

    /// A round trip to the broker, subject to latency.
    async fn round_trip(&self, operation: Operation, timeout: Duration) -> Result<(), EngineError> {
        let latency = self.inner.lock().latency;
        if latency >= timeout {
            self.requests.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(timeout).await;
            return Err(EngineError::new(
                ResultCode::Timeout,
                format!("{operation:?} timed out after {timeout:?}"),
            ));
        }
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.check(operation)
    }

    fn ensure_connected(&self) -> Result<Arc<dyn EventSink>, EngineError> {
        self.sink()
            .ok_or_else(|| EngineError::new(ResultCode::NotConnected, "engine is not started"))
    }

    fn open_entry(&self, uri: &str) -> Result<OpenQueue, EngineError> {
        self.inner
            .lock()
            .queues
            .get(uri)
            .copied()
            .ok_or_else(|| EngineError::new(ResultCode::UnknownQueue, format!("{uri} is not open")))
    }
}

#[async_trait]
impl BrokerEngine for MemoryEngine {
    async fn start(
        &self,
        settings: &ConnectSettings,
        sink: Arc<dyn EventSink>,
    ) -> Result<(), EngineError> {
        self.round_trip(Operation::Start, settings.timeout).await?;
        if settings.diagnostics {
            tracing::debug!("Memory engine {} connecting: {settings:?}", self.id);
        }
        {
            let mut inner = self.inner.lock();
            if inner.sink.is_some() {
                return Err(EngineError::new(ResultCode::NotSupported, "already started"));
            }
            inner.sink = Some(Arc::clone(&sink));
        }
        self.broker
            .state
            .lock()
            .sinks
            .insert(self.id, Arc::clone(&sink));
        sink.on_session_event(RawSessionEvent::new(SessionEventType::Connected));
        Ok(())
    }

    fn stop(&self) {
        let (sink, uris) = {
            let mut inner = self.inner.lock();
            let Some(sink) = inner.sink.take() else {
                return;
            };
            let uris: Vec<String> = std::mem::take(&mut inner.queues).into_keys().collect();
            (sink, uris)
        };

        let deliveries = {
            let mut state = self.broker.state.lock();
            state.sinks.remove(&self.id);
            let mut deliveries = Vec::new();
            for uri in &uris {
                let key = self.key(uri);
                state.requeue(&key);
                state.consumers.remove(&key);
                deliveries.extend(state.pump(uri));
            }
            deliveries
        };

        sink.on_session_event(RawSessionEvent::new(SessionEventType::Disconnected));
        deliver(deliveries);
    }

    async fn open_queue(
        &self,
        uri: &str,
        flags: QueueFlags,
        options: &QueueOptions,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.round_trip(Operation::Open, timeout).await?;
        self.ensure_connected()?;
        if !uri.starts_with("bmq://") {
            return Err(EngineError::new(ResultCode::InvalidUri, format!("bad uri {uri}")));
        }
        if flags.is_empty() {
            return Err(EngineError::new(ResultCode::InvalidFlags, "no read or write flag"));
        }
        {
            let mut inner = self.inner.lock();
            if inner.queues.contains_key(uri) {
                return Err(EngineError::new(
                    ResultCode::AlreadyOpened,
                    format!("{uri} is already open"),
                ));
            }
            inner.queues.insert(
                uri.to_string(),
                OpenQueue {
                    flags,
                    options: *options,
                },
            );
        }

        let deliveries = {
            let mut state = self.broker.state.lock();
            state.queues.entry(uri.to_string()).or_default();
            if flags.read {
                state.consumers.insert(self.key(uri), Consumer::new(options));
            }
            state.pump(uri)
        };
        deliver(deliveries);
        Ok(())
    }

    async fn configure_queue(
        &self,
        uri: &str,
        options: &QueueOptions,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.round_trip(Operation::Configure, timeout).await?;
        self.ensure_connected()?;
        let entry = self.open_entry(uri)?;
        if let Some(open) = self.inner.lock().queues.get_mut(uri) {
            open.options = *options;
        }

        let deliveries = {
            let mut state = self.broker.state.lock();
            if entry.flags.read {
                if let Some(consumer) = state.consumers.get_mut(&self.key(uri)) {
                    consumer.configure(options);
                }
            }
            state.pump(uri)
        };
        deliver(deliveries);
        Ok(())
    }

    async fn close_queue(&self, uri: &str, timeout: Duration) -> Result<(), EngineError> {
        self.round_trip(Operation::Close, timeout).await?;
        self.ensure_connected()?;
        self.open_entry(uri)?;
        self.inner.lock().queues.remove(uri);

        let deliveries = {
            let mut state = self.broker.state.lock();
            let key = self.key(uri);
            state.requeue(&key);
            state.consumers.remove(&key);
            state.pump(uri)
        };
        deliver(deliveries);
        Ok(())
    }

    fn queue_options(&self, uri: &str) -> Option<QueueOptions> {
        self.inner
            .lock()
            .queues
            .get(uri)
            .map(|open| open.options.with_defaults())
    }

    fn post(&self, request: PostRequest) -> Result<(), EngineError> {
        self.check(Operation::Post)?;
        let sink = self.ensure_connected()?;
        let (writable, ack_failure) = {
            let mut inner = self.inner.lock();
            let writable = inner
                .queues
                .get(&request.queue_uri)
                .is_some_and(|open| open.flags.write);
            (writable, inner.ack_failure.take())
        };
        if !writable {
            return Err(EngineError::new(
                ResultCode::InvalidArgument,
                format!("{} is not open for writing", request.queue_uri),
            ));
        }

        let PostRequest {
            queue_uri,
            payload,
            properties,
            correlation,
            ..
        } = request;

        let ack = match ack_failure {
            Some(status) => RawAck {
                status: status.code().unwrap_or(i32::MIN),
                status_name: status.name().to_string(),
                guid: None,
                queue_uri: queue_uri.clone(),
                correlation,
            },
            None => {
                let guid = MessageGuid::from(Uuid::new_v4());
                let deliveries = {
                    let mut state = self.broker.state.lock();
                    state.queues.entry(queue_uri.clone()).or_default().push_back(Stored {
                        guid,
                        payload,
                        properties,
                    });
                    state.pump(&queue_uri)
                };
                if correlation.is_some() {
                    sink.on_acks(vec![RawAck {
                        status: 0,
                        status_name: AckStatus::Success.name().to_string(),
                        guid: Some(guid),
                        queue_uri: queue_uri.clone(),
                        correlation,
                    }]);
                }
                deliver(deliveries);
                return Ok(());
            }
        };
        if correlation.is_some() {
            sink.on_acks(vec![ack]);
        }
        Ok(())
    }

    fn confirm(&self, uri: &str, guid: MessageGuid) -> Result<(), EngineError> {
        self.check(Operation::Confirm)?;
        self.ensure_connected()?;
        let deliveries = {
            let mut state = self.broker.state.lock();
            let confirmed = state
                .consumers
                .get_mut(&self.key(uri))
                .and_then(|consumer| {
                    let position = consumer.inflight.iter().position(|m| m.guid == guid)?;
                    Some(consumer.inflight.remove(position))
                });
            if confirmed.is_none() {
                tracing::debug!("Confirm of unknown message {guid} on {uri} ignored");
            }
            state.pump(uri)
        };
        deliver(deliveries);
        Ok(())
    }

    async fn suspend_queue(&self, uri: &str, timeout: Duration) -> Result<(), EngineError> {
        self.round_trip(Operation::Suspend, timeout).await?;
        self.ensure_connected()?;
        self.open_entry(uri)?;
        if let Some(consumer) = self.broker.state.lock().consumers.get_mut(&self.key(uri)) {
            consumer.suspended = true;
        }
        Ok(())
    }

    async fn resume_queue(&self, uri: &str, timeout: Duration) -> Result<(), EngineError> {
        self.round_trip(Operation::Resume, timeout).await?;
        self.ensure_connected()?;
        self.open_entry(uri)?;
        let deliveries = {
            let mut state = self.broker.state.lock();
            if let Some(consumer) = state.consumers.get_mut(&self.key(uri)) {
                consumer.suspended = false;
            }
            state.pump(uri)
        };
        deliver(deliveries);
        Ok(())
    }

    fn request_reconnect(&self) {
        let (sink, uris) = {
            let mut inner = self.inner.lock();
            let Some(sink) = inner.sink.clone() else {
                return;
            };
            inner.reconnects += 1;
            let uris: Vec<String> = inner.queues.keys().cloned().collect();
            (sink, uris)
        };
        tracing::info!("Memory engine {} reconnecting", self.id);

        sink.on_session_event(RawSessionEvent::new(SessionEventType::ConnectionLost));
        let deliveries = {
            let mut state = self.broker.state.lock();
            let mut deliveries = Vec::new();
            for uri in &uris {
                state.requeue(&self.key(uri));
                deliveries.extend(state.pump(uri));
            }
            deliveries
        };
        sink.on_session_event(RawSessionEvent::new(SessionEventType::Reconnected));
        for uri in &uris {
            sink.on_session_event(
                RawSessionEvent::new(SessionEventType::QueueReopenResult).queue(uri.clone()),
            );
        }
        sink.on_session_event(RawSessionEvent::new(SessionEventType::StateRestored));
        deliver(deliveries);
    }
}
