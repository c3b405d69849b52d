//! Event dispatch threads.
//!
//! The engine pushes events into a [`Dispatcher`], which fans them out
//! over one lane per processing thread. Session events always use lane 0;
//! messages and acks are routed by queue URI so each queue keeps its
//! order. Every dispatch thread is marked with its session's id so that
//! blocking operations issued from a callback can be refused instead of
//! deadlocking on the thread that would have to complete them.

use std::{
    cell::RefCell,
    collections::BTreeMap,
    hash::{DefaultHasher, Hash, Hasher},
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
    thread::{self, JoinHandle},
};

use bmq_core::{
    Ack, Message, SessionError, SessionEvent,
    properties,
    traits::{EventSink, RawAck, RawMessage, RawSessionEvent},
};
use futures::future::BoxFuture;
use tokio::{runtime::Handle, sync::mpsc};
use uuid::Uuid;

use crate::{handle::MessageHandle, session::Shared};

/// Work item for a dispatch thread.
pub(crate) enum Inbound {
    Event(RawSessionEvent),
    /// Event raised by the session itself rather than the engine.
    Local(SessionEvent),
    Messages(Vec<RawMessage>),
    Acks(Vec<RawAck>),
    Shutdown,
}

trait Routed {
    fn queue_uri(&self) -> &str;
}

impl Routed for RawMessage {
    fn queue_uri(&self) -> &str {
        &self.queue_uri
    }
}

impl Routed for RawAck {
    fn queue_uri(&self) -> &str {
        &self.queue_uri
    }
}

/// Fans engine output out to the dispatch lanes.
pub(crate) struct Dispatcher {
    lanes: Vec<mpsc::UnboundedSender<Inbound>>,
}

impl Dispatcher {
    pub(crate) fn new(threads: usize) -> (Self, Vec<mpsc::UnboundedReceiver<Inbound>>) {
        let (lanes, receivers): (Vec<_>, Vec<_>) =
            (0..threads.max(1)).map(|_| mpsc::unbounded_channel()).unzip();
        (Self { lanes }, receivers)
    }

    fn lane(&self, uri: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        uri.hash(&mut hasher);
        let lanes = self.lanes.len() as u64;
        usize::try_from(hasher.finish() % lanes).unwrap_or(0)
    }

    fn send(&self, lane: usize, item: Inbound) {
        if self.lanes[lane].send(item).is_err() {
            tracing::debug!("Dispatch lane {lane} closed, dropping work item");
        }
    }

    fn split<T: Routed>(&self, items: Vec<T>) -> BTreeMap<usize, Vec<T>> {
        let mut by_lane: BTreeMap<usize, Vec<T>> = BTreeMap::new();
        for item in items {
            by_lane.entry(self.lane(item.queue_uri())).or_default().push(item);
        }
        by_lane
    }

    /// Queue an event raised by the session, behind everything already on
    /// lane 0.
    pub(crate) fn push_local(&self, event: SessionEvent) {
        self.send(0, Inbound::Local(event));
    }

    /// Ask every dispatch thread to exit once its queue is drained.
    pub(crate) fn shutdown(&self) {
        for lane in 0..self.lanes.len() {
            self.send(lane, Inbound::Shutdown);
        }
    }
}

impl EventSink for Dispatcher {
    fn on_session_event(&self, event: RawSessionEvent) {
        self.send(0, Inbound::Event(event));
    }

    fn on_messages(&self, messages: Vec<RawMessage>) {
        for (lane, batch) in self.split(messages) {
            self.send(lane, Inbound::Messages(batch));
        }
    }

    fn on_acks(&self, acks: Vec<RawAck>) {
        for (lane, batch) in self.split(acks) {
            self.send(lane, Inbound::Acks(batch));
        }
    }
}

struct DispatchScope {
    session: Uuid,
    deferred: Vec<BoxFuture<'static, ()>>,
}

thread_local! {
    static CURRENT: RefCell<Option<DispatchScope>> = const { RefCell::new(None) };
}

/// Whether the calling thread dispatches for `session`.
pub(crate) fn on_dispatch_thread(session: Uuid) -> bool {
    CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .is_some_and(|scope| scope.session == session)
    })
}

/// Refuse blocking operations on the session's own dispatch threads.
pub(crate) fn ensure_not_dispatching(
    session: Uuid,
    operation: &'static str,
) -> Result<(), SessionError> {
    if on_dispatch_thread(session) {
        tracing::warn!("{operation} awaited from a callback of session {session}");
        return Err(SessionError::CalledFromDispatch(operation));
    }
    Ok(())
}

/// Run `future` once the current dispatch step returns, or right away
/// when not called from a dispatch thread of `session`.
pub(crate) fn defer(session: Uuid, runtime: &Handle, future: BoxFuture<'static, ()>) {
    let leftover = CURRENT.with(|current| match current.borrow_mut().as_mut() {
        Some(scope) if scope.session == session => {
            scope.deferred.push(future);
            None
        }
        _ => Some(future),
    });
    if let Some(future) = leftover {
        runtime.spawn(future);
    }
}

fn flush_deferred(runtime: &Handle) {
    let deferred = CURRENT.with(|current| {
        current
            .borrow_mut()
            .as_mut()
            .map(|scope| std::mem::take(&mut scope.deferred))
            .unwrap_or_default()
    });
    for future in deferred {
        runtime.spawn(future);
    }
}

/// Start one dispatch thread per lane.
///
/// # Errors
/// Returns error if a thread cannot be spawned; threads already started
/// are stopped first.
pub(crate) fn spawn_workers(
    shared: &Arc<Shared>,
    lanes: Vec<mpsc::UnboundedReceiver<Inbound>>,
) -> Result<Vec<JoinHandle<()>>, SessionError> {
    let mut workers = Vec::with_capacity(lanes.len());
    for (index, rx) in lanes.into_iter().enumerate() {
        let worker_shared = Arc::clone(shared);
        let spawned = thread::Builder::new()
            .name(format!("bmq-dispatch-{index}"))
            .spawn(move || run_worker(&worker_shared, rx));
        match spawned {
            Ok(handle) => workers.push(handle),
            Err(e) => {
                tracing::error!("Failed to spawn dispatch thread {index}: {e}");
                shared.dispatcher.shutdown();
                for worker in workers {
                    let _ = worker.join();
                }
                return Err(SessionError::Spawn(e));
            }
        }
    }
    Ok(workers)
}

fn run_worker(shared: &Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Inbound>) {
    let _runtime = shared.runtime.enter();
    CURRENT.with(|current| {
        *current.borrow_mut() = Some(DispatchScope {
            session: shared.id,
            deferred: Vec::new(),
        });
    });

    while let Some(item) = rx.blocking_recv() {
        if matches!(item, Inbound::Shutdown) {
            break;
        }
        dispatch(shared, item);
        flush_deferred(&shared.runtime);
    }

    CURRENT.with(|current| current.borrow_mut().take());
    tracing::debug!("Dispatch thread for session {} exiting", shared.id);
}

fn dispatch(shared: &Arc<Shared>, item: Inbound) {
    match item {
        Inbound::Event(raw) => deliver_event(shared, SessionEvent::from_raw(&raw)),
        Inbound::Local(event) => deliver_event(shared, event),
        Inbound::Messages(batch) => deliver_messages(shared, batch),
        Inbound::Acks(batch) => deliver_acks(shared, batch),
        Inbound::Shutdown => {}
    }
}

fn deliver_event(shared: &Shared, event: SessionEvent) {
    let callback = &shared.callbacks.on_session_event;
    guarded("session event callback", || callback(event));
}

fn deliver_messages(shared: &Arc<Shared>, batch: Vec<RawMessage>) {
    let Some(on_message) = shared.callbacks.on_message.as_ref() else {
        deliver_event(
            shared,
            SessionEvent::InterfaceError(Some(
                "Messages received but no callback configured".to_string(),
            )),
        );
        return;
    };

    for raw in batch {
        match properties::decode(&raw.properties) {
            Ok(decoded) => {
                let message = Message::new(
                    raw.payload,
                    raw.guid,
                    raw.queue_uri,
                    decoded.values,
                    decoded.types,
                );
                let handle = MessageHandle::new(shared, &message);
                guarded("message callback", || on_message(message, handle));
            }
            Err(errors) => {
                let detail = errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ");
                tracing::error!(
                    "Dropping message {} from {}: {detail}",
                    raw.guid,
                    raw.queue_uri
                );
                deliver_event(
                    shared,
                    SessionEvent::InterfaceError(Some(format!(
                        "Failed to decode properties of message {} from {}: {detail}",
                        raw.guid, raw.queue_uri
                    ))),
                );
            }
        }
    }
}

fn deliver_acks(shared: &Shared, batch: Vec<RawAck>) {
    for raw in batch {
        let ack = Ack::from_raw(&raw);
        let Some(correlation) = raw.correlation else {
            tracing::debug!("Ignoring uncorrelated {ack}");
            continue;
        };
        let callback = shared.ledger.lock().take(correlation);
        match callback {
            Some(callback) => guarded("ack callback", move || callback(ack)),
            None => deliver_event(
                shared,
                SessionEvent::InterfaceError(Some(format!(
                    "Received {ack} for unknown correlation {correlation}"
                ))),
            ),
        }
    }
}

fn guarded(what: &str, f: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        let reason = panic
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        tracing::error!("Panic in {what}: {reason}");
    }
}
