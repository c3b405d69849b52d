//! Weak handles to a session.

use std::{
    fmt,
    future::Future,
    sync::{Arc, Weak},
    time::Duration,
};

use bmq_core::{Message, MessageGuid, QueueFlags, QueueOptions, SessionError};
use tokio::runtime::Handle;
use uuid::Uuid;

use crate::{
    dispatch,
    ledger::HandleLease,
    session::{self, PostMessage, SessionState, Shared},
};

/// Cloneable, non-owning access to a session's operations.
///
/// Every call fails with [`SessionError::SessionStopped`] once the session
/// is gone. From inside a callback, blocking operations must go through
/// [`SessionHandle::defer`].
#[derive(Clone)]
pub struct SessionHandle {
    shared: Weak<Shared>,
    id: Uuid,
    runtime: Handle,
}

impl SessionHandle {
    pub(crate) fn new(shared: &Arc<Shared>) -> Self {
        Self {
            shared: Arc::downgrade(shared),
            id: shared.id,
            runtime: shared.runtime.clone(),
        }
    }

    fn upgrade(&self) -> Result<Arc<Shared>, SessionError> {
        self.shared.upgrade().ok_or(SessionError::SessionStopped)
    }

    #[must_use]
    pub const fn session_id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared
            .upgrade()
            .map_or(SessionState::Stopped, |shared| shared.state())
    }

    /// See [`crate::Session::open_queue`].
    ///
    /// # Errors
    /// Same as [`crate::Session::open_queue`].
    pub async fn open_queue(
        &self,
        uri: &str,
        flags: QueueFlags,
        options: QueueOptions,
        timeout: Option<Duration>,
    ) -> Result<(), SessionError> {
        dispatch::ensure_not_dispatching(self.id, "open_queue")?;
        self.upgrade()?
            .open_queue(uri, flags, options, timeout)
            .await
    }

    /// See [`crate::Session::configure_queue`].
    ///
    /// # Errors
    /// Same as [`crate::Session::configure_queue`].
    pub async fn configure_queue(
        &self,
        uri: &str,
        options: QueueOptions,
        timeout: Option<Duration>,
    ) -> Result<(), SessionError> {
        dispatch::ensure_not_dispatching(self.id, "configure_queue")?;
        self.upgrade()?.configure_queue(uri, options, timeout).await
    }

    /// See [`crate::Session::close_queue`].
    ///
    /// # Errors
    /// Same as [`crate::Session::close_queue`].
    pub async fn close_queue(
        &self,
        uri: &str,
        timeout: Option<Duration>,
    ) -> Result<(), SessionError> {
        dispatch::ensure_not_dispatching(self.id, "close_queue")?;
        self.upgrade()?.close_queue(uri, timeout).await
    }

    /// # Errors
    /// Returns error if the session is gone or the queue is not open.
    pub fn get_queue_options(&self, uri: &str) -> Result<QueueOptions, SessionError> {
        self.upgrade()?.get_queue_options(uri)
    }

    /// Safe to call from callbacks.
    ///
    /// # Errors
    /// Same as [`crate::Session::post`].
    pub fn post(&self, message: PostMessage) -> Result<(), SessionError> {
        self.upgrade()?.post(message)
    }

    /// Safe to call from callbacks.
    ///
    /// # Errors
    /// Same as [`crate::Session::confirm`].
    pub fn confirm(&self, message: &Message) -> Result<(), SessionError> {
        self.upgrade()?.confirm(message.queue_uri(), message.guid())
    }

    /// # Errors
    /// Returns error if awaited from one of this session's callbacks.
    pub async fn stop(&self) -> Result<(), SessionError> {
        dispatch::ensure_not_dispatching(self.id, "stop")?;
        match self.shared.upgrade() {
            Some(shared) => session::stop_shared(&shared).await,
            None => Ok(()),
        }
    }

    /// Run `op` after the current callback returns.
    ///
    /// Called outside a callback, `op` is spawned right away.
    pub fn defer<F, Fut>(&self, op: F)
    where
        F: FnOnce(Self) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = self.clone();
        dispatch::defer(self.id, &self.runtime, Box::pin(async move { op(handle).await }));
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Confirms one delivered message.
///
/// Does not keep the session alive.
pub struct MessageHandle {
    session: Weak<Shared>,
    queue_uri: String,
    guid: MessageGuid,
    _lease: HandleLease,
}

impl MessageHandle {
    pub(crate) fn new(shared: &Arc<Shared>, message: &Message) -> Self {
        Self {
            session: Arc::downgrade(shared),
            queue_uri: message.queue_uri().to_string(),
            guid: message.guid(),
            _lease: shared.ledger.lock().lease(),
        }
    }

    #[must_use]
    pub const fn guid(&self) -> MessageGuid {
        self.guid
    }

    #[must_use]
    pub fn queue_uri(&self) -> &str {
        &self.queue_uri
    }

    /// Confirm the message this handle was delivered with.
    ///
    /// # Errors
    /// Returns error if the session is gone, or the queue is closed or
    /// closing.
    pub fn confirm(&self) -> Result<(), SessionError> {
        let shared = self.session.upgrade().ok_or(SessionError::SessionStopped)?;
        shared.confirm(&self.queue_uri, self.guid)
    }
}

impl fmt::Debug for MessageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageHandle")
            .field("queue_uri", &self.queue_uri)
            .field("guid", &self.guid)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for MessageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<MessageHandle[{}] for {}>", self.guid, self.queue_uri)
    }
}
