//! Outstanding ack callbacks and message handles.
//!
//! Each `post` that asks for an ack parks its callback here under a fresh
//! [`CorrelationId`]. The entry leaves the ledger exactly once: when the
//! ack arrives, when the post fails before reaching the broker, or when
//! the session stops. Callers take entries out under the session lock and
//! invoke or drop them after releasing it.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use bmq_core::{Ack, traits::CorrelationId};

/// Callback invoked with the ack of a posted message.
pub type AckCallback = Box<dyn FnOnce(Ack) + Send + 'static>;

#[derive(Default)]
pub struct CallbackLedger {
    next_id: u64,
    callbacks: HashMap<CorrelationId, AckCallback>,
    handles: Arc<AtomicUsize>,
}

impl CallbackLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a callback and return the correlation to post with.
    pub fn register(&mut self, callback: AckCallback) -> CorrelationId {
        self.next_id += 1;
        let id = CorrelationId(self.next_id);
        self.callbacks.insert(id, callback);
        id
    }

    /// Remove a callback, handing ownership to the caller.
    pub fn take(&mut self, id: CorrelationId) -> Option<AckCallback> {
        self.callbacks.remove(&id)
    }

    /// Remove every remaining callback.
    pub fn drain(&mut self) -> Vec<AckCallback> {
        self.callbacks.drain().map(|(_, callback)| callback).collect()
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.callbacks.len()
    }

    /// Count a new message handle for as long as the lease lives.
    #[must_use]
    pub fn lease(&self) -> HandleLease {
        self.handles.fetch_add(1, Ordering::SeqCst);
        HandleLease(Arc::clone(&self.handles))
    }

    #[must_use]
    pub fn live_handles(&self) -> usize {
        self.handles.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for CallbackLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackLedger")
            .field("pending", &self.callbacks.len())
            .field("handles", &self.live_handles())
            .finish()
    }
}

/// Keeps a message handle counted in its ledger.
#[derive(Debug)]
pub struct HandleLease(Arc<AtomicUsize>);

impl Drop for HandleLease {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bmq_core::traits::RawAck;

    use super::*;

    fn ack() -> Ack {
        Ack::from_raw(&RawAck {
            status: 0,
            status_name: "SUCCESS".into(),
            guid: None,
            queue_uri: "bmq://d/q".into(),
            correlation: None,
        })
    }

    #[test]
    fn test_register_and_take_once() {
        let mut ledger = CallbackLedger::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = ledger.register(Box::new(move |ack| sink.lock().unwrap().push(ack)));
        assert_eq!(ledger.pending(), 1);

        let callback = ledger.take(id).unwrap();
        assert!(ledger.take(id).is_none());
        callback(ack());
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(ledger.pending(), 0);
    }

    #[test]
    fn test_correlations_are_unique() {
        let mut ledger = CallbackLedger::new();
        let a = ledger.register(Box::new(|_| {}));
        let b = ledger.register(Box::new(|_| {}));
        assert_ne!(a, b);
        assert_eq!(ledger.drain().len(), 2);
        assert_eq!(ledger.pending(), 0);
    }

    #[test]
    fn test_dropping_taken_callback_releases_captures() {
        let mut ledger = CallbackLedger::new();
        let captured = Arc::new(());
        let observer = Arc::downgrade(&captured);
        let id = ledger.register(Box::new(move |_| drop(captured)));

        drop(ledger.take(id));
        assert!(observer.upgrade().is_none());
    }

    #[test]
    fn test_handle_leases() {
        let ledger = CallbackLedger::new();
        let first = ledger.lease();
        let second = ledger.lease();
        assert_eq!(ledger.live_handles(), 2);
        drop(first);
        assert_eq!(ledger.live_handles(), 1);
        drop(second);
        assert_eq!(ledger.live_handles(), 0);
    }
}
