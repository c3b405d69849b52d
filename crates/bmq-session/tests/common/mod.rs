//! Shared helpers for session integration tests.

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use bmq_session::{
    MessageHandle, Session,
    bmq_core::{Message, SessionEvent, SessionOptions},
    engine::{MemoryBroker, MemoryEngine},
};
use tokio::sync::mpsc;

pub const QUEUE: &str = "bmq://bmq.test.mem.priority/test-queue";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Collects values pushed from dispatch threads.
pub struct Recorder<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Recorder<T> {
    pub async fn next(&mut self) -> T {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("timed out waiting for callback")
            .expect("callback channel closed")
    }

    /// Skip values until one matches.
    pub async fn next_matching(&mut self, pred: impl Fn(&T) -> bool) -> T {
        loop {
            let value = self.next().await;
            if pred(&value) {
                return value;
            }
        }
    }

    /// Values received so far, without waiting.
    pub fn drain(&mut self) -> Vec<T> {
        let mut values = Vec::new();
        while let Ok(value) = self.rx.try_recv() {
            values.push(value);
        }
        values
    }

    /// Wait briefly and assert nothing arrived.
    pub async fn assert_quiet(&mut self) {
        let got = tokio::time::timeout(Duration::from_millis(100), self.rx.recv()).await;
        assert!(got.is_err(), "unexpected callback");
    }
}

pub fn recorder<T>() -> (mpsc::UnboundedSender<T>, Recorder<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, Recorder { rx })
}

/// A broker, an engine and the recorders wired into a session.
pub struct Harness {
    pub broker: MemoryBroker,
    pub engine: Arc<MemoryEngine>,
    pub events: Recorder<SessionEvent>,
    pub messages: Recorder<(Message, MessageHandle)>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_broker(MemoryBroker::new())
    }

    pub fn with_broker(broker: MemoryBroker) -> Self {
        init_tracing();
        let engine = broker.engine();
        let (_, events) = recorder();
        let (_, messages) = recorder();
        Self {
            broker,
            engine,
            events,
            messages,
        }
    }

    /// Connect a session that records events and messages.
    pub async fn connect(&mut self, options: SessionOptions) -> Session {
        let (event_tx, events) = recorder();
        let (message_tx, messages) = recorder();
        self.events = events;
        self.messages = messages;

        let session = Session::builder(self.engine.clone())
            .on_session_event(move |event| {
                let _ = event_tx.send(event);
            })
            .on_message(move |message, handle| {
                let _ = message_tx.send((message, handle));
            })
            .options(options)
            .connect()
            .await
            .expect("session failed to connect");

        assert_eq!(self.events.next().await, SessionEvent::Connected(None));
        session
    }

    /// Connect a session without a message callback.
    pub async fn connect_without_messages(&mut self, options: SessionOptions) -> Session {
        let (event_tx, events) = recorder();
        self.events = events;

        let session = Session::builder(self.engine.clone())
            .on_session_event(move |event| {
                let _ = event_tx.send(event);
            })
            .options(options)
            .connect()
            .await
            .expect("session failed to connect");

        assert_eq!(self.events.next().await, SessionEvent::Connected(None));
        session
    }
}
