//! Dropping a connected session from its own callback cannot stop it, so
//! the process aborts. Runs the scenario in a child copy of this binary.

#![cfg(unix)]

use std::{os::unix::process::ExitStatusExt, process::Command, sync::Arc, time::Duration};

use bmq_session::{
    PostMessage, Session,
    bmq_core::{QueueFlags, QueueOptions},
    engine::MemoryBroker,
};
use parking_lot::Mutex;

const CHILD_ENV: &str = "BMQ_SESSION_DROP_IN_CALLBACK";
const QUEUE: &str = "bmq://bmq.test.mem.priority/teardown";

fn drop_session_in_own_callback() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("error"))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();

    let runtime = tokio::runtime::Runtime::new().unwrap();
    runtime.block_on(async {
        let broker = MemoryBroker::new();
        let slot: Arc<Mutex<Option<Session>>> = Arc::new(Mutex::new(None));
        let callback_slot = Arc::clone(&slot);
        let session = Session::builder(broker.engine())
            .on_message(move |_, _| {
                let session = callback_slot.lock().take();
                drop(session);
            })
            .connect()
            .await
            .unwrap();
        session
            .open_queue(QUEUE, QueueFlags::READ_WRITE, QueueOptions::new(), None)
            .await
            .unwrap();

        let handle = session.handle();
        *slot.lock() = Some(session);
        handle.post(PostMessage::new(QUEUE, "last")).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    });
}

#[test]
fn test_dropping_session_in_own_callback_aborts() {
    if std::env::var_os(CHILD_ENV).is_some() {
        drop_session_in_own_callback();
        return;
    }

    let output = Command::new(std::env::current_exe().unwrap())
        .args([
            "test_dropping_session_in_own_callback_aborts",
            "--exact",
            "--nocapture",
        ])
        .env(CHILD_ENV, "1")
        .output()
        .unwrap();

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(output.status.signal(), Some(6), "stderr: {stderr}");
    assert!(
        stderr.contains("dropped from its own callback while connected"),
        "stderr: {stderr}"
    );
}
