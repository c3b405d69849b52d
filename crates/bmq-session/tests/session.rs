mod common;

use std::{sync::Arc, time::Duration};

use bmq_session::{
    PostMessage, Session, SessionState,
    bmq_core::{
        AckStatus, PropertyType, PropertyValue, QueueFlags, QueueOptions, ResultCode,
        SessionError, SessionEvent, SessionOptions,
        options::{DEFAULT_CONSUMER_PRIORITY, DEFAULT_MAX_UNCONFIRMED_MESSAGES},
    },
    engine::Operation,
};
use common::{Harness, QUEUE, recorder};

#[tokio::test]
async fn test_post_ack_deliver_confirm() -> anyhow::Result<()> {
    let mut harness = Harness::new();
    let session = harness.connect(SessionOptions::new()).await;
    session
        .open_queue(QUEUE, QueueFlags::READ_WRITE, QueueOptions::new(), None)
        .await?;

    let (ack_tx, mut acks) = recorder();
    session.post(
        PostMessage::new(QUEUE, vec![0xDE, 0xAD, 0xBE, 0xEF])
            .property("kind", "greeting")
            .property("count", 3i64)
            .property("flag", vec![b'y'])
            .property_type("flag", PropertyType::Char)
            .on_ack(move |ack| {
                let _ = ack_tx.send(ack);
            }),
    )?;

    let ack = acks.next().await;
    assert_eq!(ack.status(), AckStatus::Success);
    assert_eq!(ack.queue_uri(), QUEUE);

    let (message, handle) = harness.messages.next().await;
    assert_eq!(message.data().as_ref(), &[0xDE, 0xAD, 0xBE, 0xEF]);
    assert_eq!(Some(message.guid()), ack.guid());
    assert_eq!(
        message.properties()["kind"],
        PropertyValue::Text("greeting".into())
    );
    assert_eq!(message.properties()["count"], PropertyValue::Int(3));
    assert_eq!(message.property_types()["flag"], PropertyType::Char);
    assert_eq!(session.pending_acks(), 0);
    assert_eq!(session.live_message_handles(), 1);

    handle.confirm()?;
    assert_eq!(harness.broker.unconfirmed(QUEUE), 0);
    drop(handle);
    assert_eq!(session.live_message_handles(), 0);

    session.stop().await?;
    assert_eq!(harness.events.next().await, SessionEvent::Disconnected(None));
    Ok(())
}

#[tokio::test]
async fn test_deadbeef_between_writer_and_reader() -> anyhow::Result<()> {
    let mut writer = Harness::new();
    let mut reader = Harness::with_broker(writer.broker.clone());
    let producer = writer.connect(SessionOptions::new()).await;
    let consumer = reader.connect(SessionOptions::new()).await;
    consumer
        .open_queue(QUEUE, QueueFlags::READ, QueueOptions::new(), None)
        .await?;
    producer
        .open_queue(QUEUE, QueueFlags::WRITE, QueueOptions::new(), None)
        .await?;

    let (ack_tx, mut acks) = recorder();
    producer.post(
        PostMessage::new(QUEUE, vec![0xDE, 0xAD, 0xBE, 0xEF]).on_ack(move |ack| {
            let _ = ack_tx.send(ack);
        }),
    )?;

    let ack = acks.next().await;
    assert_eq!(ack.status(), AckStatus::Success);
    assert_eq!(ack.queue_uri(), QUEUE);
    let guid = ack.guid().expect("successful ack carries a guid");
    assert_eq!(guid.as_bytes().len(), 16);

    let (message, handle) = reader.messages.next().await;
    assert_eq!(message.data().as_ref(), &[0xDE, 0xAD, 0xBE, 0xEF]);
    assert_eq!(message.guid(), guid);
    assert_eq!(message.queue_uri(), QUEUE);
    assert!(message.properties().is_empty());
    assert!(message.property_types().is_empty());
    writer.messages.assert_quiet().await;

    consumer.confirm(&message)?;
    drop(handle);
    assert_eq!(reader.broker.unconfirmed(QUEUE), 0);
    reader.messages.assert_quiet().await;

    consumer.close_queue(QUEUE, None).await?;
    consumer
        .open_queue(QUEUE, QueueFlags::READ, QueueOptions::new(), None)
        .await?;
    reader.messages.assert_quiet().await;
    assert_eq!(reader.broker.pending(QUEUE), 0);

    producer.stop().await?;
    consumer.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_only_unconfirmed_messages_are_redelivered() -> anyhow::Result<()> {
    let mut harness = Harness::new();
    let session = harness.connect(SessionOptions::new()).await;
    session
        .open_queue(QUEUE, QueueFlags::READ_WRITE, QueueOptions::new(), None)
        .await?;

    session.post(PostMessage::new(QUEUE, "first"))?;
    session.post(PostMessage::new(QUEUE, "second"))?;
    let (first, _) = harness.messages.next().await;
    let (second, _) = harness.messages.next().await;
    assert_eq!(first.data().as_ref(), b"first");

    session.confirm(&first)?;
    session.close_queue(QUEUE, None).await?;
    session
        .open_queue(QUEUE, QueueFlags::READ_WRITE, QueueOptions::new(), None)
        .await?;

    let (redelivered, _) = harness.messages.next().await;
    assert_eq!(redelivered.guid(), second.guid());
    assert_eq!(redelivered.data().as_ref(), b"second");
    harness.messages.assert_quiet().await;

    session.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_invalid_timeouts_never_reach_engine() {
    let mut harness = Harness::new();
    let session = harness.connect(SessionOptions::new()).await;
    let before = harness.engine.requests();

    for timeout in [Duration::ZERO, Duration::from_secs(1 << 63)] {
        let err = session
            .open_queue(QUEUE, QueueFlags::WRITE, QueueOptions::new(), Some(timeout))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidTimeout(_)), "{err}");
        assert!(err.is_validation());
    }
    let err = session
        .close_queue(QUEUE, Some(Duration::ZERO))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::InvalidTimeout(_)));
    let err = session
        .configure_queue(QUEUE, QueueOptions::new(), Some(Duration::ZERO))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::InvalidTimeout(_)));
    assert_eq!(harness.engine.requests(), before);

    session
        .open_queue(QUEUE, QueueFlags::WRITE, QueueOptions::new(), None)
        .await
        .unwrap();
    session.stop().await.unwrap();
}

#[tokio::test]
async fn test_write_only_queue_reports_default_consumer_options() {
    let mut harness = Harness::new();
    let session = harness.connect(SessionOptions::new()).await;
    let custom = QueueOptions::new()
        .max_unconfirmed_messages(5)
        .consumer_priority(3);

    session
        .open_queue(QUEUE, QueueFlags::WRITE, custom, None)
        .await
        .unwrap();
    let options = session.get_queue_options(QUEUE).unwrap();
    assert_eq!(
        options.max_unconfirmed_messages,
        Some(DEFAULT_MAX_UNCONFIRMED_MESSAGES)
    );
    assert_eq!(options.consumer_priority, Some(DEFAULT_CONSUMER_PRIORITY));

    let reader = "bmq://bmq.test.mem.priority/reader";
    session
        .open_queue(reader, QueueFlags::READ, custom, None)
        .await
        .unwrap();
    let options = session.get_queue_options(reader).unwrap();
    assert_eq!(options.max_unconfirmed_messages, Some(5));
    assert_eq!(options.consumer_priority, Some(3));

    session.stop().await.unwrap();
}

#[tokio::test]
async fn test_failed_configure_keeps_options() {
    let mut harness = Harness::new();
    let session = harness.connect(SessionOptions::new()).await;
    session
        .open_queue(
            QUEUE,
            QueueFlags::READ,
            QueueOptions::new().consumer_priority(1),
            None,
        )
        .await
        .unwrap();

    harness.engine.fail_next(Operation::Configure, ResultCode::Refused);
    let err = session
        .configure_queue(QUEUE, QueueOptions::new().consumer_priority(9), None)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Broker { .. }));
    assert_eq!(
        session.get_queue_options(QUEUE).unwrap().consumer_priority,
        Some(1)
    );

    session
        .configure_queue(QUEUE, QueueOptions::new().consumer_priority(9), None)
        .await
        .unwrap();
    let options = session.get_queue_options(QUEUE).unwrap();
    assert_eq!(options.consumer_priority, Some(9));
    assert_eq!(
        options.max_unconfirmed_messages,
        Some(DEFAULT_MAX_UNCONFIRMED_MESSAGES)
    );

    session.stop().await.unwrap();
}

#[tokio::test]
async fn test_timed_out_open_leaves_nothing_behind() {
    let mut harness = Harness::new();
    let session = harness.connect(SessionOptions::new()).await;

    harness.engine.set_latency(Duration::from_millis(200));
    let err = session
        .open_queue(
            QUEUE,
            QueueFlags::WRITE,
            QueueOptions::new(),
            Some(Duration::from_millis(20)),
        )
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "{err}");
    assert!(matches!(
        session.get_queue_options(QUEUE),
        Err(SessionError::QueueNotOpened(_))
    ));

    harness.engine.set_latency(Duration::ZERO);
    session.stop().await.unwrap();
}

#[tokio::test]
async fn test_operations_after_stop_fail() {
    let mut harness = Harness::new();
    let session = harness.connect(SessionOptions::new()).await;
    session.stop().await.unwrap();
    assert_eq!(harness.events.next().await, SessionEvent::Disconnected(None));
    assert_eq!(session.state(), SessionState::Stopped);

    let err = session
        .open_queue(QUEUE, QueueFlags::WRITE, QueueOptions::new(), None)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Method called after session was stopped");
    assert!(matches!(
        session.post(PostMessage::new(QUEUE, "x")),
        Err(SessionError::SessionStopped)
    ));
    assert!(matches!(
        session.get_queue_options(QUEUE),
        Err(SessionError::SessionStopped)
    ));

    session.stop().await.unwrap();
    harness.events.assert_quiet().await;
}

#[tokio::test]
async fn test_failed_post_releases_ack_callback() {
    let mut harness = Harness::new();
    let session = harness.connect(SessionOptions::new()).await;

    let token = Arc::new(());
    let observer = Arc::downgrade(&token);
    let err = session
        .post(PostMessage::new(QUEUE, "x").on_ack(move |_| drop(token)))
        .unwrap_err();
    assert!(matches!(err, SessionError::QueueNotOpened(_)));
    assert!(observer.upgrade().is_none());

    session
        .open_queue(QUEUE, QueueFlags::WRITE, QueueOptions::new(), None)
        .await
        .unwrap();
    harness.engine.fail_next(Operation::Post, ResultCode::NotConnected);
    let token = Arc::new(());
    let observer = Arc::downgrade(&token);
    let err = session
        .post(PostMessage::new(QUEUE, "x").on_ack(move |_| drop(token)))
        .unwrap_err();
    assert!(matches!(err, SessionError::Broker { .. }));
    assert!(observer.upgrade().is_none());
    assert_eq!(session.pending_acks(), 0);

    session.stop().await.unwrap();
}

#[tokio::test]
async fn test_post_validation() {
    let mut harness = Harness::new();
    let session = harness.connect(SessionOptions::new()).await;
    session
        .open_queue(QUEUE, QueueFlags::WRITE, QueueOptions::new(), None)
        .await
        .unwrap();

    assert!(matches!(
        session.post(PostMessage::new(QUEUE, Vec::new())),
        Err(SessionError::InvalidArgument(_))
    ));
    let err = session
        .post(
            PostMessage::new(QUEUE, "x")
                .property("n", 70_000i64)
                .property_type("n", PropertyType::Short),
        )
        .unwrap_err();
    assert!(matches!(err, SessionError::Property(_)));
    let err = session
        .post(PostMessage::new(QUEUE, "x").property_type("ghost", PropertyType::Int32))
        .unwrap_err();
    assert!(matches!(err, SessionError::Property(_)));

    let reader = "bmq://bmq.test.mem.priority/reader";
    session
        .open_queue(reader, QueueFlags::READ, QueueOptions::new(), None)
        .await
        .unwrap();
    assert!(matches!(
        session.post(PostMessage::new(reader, "x")),
        Err(SessionError::QueueNotWritable(_))
    ));

    session.stop().await.unwrap();
}

#[tokio::test]
async fn test_failed_ack_is_reported() {
    let mut harness = Harness::new();
    let session = harness.connect(SessionOptions::new()).await;
    session
        .open_queue(QUEUE, QueueFlags::WRITE, QueueOptions::new(), None)
        .await
        .unwrap();

    harness.engine.fail_next_ack(AckStatus::LimitMessages);
    let (ack_tx, mut acks) = recorder();
    session
        .post(PostMessage::new(QUEUE, "x").on_ack(move |ack| {
            let _ = ack_tx.send(ack);
        }))
        .unwrap();

    let ack = acks.next().await;
    assert_eq!(ack.status(), AckStatus::LimitMessages);
    assert_eq!(ack.guid(), None);
    assert_eq!(harness.broker.pending(QUEUE), 0);

    session.stop().await.unwrap();
}

#[tokio::test]
async fn test_confirm_while_closing() {
    let mut harness = Harness::new();
    let session = harness.connect(SessionOptions::new()).await;
    session
        .open_queue(QUEUE, QueueFlags::READ_WRITE, QueueOptions::new(), None)
        .await
        .unwrap();
    session.post(PostMessage::new(QUEUE, "x")).unwrap();
    let (message, _) = harness.messages.next().await;

    harness.engine.set_latency(Duration::from_millis(200));
    let handle = session.handle();
    let close =
        tokio::spawn(async move { handle.close_queue(QUEUE, Some(Duration::from_secs(5))).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = session.confirm(&message).unwrap_err();
    assert!(matches!(err, SessionError::QueueClosing(_)), "{err}");

    let err = session
        .close_queue(QUEUE, Some(Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::CloseInProgress(_)), "{err}");
    assert!(matches!(
        session.confirm(&message),
        Err(SessionError::QueueClosing(_))
    ));

    close.await.unwrap().unwrap();
    assert!(matches!(
        session.confirm(&message),
        Err(SessionError::QueueNotOpened(_))
    ));

    harness.engine.set_latency(Duration::ZERO);
    session.stop().await.unwrap();
}

#[tokio::test]
async fn test_read_requires_message_callback() {
    let mut harness = Harness::new();
    let session = harness.connect_without_messages(SessionOptions::new()).await;
    let before = harness.engine.requests();

    let err = session
        .open_queue(QUEUE, QueueFlags::READ, QueueOptions::new(), None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no on_message callback"), "{err}");
    assert_eq!(harness.engine.requests(), before);

    session
        .open_queue(QUEUE, QueueFlags::WRITE, QueueOptions::new(), None)
        .await
        .unwrap();
    session.stop().await.unwrap();
}

#[tokio::test]
async fn test_start_failure_leaves_nothing_running() {
    let harness = Harness::new();
    harness.engine.fail_next(Operation::Start, ResultCode::Refused);

    let err = Session::builder(harness.engine.clone())
        .connect()
        .await
        .unwrap_err();
    assert!(err.to_string().starts_with("Failed to start session"), "{err}");
    assert!(!harness.engine.is_connected());
}

#[tokio::test]
async fn test_invalid_session_options_rejected() {
    let harness = Harness::new();
    let err = Session::builder(harness.engine.clone())
        .options(SessionOptions::new().num_processing_threads(0))
        .connect()
        .await
        .unwrap_err();
    assert!(err.is_validation());
    assert_eq!(harness.engine.requests(), 0);
}

#[tokio::test]
async fn test_drop_without_stop_disconnects() {
    let mut harness = Harness::new();
    let session = harness.connect(SessionOptions::new()).await;
    let handle = session.handle();

    drop(session);
    assert_eq!(harness.events.next().await, SessionEvent::Disconnected(None));
    assert!(!harness.engine.is_connected());
    assert_eq!(handle.state(), SessionState::Stopped);
    assert!(matches!(
        handle.post(PostMessage::new(QUEUE, "x")),
        Err(SessionError::SessionStopped)
    ));
}

#[tokio::test]
async fn test_per_queue_order_with_several_threads() {
    let mut harness = Harness::new();
    let session = harness
        .connect(SessionOptions::new().num_processing_threads(4))
        .await;
    let queues = [
        "bmq://bmq.test.mem.priority/a",
        "bmq://bmq.test.mem.priority/b",
        "bmq://bmq.test.mem.priority/c",
    ];
    for uri in queues {
        session
            .open_queue(uri, QueueFlags::READ_WRITE, QueueOptions::new(), None)
            .await
            .unwrap();
    }
    for n in 0..5u8 {
        for uri in queues {
            session.post(PostMessage::new(uri, vec![n])).unwrap();
        }
    }

    let mut seen: std::collections::HashMap<String, Vec<u8>> = std::collections::HashMap::new();
    for _ in 0..15 {
        let (message, handle) = harness.messages.next().await;
        handle.confirm().unwrap();
        seen.entry(message.queue_uri().to_string())
            .or_default()
            .push(message.data()[0]);
    }
    for uri in queues {
        assert_eq!(seen[uri], vec![0, 1, 2, 3, 4], "{uri}");
    }

    session.stop().await.unwrap();
}
