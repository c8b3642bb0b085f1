mod common;

use common::{collector, connect, fast_config, next_body, wait_until};
use resilient_rabbit::testing::MemoryBroker;
use resilient_rabbit::{HandlerErrorPolicy, Message, MessageProperties, RabbitMQError, UnsettledPolicy};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[tokio::test]
async fn failing_handler_does_not_affect_other_listeners() {
    let broker = MemoryBroker::new();
    let client = connect(&broker, fast_config()).await;
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    client
        .listener("broken")
        .on_error(HandlerErrorPolicy::Discard)
        .handle(move |_message: Message| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if true {
                    panic!("boom");
                }
                anyhow::Ok(())
            }
        })
        .await
        .unwrap();
    let (handler, mut bodies) = collector();
    client.listener("healthy").handle(handler).await.unwrap();

    for i in 0..3 {
        client.send("broken", format!("bad-{i}"), MessageProperties::default()).await.unwrap();
        client.send("healthy", format!("good-{i}"), MessageProperties::default()).await.unwrap();
    }
    for i in 0..3 {
        assert_eq!(next_body(&mut bodies).await, format!("good-{i}"));
    }

    wait_until("broken deliveries discarded", || {
        calls.load(Ordering::SeqCst) == 3 && broker.unacked_count("broken") == 0
    })
    .await;
    assert_eq!(broker.message_count("broken"), 0);
    let status = client.listeners().await;
    assert!(status.iter().all(|listener| listener.running));
    assert_eq!(status[0].queue, "broken");
    assert_eq!(status[0].deliveries, 3);
    client.shutdown().await;
}

#[tokio::test]
async fn failed_delivery_is_requeued_once() {
    let broker = MemoryBroker::new();
    let client = connect(&broker, fast_config()).await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    client
        .listener("flaky")
        .handle(move |message: Message| {
            let tx = tx.clone();
            async move {
                tx.send(message.redelivered()).ok();
                Err::<(), _>(anyhow::anyhow!("cannot process {}", message.text()))
            }
        })
        .await
        .unwrap();
    client.send("flaky", "job", MessageProperties::default()).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
    assert_eq!(first, Some(false));
    assert_eq!(second, Some(true));

    wait_until("delivery dropped", || broker.unacked_count("flaky") == 0).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(broker.message_count("flaky"), 0);
    client.shutdown().await;
}

#[tokio::test]
async fn handler_can_settle_explicitly() {
    let broker = MemoryBroker::new();
    let client = connect(&broker, fast_config()).await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    client
        .listener("manual")
        .on_unsettled(UnsettledPolicy::Leave)
        .handle(move |message: Message| {
            let tx = tx.clone();
            async move {
                message.ack().await?;
                let again = message.ack().await;
                tx.send(matches!(again, Err(RabbitMQError::AlreadySettled(_)))).ok();
                anyhow::Ok(())
            }
        })
        .await
        .unwrap();
    client.send("manual", "payload", MessageProperties::default()).await.unwrap();

    let double_ack_refused = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
    assert_eq!(double_ack_refused, Some(true));
    wait_until("ack", || broker.unacked_count("manual") == 0).await;
    client.shutdown().await;
}

#[tokio::test]
async fn stop_listener_lets_in_flight_handler_finish() {
    let broker = MemoryBroker::new();
    let client = connect(&broker, fast_config()).await;
    let started = Arc::new(Notify::new());
    let finished = Arc::new(AtomicUsize::new(0));

    let (on_start, done) = (Arc::clone(&started), Arc::clone(&finished));
    client
        .listener("slow")
        .handle(move |_message: Message| {
            let (on_start, done) = (Arc::clone(&on_start), Arc::clone(&done));
            async move {
                on_start.notify_one();
                tokio::time::sleep(Duration::from_millis(100)).await;
                done.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        })
        .await
        .unwrap();
    client.send("slow", "work", MessageProperties::default()).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), started.notified()).await.unwrap();
    assert!(client.stop_listener("slow").await);

    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(broker.consumer_count("slow"), 0);
    assert_eq!(broker.unacked_count("slow"), 0);
    assert_eq!(broker.message_count("slow"), 0);
    assert!(client.listeners().await.is_empty());
    assert!(!client.stop_listener("slow").await);

    client.send("slow", "queued", MessageProperties::default()).await.unwrap();
    assert_eq!(broker.message_count("slow"), 1);
    client.shutdown().await;
}

#[tokio::test]
async fn stuck_handler_is_aborted_and_its_delivery_requeued() {
    let broker = MemoryBroker::new();
    let client = connect(&broker, fast_config().with_join_timeout(Duration::from_millis(50))).await;
    let started = Arc::new(Notify::new());

    let on_start = Arc::clone(&started);
    client
        .listener("stuck")
        .handle(move |_message: Message| {
            let on_start = Arc::clone(&on_start);
            async move {
                on_start.notify_one();
                tokio::time::sleep(Duration::from_secs(60)).await;
                anyhow::Ok(())
            }
        })
        .await
        .unwrap();
    client.send("stuck", "forever", MessageProperties::default()).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), started.notified()).await.unwrap();
    assert!(client.stop_listener("stuck").await);

    assert_eq!(broker.consumer_count("stuck"), 0);
    assert_eq!(broker.unacked_count("stuck"), 0);
    assert_eq!(broker.message_count("stuck"), 1);
    client.shutdown().await;
}

#[tokio::test]
async fn re_registering_replaces_the_listener() {
    let broker = MemoryBroker::new();
    let client = connect(&broker, fast_config()).await;
    let (first, mut first_rx) = collector();
    let (second, mut second_rx) = collector();

    client.listener("q1").handle(first).await.unwrap();
    client.listener("q1").prefetch(5).handle(second).await.unwrap();
    assert_eq!(broker.consumer_count("q1"), 1);

    client.send("q1", "to second", MessageProperties::default()).await.unwrap();
    assert_eq!(next_body(&mut second_rx).await, "to second");
    assert!(first_rx.try_recv().is_err());
    client.shutdown().await;
}

#[tokio::test]
async fn exclusive_listener_conflict_is_reported() {
    let broker = MemoryBroker::new();
    let owner = connect(&broker, fast_config()).await;
    let intruder = connect(&broker, fast_config()).await;
    let (handler, _rx) = collector();
    let (other, _other_rx) = collector();

    owner.listener("private").exclusive(true).handle(handler).await.unwrap();
    let err = intruder
        .listener("private")
        .exclusive(true)
        .handle(other)
        .await
        .err()
        .expect("a second exclusive listener should be refused");

    assert!(!err.is_retryable());
    assert!(intruder.listeners().await.is_empty());
    owner.shutdown().await;
    intruder.shutdown().await;
}
