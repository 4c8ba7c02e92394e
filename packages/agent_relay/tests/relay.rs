//! End-to-end tests: a real broker on loopback TCP, producer and viewer
//! connections, and the full open/content/close round trip.

use std::time::{Duration, Instant};

use agent_relay::{Broker, Connection, ContentKind, RelayConfig, RelayError, Role, StartTag};

fn ephemeral_config() -> RelayConfig {
    RelayConfig {
        ingress_addr: "127.0.0.1:0".to_string(),
        egress_addr: "127.0.0.1:0".to_string(),
    }
}

async fn start_broker() -> Broker {
    let broker = Broker::new(ephemeral_config());
    broker.start().await.expect("broker should start");
    broker
}

async fn connected(broker: &Broker) -> Connection {
    let conn = broker.connect().await;
    conn.start().await.expect("connection should start");
    conn
}

/// Give the broker time to accept freshly attached sockets and wire
/// their fan-out subscriptions.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

fn open_tag(id: &str, thread_id: &str) -> StartTag {
    let mut tag = StartTag::new(thread_id);
    tag.id = id.to_string();
    tag
}

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn round_trip_reconstructs_the_envelope() {
    let broker = start_broker().await;
    let producer = connected(&broker).await;
    let viewer = connected(&broker).await;
    let sub = viewer.subscribe("t1", "viewer-1").await;
    settle().await;

    let mut tag = open_tag("m1", "t1");
    tag.role = Role::User;
    producer.publish_start(&tag).await.unwrap();
    producer.publish_content("hello ").await.unwrap();
    producer.publish_content("world").await.unwrap();
    producer.publish_end().await.unwrap();

    let envelope = sub
        .wait_for_message(WAIT)
        .await
        .unwrap()
        .expect("queue should still be open");
    assert_eq!(envelope.message_id, "m1");
    assert_eq!(envelope.thread_id, "t1");
    assert_eq!(envelope.role, Role::User);
    assert_eq!(envelope.kind, ContentKind::Text);
    assert!(!envelope.is_error);
    assert!(!envelope.is_done);
    assert_eq!(envelope.content.get_content().await, "hello world");

    producer.stop().await;
    viewer.stop().await;
    broker.stop().await;
}

#[tokio::test]
async fn fanout_delivers_fragments_in_the_same_order_to_all_subscribers() {
    let broker = start_broker().await;
    let producer = connected(&broker).await;
    let viewer_a = connected(&broker).await;
    let viewer_b = connected(&broker).await;

    // Two subscribers on independent connections plus a second
    // subscriber sharing a connection.
    let sub_a = viewer_a.subscribe("t1", "alice").await;
    let sub_b = viewer_b.subscribe("t1", "bob").await;
    let sub_c = viewer_b.subscribe("t1", "carol").await;
    settle().await;

    producer.publish_start(&open_tag("m1", "t1")).await.unwrap();
    for chunk in ["alpha", "beta", "gamma"] {
        producer.publish_content(chunk).await.unwrap();
    }
    producer.publish_end().await.unwrap();

    for sub in [&sub_a, &sub_b, &sub_c] {
        let envelope = sub.wait_for_message(WAIT).await.unwrap().unwrap();
        let mut reader = envelope.content.reader();
        let mut chunks = Vec::new();
        while let Some(chunk) = reader.next_chunk().await {
            chunks.push(chunk);
        }
        assert_eq!(chunks, vec!["alpha", "beta", "gamma"]);
    }

    producer.stop().await;
    viewer_a.stop().await;
    viewer_b.stop().await;
    broker.stop().await;
}

#[tokio::test]
async fn threads_are_isolated_across_subscriptions() {
    let broker = start_broker().await;
    let producer = connected(&broker).await;
    let viewer = connected(&broker).await;
    let sub_other = viewer.subscribe("t2", "viewer-1").await;
    settle().await;

    producer.publish_start(&open_tag("m1", "t1")).await.unwrap();
    producer.publish_content("for t1 only").await.unwrap();
    producer.publish_end().await.unwrap();

    let err = sub_other
        .wait_for_message(Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Timeout));

    producer.stop().await;
    viewer.stop().await;
    broker.stop().await;
}

#[tokio::test]
async fn interleaved_threads_never_cross_attribute_fragments() {
    let broker = start_broker().await;
    let producer = connected(&broker).await;
    let viewer = connected(&broker).await;
    let sub_t1 = viewer.subscribe("t1", "viewer-1").await;
    let sub_t2 = viewer.subscribe("t2", "viewer-1").await;
    settle().await;

    producer.publish_start(&open_tag("m1", "t1")).await.unwrap();
    producer.publish_start(&open_tag("m2", "t2")).await.unwrap();
    producer.publish_content("inner").await.unwrap();
    producer.publish_end().await.unwrap();
    producer.publish_content("outer").await.unwrap();
    producer.publish_end().await.unwrap();

    let envelope_t1 = sub_t1.wait_for_message(WAIT).await.unwrap().unwrap();
    assert_eq!(envelope_t1.message_id, "m1");
    assert_eq!(envelope_t1.content.get_content().await, "outer");

    let envelope_t2 = sub_t2.wait_for_message(WAIT).await.unwrap().unwrap();
    assert_eq!(envelope_t2.message_id, "m2");
    assert_eq!(envelope_t2.content.get_content().await, "inner");

    producer.stop().await;
    viewer.stop().await;
    broker.stop().await;
}

#[tokio::test]
async fn repeated_subscribe_shares_one_queue_and_resubscribe_is_fresh() {
    let broker = start_broker().await;
    let producer = connected(&broker).await;
    let viewer = connected(&broker).await;

    let first = viewer.subscribe("t1", "viewer-1").await;
    let second = viewer.subscribe("t1", "viewer-1").await;
    settle().await;

    producer.publish_start(&open_tag("m1", "t1")).await.unwrap();
    producer.publish_end().await.unwrap();

    // Both handles drain the same queue: one pull empties it for both.
    let envelope = second.wait_for_message(WAIT).await.unwrap().unwrap();
    assert_eq!(envelope.message_id, "m1");
    let err = first
        .wait_for_message(Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Timeout));

    // Leave an undrained envelope behind, then unsubscribe: the fresh
    // queue starts empty.
    producer.publish_start(&open_tag("m2", "t1")).await.unwrap();
    producer.publish_end().await.unwrap();
    settle().await;

    assert!(viewer.unsubscribe("t1", "viewer-1").await);
    assert!(!viewer.unsubscribe("t1", "viewer-1").await);

    let fresh = viewer.subscribe("t1", "viewer-1").await;
    let err = fresh
        .wait_for_message(Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Timeout));

    producer.stop().await;
    viewer.stop().await;
    broker.stop().await;
}

#[tokio::test]
async fn wait_for_message_timeout_is_bounded() {
    let broker = start_broker().await;
    let viewer = connected(&broker).await;
    let sub = viewer.subscribe("t1", "viewer-1").await;

    let started = Instant::now();
    let err = sub
        .wait_for_message(Duration::from_millis(100))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, RelayError::Timeout));
    assert!(elapsed >= Duration::from_millis(90), "returned too early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(1), "returned too late: {:?}", elapsed);

    viewer.stop().await;
    broker.stop().await;
}

#[tokio::test]
async fn stop_is_idempotent_and_closes_queues() {
    let broker = start_broker().await;
    let producer = connected(&broker).await;
    let viewer = connected(&broker).await;
    let sub = viewer.subscribe("t1", "viewer-1").await;

    viewer.stop().await;
    viewer.stop().await;

    // The registry was cleared, so the consumer sees the closed
    // sentinel rather than a timeout.
    let closed = sub.wait_for_message(WAIT).await.unwrap();
    assert!(closed.is_none());

    producer.stop().await;
    let err = producer.publish("frame").await.unwrap_err();
    assert!(matches!(err, RelayError::NotRunning));

    broker.stop().await;
    broker.stop().await;

    // A broker that never started also stops cleanly.
    let unstarted = Broker::new(ephemeral_config());
    unstarted.stop().await;
}

#[tokio::test]
async fn protocol_violations_do_not_interrupt_delivery() {
    let broker = start_broker().await;
    let producer = connected(&broker).await;
    let viewer = connected(&broker).await;
    let sub = viewer.subscribe("t1", "viewer-1").await;
    settle().await;

    // Orphan content, an orphan close, and a malformed open tag all
    // get dropped by the relay without killing it.
    producer.publish("stray fragment").await.unwrap();
    producer.publish_end().await.unwrap();
    producer.publish("<message broken>").await.unwrap();

    producer.publish_start(&open_tag("m1", "t1")).await.unwrap();
    producer.publish_content("still alive").await.unwrap();
    producer.publish_end().await.unwrap();

    let envelope = sub.wait_for_message(WAIT).await.unwrap().unwrap();
    assert_eq!(envelope.message_id, "m1");
    assert_eq!(envelope.content.get_content().await, "still alive");

    producer.stop().await;
    viewer.stop().await;
    broker.stop().await;
}

#[tokio::test]
async fn producer_errors_arrive_as_ordinary_envelopes() {
    let broker = start_broker().await;
    let producer = connected(&broker).await;
    let viewer = connected(&broker).await;
    let sub = viewer.subscribe("t1", "viewer-1").await;
    settle().await;

    producer
        .publish_error("t1", "model backend unavailable")
        .await
        .unwrap();

    let envelope = sub.wait_for_message(WAIT).await.unwrap().unwrap();
    assert_eq!(envelope.role, Role::System);
    assert_eq!(envelope.kind, ContentKind::Error);
    assert!(envelope.is_error);
    assert!(envelope.is_done);
    assert_eq!(
        envelope.content.get_content().await,
        "model backend unavailable"
    );

    producer.stop().await;
    viewer.stop().await;
    broker.stop().await;
}

#[tokio::test]
async fn turn_done_marker_reaches_subscribers() {
    let broker = start_broker().await;
    let producer = connected(&broker).await;
    let viewer = connected(&broker).await;
    let sub = viewer.subscribe("t1", "viewer-1").await;
    settle().await;

    producer.publish_start(&open_tag("m1", "t1")).await.unwrap();
    producer.publish_content("partial reply").await.unwrap();
    producer.publish_end().await.unwrap();
    producer.publish_turn_done("t1", Some("agent-7")).await.unwrap();

    let reply = sub.wait_for_message(WAIT).await.unwrap().unwrap();
    assert!(!reply.is_done);

    let marker = sub.wait_for_message(WAIT).await.unwrap().unwrap();
    assert!(marker.is_done);
    assert_eq!(marker.agent_id.as_deref(), Some("agent-7"));
    assert_eq!(marker.content.get_content().await, "");

    producer.stop().await;
    viewer.stop().await;
    broker.stop().await;
}

#[tokio::test]
async fn many_producers_one_broadcast_domain() {
    let broker = start_broker().await;
    let producer_a = connected(&broker).await;
    let producer_b = connected(&broker).await;
    let viewer = connected(&broker).await;
    let sub_t1 = viewer.subscribe("t1", "viewer-1").await;
    let sub_t2 = viewer.subscribe("t2", "viewer-1").await;
    settle().await;

    producer_a
        .publish_start(&open_tag("m1", "t1"))
        .await
        .unwrap();
    producer_a.publish_content("from a").await.unwrap();
    producer_a.publish_end().await.unwrap();

    // Let the first message finish before the second producer opens:
    // the per-connection open context is shared by everything arriving
    // on the egress stream.
    let envelope_a = sub_t1.wait_for_message(WAIT).await.unwrap().unwrap();
    assert_eq!(envelope_a.content.get_content().await, "from a");

    producer_b
        .publish_start(&open_tag("m2", "t2"))
        .await
        .unwrap();
    producer_b.publish_content("from b").await.unwrap();
    producer_b.publish_end().await.unwrap();

    let envelope_b = sub_t2.wait_for_message(WAIT).await.unwrap().unwrap();
    assert_eq!(envelope_b.content.get_content().await, "from b");

    producer_a.stop().await;
    producer_b.stop().await;
    viewer.stop().await;
    broker.stop().await;
}
