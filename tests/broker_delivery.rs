//! Broker delivery guarantees over real connections
//!
//! Fan-out to every subscriber, per-publisher ordering, back-pressure with
//! a publish deadline, and direct sends.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use agen::broker::{BrokerConfig, ERR_BACKPRESSURE_TIMEOUT, MessageBroker};
use agen::client::{AgenClient, ClientConfig};
use agen::domain_types::{AgentInstanceId, ProjectId, QueueCapacity, TopicName};
use agen::protocol::wire::CODEC_JSON;
use agen::protocol::{
    BrokerFrame, ClientFrame, Envelope, HandshakeReply, Hello, PROTOCOL_VERSION, PublishStatus,
    SendStatus, read_frame, write_frame,
};
use serde_json::json;

fn topic(name: &str) -> TopicName {
    TopicName::try_new(name.to_string()).unwrap()
}

fn instance(id: &str) -> AgentInstanceId {
    AgentInstanceId::try_new(id.to_string()).unwrap()
}

async fn start_broker(config: BrokerConfig) -> MessageBroker {
    MessageBroker::start(config, None, None, CancellationToken::new())
        .await
        .expect("broker should bind")
}

async fn connect(broker: &MessageBroker, id: &str) -> AgenClient {
    let config = ClientConfig::new(
        broker.local_addr().to_string(),
        instance(id),
        ProjectId::try_new("test".to_string()).unwrap(),
    );
    AgenClient::connect(config).await.expect("client connects")
}

#[tokio::test]
async fn test_fan_out_preserves_publisher_order() {
    let broker = start_broker(BrokerConfig::default()).await;

    let sub_a = connect(&broker, "sub-a").await;
    let sub_b = connect(&broker, "sub-b").await;
    sub_a.subscribe(topic("t")).await.unwrap();
    sub_b.subscribe(topic("t")).await.unwrap();
    let mut inbox_a = sub_a.deliveries().await.unwrap();
    let mut inbox_b = sub_b.deliveries().await.unwrap();

    let publisher = connect(&broker, "pub-1").await;
    for i in 1..=3 {
        let status = publisher
            .publish_to(topic("t"), Envelope::new("event", "pub:t", json!({ "n": i })))
            .await
            .unwrap();
        assert_eq!(status, PublishStatus::DeliveredTo { count: 2 });
    }

    for inbox in [&mut inbox_a, &mut inbox_b] {
        for i in 1..=3 {
            let envelope = tokio::time::timeout(Duration::from_secs(2), inbox.recv())
                .await
                .expect("delivery expected")
                .expect("stream open");
            assert_eq!(envelope.payload["n"], i);
        }
    }
}

#[tokio::test]
async fn test_per_publisher_fifo_across_many_envelopes() {
    let broker = start_broker(BrokerConfig::default()).await;

    let subscriber = connect(&broker, "sub-1").await;
    subscriber.subscribe(topic("stream")).await.unwrap();
    let mut inbox = subscriber.deliveries().await.unwrap();

    let publisher = connect(&broker, "pub-1").await;
    for i in 0..50 {
        publisher
            .publish_to(
                topic("stream"),
                Envelope::new("event", "pub:stream", json!({ "seq": i })),
            )
            .await
            .unwrap();
    }

    for i in 0..50 {
        let envelope = tokio::time::timeout(Duration::from_secs(2), inbox.recv())
            .await
            .expect("delivery expected")
            .expect("stream open");
        assert_eq!(envelope.payload["seq"], i, "out-of-order delivery");
    }
}

#[tokio::test]
async fn test_publish_without_subscribers_returns_immediately() {
    let broker = start_broker(BrokerConfig::default()).await;
    let publisher = connect(&broker, "pub-1").await;

    let started = tokio::time::Instant::now();
    let status = publisher
        .publish_to(
            topic("empty"),
            Envelope::new("event", "pub:empty", json!({})),
        )
        .await
        .unwrap();
    assert_eq!(status, PublishStatus::NoSubscribers);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_saturated_subscriber_back_pressures_publisher() {
    let broker = start_broker(BrokerConfig {
        subscriber_queue_capacity: QueueCapacity::try_new(4).unwrap(),
        publish_deadline: Duration::from_millis(100),
        ..BrokerConfig::default()
    })
    .await;

    // raw connection that subscribes and then never reads another frame
    let mut stalled = tokio::net::TcpStream::connect(broker.local_addr())
        .await
        .unwrap();
    write_frame(
        &mut stalled,
        &Hello {
            agent_id: instance("stalled-1"),
            project_id: ProjectId::try_new("test".to_string()).unwrap(),
            codec: CODEC_JSON.to_string(),
            protocol_version: PROTOCOL_VERSION,
        },
    )
    .await
    .unwrap();
    let reply: HandshakeReply = read_frame(&mut stalled).await.unwrap();
    assert!(matches!(reply, HandshakeReply::Welcome { .. }));
    write_frame(
        &mut stalled,
        &ClientFrame::Subscribe {
            topic: "firehose".to_string(),
        },
    )
    .await
    .unwrap();
    let ack: BrokerFrame = read_frame(&mut stalled).await.unwrap();
    assert!(matches!(ack, BrokerFrame::SubscribeAck { .. }));

    let publisher = connect(&broker, "pub-1").await;
    let big = "x".repeat(2_000_000);
    let mut accepted = 0usize;
    let mut rejected = 0usize;
    for i in 0..12 {
        let status = publisher
            .publish_to(
                topic("firehose"),
                Envelope::new("event", "pub:firehose", json!({ "n": i, "fill": big.clone() })),
            )
            .await
            .unwrap();
        match status {
            PublishStatus::DeliveredTo { .. } => {
                assert_eq!(rejected, 0, "acceptance after rejection");
                accepted += 1;
            }
            PublishStatus::Error { code } => {
                assert_eq!(code, ERR_BACKPRESSURE_TIMEOUT);
                rejected += 1;
            }
            PublishStatus::NoSubscribers => panic!("subscriber disappeared"),
        }
    }

    assert!(accepted >= 4, "queue capacity worth of envelopes accepted, got {accepted}");
    assert!(rejected >= 1, "saturation never surfaced");
}

#[tokio::test]
async fn test_direct_send_reaches_target_instance() {
    let broker = start_broker(BrokerConfig::default()).await;

    let receiver = connect(&broker, "worker-1").await;
    let mut inbox = receiver.deliveries().await.unwrap();
    let sender = connect(&broker, "coordinator-1").await;

    let status = sender
        .send_to(
            instance("worker-1"),
            Envelope::new("task", "worker-1", json!({ "op": "index" })),
        )
        .await
        .unwrap();
    assert_eq!(status, SendStatus::Delivered);

    let envelope = tokio::time::timeout(Duration::from_secs(2), inbox.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(envelope.kind, "task");
    assert_eq!(envelope.payload["op"], "index");

    let status = sender
        .send_to(
            instance("nobody-9"),
            Envelope::new("task", "nobody-9", json!({})),
        )
        .await
        .unwrap();
    assert_eq!(status, SendStatus::NoSuchTarget);
}

#[tokio::test]
async fn test_unsubscribe_stops_future_deliveries() {
    let broker = start_broker(BrokerConfig::default()).await;

    let subscriber = connect(&broker, "sub-1").await;
    subscriber.subscribe(topic("news")).await.unwrap();
    let mut inbox = subscriber.deliveries().await.unwrap();

    let publisher = connect(&broker, "pub-1").await;
    publisher
        .publish_to(topic("news"), Envelope::new("event", "pub:news", json!({"n": 1})))
        .await
        .unwrap();
    assert!(
        tokio::time::timeout(Duration::from_secs(2), inbox.recv())
            .await
            .unwrap()
            .is_some()
    );

    subscriber.unsubscribe(topic("news")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let status = publisher
        .publish_to(topic("news"), Envelope::new("event", "pub:news", json!({"n": 2})))
        .await
        .unwrap();
    assert_eq!(status, PublishStatus::NoSubscribers);
}

#[tokio::test]
async fn test_second_connection_for_same_instance_rejected() {
    let broker = start_broker(BrokerConfig::default()).await;
    let _first = connect(&broker, "solo-1").await;

    let config = ClientConfig::new(
        broker.local_addr().to_string(),
        instance("solo-1"),
        ProjectId::try_new("test".to_string()).unwrap(),
    );
    let second = AgenClient::connect(config).await;
    assert!(matches!(
        second,
        Err(agen::client::ClientError::Rejected { .. })
    ));
}
