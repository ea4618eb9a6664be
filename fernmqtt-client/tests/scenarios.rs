//! End-to-end scenarios against the mock broker in `tests/support`.

mod support;

use std::sync::Arc;
use std::time::Duration;

use fernmqtt_client::{ClientError, ConnectOptions, Event, MqttClient, ProtocolVersion, QoS};
use fernmqtt_core::reason::ReasonCode;
use fernmqtt_packets::ControlPacket;
use fernmqtt_storage::memory::MemoryPersistence;

use support::MockBroker;

/// Scenario 1: a QoS 2 publish that loses its connection after PUBREC but
/// before PUBCOMP must, on reconnect, resend only the PUBREL -- never the
/// original PUBLISH -- since the broker has already seen it.
#[tokio::test]
async fn qos2_lost_and_resumed_resends_only_pubrel() {
    let broker = MockBroker::bind().await;
    let options = ConnectOptions::new("unused", 0)
        .server_uris([broker.uri()])
        .automatic_reconnect(1, 1)
        .persistence(Arc::new(MemoryPersistence::new()));

    let connect_task = tokio::spawn(MqttClient::connect(options));
    let mut first = broker.accept().await;
    first.accept_connect().await;
    let client = connect_task.await.unwrap().expect("initial connect succeeds");

    let publish_task = tokio::spawn({
        let client = Arc::new(client);
        let handle = client.clone();
        async move { (handle.publish("lost/topic", "payload", QoS::ExactlyOnce).await, client) }
    });

    match first.read_packet().await {
        ControlPacket::Publish(p) => assert_eq!(p.packet_id, Some(1)),
        other => panic!("expected PUBLISH, got {other:?}"),
    }
    first.rec_publish(1).await;

    match first.read_packet().await {
        ControlPacket::PubRel(rel) => assert_eq!(rel.packet_id, 1),
        other => panic!("expected PUBREL, got {other:?}"),
    }

    // Simulate the connection dying before PUBCOMP ever arrives.
    drop(first);

    let mut second = broker.accept().await;
    second.accept_connect().await;

    match second.read_packet().await {
        ControlPacket::PubRel(rel) => assert_eq!(rel.packet_id, 1),
        other => panic!("reconnect must resend only PUBREL, got {other:?}"),
    }
    second.complete_publish(1).await;

    let (result, _client) = publish_task.await.unwrap();
    assert!(result.is_ok(), "publish should resolve once PUBCOMP finally arrives: {result:?}");
}

/// Scenario 2: while disconnected with `send_while_disconnected` enabled,
/// publishes queue up to `max_buffered_messages`; past that, the oldest
/// buffered entry is evicted silently (its future resolves `Disconnected`,
/// not any success).
#[tokio::test]
async fn offline_buffering_evicts_oldest_when_full() {
    let broker = MockBroker::bind().await;
    let options = ConnectOptions::new("unused", 0)
        .server_uris([broker.uri()])
        .automatic_reconnect(60, 60)
        .send_while_disconnected(2, true);

    let connect_task = tokio::spawn(MqttClient::connect(options));
    let mut conn = broker.accept().await;
    conn.accept_connect().await;
    let client = Arc::new(connect_task.await.unwrap().expect("initial connect succeeds"));

    drop(conn);
    assert!(matches!(client.recv().await, Some(Event::Disconnected { .. })));

    let h_a = tokio::spawn({
        let client = client.clone();
        async move { client.publish_with_retain("a/topic", "a", QoS::AtMostOnce, false).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let h_b = tokio::spawn({
        let client = client.clone();
        async move { client.publish_with_retain("b/topic", "b", QoS::AtMostOnce, false).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let h_c = tokio::spawn({
        let client = client.clone();
        async move { client.publish_with_retain("c/topic", "c", QoS::AtMostOnce, false).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let result_a = h_a.await.unwrap();
    assert!(
        matches!(result_a, Err(ClientError::Disconnected)),
        "the oldest buffered publish should have been evicted once the buffer hit capacity: {result_a:?}"
    );

    h_b.abort();
    h_c.abort();
}

/// Scenario 3: a severed connection is detected and, with automatic
/// reconnect enabled, the client dials back in and reports `Reconnected`.
#[tokio::test]
async fn automatic_reconnect_recovers_after_connection_loss() {
    let broker = MockBroker::bind().await;
    let options = ConnectOptions::new("unused", 0)
        .server_uris([broker.uri()])
        .automatic_reconnect(1, 1);

    let connect_task = tokio::spawn(MqttClient::connect(options));
    let first = broker.accept().await;
    let mut first = first;
    first.accept_connect().await;
    let client = connect_task.await.unwrap().expect("initial connect succeeds");

    drop(first);

    match client.recv().await {
        Some(Event::Disconnected { .. }) => {}
        other => panic!("expected Disconnected event, got {other:?}"),
    }

    let mut second = broker.accept().await;
    second.accept_connect().await;

    match client.recv().await {
        Some(Event::Reconnected { server_uri, .. }) => assert_eq!(server_uri, broker.uri()),
        other => panic!("expected Reconnected event, got {other:?}"),
    }
}

/// Scenario 4: a broker that rejects MQTT 5 falls back through older
/// protocol versions against the same server URI before giving up.
#[tokio::test]
async fn protocol_version_falls_back_on_rejection() {
    let broker = MockBroker::bind().await;
    let options = ConnectOptions::new("unused", 0)
        .server_uris([broker.uri()])
        .protocol_version(ProtocolVersion::V5);

    let connect_task = tokio::spawn(MqttClient::connect(options));

    let mut first = broker.accept().await;
    assert_eq!(first.version, ProtocolVersion::V5);
    first.reject_connect(ReasonCode::UnsupportedProtocolVersion).await;

    let mut second = broker.accept().await;
    assert_eq!(second.version, ProtocolVersion::V3_1_1);
    second.accept_connect().await;

    let _client = connect_task.await.unwrap().expect("falls back to 3.1.1 and connects");
}

/// Scenario 5: with a high-availability URI list, a dead first entry is
/// skipped in favor of a working second one.
#[tokio::test]
async fn ha_uri_rotation_skips_unreachable_first_uri() {
    let broker = MockBroker::bind().await;
    let options = ConnectOptions::new("unused", 0)
        .server_uris(["tcp://127.0.0.1:1".to_string(), broker.uri()]);

    let connect_task = tokio::spawn(MqttClient::connect(options));

    let mut conn = broker.accept().await;
    conn.accept_connect().await;

    let client = connect_task.await.unwrap().expect("rotates past the dead URI");
    assert_eq!(client.server_uri(), broker.uri());
}

/// Scenario 6: disconnecting while a publish is still awaiting its ack
/// resolves that publish with a disconnect error instead of hanging.
#[tokio::test]
async fn destroy_with_pending_publish_resolves_as_disconnected() {
    let broker = MockBroker::bind().await;
    let options = ConnectOptions::new("unused", 0).server_uris([broker.uri()]);

    let connect_task = tokio::spawn(MqttClient::connect(options));
    let mut conn = broker.accept().await;
    conn.accept_connect().await;
    let client = connect_task.await.unwrap().expect("initial connect succeeds");

    let publish_fut = client.publish("pending/topic", "x", QoS::AtLeastOnce);
    let disconnect_fut = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.disconnect().await
    };

    let (publish_result, disconnect_result) = tokio::join!(publish_fut, disconnect_fut);

    assert!(
        matches!(publish_result, Err(ClientError::Disconnected)),
        "pending publish should be failed out, not left hanging: {publish_result:?}"
    );
    assert!(disconnect_result.is_ok());
}

/// In-session retry: an unacknowledged QoS 1 publish is resent with DUP set
/// once it's gone stale, without waiting for a reconnect.
#[tokio::test(start_paused = true)]
async fn in_session_retry_resends_stale_qos1_publish() {
    let broker = MockBroker::bind().await;
    let options = ConnectOptions::new("unused", 0)
        .server_uris([broker.uri()])
        .retry_interval_secs(1);

    let connect_task = tokio::spawn(MqttClient::connect(options));
    let mut conn = broker.accept().await;
    conn.accept_connect().await;
    let client = connect_task.await.unwrap().expect("initial connect succeeds");

    let mut publish_fut = Box::pin(client.publish("retry/topic", "x", QoS::AtLeastOnce));

    match conn.read_packet().await {
        ControlPacket::Publish(p) => {
            assert!(!p.dup);
            assert_eq!(p.packet_id, Some(1));
        }
        other => panic!("expected initial PUBLISH, got {other:?}"),
    }

    tokio::time::advance(Duration::from_secs(2)).await;

    match conn.read_packet().await {
        ControlPacket::Publish(p) => {
            assert!(p.dup, "in-session retry must resend with DUP set");
            assert_eq!(p.packet_id, Some(1));
        }
        other => panic!("expected retried PUBLISH, got {other:?}"),
    }

    conn.ack_publish(1).await;

    let result = (&mut publish_fut).await;
    assert!(result.is_ok(), "publish resolves once the retried copy is finally acked: {result:?}");
}
