//! End-to-end session flows against a scripted in-process broker.
//!
//! Each test binds a loopback listener, plays the broker side of the
//! exchange by hand with the protocol crate's codec, and drives the real
//! client against it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::Instant;

use mqtt311::{
    ClientObserver, ConnectOptions, ConnectionState, InboundMessage, MqttClient, MqttError, QoS,
    RetryPolicy,
};
use mqtt311_protocol::packet::{
    ConnAckPacket, PubAckPacket, PubCompPacket, PubRecPacket, PublishPacket, SubAckPacket,
    UnsubAckPacket, SUBACK_FAILURE,
};
use mqtt311_protocol::{codec, ConnectReturnCode, Packet, PacketDecoder};

struct BrokerConn {
    socket: tokio::net::TcpStream,
    decoder: PacketDecoder,
}

impl BrokerConn {
    async fn accept(listener: &TcpListener) -> Self {
        let (socket, _) = listener.accept().await.unwrap();
        Self {
            socket,
            decoder: PacketDecoder::new(),
        }
    }

    /// Accept a connection, consume the CONNECT, and accept the session.
    async fn handshake(listener: &TcpListener) -> Self {
        let mut conn = Self::accept(listener).await;
        let connect = conn.read_packet().await;
        assert!(matches!(connect, Packet::Connect(_)), "expected CONNECT, got {connect:?}");
        conn.write_packet(&Packet::ConnAck(ConnAckPacket {
            session_present: false,
            return_code: ConnectReturnCode::Accepted,
        }))
        .await;
        conn
    }

    async fn read_packet(&mut self) -> Packet {
        loop {
            if let Some(packet) = self.decoder.next_packet().unwrap() {
                return packet;
            }
            let mut buf = [0u8; 1024];
            let n = self.socket.read(&mut buf).await.unwrap();
            assert!(n > 0, "client closed the connection mid-script");
            self.decoder.feed(&buf[..n]);
        }
    }

    async fn write_packet(&mut self, packet: &Packet) {
        let mut buf = BytesMut::new();
        codec::encode_packet(packet, &mut buf).unwrap();
        self.socket.write_all(&buf).await.unwrap();
    }
}

async fn broker_endpoint() -> (TcpListener, ConnectOptions) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let options = ConnectOptions::new(addr.ip().to_string(), addr.port())
        .with_client_id("itest")
        .with_keep_alive(Duration::ZERO)
        .with_connect_timeout(Duration::from_secs(2));
    (listener, options)
}

#[derive(Default)]
struct Recorder {
    states: Mutex<Vec<(ConnectionState, ConnectionState)>>,
    messages: Mutex<Vec<InboundMessage>>,
    sent: Mutex<Vec<u16>>,
    acked: Mutex<Vec<u16>>,
    errors: Mutex<Vec<MqttError>>,
}

impl ClientObserver for Recorder {
    fn on_state_changed(&self, old: ConnectionState, new: ConnectionState) {
        self.states.lock().unwrap().push((old, new));
    }

    fn on_message(&self, message: &InboundMessage) {
        self.messages.lock().unwrap().push(message.clone());
    }

    fn on_publish_sent(&self, packet_id: u16) {
        self.sent.lock().unwrap().push(packet_id);
    }

    fn on_publish_acked(&self, packet_id: u16) {
        self.acked.lock().unwrap().push(packet_id);
    }

    fn on_error(&self, error: &MqttError) {
        self.errors.lock().unwrap().push(error.clone());
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn connect_and_disconnect_round_trip() {
    let (listener, options) = broker_endpoint().await;
    let broker = tokio::spawn(async move {
        let mut conn = BrokerConn::handshake(&listener).await;
        let packet = conn.read_packet().await;
        assert!(matches!(packet, Packet::Disconnect));
    });

    let client = MqttClient::new();
    let recorder = Arc::new(Recorder::default());
    let _observer = client.observe(recorder.clone());

    let ack = client.connect(options).await.unwrap();
    assert!(!ack.session_present);
    assert_eq!(client.state().await, ConnectionState::Connected);

    client.disconnect().await.unwrap();
    assert_eq!(client.state().await, ConnectionState::Disconnected);
    broker.await.unwrap();

    let states = recorder.states.lock().unwrap().clone();
    assert!(states.contains(&(ConnectionState::Disconnected, ConnectionState::Connecting)));
    assert!(states.contains(&(ConnectionState::Connecting, ConnectionState::Connected)));
    assert_eq!(states.last().unwrap().1, ConnectionState::Disconnected);
}

#[tokio::test]
async fn connect_refused_resolves_with_reason_code() {
    let (listener, options) = broker_endpoint().await;
    let broker = tokio::spawn(async move {
        let mut conn = BrokerConn::accept(&listener).await;
        let _connect = conn.read_packet().await;
        conn.write_packet(&Packet::ConnAck(ConnAckPacket {
            session_present: false,
            return_code: ConnectReturnCode::NotAuthorized,
        }))
        .await;
    });

    let client = MqttClient::new();
    let err = client.connect(options).await.unwrap_err();
    assert_eq!(err, MqttError::ConnectRefused(ConnectReturnCode::NotAuthorized));
    assert_eq!(client.state().await, ConnectionState::Disconnected);
    broker.await.unwrap();
}

#[tokio::test]
async fn connect_times_out_without_connack() {
    let (listener, options) = broker_endpoint().await;
    let options = options.with_connect_timeout(Duration::from_millis(300));
    let broker = tokio::spawn(async move {
        let mut conn = BrokerConn::accept(&listener).await;
        let _connect = conn.read_packet().await;
        // Never answer.
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let client = MqttClient::new();
    let err = client.connect(options).await.unwrap_err();
    assert_eq!(err, MqttError::ConnectTimeout);
    assert_eq!(client.state().await, ConnectionState::Disconnected);
    broker.abort();
}

#[tokio::test]
async fn connect_while_connected_fails_fast() {
    let (listener, options) = broker_endpoint().await;
    let broker = tokio::spawn(async move {
        let _conn = BrokerConn::handshake(&listener).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let client = MqttClient::new();
    client.connect(options.clone()).await.unwrap();
    let err = client.connect(options).await.unwrap_err();
    assert_eq!(err, MqttError::AlreadyConnected);
    broker.abort();
}

#[tokio::test]
async fn qos0_publish_resolves_immediately() {
    let (listener, options) = broker_endpoint().await;
    let broker = tokio::spawn(async move {
        let mut conn = BrokerConn::handshake(&listener).await;
        let packet = conn.read_packet().await;
        match packet {
            Packet::Publish(publish) => {
                assert_eq!(publish.topic, "status");
                assert_eq!(publish.qos, QoS::AtMostOnce);
                assert_eq!(&publish.payload[..], b"online");
                assert!(publish.packet_id.is_none());
            }
            other => panic!("expected PUBLISH, got {other:?}"),
        }
    });

    let client = MqttClient::new();
    client.connect(options).await.unwrap();
    let handle = client
        .publish("status", b"online".as_slice(), QoS::AtMostOnce, false)
        .await
        .unwrap();
    assert!(handle.packet_id().is_none());
    handle.acknowledged().await.unwrap();
    broker.await.unwrap();
}

#[tokio::test]
async fn qos1_publish_completes_on_puback() {
    let (listener, options) = broker_endpoint().await;
    let broker = tokio::spawn(async move {
        let mut conn = BrokerConn::handshake(&listener).await;
        let packet = conn.read_packet().await;
        let Packet::Publish(publish) = packet else {
            panic!("expected PUBLISH");
        };
        let packet_id = publish.packet_id.unwrap();
        conn.write_packet(&Packet::PubAck(PubAckPacket::new(packet_id))).await;
        packet_id
    });

    let client = MqttClient::new();
    let recorder = Arc::new(Recorder::default());
    let _observer = client.observe(recorder.clone());
    client.connect(options).await.unwrap();

    let handle = client
        .publish("sensors/accel", b"x: 0.1".as_slice(), QoS::AtLeastOnce, false)
        .await
        .unwrap();
    let packet_id = handle.packet_id().unwrap();
    handle.acknowledged().await.unwrap();

    let broker_saw = broker.await.unwrap();
    assert_eq!(broker_saw, packet_id);
    assert_eq!(recorder.sent.lock().unwrap().clone(), vec![packet_id]);
    assert_eq!(recorder.acked.lock().unwrap().clone(), vec![packet_id]);
}

#[tokio::test]
async fn qos1_publish_retries_with_dup_then_times_out() {
    let (listener, options) = broker_endpoint().await;
    let options = options.with_retry(RetryPolicy {
        ack_timeout: Duration::from_millis(100),
        max_retries: 2,
    });

    let broker = tokio::spawn(async move {
        let mut conn = BrokerConn::handshake(&listener).await;
        let mut seen = Vec::new();
        for _ in 0..3 {
            let Packet::Publish(publish) = conn.read_packet().await else {
                panic!("expected PUBLISH");
            };
            seen.push((publish.packet_id.unwrap(), publish.dup));
        }
        seen
    });

    let client = MqttClient::new();
    client.connect(options).await.unwrap();

    let handle = client
        .publish("sensors/accel", b"x: 0.1".as_slice(), QoS::AtLeastOnce, false)
        .await
        .unwrap();
    let packet_id = handle.packet_id().unwrap();
    let err = handle.acknowledged().await.unwrap_err();
    assert_eq!(err, MqttError::AckTimeout(packet_id));

    let seen = broker.await.unwrap();
    assert_eq!(
        seen,
        vec![(packet_id, false), (packet_id, true), (packet_id, true)],
        "initial send then exactly max_retries DUP re-sends"
    );
}

#[tokio::test]
async fn qos2_publish_runs_the_four_way_handshake() {
    let (listener, options) = broker_endpoint().await;
    let broker = tokio::spawn(async move {
        let mut conn = BrokerConn::handshake(&listener).await;
        let Packet::Publish(publish) = conn.read_packet().await else {
            panic!("expected PUBLISH");
        };
        assert_eq!(publish.qos, QoS::ExactlyOnce);
        let packet_id = publish.packet_id.unwrap();
        conn.write_packet(&Packet::PubRec(PubRecPacket::new(packet_id))).await;
        let Packet::PubRel(pubrel) = conn.read_packet().await else {
            panic!("expected PUBREL");
        };
        assert_eq!(pubrel.packet_id, packet_id);
        conn.write_packet(&Packet::PubComp(PubCompPacket::new(packet_id))).await;
    });

    let client = MqttClient::new();
    let recorder = Arc::new(Recorder::default());
    let _observer = client.observe(recorder.clone());
    client.connect(options).await.unwrap();

    let handle = client
        .publish("exact/once", b"payload".as_slice(), QoS::ExactlyOnce, false)
        .await
        .unwrap();
    let packet_id = handle.packet_id().unwrap();
    handle.acknowledged().await.unwrap();
    broker.await.unwrap();

    assert_eq!(recorder.acked.lock().unwrap().clone(), vec![packet_id]);
}

#[tokio::test]
async fn subscribe_applies_grants_and_routes_messages() {
    let (listener, options) = broker_endpoint().await;
    let broker = tokio::spawn(async move {
        let mut conn = BrokerConn::handshake(&listener).await;
        let Packet::Subscribe(subscribe) = conn.read_packet().await else {
            panic!("expected SUBSCRIBE");
        };
        assert_eq!(subscribe.filters.len(), 2);
        assert_eq!(subscribe.filters[0].filter, "sensors/+");
        assert_eq!(subscribe.filters[0].qos, QoS::AtLeastOnce);
        assert_eq!(subscribe.filters[1].filter, "sensors/accel");
        assert_eq!(subscribe.filters[1].qos, QoS::ExactlyOnce);
        conn.write_packet(&Packet::SubAck(SubAckPacket {
            packet_id: subscribe.packet_id,
            return_codes: vec![1, 2],
        }))
        .await;
        conn.write_packet(&Packet::Publish(PublishPacket {
            topic: "sensors/accel".to_string(),
            payload: bytes::Bytes::from_static(b"x: 1.0"),
            qos: QoS::AtMostOnce,
            retain: false,
            dup: false,
            packet_id: None,
        }))
        .await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let client = MqttClient::new();
    let recorder = Arc::new(Recorder::default());
    let _observer = client.observe(recorder.clone());
    client.connect(options).await.unwrap();

    let grants = client
        .subscribe(&[("sensors/+", QoS::AtLeastOnce), ("sensors/accel", QoS::ExactlyOnce)])
        .await
        .unwrap();
    assert_eq!(grants.len(), 2);
    assert_eq!(grants[0].granted, Ok(QoS::AtLeastOnce));
    assert_eq!(grants[1].granted, Ok(QoS::ExactlyOnce));

    let subscriptions = client.subscriptions().await;
    assert_eq!(subscriptions.len(), 2);
    assert_eq!(subscriptions[0].filter, "sensors/+");
    assert_eq!(subscriptions[0].granted_qos, QoS::AtLeastOnce);
    assert_eq!(subscriptions[1].filter, "sensors/accel");
    let matching = subscriptions
        .iter()
        .filter(|entry| mqtt311_protocol::matches("sensors/accel", &entry.filter))
        .count();
    assert_eq!(matching, 2, "both filters match the published topic");

    wait_until(
        || !recorder.messages.lock().unwrap().is_empty(),
        "inbound message",
    )
    .await;
    let messages = recorder.messages.lock().unwrap().clone();
    assert_eq!(messages[0].topic, "sensors/accel");
    assert_eq!(&messages[0].payload[..], b"x: 1.0");
    broker.abort();
}

#[tokio::test]
async fn suback_failure_code_fails_that_filter_only() {
    let (listener, options) = broker_endpoint().await;
    let broker = tokio::spawn(async move {
        let mut conn = BrokerConn::handshake(&listener).await;
        let Packet::Subscribe(subscribe) = conn.read_packet().await else {
            panic!("expected SUBSCRIBE");
        };
        conn.write_packet(&Packet::SubAck(SubAckPacket {
            packet_id: subscribe.packet_id,
            return_codes: vec![0, SUBACK_FAILURE],
        }))
        .await;
        // Hold the connection open while the client is inspected.
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let client = MqttClient::new();
    client.connect(options).await.unwrap();

    let grants = client
        .subscribe(&[("ok/topic", QoS::AtMostOnce), ("denied/topic", QoS::AtMostOnce)])
        .await
        .unwrap();
    assert_eq!(grants[0].granted, Ok(QoS::AtMostOnce));
    assert_eq!(
        grants[1].granted,
        Err(MqttError::SubscriptionFailed("denied/topic".to_string()))
    );

    let subscriptions = client.subscriptions().await;
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(subscriptions[0].filter, "ok/topic");
    broker.abort();
}

#[tokio::test]
async fn unsubscribe_removes_registry_entries() {
    let (listener, options) = broker_endpoint().await;
    let broker = tokio::spawn(async move {
        let mut conn = BrokerConn::handshake(&listener).await;
        let Packet::Subscribe(subscribe) = conn.read_packet().await else {
            panic!("expected SUBSCRIBE");
        };
        conn.write_packet(&Packet::SubAck(SubAckPacket {
            packet_id: subscribe.packet_id,
            return_codes: vec![1],
        }))
        .await;
        let Packet::Unsubscribe(unsubscribe) = conn.read_packet().await else {
            panic!("expected UNSUBSCRIBE");
        };
        assert_eq!(unsubscribe.filters, vec!["sensors/+".to_string()]);
        conn.write_packet(&Packet::UnsubAck(UnsubAckPacket::new(unsubscribe.packet_id))).await;
    });

    let client = MqttClient::new();
    client.connect(options).await.unwrap();

    client.subscribe(&[("sensors/+", QoS::AtLeastOnce)]).await.unwrap();
    assert_eq!(client.subscriptions().await.len(), 1);

    client.unsubscribe(&["sensors/+"]).await.unwrap();
    assert!(client.subscriptions().await.is_empty());
    broker.await.unwrap();
}

#[tokio::test]
async fn disconnect_cancels_all_pending_operations() {
    let (listener, options) = broker_endpoint().await;
    let options = options.with_retry(RetryPolicy {
        ack_timeout: Duration::from_secs(30),
        max_retries: 0,
    });
    let broker = tokio::spawn(async move {
        let mut conn = BrokerConn::handshake(&listener).await;
        // Swallow the publishes, never acknowledge, expect the DISCONNECT.
        loop {
            match conn.read_packet().await {
                Packet::Disconnect => break,
                Packet::Publish(_) => {}
                other => panic!("unexpected packet {other:?}"),
            }
        }
    });

    let client = MqttClient::new();
    client.connect(options).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..3 {
        let handle = client
            .publish(
                format!("pending/{i}"),
                b"payload".as_slice(),
                QoS::AtLeastOnce,
                false,
            )
            .await
            .unwrap();
        handles.push(handle);
    }

    client.disconnect().await.unwrap();
    for handle in handles {
        assert_eq!(handle.acknowledged().await.unwrap_err(), MqttError::Cancelled);
    }
    assert_eq!(client.state().await, ConnectionState::Disconnected);
    broker.await.unwrap();
}

#[tokio::test]
async fn publish_validates_topic_names() {
    let (listener, options) = broker_endpoint().await;
    let broker = tokio::spawn(async move {
        let _conn = BrokerConn::handshake(&listener).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let client = MqttClient::new();
    client.connect(options).await.unwrap();

    for topic in ["", "bad/+/topic", "bad/#"] {
        let err = client
            .publish(topic, b"p".as_slice(), QoS::AtMostOnce, false)
            .await
            .unwrap_err();
        assert_eq!(err, MqttError::InvalidTopicName(topic.to_string()));
    }
    broker.abort();
}

#[tokio::test]
async fn keepalive_sends_pingreq_and_survives_on_pingresp() {
    let (listener, options) = broker_endpoint().await;
    let options = options.with_keep_alive(Duration::from_millis(500));
    let (pings_tx, pings_rx) = tokio::sync::oneshot::channel();
    let broker = tokio::spawn(async move {
        let mut conn = BrokerConn::handshake(&listener).await;
        for _ in 0..2 {
            let packet = conn.read_packet().await;
            assert!(matches!(packet, Packet::PingReq), "expected PINGREQ, got {packet:?}");
            conn.write_packet(&Packet::PingResp).await;
        }
        let _ = pings_tx.send(());
        // Hold the connection open while the client is inspected.
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let client = MqttClient::new();
    client.connect(options).await.unwrap();

    // Two ping cycles of idle time; the PINGRESPs must keep us alive.
    pings_rx.await.unwrap();
    assert_eq!(client.state().await, ConnectionState::Connected);
    client.disconnect().await.unwrap();
    broker.abort();
}

#[tokio::test]
async fn missing_pingresp_is_fatal() {
    let (listener, options) = broker_endpoint().await;
    let options = options.with_keep_alive(Duration::from_millis(300));
    let broker = tokio::spawn(async move {
        let mut conn = BrokerConn::handshake(&listener).await;
        let packet = conn.read_packet().await;
        assert!(matches!(packet, Packet::PingReq));
        // Never answer; the client must declare the transport dead.
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let client = MqttClient::new();
    let recorder = Arc::new(Recorder::default());
    let _observer = client.observe(recorder.clone());
    client.connect(options).await.unwrap();

    wait_until(
        || {
            recorder
                .errors
                .lock()
                .unwrap()
                .iter()
                .any(|err| *err == MqttError::KeepAliveTimeout)
        },
        "keep-alive timeout",
    )
    .await;
    assert_eq!(client.state().await, ConnectionState::Disconnected);
    broker.abort();
}

#[tokio::test]
async fn broker_dropping_the_socket_cancels_pending_publishes() {
    let (listener, options) = broker_endpoint().await;
    let options = options.with_retry(RetryPolicy {
        ack_timeout: Duration::from_secs(30),
        max_retries: 0,
    });
    let broker = tokio::spawn(async move {
        let mut conn = BrokerConn::handshake(&listener).await;
        let _publish = conn.read_packet().await;
        // Drop the connection with an acknowledgement outstanding.
    });

    let client = MqttClient::new();
    let recorder = Arc::new(Recorder::default());
    let _observer = client.observe(recorder.clone());
    client.connect(options).await.unwrap();

    let handle = client
        .publish("doomed", b"p".as_slice(), QoS::AtLeastOnce, false)
        .await
        .unwrap();
    broker.await.unwrap();

    assert_eq!(handle.acknowledged().await.unwrap_err(), MqttError::Cancelled);
    wait_until(
        || client_state_is_disconnected(&recorder),
        "disconnect after peer close",
    )
    .await;
}

fn client_state_is_disconnected(recorder: &Recorder) -> bool {
    recorder
        .states
        .lock()
        .unwrap()
        .last()
        .is_some_and(|(_, new)| *new == ConnectionState::Disconnected)
}
