//! A minimal in-process MQTT broker for integration tests.
//!
//! Speaks just enough of the wire protocol to script CONNACK/PUBACK/etc.
//! responses and observe what a connected `MqttClient` sends, using the
//! same "try parse, else read more" loop `Connection` uses on the client
//! side.

use bytes::BytesMut;
use fernmqtt_core::{codec::Encoder, protocol::ProtocolVersion, reason::ReasonCode};
use fernmqtt_packets::{
    connack::{ConnAckFlags, ConnAckPacket},
    puback::PubAckPacket,
    pubcomp::PubCompPacket,
    pubrec::PubRecPacket,
    suback::{SubAckPacket, SubAckPayload},
    ControlPacket,
};
use tokio::net::{TcpListener, TcpStream};

pub struct MockBroker {
    listener: TcpListener,
    port: u16,
}

impl MockBroker {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock broker");
        let port = listener.local_addr().expect("local_addr").port();
        Self { listener, port }
    }

    pub fn uri(&self) -> String {
        format!("tcp://127.0.0.1:{}", self.port)
    }

    /// Accepts one incoming connection and reads its CONNECT packet,
    /// returning a handle scoped to the negotiated protocol version.
    pub async fn accept(&self) -> BrokerConn {
        let (stream, _) = self.listener.accept().await.expect("accept connection");
        let mut conn = BrokerConn { stream, read_buffer: BytesMut::new(), version: ProtocolVersion::V5 };
        let connect = conn.read_connect().await;
        conn.version = connect.protocol_version;
        conn
    }
}

pub struct BrokerConn {
    stream: TcpStream,
    read_buffer: BytesMut,
    pub version: ProtocolVersion,
}

impl BrokerConn {
    async fn read_packet_as(&mut self, version: ProtocolVersion) -> ControlPacket {
        use tokio::io::AsyncReadExt;

        loop {
            if !self.read_buffer.is_empty() {
                if let Ok(packet) = ControlPacket::parse_with_version(&mut self.read_buffer.clone(), version) {
                    let mut encoded = BytesMut::new();
                    packet.encode(&mut encoded);
                    let _ = self.read_buffer.split_to(encoded.len());
                    return packet;
                }
            }

            let mut buf = [0u8; 4096];
            let n = self.stream.read(&mut buf).await.expect("read from client");
            assert!(n > 0, "client closed the connection unexpectedly");
            self.read_buffer.extend_from_slice(&buf[..n]);
        }
    }

    /// The first packet off a fresh connection always decodes as CONNECT
    /// regardless of negotiated version (the version lives in its own bytes).
    async fn read_connect(&mut self) -> fernmqtt_packets::connect::ConnectPacket {
        match self.read_packet_as(ProtocolVersion::V5).await {
            ControlPacket::Connect(c) => c,
            other => panic!("expected CONNECT, got {other:?}"),
        }
    }

    pub async fn read_packet(&mut self) -> ControlPacket {
        let version = self.version;
        self.read_packet_as(version).await
    }

    pub async fn write_packet(&mut self, packet: ControlPacket) {
        use tokio::io::AsyncWriteExt;

        let mut buffer = BytesMut::new();
        packet.encode(&mut buffer);
        self.stream.write_all(&buffer).await.expect("write to client");
    }

    pub async fn accept_connect(&mut self) {
        self.write_packet(ControlPacket::ConnAck(ConnAckPacket {
            protocol_version: self.version,
            flags: ConnAckFlags { session_present: false },
            reason_code: ReasonCode::Success,
            properties: self.version.supports_properties().then(Default::default),
        }))
        .await;
    }

    pub async fn reject_connect(&mut self, reason: ReasonCode) {
        self.write_packet(ControlPacket::ConnAck(ConnAckPacket {
            protocol_version: self.version,
            flags: ConnAckFlags { session_present: false },
            reason_code: reason,
            properties: self.version.supports_properties().then(Default::default),
        }))
        .await;
    }

    pub async fn ack_publish(&mut self, packet_id: u16) {
        self.write_packet(ControlPacket::PubAck(PubAckPacket {
            packet_id,
            reason: ReasonCode::Success,
            properties: None,
        }))
        .await;
    }

    pub async fn rec_publish(&mut self, packet_id: u16) {
        self.write_packet(ControlPacket::PubRec(PubRecPacket {
            packet_id,
            reason: ReasonCode::Success,
            properties: None,
        }))
        .await;
    }

    pub async fn complete_publish(&mut self, packet_id: u16) {
        self.write_packet(ControlPacket::PubComp(PubCompPacket {
            packet_id,
            reason: ReasonCode::Success,
            properties: None,
        }))
        .await;
    }

    pub async fn ack_subscribe(&mut self, packet_id: u16, granted: ReasonCode) {
        self.write_packet(ControlPacket::SubAck(SubAckPacket {
            protocol_version: self.version,
            packet_id,
            properties: None,
            payload: vec![SubAckPayload { reason_code: granted }],
        }))
        .await;
    }

    /// Drops the socket without any MQTT-level teardown, simulating a
    /// network failure.
    pub fn drop_connection(self) {
        drop(self);
    }
}
