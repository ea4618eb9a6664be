use bytes::Bytes;
use fernmqtt_core::{qos::QoS, reason::ReasonCode};

/// Events received from the MQTT broker.
#[derive(Debug, Clone)]
pub enum Event {
    /// A message was received on a subscribed topic. For QoS 2 this fires
    /// only once the PUBREL/PUBCOMP handshake has completed, guaranteeing
    /// exactly-once delivery to the application.
    Message {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },

    /// The broker sent an AUTH packet as part of an extended (SASL-style)
    /// authentication exchange. MQTT 5 only.
    Auth { reason: ReasonCode },

    /// The client was disconnected from the broker.
    Disconnected { reason: DisconnectReason },

    /// A reconnect attempt succeeded after a prior disconnection.
    Reconnected { session_present: bool, server_uri: String },
}

/// Reason for disconnection.
#[derive(Debug, Clone)]
pub enum DisconnectReason {
    /// Client initiated disconnect.
    ClientInitiated,

    /// Server initiated disconnect.
    ServerInitiated,

    /// Connection lost (network error).
    ConnectionLost,

    /// Keep-alive timeout.
    KeepAliveTimeout,

    /// Protocol error.
    ProtocolError(String),
}

/// Result of a subscription request.
#[derive(Debug, Clone)]
pub struct SubscribeResult {
    pub topic: String,
    pub qos: QoS,
    pub success: bool,
}
