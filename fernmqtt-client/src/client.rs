use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use fernmqtt_core::codec::{Decoder, Encoder};
use fernmqtt_core::protocol::ProtocolVersion;
use fernmqtt_core::qos::QoS;
use fernmqtt_core::reason::ReasonCode;
use fernmqtt_packets::connect::{ConnectFlags, ConnectPacket, ConnectPayload, ConnectProperties, WillProperties};
use fernmqtt_packets::disconnect::DisconnectPacket;
use fernmqtt_packets::pingreq::PingReqPacket;
use fernmqtt_packets::puback::PubAckPacket;
use fernmqtt_packets::pubcomp::PubCompPacket;
use fernmqtt_packets::publish::PublishPacket;
use fernmqtt_packets::pubrec::PubRecPacket;
use fernmqtt_packets::pubrel::PubRelPacket;
use fernmqtt_packets::subscribe::{SubscribePacket, SubscribePayload, SubscriptionOptions, RetainHandling};
use fernmqtt_packets::unsubscribe::{UnsubscribePacket, UnsubscribePayload};
use fernmqtt_packets::ControlPacket;
use fernmqtt_storage::{make_key, parse_key, KeyTag, PersistencePort};
use rand::Rng;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{self, timeout};
use tracing::{debug, error, info, warn};

use crate::connection::Connection;
use crate::error::{ClientError, Result};
use crate::event::{DisconnectReason, Event, SubscribeResult};
use crate::options::{ConnectOptions, ServerUri};

/// Command sent to the client's connection task.
enum Command {
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        response: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        topics: Vec<(String, QoS)>,
        response: oneshot::Sender<Result<Vec<SubscribeResult>>>,
    },
    Unsubscribe {
        topics: Vec<String>,
        response: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        response: oneshot::Sender<Result<()>>,
    },
}

/// A publish command that couldn't go out immediately because the client is
/// disconnected, waiting in line for the next successful connection.
struct BufferedPublish {
    topic: String,
    payload: Bytes,
    qos: QoS,
    retain: bool,
    response: oneshot::Sender<Result<()>>,
}

/// An outbound QoS 1 publish awaiting its PUBACK. Keeps the original packet
/// around so both reconnect-time and in-session retry can resend it DUP=1
/// without needing a persistence backend.
struct PendingPubAck {
    response: Option<oneshot::Sender<Result<()>>>,
    packet: PublishPacket,
    last_touch: Instant,
}

/// An outbound QoS 2 publish awaiting its PUBREC/PUBCOMP handshake.
struct PendingQos2Out {
    response: Option<oneshot::Sender<Result<()>>>,
    packet: PublishPacket,
    awaiting_pubcomp: bool,
    last_touch: Instant,
}

/// One packet id restored from persistence on reconnect.
struct RestoredOutbound {
    packet: PublishPacket,
    awaiting_pubcomp: bool,
}

/// Why a connection's event loop stopped.
enum ConnectionOutcome {
    /// `disconnect()` was called, or every client handle was dropped.
    ClientDisconnected,
    /// The socket died or the broker dropped us; worth a reconnect attempt.
    ConnectionLost(DisconnectReason),
}

/// State shared between the public `MqttClient` handle and the task that
/// owns the socket, so `publish()` can tell whether to send immediately or
/// buffer, without round-tripping through the command channel first.
struct SharedState {
    connected: AtomicBool,
    has_ever_connected: AtomicBool,
    buffer: Mutex<VecDeque<BufferedPublish>>,
}

/// Offline-buffering policy, copied out of `ConnectOptions` once at connect
/// time so `publish()` doesn't need to reach into the options the
/// connection task owns.
#[derive(Clone, Copy)]
struct BufferPolicy {
    send_while_disconnected: bool,
    allow_disconnected_send_at_any_time: bool,
    max_buffered_messages: u32,
    delete_oldest_messages: bool,
}

impl From<&ConnectOptions> for BufferPolicy {
    fn from(options: &ConnectOptions) -> Self {
        Self {
            send_while_disconnected: options.send_while_disconnected,
            allow_disconnected_send_at_any_time: options.allow_disconnected_send_at_any_time,
            max_buffered_messages: options.max_buffered_messages,
            delete_oldest_messages: options.delete_oldest_messages,
        }
    }
}

/// An MQTT client for connecting to brokers.
///
/// Cloning is not supported; instead, create additional handles is not
/// needed because `MqttClient` itself is cheap to share behind an `Arc` --
/// the command channel and event channel are already `Send + Sync`.
pub struct MqttClient {
    command_tx: mpsc::Sender<Command>,
    event_rx: Mutex<mpsc::Receiver<Event>>,
    client_id: String,
    server_uri: Arc<std::sync::Mutex<String>>,
    shared: Arc<SharedState>,
    buffer_policy: BufferPolicy,
}

impl MqttClient {
    /// Connect to an MQTT broker with the given options.
    ///
    /// Spawns one task that owns the socket for the lifetime of the client.
    /// If `options.automatic_reconnect()` was set, that task keeps running
    /// across connection loss, retrying with jittered backoff.
    pub async fn connect(options: ConnectOptions) -> Result<Self> {
        if options.send_while_disconnected && options.max_buffered_messages == 0 {
            return Err(ClientError::InvalidConfiguration(
                "max_buffered_messages must be greater than zero when send_while_disconnected is enabled".into(),
            ));
        }

        let (client_id, session_present, connection, version, uri) = Self::handshake(&options).await?;
        let _ = session_present;

        let (command_tx, command_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::channel(256);

        let shared = Arc::new(SharedState {
            connected: AtomicBool::new(true),
            has_ever_connected: AtomicBool::new(true),
            buffer: Mutex::new(VecDeque::new()),
        });
        let server_uri = Arc::new(std::sync::Mutex::new(uri));
        let buffer_policy = BufferPolicy::from(&options);

        let supervisor_client_id = client_id.clone();
        tokio::spawn(Self::supervisor(
            options,
            connection,
            supervisor_client_id,
            version,
            command_rx,
            event_tx,
            shared.clone(),
            server_uri.clone(),
        ));

        Ok(MqttClient {
            command_tx,
            event_rx: Mutex::new(event_rx),
            client_id,
            server_uri,
            shared,
            buffer_policy,
        })
    }

    /// The client id assigned by the broker, or chosen by the caller.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The server URI the client is currently connected to (or was last
    /// connected to, if a reconnect is in progress).
    pub fn server_uri(&self) -> String {
        self.server_uri.lock().expect("server_uri mutex poisoned").clone()
    }

    /// The protocol version fallback order to try, starting from the one
    /// the caller requested down to the oldest supported version.
    fn fallback_versions(start: ProtocolVersion) -> &'static [ProtocolVersion] {
        match start {
            ProtocolVersion::V5 => &[ProtocolVersion::V5, ProtocolVersion::V3_1_1, ProtocolVersion::V3_1],
            ProtocolVersion::V3_1_1 => &[ProtocolVersion::V3_1_1, ProtocolVersion::V3_1],
            ProtocolVersion::V3_1 => &[ProtocolVersion::V3_1],
        }
    }

    /// Walks the configured server URI list, and for each one the protocol
    /// version fallback order, until a CONNECT/CONNACK handshake succeeds.
    /// A TCP-level failure or a non-version CONNACK refusal moves on to the
    /// next URI directly; `UnsupportedProtocolVersion` tries the next older
    /// version against the same URI first, only advancing the URI once
    /// every version has been exhausted.
    async fn handshake(options: &ConnectOptions) -> Result<(String, bool, Connection, ProtocolVersion, String)> {
        let uris = options.resolved_uris();
        let mut last_err = None;

        for uri in &uris {
            let target = match ServerUri::parse(uri) {
                Ok(target) => target,
                Err(e) => {
                    warn!("skipping unusable server URI {}: {}", uri, e);
                    last_err = Some(e);
                    continue;
                }
            };

            for &version in Self::fallback_versions(options.protocol_version) {
                match Self::handshake_with_version(options, &target, version).await {
                    Ok((client_id, session_present, connection, version)) => {
                        return Ok((client_id, session_present, connection, version, uri.clone()));
                    }
                    Err(ClientError::ConnectionRefused(ReasonCode::UnsupportedProtocolVersion)) => {
                        warn!("broker at {} rejected {}, falling back", uri, version);
                        last_err = Some(ClientError::ConnectionRefused(
                            ReasonCode::UnsupportedProtocolVersion,
                        ));
                    }
                    Err(e) => {
                        warn!("connect attempt to {} failed: {}", uri, e);
                        last_err = Some(e);
                        break;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            ClientError::ConnectionFailed("no server URIs configured".into())
        }))
    }

    async fn handshake_with_version(
        options: &ConnectOptions,
        target: &ServerUri,
        version: ProtocolVersion,
    ) -> Result<(String, bool, Connection, ProtocolVersion)> {
        info!(
            "Connecting to MQTT broker at {}:{} ({})",
            target.host, target.port, version
        );

        let mut connection = Connection::connect(options, target).await?;
        connection.set_protocol_version(version);

        let connect_packet = Self::build_connect_packet(options, version);
        connection
            .write_packet(ControlPacket::Connect(connect_packet))
            .await?;

        let connack = timeout(
            Duration::from_secs(options.connect_timeout_secs),
            connection.read_packet(),
        )
        .await
        .map_err(|_| ClientError::Timeout)??
        .ok_or_else(|| ClientError::ConnectionFailed("Connection closed".into()))?;

        let (session_present, client_id) = match connack {
            ControlPacket::ConnAck(ack) => {
                if ack.reason_code != ReasonCode::Success {
                    return Err(ClientError::ConnectionRefused(ack.reason_code));
                }
                let assigned_id = ack
                    .properties
                    .as_ref()
                    .and_then(|p| p.assigned_client_id.as_ref())
                    .map(|id| id.0.clone());
                let client_id =
                    assigned_id.unwrap_or_else(|| options.client_id.clone().unwrap_or_default());
                (ack.flags.session_present, client_id)
            }
            _ => return Err(ClientError::Protocol("Expected CONNACK packet".to_string())),
        };

        info!(
            "Connected to MQTT broker, client_id: {}, session_present: {}",
            client_id, session_present
        );

        Ok((client_id, session_present, connection, version))
    }

    /// Build a CONNECT packet from options for a specific negotiated version.
    fn build_connect_packet(options: &ConnectOptions, version: ProtocolVersion) -> ConnectPacket {
        let flags = ConnectFlags {
            user_name: options.username.is_some(),
            password: options.password.is_some(),
            will_retain: options.will.as_ref().map(|w| w.retain).unwrap_or(false),
            will_qos: options
                .will
                .as_ref()
                .map(|w| w.qos)
                .unwrap_or(QoS::AtMostOnce),
            will_flag: options.will.is_some(),
            clean_start: options.clean_start,
        };

        let payload = ConnectPayload {
            client_id: options.client_id.clone().unwrap_or_default(),
            will_properties: options.will.as_ref().map(|_| WillProperties::default()),
            will_topic: options.will.as_ref().map(|w| w.topic.clone()),
            will_payload: options.will.as_ref().map(|w| w.payload.clone()),
            user_name: options.username.clone(),
            password: options.password.clone(),
        };

        let properties = version.supports_properties().then(|| ConnectProperties {
            receive_maximum: Some(fernmqtt_core::properties::ReceiveMaximum::new(
                options.receive_maximum,
            )),
            ..Default::default()
        });

        ConnectPacket {
            protocol_version: version,
            flags,
            keepalive: options.keep_alive,
            properties,
            payload,
        }
    }

    /// Owns the connection for as long as the client lives, reconnecting
    /// with jittered backoff when `options.automatic_reconnect` is set.
    #[allow(clippy::too_many_arguments)]
    async fn supervisor(
        options: ConnectOptions,
        mut connection: Connection,
        mut client_id: String,
        mut version: ProtocolVersion,
        mut command_rx: mpsc::Receiver<Command>,
        event_tx: mpsc::Sender<Event>,
        shared: Arc<SharedState>,
        server_uri: Arc<std::sync::Mutex<String>>,
    ) {
        loop {
            let uri_snapshot = server_uri.lock().expect("server_uri mutex poisoned").clone();
            let outcome = Self::run_connection(
                &options,
                &mut connection,
                &client_id,
                version,
                &uri_snapshot,
                &mut command_rx,
                &event_tx,
                &shared,
            )
            .await;

            shared.connected.store(false, Ordering::Release);

            let reason = match outcome {
                ConnectionOutcome::ClientDisconnected => return,
                ConnectionOutcome::ConnectionLost(reason) => reason,
            };

            let _ = event_tx.send(Event::Disconnected { reason }).await;

            if !options.automatic_reconnect || command_rx.is_closed() {
                return;
            }

            let mut delay = options.min_reconnect_delay_secs;
            loop {
                if command_rx.is_closed() {
                    return;
                }

                let jitter = rand::thread_rng().gen_range(0..=delay);
                time::sleep(Duration::from_secs(delay.saturating_sub(jitter / 2).max(1))).await;

                match Self::handshake(&options).await {
                    Ok((new_client_id, session_present, new_connection, new_version, new_uri)) => {
                        client_id = new_client_id;
                        connection = new_connection;
                        version = new_version;
                        *server_uri.lock().expect("server_uri mutex poisoned") = new_uri.clone();
                        let _ = event_tx
                            .send(Event::Reconnected { session_present, server_uri: new_uri })
                            .await;
                        break;
                    }
                    Err(e) => {
                        warn!("reconnect attempt failed: {}", e);
                        delay = (delay * 2).min(options.max_reconnect_delay_secs);
                    }
                }
            }
        }
    }

    /// Runs one connection's worth of protocol traffic until it dies or the
    /// caller asks to disconnect.
    #[allow(clippy::too_many_arguments)]
    async fn run_connection(
        options: &ConnectOptions,
        connection: &mut Connection,
        client_id: &str,
        version: ProtocolVersion,
        uri: &str,
        command_rx: &mut mpsc::Receiver<Command>,
        event_tx: &mpsc::Sender<Event>,
        shared: &SharedState,
    ) -> ConnectionOutcome {
        let mut next_packet_id: u16 = 1;
        let mut pending_puback: HashMap<u16, PendingPubAck> = HashMap::new();
        let mut pending_qos2_out: HashMap<u16, PendingQos2Out> = HashMap::new();
        let mut pending_suback: HashMap<u16, (Vec<(String, QoS)>, oneshot::Sender<Result<Vec<SubscribeResult>>>)> =
            HashMap::new();
        let mut pending_unsuback: HashMap<u16, oneshot::Sender<Result<()>>> = HashMap::new();
        let mut inbound_qos2: HashMap<u16, (String, Bytes, bool)> = HashMap::new();

        if let Some(store) = &options.persistence {
            if let Err(e) = store.open(client_id, uri).await {
                warn!("failed to open persistence store: {}", e);
            } else {
                match Self::restore_outbound(store.as_ref(), client_id, version, connection).await {
                    Ok(restored) => {
                        let now = Instant::now();
                        for r in restored {
                            let packet_id = r.packet.packet_id.unwrap_or(0);
                            match r.packet.qos_level {
                                QoS::AtLeastOnce => {
                                    pending_puback.insert(
                                        packet_id,
                                        PendingPubAck { response: None, packet: r.packet, last_touch: now },
                                    );
                                }
                                QoS::ExactlyOnce => {
                                    pending_qos2_out.insert(
                                        packet_id,
                                        PendingQos2Out {
                                            response: None,
                                            packet: r.packet,
                                            awaiting_pubcomp: r.awaiting_pubcomp,
                                            last_touch: now,
                                        },
                                    );
                                }
                                _ => {}
                            }
                        }
                    }
                    Err(e) => warn!("failed to resend queued publications: {}", e),
                }
            }
        }

        shared.connected.store(true, Ordering::Release);
        shared.has_ever_connected.store(true, Ordering::Release);

        if let Err(e) = Self::drain_buffered_publishes(
            shared,
            connection,
            client_id,
            version,
            &options.persistence,
            &mut next_packet_id,
            &mut pending_puback,
            &mut pending_qos2_out,
            &pending_suback,
            &pending_unsuback,
        )
        .await
        {
            error!("failed to flush buffered publishes, dropping connection: {}", e);
            Self::fail_all_pending(pending_puback, pending_qos2_out, pending_suback, pending_unsuback);
            return ConnectionOutcome::ConnectionLost(DisconnectReason::ConnectionLost);
        }

        let ping_interval = if options.keep_alive > 0 {
            Duration::from_secs((options.keep_alive / 2).max(1) as u64)
        } else {
            Duration::from_secs(u64::MAX / 2)
        };
        let mut ping_timer = time::interval(ping_interval);
        ping_timer.tick().await;
        let mut awaiting_pingresp = false;

        let retry_interval = Self::retry_interval(options);
        let retry_threshold = retry_interval.map(|i| i.max(Duration::from_secs(10)));
        let mut retry_timer = retry_interval.map(time::interval);

        loop {
            tokio::select! {
                maybe_packet = connection.read_packet() => {
                    match maybe_packet {
                        Ok(Some(ControlPacket::Disconnect(d))) => {
                            info!("broker sent DISCONNECT: {:?}", d.reason);
                            Self::fail_all_pending(pending_puback, pending_qos2_out, pending_suback, pending_unsuback);
                            return ConnectionOutcome::ConnectionLost(DisconnectReason::ServerInitiated);
                        }
                        Ok(Some(packet)) => {
                            awaiting_pingresp = false;
                            if let Err(e) = Self::handle_incoming_packet(
                                packet,
                                connection,
                                event_tx,
                                client_id,
                                &options.persistence,
                                version,
                                &mut pending_puback,
                                &mut pending_qos2_out,
                                &mut pending_suback,
                                &mut pending_unsuback,
                                &mut inbound_qos2,
                            ).await {
                                error!("error handling packet, dropping connection: {}", e);
                                Self::fail_all_pending(pending_puback, pending_qos2_out, pending_suback, pending_unsuback);
                                return ConnectionOutcome::ConnectionLost(DisconnectReason::ProtocolError(e.to_string()));
                            }
                        }
                        Ok(None) => {
                            Self::fail_all_pending(pending_puback, pending_qos2_out, pending_suback, pending_unsuback);
                            return ConnectionOutcome::ConnectionLost(DisconnectReason::ServerInitiated);
                        }
                        Err(e) => {
                            error!("error reading packet: {}", e);
                            Self::fail_all_pending(pending_puback, pending_qos2_out, pending_suback, pending_unsuback);
                            return ConnectionOutcome::ConnectionLost(DisconnectReason::ConnectionLost);
                        }
                    }
                }

                maybe_cmd = command_rx.recv() => {
                    match maybe_cmd {
                        Some(Command::Publish { topic, payload, qos, retain, response }) => {
                            match Self::allocate_publish_id(qos, &mut next_packet_id, &pending_puback, &pending_qos2_out, &pending_suback, &pending_unsuback) {
                                Ok(packet_id) => {
                                    if let Err(e) = Self::handle_publish(
                                        connection, client_id, version, &options.persistence,
                                        packet_id, &mut pending_puback, &mut pending_qos2_out,
                                        topic, payload, qos, retain, response,
                                    ).await {
                                        error!("failed to publish, dropping connection: {}", e);
                                        Self::fail_all_pending(pending_puback, pending_qos2_out, pending_suback, pending_unsuback);
                                        return ConnectionOutcome::ConnectionLost(DisconnectReason::ConnectionLost);
                                    }
                                }
                                Err(e) => {
                                    let _ = response.send(Err(e));
                                }
                            }
                        }
                        Some(Command::Subscribe { topics, response }) => {
                            match Self::next_id(&mut next_packet_id, &pending_puback, &pending_qos2_out, &pending_suback, &pending_unsuback) {
                                Ok(packet_id) => {
                                    if let Err(e) = Self::handle_subscribe(connection, packet_id, &mut pending_suback, topics, response).await {
                                        error!("failed to subscribe, dropping connection: {}", e);
                                        Self::fail_all_pending(pending_puback, pending_qos2_out, pending_suback, pending_unsuback);
                                        return ConnectionOutcome::ConnectionLost(DisconnectReason::ConnectionLost);
                                    }
                                }
                                Err(e) => {
                                    let _ = response.send(Err(e));
                                }
                            }
                        }
                        Some(Command::Unsubscribe { topics, response }) => {
                            match Self::next_id(&mut next_packet_id, &pending_puback, &pending_qos2_out, &pending_suback, &pending_unsuback) {
                                Ok(packet_id) => {
                                    if let Err(e) = Self::handle_unsubscribe(connection, packet_id, &mut pending_unsuback, topics, response).await {
                                        error!("failed to unsubscribe, dropping connection: {}", e);
                                        Self::fail_all_pending(pending_puback, pending_qos2_out, pending_suback, pending_unsuback);
                                        return ConnectionOutcome::ConnectionLost(DisconnectReason::ConnectionLost);
                                    }
                                }
                                Err(e) => {
                                    let _ = response.send(Err(e));
                                }
                            }
                        }
                        Some(Command::Disconnect { response }) => {
                            let result = Self::handle_disconnect(connection).await;
                            let _ = response.send(result);
                            Self::fail_all_pending(pending_puback, pending_qos2_out, pending_suback, pending_unsuback);
                            return ConnectionOutcome::ClientDisconnected;
                        }
                        None => {
                            let _ = Self::handle_disconnect(connection).await;
                            Self::fail_all_pending(pending_puback, pending_qos2_out, pending_suback, pending_unsuback);
                            return ConnectionOutcome::ClientDisconnected;
                        }
                    }
                }

                _ = ping_timer.tick() => {
                    if awaiting_pingresp {
                        error!("keep-alive timeout: no PINGRESP received");
                        Self::fail_all_pending(pending_puback, pending_qos2_out, pending_suback, pending_unsuback);
                        return ConnectionOutcome::ConnectionLost(DisconnectReason::KeepAliveTimeout);
                    }

                    debug!("sending PINGREQ");
                    if let Err(e) = connection.write_packet(ControlPacket::PingReq(PingReqPacket {})).await {
                        error!("failed to send PINGREQ: {}", e);
                        Self::fail_all_pending(pending_puback, pending_qos2_out, pending_suback, pending_unsuback);
                        return ConnectionOutcome::ConnectionLost(DisconnectReason::KeepAliveTimeout);
                    }
                    awaiting_pingresp = options.keep_alive > 0;
                }

                _ = async { retry_timer.as_mut().unwrap().tick().await }, if retry_timer.is_some() => {
                    let threshold = retry_threshold.expect("retry_threshold set whenever retry_timer is");
                    if let Err(e) = Self::retry_stale_outbound(connection, &mut pending_puback, &mut pending_qos2_out, threshold).await {
                        error!("in-session retry failed, dropping connection: {}", e);
                        Self::fail_all_pending(pending_puback, pending_qos2_out, pending_suback, pending_unsuback);
                        return ConnectionOutcome::ConnectionLost(DisconnectReason::ConnectionLost);
                    }
                }
            }
        }
    }

    /// The in-session retry tick interval, `clamp(keep_alive / 10, 100ms,
    /// 5s)` unless overridden. A configured non-positive interval disables
    /// in-session retry (reconnect-time resend still happens regardless).
    fn retry_interval(options: &ConnectOptions) -> Option<Duration> {
        match options.retry_interval_secs {
            Some(secs) if secs <= 0 => None,
            Some(secs) => Some(Duration::from_secs(secs as u64)),
            None => {
                let millis = ((options.keep_alive as u64) * 1000 / 10).clamp(100, 5_000);
                Some(Duration::from_millis(millis))
            }
        }
    }

    /// Resends any outbound entry whose `last_touch` is older than
    /// `threshold`: PUBLISH (DUP=1) if still awaiting PUBREC/PUBACK, PUBREL
    /// if already in the PUBCOMP-awaited state.
    async fn retry_stale_outbound(
        connection: &mut Connection,
        pending_puback: &mut HashMap<u16, PendingPubAck>,
        pending_qos2_out: &mut HashMap<u16, PendingQos2Out>,
        threshold: Duration,
    ) -> Result<()> {
        let now = Instant::now();

        for (packet_id, entry) in pending_puback.iter_mut() {
            if now.duration_since(entry.last_touch) >= threshold {
                debug!("retrying stale QoS 1 publish, packet_id: {}", packet_id);
                let mut packet = entry.packet.clone();
                packet.dup = true;
                connection.write_packet(ControlPacket::Publish(packet)).await?;
                entry.last_touch = now;
            }
        }

        for (packet_id, entry) in pending_qos2_out.iter_mut() {
            if now.duration_since(entry.last_touch) >= threshold {
                if entry.awaiting_pubcomp {
                    debug!("retrying stale PUBREL, packet_id: {}", packet_id);
                    connection
                        .write_packet(ControlPacket::PubRel(PubRelPacket {
                            packet_id: *packet_id,
                            reason: ReasonCode::Success,
                            properties: None,
                        }))
                        .await?;
                } else {
                    debug!("retrying stale QoS 2 publish, packet_id: {}", packet_id);
                    let mut packet = entry.packet.clone();
                    packet.dup = true;
                    connection.write_packet(ControlPacket::Publish(packet)).await?;
                }
                entry.last_touch = now;
            }
        }

        Ok(())
    }

    /// Sends every publish that was buffered while disconnected, in the
    /// order it was enqueued, allocating each one a fresh packet id.
    #[allow(clippy::too_many_arguments)]
    async fn drain_buffered_publishes(
        shared: &SharedState,
        connection: &mut Connection,
        client_id: &str,
        version: ProtocolVersion,
        persistence: &Option<Arc<dyn PersistencePort>>,
        next_packet_id: &mut u16,
        pending_puback: &mut HashMap<u16, PendingPubAck>,
        pending_qos2_out: &mut HashMap<u16, PendingQos2Out>,
        pending_suback: &HashMap<u16, (Vec<(String, QoS)>, oneshot::Sender<Result<Vec<SubscribeResult>>>)>,
        pending_unsuback: &HashMap<u16, oneshot::Sender<Result<()>>>,
    ) -> Result<()> {
        let mut buffer = shared.buffer.lock().await;
        while let Some(buffered) = buffer.pop_front() {
            let packet_id = match Self::allocate_publish_id(
                buffered.qos,
                next_packet_id,
                pending_puback,
                pending_qos2_out,
                pending_suback,
                pending_unsuback,
            ) {
                Ok(id) => id,
                Err(e) => {
                    let _ = buffered.response.send(Err(e));
                    continue;
                }
            };

            Self::handle_publish(
                connection,
                client_id,
                version,
                persistence,
                packet_id,
                pending_puback,
                pending_qos2_out,
                buffered.topic,
                buffered.payload,
                buffered.qos,
                buffered.retain,
                buffered.response,
            )
            .await?;
        }

        Ok(())
    }

    /// Resolves every outstanding caller-facing future with a disconnect
    /// error when a connection is torn down.
    fn fail_all_pending(
        pending_puback: HashMap<u16, PendingPubAck>,
        pending_qos2_out: HashMap<u16, PendingQos2Out>,
        pending_suback: HashMap<u16, (Vec<(String, QoS)>, oneshot::Sender<Result<Vec<SubscribeResult>>>)>,
        pending_unsuback: HashMap<u16, oneshot::Sender<Result<()>>>,
    ) {
        for (_, entry) in pending_puback {
            if let Some(tx) = entry.response {
                let _ = tx.send(Err(ClientError::Disconnected));
            }
        }
        for (_, entry) in pending_qos2_out {
            if let Some(tx) = entry.response {
                let _ = tx.send(Err(ClientError::Disconnected));
            }
        }
        for (_, (_, tx)) in pending_suback {
            let _ = tx.send(Err(ClientError::Disconnected));
        }
        for (_, tx) in pending_unsuback {
            let _ = tx.send(Err(ClientError::Disconnected));
        }
    }

    /// Allocates a packet id for `qos`, or `None` for QoS 0 (which never
    /// consumes one).
    fn allocate_publish_id(
        qos: QoS,
        counter: &mut u16,
        pending_puback: &HashMap<u16, PendingPubAck>,
        pending_qos2_out: &HashMap<u16, PendingQos2Out>,
        pending_suback: &HashMap<u16, (Vec<(String, QoS)>, oneshot::Sender<Result<Vec<SubscribeResult>>>)>,
        pending_unsuback: &HashMap<u16, oneshot::Sender<Result<()>>>,
    ) -> Result<Option<u16>> {
        if qos == QoS::AtMostOnce {
            return Ok(None);
        }
        Self::next_id(counter, pending_puback, pending_qos2_out, pending_suback, pending_unsuback).map(Some)
    }

    /// Linear free-id search starting after the last id issued, wrapping
    /// 65535 back to 1. Ids must be distinct across every currently live
    /// outbound in-flight and response-awaiting command; a full cycle with
    /// no free id returns `NoMoreMsgIds`.
    fn next_id(
        counter: &mut u16,
        pending_puback: &HashMap<u16, PendingPubAck>,
        pending_qos2_out: &HashMap<u16, PendingQos2Out>,
        pending_suback: &HashMap<u16, (Vec<(String, QoS)>, oneshot::Sender<Result<Vec<SubscribeResult>>>)>,
        pending_unsuback: &HashMap<u16, oneshot::Sender<Result<()>>>,
    ) -> Result<u16> {
        let is_live = |id: u16| {
            pending_puback.contains_key(&id)
                || pending_qos2_out.contains_key(&id)
                || pending_suback.contains_key(&id)
                || pending_unsuback.contains_key(&id)
        };

        let mut candidate = if *counter == 0 { 1 } else { *counter };

        for _ in 0..u16::MAX {
            if !is_live(candidate) {
                *counter = if candidate == u16::MAX { 1 } else { candidate + 1 };
                return Ok(candidate);
            }
            candidate = if candidate == u16::MAX { 1 } else { candidate + 1 };
        }

        Err(ClientError::NoMoreMsgIds)
    }

    fn sent_publish_tag(version: ProtocolVersion) -> KeyTag {
        if version.supports_properties() {
            KeyTag::SentPublishV5
        } else {
            KeyTag::SentPublish
        }
    }

    fn pubrel_sent_tag(version: ProtocolVersion) -> KeyTag {
        if version.supports_properties() {
            KeyTag::PubRelSentV5
        } else {
            KeyTag::PubRelSent
        }
    }

    async fn persist_outbound(
        persistence: &Option<Arc<dyn PersistencePort>>,
        client_id: &str,
        version: ProtocolVersion,
        packet: &PublishPacket,
    ) -> Result<()> {
        let Some(store) = persistence else { return Ok(()) };
        let packet_id = packet.packet_id.unwrap_or(0);
        let key = make_key(Self::sent_publish_tag(version), packet_id as u32);

        let mut buf = BytesMut::new();
        packet.encode(&mut buf);
        store.put(client_id, &key, &[buf.freeze()]).await?;
        Ok(())
    }

    async fn forget_outbound(
        persistence: &Option<Arc<dyn PersistencePort>>,
        client_id: &str,
        version: ProtocolVersion,
        packet_id: u16,
    ) {
        if let Some(store) = persistence {
            let key = make_key(Self::sent_publish_tag(version), packet_id as u32);
            if let Err(e) = store.remove(client_id, &key).await {
                warn!("failed to clear persisted publication {}: {}", packet_id, e);
            }
        }
    }

    /// Marks an outbound QoS 2 publish as having moved past PUBLISH into
    /// the PUBREL-sent state, so a crash-and-restore resends only the
    /// PUBREL, never the original PUBLISH, for this id.
    async fn persist_pubrel_sent(
        persistence: &Option<Arc<dyn PersistencePort>>,
        client_id: &str,
        version: ProtocolVersion,
        packet_id: u16,
    ) -> Result<()> {
        let Some(store) = persistence else { return Ok(()) };
        let key = make_key(Self::pubrel_sent_tag(version), packet_id as u32);
        store.put(client_id, &key, &[Bytes::new()]).await?;
        Ok(())
    }

    async fn forget_pubrel_sent(
        persistence: &Option<Arc<dyn PersistencePort>>,
        client_id: &str,
        version: ProtocolVersion,
        packet_id: u16,
    ) {
        if let Some(store) = persistence {
            let key = make_key(Self::pubrel_sent_tag(version), packet_id as u32);
            if let Err(e) = store.remove(client_id, &key).await {
                warn!("failed to clear persisted PUBREL state for {}: {}", packet_id, e);
            }
        }
    }

    /// Resends every durably-queued outbound publication in the order it
    /// was originally sent. An id that also has a persisted PUBREL-sent
    /// marker resends only the PUBREL (the peer has already seen the
    /// PUBLISH); every other id resends the PUBLISH itself with DUP set.
    async fn restore_outbound(
        store: &dyn PersistencePort,
        client_id: &str,
        version: ProtocolVersion,
        connection: &mut Connection,
    ) -> Result<Vec<RestoredOutbound>> {
        let publish_tag = Self::sent_publish_tag(version);
        let pubrel_tag = Self::pubrel_sent_tag(version);

        let keys = store.keys(client_id).await?;
        let mut publish_seqs: Vec<u32> = Vec::new();
        let mut pubrel_seqs: std::collections::HashSet<u32> = std::collections::HashSet::new();

        for key in &keys {
            if let Some((tag, seq)) = parse_key(key) {
                if tag == publish_tag {
                    publish_seqs.push(seq);
                } else if tag == pubrel_tag {
                    pubrel_seqs.insert(seq);
                }
            }
        }
        publish_seqs.sort_unstable();

        let mut restored = Vec::new();
        for seq in publish_seqs {
            let key = make_key(publish_tag, seq);
            let Some(mut bytes) = store.get(client_id, &key).await? else {
                continue;
            };

            let mut packet = PublishPacket::decode(&mut bytes)
                .map_err(|_| ClientError::Protocol("corrupted persisted publication".into()))?;
            packet.dup = true;

            let awaiting_pubcomp = pubrel_seqs.contains(&seq);
            if awaiting_pubcomp {
                info!("resending PUBREL for packet_id: {}", seq);
                connection
                    .write_packet(ControlPacket::PubRel(PubRelPacket {
                        packet_id: seq as u16,
                        reason: ReasonCode::Success,
                        properties: None,
                    }))
                    .await?;
            } else {
                info!("resending queued publication, packet_id: {}", seq);
                connection.write_packet(ControlPacket::Publish(packet.clone())).await?;
            }

            restored.push(RestoredOutbound { packet, awaiting_pubcomp });
        }

        Ok(restored)
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_incoming_packet(
        packet: ControlPacket,
        connection: &mut Connection,
        event_tx: &mpsc::Sender<Event>,
        client_id: &str,
        persistence: &Option<Arc<dyn PersistencePort>>,
        version: ProtocolVersion,
        pending_puback: &mut HashMap<u16, PendingPubAck>,
        pending_qos2_out: &mut HashMap<u16, PendingQos2Out>,
        pending_suback: &mut HashMap<u16, (Vec<(String, QoS)>, oneshot::Sender<Result<Vec<SubscribeResult>>>)>,
        pending_unsuback: &mut HashMap<u16, oneshot::Sender<Result<()>>>,
        inbound_qos2: &mut HashMap<u16, (String, Bytes, bool)>,
    ) -> Result<()> {
        match packet {
            ControlPacket::Publish(publish) => {
                Self::handle_incoming_publish(publish, connection, event_tx, inbound_qos2).await?;
            }

            ControlPacket::PubAck(ack) => {
                if let Some(entry) = pending_puback.remove(&ack.packet_id) {
                    Self::forget_outbound(persistence, client_id, version, ack.packet_id).await;
                    if let Some(tx) = entry.response {
                        let result = if ack.reason.get_code() < 0x80 {
                            Ok(())
                        } else {
                            Err(ClientError::ConnectionRefused(ack.reason))
                        };
                        let _ = tx.send(result);
                    }
                } else {
                    debug!("PUBACK for unknown packet id {}, ignoring", ack.packet_id);
                }
            }

            ControlPacket::PubRec(rec) => {
                let Some(entry) = pending_qos2_out.get_mut(&rec.packet_id) else {
                    debug!("PUBREC for unknown packet id {}, ignoring", rec.packet_id);
                    return Ok(());
                };

                if entry.awaiting_pubcomp {
                    debug!("duplicate PUBREC for packet id {} after PUBREL sent, ignoring", rec.packet_id);
                    return Ok(());
                }

                if rec.reason.get_code() >= 0x80 {
                    let entry = pending_qos2_out.remove(&rec.packet_id).unwrap();
                    Self::forget_outbound(persistence, client_id, version, rec.packet_id).await;
                    if let Some(tx) = entry.response {
                        let _ = tx.send(Err(ClientError::ConnectionRefused(rec.reason)));
                    }
                    return Ok(());
                }

                entry.awaiting_pubcomp = true;
                entry.last_touch = Instant::now();

                Self::persist_pubrel_sent(persistence, client_id, version, rec.packet_id).await?;

                connection
                    .write_packet(ControlPacket::PubRel(PubRelPacket {
                        packet_id: rec.packet_id,
                        reason: ReasonCode::Success,
                        properties: None,
                    }))
                    .await?;
            }

            ControlPacket::PubComp(comp) => {
                if let Some(entry) = pending_qos2_out.remove(&comp.packet_id) {
                    Self::forget_outbound(persistence, client_id, version, comp.packet_id).await;
                    Self::forget_pubrel_sent(persistence, client_id, version, comp.packet_id).await;
                    if let Some(tx) = entry.response {
                        let _ = tx.send(Ok(()));
                    }
                } else {
                    debug!("PUBCOMP for unknown packet id {}, ignoring", comp.packet_id);
                }
            }

            ControlPacket::PubRel(rel) => {
                if let Some((topic, payload, retain)) = inbound_qos2.remove(&rel.packet_id) {
                    let _ = event_tx
                        .send(Event::Message { topic, payload, qos: QoS::ExactlyOnce, retain })
                        .await;
                } else {
                    debug!("PUBREL for unknown packet id {}, ignoring", rel.packet_id);
                }
                connection
                    .write_packet(ControlPacket::PubComp(PubCompPacket {
                        packet_id: rel.packet_id,
                        reason: ReasonCode::Success,
                        properties: None,
                    }))
                    .await?;
            }

            ControlPacket::SubAck(ack) => {
                if let Some((requested, tx)) = pending_suback.remove(&ack.packet_id) {
                    let results = requested
                        .into_iter()
                        .zip(ack.payload.iter())
                        .map(|((topic, requested_qos), granted)| {
                            let success = granted.reason_code.get_code() < 0x80;
                            let qos = match granted.reason_code {
                                ReasonCode::GrantedQoS0 => QoS::AtMostOnce,
                                ReasonCode::GrantedQoS1 => QoS::AtLeastOnce,
                                ReasonCode::GrantedQoS2 => QoS::ExactlyOnce,
                                _ => requested_qos,
                            };
                            SubscribeResult { topic, qos, success }
                        })
                        .collect();
                    let _ = tx.send(Ok(results));
                }
            }

            ControlPacket::UnsubAck(ack) => {
                if let Some(tx) = pending_unsuback.remove(&ack.packet_id) {
                    let _ = tx.send(Ok(()));
                }
            }

            ControlPacket::Auth(auth) => {
                let _ = event_tx.send(Event::Auth { reason: auth.reason }).await;
            }

            ControlPacket::PingResp(_) => {
                debug!("received PINGRESP");
            }

            other => {
                debug!("ignoring unexpected packet: {:?}", other);
            }
        }

        Ok(())
    }

    async fn handle_incoming_publish(
        publish: PublishPacket,
        connection: &mut Connection,
        event_tx: &mpsc::Sender<Event>,
        inbound_qos2: &mut HashMap<u16, (String, Bytes, bool)>,
    ) -> Result<()> {
        match publish.qos_level {
            QoS::AtMostOnce => {
                let _ = event_tx
                    .send(Event::Message {
                        topic: publish.topic_name,
                        payload: publish.payload.unwrap_or_default(),
                        qos: QoS::AtMostOnce,
                        retain: publish.retain,
                    })
                    .await;
            }

            QoS::AtLeastOnce => {
                let packet_id = publish
                    .packet_id
                    .ok_or_else(|| ClientError::Protocol("PUBLISH with QoS 1 missing packet id".into()))?;

                let _ = event_tx
                    .send(Event::Message {
                        topic: publish.topic_name,
                        payload: publish.payload.unwrap_or_default(),
                        qos: QoS::AtLeastOnce,
                        retain: publish.retain,
                    })
                    .await;

                connection
                    .write_packet(ControlPacket::PubAck(PubAckPacket {
                        packet_id,
                        reason: ReasonCode::Success,
                        properties: None,
                    }))
                    .await?;
            }

            QoS::ExactlyOnce => {
                let packet_id = publish
                    .packet_id
                    .ok_or_else(|| ClientError::Protocol("PUBLISH with QoS 2 missing packet id".into()))?;

                inbound_qos2.entry(packet_id).or_insert_with(|| {
                    (
                        publish.topic_name.clone(),
                        publish.payload.clone().unwrap_or_default(),
                        publish.retain,
                    )
                });

                connection
                    .write_packet(ControlPacket::PubRec(PubRecPacket {
                        packet_id,
                        reason: ReasonCode::Success,
                        properties: None,
                    }))
                    .await?;
            }

            QoS::Invalid => return Err(ClientError::Protocol("PUBLISH with invalid QoS".into())),
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_publish(
        connection: &mut Connection,
        client_id: &str,
        version: ProtocolVersion,
        persistence: &Option<Arc<dyn PersistencePort>>,
        packet_id: Option<u16>,
        pending_puback: &mut HashMap<u16, PendingPubAck>,
        pending_qos2_out: &mut HashMap<u16, PendingQos2Out>,
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        response: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        if qos == QoS::AtMostOnce {
            let packet = PublishPacket {
                dup: false,
                qos_level: qos,
                retain,
                topic_name: topic,
                packet_id: None,
                properties: None,
                payload: Some(payload),
            };
            let result = connection.write_packet(ControlPacket::Publish(packet)).await;
            let _ = response.send(result);
            return Ok(());
        }

        let packet_id = packet_id.expect("qos >= 1 publish must have an allocated packet id");
        let packet = PublishPacket {
            dup: false,
            qos_level: qos,
            retain,
            topic_name: topic,
            packet_id: Some(packet_id),
            properties: None,
            payload: Some(payload),
        };

        Self::persist_outbound(persistence, client_id, version, &packet).await?;

        let now = Instant::now();
        match qos {
            QoS::AtLeastOnce => {
                pending_puback.insert(
                    packet_id,
                    PendingPubAck { response: Some(response), packet: packet.clone(), last_touch: now },
                );
            }
            QoS::ExactlyOnce => {
                pending_qos2_out.insert(
                    packet_id,
                    PendingQos2Out {
                        response: Some(response),
                        packet: packet.clone(),
                        awaiting_pubcomp: false,
                        last_touch: now,
                    },
                );
            }
            QoS::AtMostOnce | QoS::Invalid => unreachable!(),
        }

        connection.write_packet(ControlPacket::Publish(packet)).await
    }

    async fn handle_subscribe(
        connection: &mut Connection,
        packet_id: u16,
        pending_suback: &mut HashMap<u16, (Vec<(String, QoS)>, oneshot::Sender<Result<Vec<SubscribeResult>>>)>,
        topics: Vec<(String, QoS)>,
        response: oneshot::Sender<Result<Vec<SubscribeResult>>>,
    ) -> Result<()> {
        let payload: Vec<SubscribePayload> = topics
            .iter()
            .map(|(topic, qos)| SubscribePayload {
                topic_filter: topic.clone(),
                subs_opt: SubscriptionOptions {
                    qos: *qos,
                    no_local: false,
                    retain_as_pub: false,
                    retain_handling: RetainHandling::SendRetained,
                },
            })
            .collect();

        pending_suback.insert(packet_id, (topics, response));

        connection
            .write_packet(ControlPacket::Subscribe(SubscribePacket {
                packet_id,
                properties: None,
                payload,
            }))
            .await
    }

    async fn handle_unsubscribe(
        connection: &mut Connection,
        packet_id: u16,
        pending_unsuback: &mut HashMap<u16, oneshot::Sender<Result<()>>>,
        topics: Vec<String>,
        response: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        let payload: Vec<UnsubscribePayload> = topics
            .iter()
            .map(|topic| UnsubscribePayload { topic_filter: topic.clone() })
            .collect();

        pending_unsuback.insert(packet_id, response);

        connection
            .write_packet(ControlPacket::Unsubscribe(UnsubscribePacket {
                packet_id,
                properties: None,
                payload,
            }))
            .await
    }

    async fn handle_disconnect(connection: &mut Connection) -> Result<()> {
        connection
            .write_packet(ControlPacket::Disconnect(DisconnectPacket {
                reason: ReasonCode::NormalDisconnection,
                properties: None,
            }))
            .await
    }

    /// Publish a message to a topic. Resolves once the broker has fully
    /// acknowledged the publish (QoS 1: PUBACK, QoS 2: PUBCOMP). QoS 0
    /// resolves as soon as the bytes are written to the socket.
    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>, qos: QoS) -> Result<()> {
        self.publish_with_retain(topic, payload, qos, false).await
    }

    /// Publish a message to a topic with the retain flag set. If the client
    /// is disconnected, this either fails with `NotConnected` (the default),
    /// or — when `send_while_disconnected` was configured — buffers the
    /// publish for delivery on the next successful connection, subject to
    /// `max_buffered_messages`/`delete_oldest_messages`.
    pub async fn publish_with_retain(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        fernmqtt_core::topic::validate_publish_topic(topic)
            .map_err(|e| ClientError::InvalidTopic(e.to_string()))?;

        let payload = payload.into();

        if self.shared.connected.load(Ordering::Acquire) {
            return self.send_publish_command(topic.to_string(), payload, qos, retain).await;
        }

        if !self.buffer_policy.send_while_disconnected {
            return Err(ClientError::NotConnected);
        }

        if !self.buffer_policy.allow_disconnected_send_at_any_time
            && !self.shared.has_ever_connected.load(Ordering::Acquire)
        {
            return Err(ClientError::NotConnected);
        }

        let (response_tx, response_rx) = oneshot::channel();
        {
            let mut buffer = self.shared.buffer.lock().await;
            if buffer.len() >= self.buffer_policy.max_buffered_messages as usize {
                if self.buffer_policy.delete_oldest_messages {
                    // Oldest buffered publish is dropped with no callback,
                    // per the documented overflow policy.
                    buffer.pop_front();
                } else {
                    return Err(ClientError::MaxBufferedMessages(self.buffer_policy.max_buffered_messages));
                }
            }
            buffer.push_back(BufferedPublish {
                topic: topic.to_string(),
                payload,
                qos,
                retain,
                response: response_tx,
            });
        }

        response_rx.await.map_err(|_| ClientError::Disconnected)?
    }

    async fn send_publish_command(&self, topic: String, payload: Bytes, qos: QoS, retain: bool) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Publish { topic, payload, qos, retain, response: response_tx })
            .await
            .map_err(|_| ClientError::SendError)?;

        response_rx.await.map_err(|_| ClientError::Disconnected)?
    }

    /// Subscribe to one or more topics, waiting for the broker's SUBACK.
    pub async fn subscribe(&self, topics: &[(&str, QoS)]) -> Result<Vec<SubscribeResult>> {
        for (topic, _) in topics {
            fernmqtt_core::topic::validate_subscribe_filter(topic)
                .map_err(|e| ClientError::InvalidTopic(e.to_string()))?;
        }

        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Subscribe {
                topics: topics.iter().map(|(t, q)| (t.to_string(), *q)).collect(),
                response: response_tx,
            })
            .await
            .map_err(|_| ClientError::SendError)?;

        response_rx.await.map_err(|_| ClientError::Disconnected)?
    }

    /// Subscribe to a single topic, waiting for the broker's SUBACK.
    pub async fn subscribe_one(&self, topic: &str, qos: QoS) -> Result<SubscribeResult> {
        let mut results = self.subscribe(&[(topic, qos)]).await?;
        results.pop().ok_or_else(|| ClientError::Protocol("SUBACK carried no payload".into()))
    }

    /// Unsubscribe from one or more topics, waiting for the broker's UNSUBACK.
    pub async fn unsubscribe(&self, topics: &[&str]) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Unsubscribe {
                topics: topics.iter().map(|t| t.to_string()).collect(),
                response: response_tx,
            })
            .await
            .map_err(|_| ClientError::SendError)?;

        response_rx.await.map_err(|_| ClientError::Disconnected)?
    }

    /// Disconnect from the broker gracefully. Stops the reconnect
    /// supervisor even if automatic reconnect is enabled.
    pub async fn disconnect(&self) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Disconnect { response: response_tx })
            .await
            .map_err(|_| ClientError::SendError)?;

        response_rx.await.map_err(|_| ClientError::Disconnected)?
    }

    /// Receive the next event from the broker.
    /// Returns None once the client is permanently disconnected (automatic
    /// reconnect disabled, or exhausted) and every handle has been dropped.
    pub async fn recv(&self) -> Option<Event> {
        let mut rx = self.event_rx.lock().await;
        rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_id_skips_zero_and_wraps() {
        let mut counter: u16 = u16::MAX;
        let empty_puback = HashMap::new();
        let empty_qos2 = HashMap::new();
        let empty_suback = HashMap::new();
        let empty_unsuback = HashMap::new();

        let id = MqttClient::next_id(&mut counter, &empty_puback, &empty_qos2, &empty_suback, &empty_unsuback).unwrap();
        assert_eq!(id, u16::MAX);
        assert_eq!(counter, 1);

        let id = MqttClient::next_id(&mut counter, &empty_puback, &empty_qos2, &empty_suback, &empty_unsuback).unwrap();
        assert_eq!(id, 1);
        assert_eq!(counter, 2);
    }

    #[test]
    fn next_id_skips_ids_already_live() {
        let mut counter: u16 = 1;
        let mut pending_puback = HashMap::new();
        let (tx, _rx) = oneshot::channel();
        pending_puback.insert(
            1u16,
            PendingPubAck {
                response: Some(tx),
                packet: PublishPacket::default(),
                last_touch: Instant::now(),
            },
        );
        let empty_qos2 = HashMap::new();
        let empty_suback = HashMap::new();
        let empty_unsuback = HashMap::new();

        let id = MqttClient::next_id(&mut counter, &pending_puback, &empty_qos2, &empty_suback, &empty_unsuback).unwrap();
        assert_eq!(id, 2, "id 1 is live, allocator must skip it");
    }

    #[test]
    fn next_id_exhaustion_returns_no_more_msgids() {
        let mut counter: u16 = 1;
        let mut pending_puback = HashMap::new();
        for id in 1..=u16::MAX {
            let (tx, _rx) = oneshot::channel();
            pending_puback.insert(
                id,
                PendingPubAck { response: Some(tx), packet: PublishPacket::default(), last_touch: Instant::now() },
            );
        }
        let empty_qos2 = HashMap::new();
        let empty_suback = HashMap::new();
        let empty_unsuback = HashMap::new();

        let result = MqttClient::next_id(&mut counter, &pending_puback, &empty_qos2, &empty_suback, &empty_unsuback);
        assert!(matches!(result, Err(ClientError::NoMoreMsgIds)));
    }

    #[test]
    fn fallback_versions_cover_every_older_version() {
        assert_eq!(
            MqttClient::fallback_versions(ProtocolVersion::V5),
            &[ProtocolVersion::V5, ProtocolVersion::V3_1_1, ProtocolVersion::V3_1]
        );
        assert_eq!(
            MqttClient::fallback_versions(ProtocolVersion::V3_1_1),
            &[ProtocolVersion::V3_1_1, ProtocolVersion::V3_1]
        );
        assert_eq!(
            MqttClient::fallback_versions(ProtocolVersion::V3_1),
            &[ProtocolVersion::V3_1]
        );
    }

    #[test]
    fn sent_publish_tag_depends_on_property_support() {
        assert_eq!(MqttClient::sent_publish_tag(ProtocolVersion::V5), KeyTag::SentPublishV5);
        assert_eq!(MqttClient::sent_publish_tag(ProtocolVersion::V3_1_1), KeyTag::SentPublish);
        assert_eq!(MqttClient::sent_publish_tag(ProtocolVersion::V3_1), KeyTag::SentPublish);
    }

    #[test]
    fn pubrel_sent_tag_depends_on_property_support() {
        assert_eq!(MqttClient::pubrel_sent_tag(ProtocolVersion::V5), KeyTag::PubRelSentV5);
        assert_eq!(MqttClient::pubrel_sent_tag(ProtocolVersion::V3_1_1), KeyTag::PubRelSent);
    }

    #[test]
    fn retry_interval_clamps_to_keepalive_tenth() {
        let options = ConnectOptions::new("broker.example", 1883).keep_alive(60);
        assert_eq!(MqttClient::retry_interval(&options), Some(Duration::from_millis(5_000)));

        let options = ConnectOptions::new("broker.example", 1883).keep_alive(1);
        assert_eq!(MqttClient::retry_interval(&options), Some(Duration::from_millis(100)));
    }

    #[test]
    fn retry_interval_override_disables_on_non_positive() {
        let options = ConnectOptions::new("broker.example", 1883).retry_interval_secs(0);
        assert_eq!(MqttClient::retry_interval(&options), None);

        let options = ConnectOptions::new("broker.example", 1883).retry_interval_secs(-1);
        assert_eq!(MqttClient::retry_interval(&options), None);
    }

    #[test]
    fn build_connect_packet_carries_will_and_credentials() {
        let options = ConnectOptions::new("broker.example", 1883)
            .client_id("tester")
            .username("alice")
            .password(Bytes::from_static(b"secret"))
            .will(crate::options::Will::new("clients/tester/lwt", "offline").qos(QoS::AtLeastOnce).retain(true));

        let packet = MqttClient::build_connect_packet(&options, ProtocolVersion::V3_1_1);

        assert_eq!(packet.protocol_version, ProtocolVersion::V3_1_1);
        assert!(packet.flags.user_name);
        assert!(packet.flags.password);
        assert!(packet.flags.will_flag);
        assert!(packet.flags.will_retain);
        assert_eq!(packet.flags.will_qos, QoS::AtLeastOnce);
        assert_eq!(packet.payload.client_id, "tester");
        assert_eq!(packet.payload.will_topic.as_deref(), Some("clients/tester/lwt"));
        assert!(packet.properties.is_none(), "v3.1.1 has no CONNECT properties");
    }

    #[tokio::test]
    async fn fail_all_pending_resolves_every_waiter_with_disconnected() {
        let mut pending_puback = HashMap::new();
        let (tx, rx) = oneshot::channel();
        pending_puback.insert(
            1u16,
            PendingPubAck { response: Some(tx), packet: PublishPacket::default(), last_touch: Instant::now() },
        );

        let mut pending_qos2_out = HashMap::new();
        let (tx2, rx2) = oneshot::channel();
        pending_qos2_out.insert(
            2u16,
            PendingQos2Out {
                response: Some(tx2),
                packet: PublishPacket::default(),
                awaiting_pubcomp: false,
                last_touch: Instant::now(),
            },
        );

        MqttClient::fail_all_pending(pending_puback, pending_qos2_out, HashMap::new(), HashMap::new());

        assert!(matches!(rx.await, Ok(Err(ClientError::Disconnected))));
        assert!(matches!(rx2.await, Ok(Err(ClientError::Disconnected))));
    }
}
