use std::sync::Arc;

use bytes::Bytes;
use fernmqtt_core::{protocol::ProtocolVersion, qos::QoS};
use fernmqtt_storage::PersistencePort;

use crate::error::ClientError;

/// Will message configuration.
#[derive(Debug, Clone)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl Will {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// TLS configuration for a connection.
///
/// By default, system root certificates are used and the server's
/// certificate is verified normally.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub(crate) danger_skip_verify: bool,
    pub(crate) ca_path: Option<String>,
}

impl TlsOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trust a custom CA certificate bundle instead of the system roots.
    pub fn ca_path(mut self, path: impl Into<String>) -> Self {
        self.ca_path = Some(path.into());
        self
    }

    /// Disable server certificate verification entirely. Only ever useful
    /// against a broker with a self-signed cert in a test harness.
    pub fn danger_skip_verify(mut self, skip: bool) -> Self {
        self.danger_skip_verify = skip;
        self
    }
}

/// A single resolved server URI: target host/port plus the transport the
/// scheme selects. `ws://`/`wss://` parse successfully (so a mixed URI list
/// doesn't blow up on an unrelated entry) but are rejected when dialed,
/// since WebSocket transport itself is out of scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ServerUri {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub websocket: bool,
}

impl ServerUri {
    pub fn parse(uri: &str) -> Result<Self, ClientError> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| ClientError::InvalidServerUri(format!("missing scheme in '{uri}'")))?;

        let (tls, websocket) = match scheme {
            "tcp" | "mqtt" => (false, false),
            "ssl" | "mqtts" => (true, false),
            "ws" => (false, true),
            "wss" => (true, true),
            other => {
                return Err(ClientError::InvalidServerUri(format!(
                    "unknown URI scheme '{other}://' in '{uri}'"
                )))
            }
        };

        let (host, port) = rest.rsplit_once(':').ok_or_else(|| {
            ClientError::InvalidServerUri(format!("missing port in '{uri}'"))
        })?;
        let port: u16 = port
            .parse()
            .map_err(|_| ClientError::InvalidServerUri(format!("invalid port in '{uri}'")))?;

        if host.is_empty() {
            return Err(ClientError::InvalidServerUri(format!("missing host in '{uri}'")));
        }

        Ok(Self { host: host.to_string(), port, tls, websocket })
    }
}

/// Options for connecting to an MQTT broker.
#[derive(Clone)]
pub struct ConnectOptions {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) server_uris: Vec<String>,
    pub(crate) client_id: Option<String>,
    pub(crate) username: Option<String>,
    pub(crate) password: Option<Bytes>,
    pub(crate) keep_alive: u16,
    pub(crate) clean_start: bool,
    pub(crate) will: Option<Will>,
    pub(crate) protocol_version: ProtocolVersion,
    pub(crate) connect_timeout_secs: u64,
    pub(crate) tls: Option<TlsOptions>,
    pub(crate) receive_maximum: u16,
    pub(crate) automatic_reconnect: bool,
    pub(crate) min_reconnect_delay_secs: u64,
    pub(crate) max_reconnect_delay_secs: u64,
    pub(crate) persistence: Option<Arc<dyn PersistencePort>>,
    pub(crate) retry_interval_secs: Option<i64>,
    pub(crate) send_while_disconnected: bool,
    pub(crate) allow_disconnected_send_at_any_time: bool,
    pub(crate) max_buffered_messages: u32,
    pub(crate) delete_oldest_messages: bool,
}

impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("server_uris", &self.server_uris)
            .field("client_id", &self.client_id)
            .field("protocol_version", &self.protocol_version)
            .field("automatic_reconnect", &self.automatic_reconnect)
            .field("send_while_disconnected", &self.send_while_disconnected)
            .finish_non_exhaustive()
    }
}

impl ConnectOptions {
    /// Create new connection options for the given host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            server_uris: Vec::new(),
            client_id: None,
            username: None,
            password: None,
            keep_alive: 60,
            clean_start: true,
            will: None,
            protocol_version: ProtocolVersion::V5,
            connect_timeout_secs: 30,
            tls: None,
            receive_maximum: 65535,
            automatic_reconnect: false,
            min_reconnect_delay_secs: 1,
            max_reconnect_delay_secs: 120,
            persistence: None,
            retry_interval_secs: None,
            send_while_disconnected: false,
            allow_disconnected_send_at_any_time: false,
            max_buffered_messages: 0,
            delete_oldest_messages: false,
        }
    }

    /// Set the client ID. If not set, the broker will assign one.
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Set the username for authentication.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set the password for authentication.
    pub fn password(mut self, password: impl Into<Bytes>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the keep-alive interval in seconds.
    pub fn keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// Set clean start flag. If true, the broker will discard any existing session.
    pub fn clean_start(mut self, clean: bool) -> Self {
        self.clean_start = clean;
        self
    }

    /// Set the will message to be published if the client disconnects unexpectedly.
    pub fn will(mut self, will: Will) -> Self {
        self.will = Some(will);
        self
    }

    /// Set the MQTT protocol version to use.
    pub fn protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    /// Set the connection timeout in seconds.
    pub fn connect_timeout(mut self, seconds: u64) -> Self {
        self.connect_timeout_secs = seconds;
        self
    }

    /// Connect over TLS using the given options.
    pub fn tls(mut self, options: TlsOptions) -> Self {
        self.tls = Some(options);
        self
    }

    /// Maximum number of QoS 1/2 publications this client will allow the
    /// broker to have in flight toward it at once.
    pub fn receive_maximum(mut self, value: u16) -> Self {
        self.receive_maximum = value.max(1);
        self
    }

    /// Enable automatic reconnect with jittered exponential backoff between
    /// `min_delay` and `max_delay` seconds.
    pub fn automatic_reconnect(mut self, min_delay_secs: u64, max_delay_secs: u64) -> Self {
        self.automatic_reconnect = true;
        self.min_reconnect_delay_secs = min_delay_secs.max(1);
        self.max_reconnect_delay_secs = max_delay_secs.max(self.min_reconnect_delay_secs);
        self
    }

    /// Install a persistence backend used to durably queue outbound QoS 1/2
    /// publications and track the inbound QoS 2 handshake across restarts.
    pub fn persistence(mut self, store: Arc<dyn PersistencePort>) -> Self {
        self.persistence = Some(store);
        self
    }

    /// Give the client a high-availability list of server URIs to rotate
    /// through on connect failure, instead of the single `host`/`port`
    /// passed to [`ConnectOptions::new`]. Each entry is a full URI —
    /// `tcp://host:port`, `mqtt://host:port`, `ssl://host:port`, or
    /// `mqtts://host:port`. `ws://`/`wss://` entries parse but are rejected
    /// at dial time, since WebSocket transport is not supported.
    pub fn server_uris<I, S>(mut self, uris: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.server_uris = uris.into_iter().map(Into::into).collect();
        self
    }

    /// Override the in-session retry interval instead of deriving it from
    /// `keep_alive` (`clamp(keep_alive / 10, 100ms, 5s)`). A non-positive
    /// value disables in-session retry entirely; reconnect-time resend of
    /// unacknowledged QoS 1/2 publications still applies regardless.
    pub fn retry_interval_secs(mut self, secs: i64) -> Self {
        self.retry_interval_secs = Some(secs);
        self
    }

    /// Allow publishes to be buffered locally while the client is
    /// disconnected, instead of failing immediately with `NotConnected`.
    /// `max_buffered_messages` must be greater than zero. When the buffer is
    /// full, a new publish either fails with `MaxBufferedMessages` (the
    /// default) or silently evicts the oldest buffered publish, depending on
    /// `delete_oldest_messages`.
    pub fn send_while_disconnected(mut self, max_buffered_messages: u32, delete_oldest_messages: bool) -> Self {
        self.send_while_disconnected = true;
        self.max_buffered_messages = max_buffered_messages;
        self.delete_oldest_messages = delete_oldest_messages;
        self
    }

    /// When `send_while_disconnected` is enabled, controls whether publishes
    /// may be buffered before the client has ever connected successfully
    /// (`true`), or only once it has connected at least once before going
    /// offline (`false`, the default).
    pub fn allow_disconnected_send_at_any_time(mut self, allow: bool) -> Self {
        self.allow_disconnected_send_at_any_time = allow;
        self
    }

    /// Every URI this client may dial, in rotation order. Falls back to a
    /// single entry built from `host`/`port`/`tls` when no explicit list was
    /// given via [`ConnectOptions::server_uris`].
    pub(crate) fn resolved_uris(&self) -> Vec<String> {
        if self.server_uris.is_empty() {
            let scheme = if self.tls.is_some() { "ssl" } else { "tcp" };
            vec![format!("{scheme}://{}:{}", self.host, self.port)]
        } else {
            self.server_uris.clone()
        }
    }
}
