use std::time::Duration;

use bytes::BytesMut;
use fernmqtt_core::{codec::Encoder, protocol::ProtocolVersion};
use fernmqtt_packets::ControlPacket;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};

use crate::error::{ClientError, Result};
use crate::options::{ConnectOptions, ServerUri};
use crate::tls;

/// A connection to an MQTT broker with packet framing.
///
/// Boxed as a trait object so the reconnect loop can tear down a plain TCP
/// stream and bring up a TLS one (or vice versa) without changing types.
pub struct Connection {
    stream: Box<dyn AsyncReadWrite>,
    read_buffer: BytesMut,
    protocol_version: ProtocolVersion,
}

trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadWrite for T {}

impl Connection {
    /// Opens a TCP (optionally TLS-wrapped) connection to `target`, using
    /// `options` for everything that isn't per-URI (timeouts, TLS cert
    /// configuration).
    pub async fn connect(options: &ConnectOptions, target: &ServerUri) -> Result<Self> {
        if target.websocket {
            return Err(ClientError::UnsupportedTransport(format!(
                "{}:{} requires a WebSocket transport, which is not supported",
                target.host, target.port
            )));
        }

        let addr = format!("{}:{}", target.host, target.port);

        let tcp = timeout(
            Duration::from_secs(options.connect_timeout_secs),
            TcpStream::connect(&addr),
        )
        .await
        .map_err(|_| ClientError::Timeout)?
        .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;

        let stream: Box<dyn AsyncReadWrite> = if target.tls {
            let tls_options = options.tls.clone().unwrap_or_default();
            let (connector, server_name) = tls::build_tls_connector(&tls_options, &target.host)?;
            let tls_stream = timeout(
                Duration::from_secs(options.connect_timeout_secs),
                connector.connect(server_name, tcp),
            )
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(|e| ClientError::Tls(e.to_string()))?;
            Box::new(tls_stream)
        } else {
            Box::new(tcp)
        };

        Ok(Self {
            stream,
            read_buffer: BytesMut::with_capacity(4096),
            protocol_version: options.protocol_version,
        })
    }

    /// Set the protocol version for version-aware packet parsing.
    pub fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.protocol_version = version;
    }

    /// Write a control packet to the connection.
    pub async fn write_packet(&mut self, packet: ControlPacket) -> Result<()> {
        let mut buffer = BytesMut::new();
        packet.encode(&mut buffer);
        self.stream.write_all(&buffer).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read a control packet from the connection.
    /// Returns None if the connection was closed.
    /// Uses version-aware parsing based on the configured protocol version.
    pub async fn read_packet(&mut self) -> Result<Option<ControlPacket>> {
        loop {
            if !self.read_buffer.is_empty() {
                match ControlPacket::parse_with_version(
                    &mut self.read_buffer.clone(),
                    self.protocol_version,
                ) {
                    Ok(packet) => {
                        let consumed = self.calculate_packet_size(&packet);
                        let _ = self.read_buffer.split_to(consumed);
                        return Ok(Some(packet));
                    }
                    Err(fernmqtt_core::error::Error::PacketIncomplete) => {
                        // Need more data
                    }
                    Err(e) => return Err(ClientError::Packet(e)),
                }
            }

            let mut temp_buf = [0u8; 4096];
            let n = self.stream.read(&mut temp_buf).await?;
            if n == 0 {
                return Ok(None);
            }
            self.read_buffer.extend_from_slice(&temp_buf[..n]);
        }
    }

    /// Calculate the size of an encoded packet.
    fn calculate_packet_size(&self, packet: &ControlPacket) -> usize {
        let mut buffer = BytesMut::new();
        packet.encode(&mut buffer);
        buffer.len()
    }
}
