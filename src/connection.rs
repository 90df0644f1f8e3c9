//! Connection management for the Forward-protocol collector.
//!
//! [`ConnectionManager`] owns at most one transport stream (plain TCP or
//! TLS) and tracks whether it is merely connected or also authenticated by
//! the shared-key handshake. All operations take `&mut self`; callers
//! serialise access themselves.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::ForwardError;
use crate::metrics::DeliveryMetrics;
use crate::protocol::{
    decode_frame, encode_message, encode_ping, new_chunk_id, new_salt, shared_key_digest,
    AckResponse, Entry, Helo, Pong, SendMode,
};
use crate::tls::TlsContext;

/// Size of a single socket read
const READ_CHUNK_SIZE: usize = 4096;

/// Lifecycle of the collector connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
    /// Connected and past a verified shared-key handshake
    Authenticated,
}

/// Settings needed to open and use a connection.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Collector `host:port`
    pub address: String,

    /// Bound on TCP connect plus TLS setup, and separately on the handshake
    pub timeout: Duration,

    /// Enables the shared-key handshake
    pub shared_key: Option<String>,

    /// Hostname announced in `PING`
    pub self_hostname: String,

    /// Wait for `{"ack": chunk}` after every message
    pub require_ack: bool,
}

impl From<&Config> for ConnectionSettings {
    fn from(config: &Config) -> Self {
        Self {
            address: config.endpoint.clone(),
            timeout: config.connection_timeout,
            shared_key: config.shared_key.clone(),
            self_hostname: config.self_hostname.clone(),
            require_ack: config.require_ack,
        }
    }
}

/// Byte stream a connection can run over.
pub trait TransportStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TransportStream for T {}

/// The operations the sender and exporter need from a connection.
#[async_trait]
pub trait ForwardLink: Send {
    /// Put one batch on the wire, waiting for the ack when required.
    async fn transmit(
        &mut self,
        mode: SendMode,
        tag: &str,
        entries: &[Entry],
    ) -> Result<(), ForwardError>;

    /// Drop the current connection and try to open a new one.
    ///
    /// Only a failure to release the old connection is returned. Connect
    /// and handshake failures are logged and leave the link disconnected or
    /// unauthenticated.
    async fn reconnect(&mut self) -> Result<(), ForwardError>;

    /// Release the connection. Safe to call when already disconnected.
    async fn disconnect(&mut self) -> Result<(), ForwardError>;

    fn state(&self) -> ConnectionState;
}

/// Single connection to a Forward-protocol collector.
pub struct ConnectionManager {
    settings: ConnectionSettings,
    tls: Option<TlsContext>,
    metrics: Arc<DeliveryMetrics>,
    state: ConnectionState,
    stream: Option<Box<dyn TransportStream>>,
    read_buf: Vec<u8>,
}

impl ConnectionManager {
    pub fn new(
        settings: ConnectionSettings,
        tls: Option<TlsContext>,
        metrics: Arc<DeliveryMetrics>,
    ) -> Self {
        Self {
            settings,
            tls,
            metrics,
            state: ConnectionState::Disconnected,
            stream: None,
            read_buf: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn address(&self) -> &str {
        &self.settings.address
    }

    /// Open the transport. A no-op if a usable stream is already open.
    ///
    /// A stream left behind by an interrupted write is dropped and replaced.
    ///
    /// # Errors
    ///
    /// Returns `ForwardError::Connect`, `ForwardError::Tls` or
    /// `ForwardError::ConnectTimeout`; the state stays `Disconnected`.
    pub async fn connect(&mut self) -> Result<(), ForwardError> {
        if self.stream.is_some() {
            if self.state != ConnectionState::Disconnected {
                return Ok(());
            }
            debug!(endpoint = %self.settings.address, "Dropping stream left by an interrupted write");
            self.stream = None;
            self.read_buf.clear();
        }

        let address = self.settings.address.clone();
        let timeout = self.settings.timeout;
        let tls = self.tls.clone();

        let open = async {
            let tcp = TcpStream::connect(address.as_str())
                .await
                .map_err(|source| ForwardError::Connect {
                    address: address.clone(),
                    source,
                })?;
            tcp.set_nodelay(true)?;

            let stream: Box<dyn TransportStream> = match &tls {
                Some(context) => Box::new(context.connect(tcp).await.map_err(|source| {
                    ForwardError::Tls {
                        address: address.clone(),
                        source,
                    }
                })?),
                None => Box::new(tcp),
            };
            Ok::<_, ForwardError>(stream)
        };

        let stream = tokio::time::timeout(timeout, open)
            .await
            .map_err(|_| ForwardError::ConnectTimeout {
                address: address.clone(),
                timeout,
            })??;

        self.stream = Some(stream);
        self.read_buf.clear();
        self.state = ConnectionState::Connected;

        info!(
            endpoint = %address,
            tls = tls.is_some(),
            "Connected to Fluent Forward endpoint"
        );
        Ok(())
    }

    /// Run the shared-key handshake if a key is configured.
    ///
    /// On failure the state stays `Connected` and every transmit is refused
    /// until a later handshake succeeds.
    pub async fn handshake(&mut self) -> Result<(), ForwardError> {
        let Some(shared_key) = self.settings.shared_key.clone() else {
            return Ok(());
        };

        match self.state {
            ConnectionState::Disconnected => return Err(ForwardError::NotConnected),
            ConnectionState::Authenticated => return Ok(()),
            ConnectionState::Connected => {}
        }

        let timeout = self.settings.timeout;
        tokio::time::timeout(timeout, self.exchange_keys(&shared_key))
            .await
            .map_err(|_| ForwardError::Handshake(format!("timed out after {:?}", timeout)))??;

        self.state = ConnectionState::Authenticated;
        info!(endpoint = %self.settings.address, "Authenticated with shared key");
        Ok(())
    }

    async fn exchange_keys(&mut self, shared_key: &str) -> Result<(), ForwardError> {
        let Helo(kind, options) = self.read_frame::<Helo>().await?;
        if kind != "HELO" {
            return Err(ForwardError::Handshake(format!(
                "expected HELO, received {}",
                kind
            )));
        }

        let hostname = self.settings.self_hostname.clone();
        let salt = new_salt();
        let digest = shared_key_digest(&salt, &hostname, &options.nonce.0, shared_key);
        let ping = encode_ping(&hostname, &salt, &digest)?;
        self.write_all(&ping).await?;

        let Pong(kind, accepted, reason, server_hostname, server_digest) =
            self.read_frame::<Pong>().await?;
        if kind != "PONG" {
            return Err(ForwardError::Handshake(format!(
                "expected PONG, received {}",
                kind
            )));
        }
        if !accepted {
            return Err(ForwardError::AuthRejected(reason));
        }

        // The server proves it knows the key with the same salt and nonce.
        let expected = shared_key_digest(&salt, &server_hostname, &options.nonce.0, shared_key);
        if server_digest != expected {
            return Err(ForwardError::Handshake(format!(
                "shared key mismatch for server {}",
                server_hostname
            )));
        }

        debug!(server = %server_hostname, "Handshake completed");
        Ok(())
    }

    /// Release the transport. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `ForwardError::Disconnect` if shutting the stream down fails
    /// for a reason other than it already being closed.
    pub async fn disconnect(&mut self) -> Result<(), ForwardError> {
        self.state = ConnectionState::Disconnected;
        self.read_buf.clear();

        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };

        match stream.shutdown().await {
            Ok(()) => {
                debug!(endpoint = %self.settings.address, "Disconnected from Fluent Forward endpoint");
                Ok(())
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::NotConnected
                        | std::io::ErrorKind::BrokenPipe
                        | std::io::ErrorKind::ConnectionReset
                ) =>
            {
                debug!(endpoint = %self.settings.address, error = %e, "Connection was already closed");
                Ok(())
            }
            Err(e) => Err(ForwardError::Disconnect(e)),
        }
    }

    async fn reconnect_cycle(&mut self) -> Result<(), ForwardError> {
        self.disconnect().await?;
        self.metrics.record_reconnect();

        if let Err(e) = self.connect().await {
            self.metrics.record_connect_failure();
            warn!(
                endpoint = %self.settings.address,
                error = %e,
                "Failed to connect to Fluent Forward endpoint"
            );
            return Ok(());
        }

        if let Err(e) = self.handshake().await {
            self.metrics.record_handshake_failure();
            warn!(
                endpoint = %self.settings.address,
                error = %e,
                "Shared key handshake failed"
            );
        }

        Ok(())
    }

    async fn send_message(
        &mut self,
        mode: SendMode,
        tag: &str,
        entries: &[Entry],
    ) -> Result<(), ForwardError> {
        match self.state {
            ConnectionState::Disconnected => return Err(ForwardError::NotConnected),
            ConnectionState::Connected if self.settings.shared_key.is_some() => {
                return Err(ForwardError::NotAuthenticated)
            }
            _ => {}
        }

        let chunk = self.settings.require_ack.then(new_chunk_id);
        let message = encode_message(mode, tag, entries, chunk.as_deref())?;

        // Until the write and ack complete the stream may hold a partial
        // frame, so a failed or dropped send leaves the link Disconnected.
        let ready = self.state;
        self.state = ConnectionState::Disconnected;

        self.write_all(&message).await?;

        if let Some(chunk) = chunk {
            let AckResponse { ack } = self.read_frame::<AckResponse>().await?;
            if ack != chunk {
                return Err(ForwardError::AckMismatch {
                    expected: chunk,
                    received: ack,
                });
            }
        }

        self.state = ready;

        debug!(
            mode = %mode,
            tag = tag,
            entries = entries.len(),
            bytes = message.len(),
            "Message written"
        );
        Ok(())
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), ForwardError> {
        let stream = self.stream.as_mut().ok_or(ForwardError::NotConnected)?;
        stream.write_all(bytes).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn read_frame<T: DeserializeOwned>(&mut self) -> Result<T, ForwardError> {
        loop {
            if let Some((value, used)) = decode_frame::<T>(&self.read_buf)? {
                self.read_buf.drain(..used);
                return Ok(value);
            }

            let stream = self.stream.as_mut().ok_or(ForwardError::NotConnected)?;
            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(ForwardError::ConnectionClosed);
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }
}

#[async_trait]
impl ForwardLink for ConnectionManager {
    async fn transmit(
        &mut self,
        mode: SendMode,
        tag: &str,
        entries: &[Entry],
    ) -> Result<(), ForwardError> {
        self.send_message(mode, tag, entries).await
    }

    async fn reconnect(&mut self) -> Result<(), ForwardError> {
        self.reconnect_cycle().await
    }

    async fn disconnect(&mut self) -> Result<(), ForwardError> {
        ConnectionManager::disconnect(self).await
    }

    fn state(&self) -> ConnectionState {
        self.state
    }
}
