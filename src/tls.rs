//! Transport security for the collector connection.
//!
//! The exporter does not load certificates itself. A host that wants
//! verified TLS hands over a ready `rustls::ClientConfig`; the only context
//! built here is the accept-any-certificate one behind
//! `FLUENT_FORWARD_TLS_INSECURE_SKIP_VERIFY`.

use std::fmt;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::config::{ConfigError, TlsSettings};

/// A TLS connector bound to the name the server certificate is checked against.
#[derive(Clone)]
pub struct TlsContext {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl TlsContext {
    /// Wrap a host-supplied client configuration.
    pub fn new(config: Arc<ClientConfig>, server_name: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            connector: TlsConnector::from(config),
            server_name: parse_server_name(server_name)?,
        })
    }

    /// Context that accepts any server certificate.
    pub fn insecure(server_name: &str) -> Result<Self, ConfigError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| ConfigError::Tls(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
            .with_no_client_auth();

        Self::new(Arc::new(config), server_name)
    }

    /// Build the context implied by the settings alone.
    ///
    /// Returns `Ok(None)` when TLS is disabled. Verified TLS cannot be set up
    /// from settings and yields [`ConfigError::MissingTlsContext`].
    pub fn from_settings(settings: &TlsSettings, endpoint_host: &str) -> Result<Option<Self>, ConfigError> {
        if !settings.enabled {
            return Ok(None);
        }

        if !settings.insecure_skip_verify {
            return Err(ConfigError::MissingTlsContext);
        }

        let server_name = settings.server_name.as_deref().unwrap_or(endpoint_host);
        Self::insecure(server_name).map(Some)
    }

    pub fn server_name(&self) -> &ServerName<'static> {
        &self.server_name
    }

    /// Run the client handshake over an established TCP stream.
    pub(crate) async fn connect(&self, stream: TcpStream) -> std::io::Result<TlsStream<TcpStream>> {
        self.connector.connect(self.server_name.clone(), stream).await
    }
}

fn parse_server_name(name: &str) -> Result<ServerName<'static>, ConfigError> {
    ServerName::try_from(name.to_string())
        .map_err(|e| ConfigError::Tls(format!("invalid server name '{}': {}", name, e)))
}

#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_disabled_settings_give_no_context() {
        let settings = TlsSettings::default();
        assert!(TlsContext::from_settings(&settings, "localhost").unwrap().is_none());
    }

    #[test]
    fn test_verified_tls_needs_host_context() {
        let settings = TlsSettings {
            enabled: true,
            ..TlsSettings::default()
        };
        assert!(matches!(
            TlsContext::from_settings(&settings, "localhost"),
            Err(ConfigError::MissingTlsContext)
        ));
    }

    #[test]
    fn test_insecure_context_uses_server_name_override() {
        let settings = TlsSettings {
            enabled: true,
            insecure_skip_verify: true,
            server_name: Some("fluentd.internal".to_string()),
        };
        let context = TlsContext::from_settings(&settings, "10.0.0.5").unwrap().unwrap();
        assert_eq!(
            context.server_name(),
            &ServerName::try_from("fluentd.internal").unwrap()
        );

        let settings = TlsSettings {
            server_name: None,
            ..settings
        };
        let context = TlsContext::from_settings(&settings, "10.0.0.5").unwrap().unwrap();
        assert!(matches!(context.server_name(), ServerName::IpAddress(_)));
    }

    #[test]
    fn test_invalid_server_name() {
        let err = TlsContext::insecure("not a host name").unwrap_err();
        assert!(matches!(err, ConfigError::Tls(_)));
    }

    #[tokio::test]
    async fn test_handshake_fails_against_plain_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = socket.write_all(b"this is not a TLS server\r\n").await;
        });

        let context = TlsContext::insecure("localhost").unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();
        assert!(context.connect(stream).await.is_err());
    }
}
