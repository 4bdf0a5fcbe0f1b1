//! WebSocket endpoint configuration

use peerlink_transport::{TransportError, TransportResult, TransportSecurityConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Default cap on a single outbound or inbound message, in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Configuration for a WebSocket endpoint
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Skip peer certificate validation for wss sessions (INSECURE)
    pub disable_tls_verification: bool,

    /// Subprotocols offered during the handshake, in preference order
    pub protocols: Vec<String>,

    /// Custom trust anchors (PEM bundle) instead of the built-in roots
    pub ca_certificate_pem_file: Option<PathBuf>,

    /// Client certificate chain (PEM) for mutual TLS
    pub certificate_pem_file: Option<PathBuf>,

    /// Client private key (PEM) for mutual TLS
    pub key_pem_file: Option<PathBuf>,

    /// Passphrase for an encrypted private key
    pub key_pem_pass: Option<String>,

    /// TCP establishment deadline
    pub connection_timeout: Duration,

    /// Keepalive ping cadence, `None` to disable
    pub ping_interval: Option<Duration>,

    /// Unanswered pings tolerated before the connection is failed
    pub max_outstanding_pings: Option<usize>,

    /// `host:port` of an HTTP CONNECT proxy to tunnel through
    pub proxy_server: Option<String>,

    /// Maximum message size, outbound admission and inbound framing cap
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            disable_tls_verification: false,
            protocols: Vec::new(),
            ca_certificate_pem_file: None,
            certificate_pem_file: None,
            key_pem_file: None,
            key_pem_pass: None,
            connection_timeout: Duration::from_secs(10),
            ping_interval: Some(Duration::from_secs(30)),
            max_outstanding_pings: None,
            proxy_server: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl WebSocketConfig {
    /// Configuration for local development: self-signed peers accepted.
    pub fn insecure() -> Self {
        Self {
            disable_tls_verification: true,
            ..Self::default()
        }
    }

    /// Offer a subprotocol during the handshake.
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocols.push(protocol.into());
        self
    }

    /// Use a custom CA bundle instead of the built-in roots.
    pub fn with_ca_certificate(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_certificate_pem_file = Some(path.into());
        self
    }

    /// Present a client certificate during the TLS handshake.
    pub fn with_client_identity(
        mut self,
        certificate: impl Into<PathBuf>,
        key: impl Into<PathBuf>,
    ) -> Self {
        self.certificate_pem_file = Some(certificate.into());
        self.key_pem_file = Some(key.into());
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_ping_interval(mut self, interval: Option<Duration>) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_max_outstanding_pings(mut self, limit: Option<usize>) -> Self {
        self.max_outstanding_pings = limit;
        self
    }

    pub fn with_proxy_server(mut self, proxy: impl Into<String>) -> Self {
        self.proxy_server = Some(proxy.into());
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.key_pem_pass.is_some() {
            // rustls has no encrypted-PEM support; failing here beats
            // silently ignoring the passphrase.
            return Err(TransportError::ConfigurationError(
                "encrypted private keys are not supported".to_string(),
            ));
        }
        if self.certificate_pem_file.is_some() != self.key_pem_file.is_some() {
            return Err(TransportError::ConfigurationError(
                "client certificate and key must be configured together".to_string(),
            ));
        }
        if self.protocols.iter().any(|p| p.is_empty()) {
            return Err(TransportError::ConfigurationError(
                "empty subprotocol name".to_string(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(TransportError::ConfigurationError(
                "max_message_size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve the configured PEM material into transport security form.
    pub(crate) fn security_config(&self) -> TransportResult<TransportSecurityConfig> {
        let mut security = TransportSecurityConfig {
            verify_server_cert: !self.disable_tls_verification,
            ..Default::default()
        };

        if let Some(path) = &self.ca_certificate_pem_file {
            security.root_certs = load_certs(path)?
                .into_iter()
                .map(|cert| cert.as_ref().to_vec())
                .collect();
        }

        if let (Some(cert_path), Some(key_path)) =
            (&self.certificate_pem_file, &self.key_pem_file)
        {
            security.client_cert = Some(peerlink_transport::ClientCertificate {
                cert_chain: load_certs(cert_path)?
                    .into_iter()
                    .map(|cert| cert.as_ref().to_vec())
                    .collect(),
                private_key: load_private_key(key_path)?.secret_der().to_vec(),
            });
        }

        Ok(security)
    }

    /// Build the rustls connector for a wss session: root-store validation
    /// by default, the no-op verifier when verification is disabled.
    pub(crate) fn build_tls_connector(&self) -> TransportResult<tokio_rustls::TlsConnector> {
        ensure_crypto_provider();

        let security = self.security_config()?;

        let mut roots = rustls::RootCertStore::empty();
        if security.root_certs.is_empty() {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        } else {
            for cert_der in &security.root_certs {
                roots
                    .add(rustls::pki_types::CertificateDer::from(cert_der.clone()))
                    .map_err(|e| {
                        TransportError::ConfigurationError(format!("Invalid root cert: {}", e))
                    })?;
            }
        }

        let builder = if security.verify_server_cert {
            rustls::ClientConfig::builder().with_root_certificates(roots)
        } else {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(NoVerification::new())
        };

        let mut client_crypto = match &security.client_cert {
            Some(identity) => {
                let chain = identity
                    .cert_chain
                    .iter()
                    .map(|der| rustls::pki_types::CertificateDer::from(der.clone()))
                    .collect();
                let key = rustls::pki_types::PrivateKeyDer::try_from(identity.private_key.clone())
                    .map_err(|e| {
                        TransportError::TlsError(format!("Invalid client key: {}", e))
                    })?;
                builder
                    .with_client_auth_cert(chain, key)
                    .map_err(|e| TransportError::TlsError(format!("Invalid client cert: {}", e)))?
            }
            None => builder.with_no_client_auth(),
        };

        if !security.alpn_protocols.is_empty() {
            client_crypto.alpn_protocols = security
                .alpn_protocols
                .iter()
                .map(|p| p.as_bytes().to_vec())
                .collect();
        }

        Ok(tokio_rustls::TlsConnector::from(Arc::new(client_crypto)))
    }
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

fn load_certs(path: &Path) -> TransportResult<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| TransportError::TlsError(format!("Failed to open cert file: {}", e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Failed to parse certs: {}", e)))
}

fn load_private_key(path: &Path) -> TransportResult<rustls::pki_types::PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| TransportError::TlsError(format!("Failed to open key file: {}", e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::TlsError(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| TransportError::TlsError("No private key found".to_string()))
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
struct NoVerification;

impl NoVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = WebSocketConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
        assert!(!config.disable_tls_verification);
    }

    #[test]
    fn insecure_preset_disables_verification() {
        assert!(WebSocketConfig::insecure().disable_tls_verification);
    }

    #[test]
    fn encrypted_key_is_rejected() {
        let mut config = WebSocketConfig::default();
        config.key_pem_pass = Some("secret".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn client_identity_requires_both_halves() {
        let mut config = WebSocketConfig::default();
        config.certificate_pem_file = Some("client.crt".into());
        assert!(config.validate().is_err());

        config.key_pem_file = Some("client.key".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_subprotocol_is_rejected() {
        let config = WebSocketConfig::default().with_protocol("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn builders_accumulate() {
        let config = WebSocketConfig::default()
            .with_protocol("chat.v2")
            .with_protocol("chat.v1")
            .with_max_message_size(1024)
            .with_proxy_server("proxy:3128");
        assert_eq!(config.protocols, vec!["chat.v2", "chat.v1"]);
        assert_eq!(config.max_message_size, 1024);
        assert_eq!(config.proxy_server.as_deref(), Some("proxy:3128"));
    }
}
