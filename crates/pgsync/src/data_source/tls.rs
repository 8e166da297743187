//! TLS configuration for database connections.
//!
//! The `sslmode` of a connection URL picks plain TCP or a rustls connector.

use std::sync::Arc;

use rustls::ClientConfig;
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};

/// SSL modes, matching the `sslmode` connection parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// No SSL/TLS (plain TCP connection).
    Disable,
    /// Try TLS without verification, fall back to plain TCP.
    #[default]
    Prefer,
    /// Use SSL but don't verify server certificate.
    Require,
    /// Verify server certificate against CA.
    VerifyCa,
    /// Full certificate and hostname verification.
    VerifyFull,
}

impl SslMode {
    /// Parse an SSL mode from a string.
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "disable" => Ok(SslMode::Disable),
            "prefer" | "allow" | "" => Ok(SslMode::Prefer),
            "require" => Ok(SslMode::Require),
            "verify-ca" => Ok(SslMode::VerifyCa),
            "verify-full" => Ok(SslMode::VerifyFull),
            other => Err(SyncError::Config(format!(
                "Invalid sslmode '{}'. Valid values: disable, prefer, require, verify-ca, verify-full",
                other
            ))),
        }
    }

    /// Check if this mode may use TLS.
    pub fn uses_tls(&self) -> bool {
        !matches!(self, SslMode::Disable)
    }

    /// The closest mode the driver itself understands.
    pub fn driver_mode(&self) -> tokio_postgres::config::SslMode {
        match self {
            SslMode::Disable => tokio_postgres::config::SslMode::Disable,
            SslMode::Prefer => tokio_postgres::config::SslMode::Prefer,
            SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => {
                tokio_postgres::config::SslMode::Require
            }
        }
    }
}

/// Builder for rustls connectors.
pub struct TlsBuilder {
    ssl_mode: SslMode,
}

impl TlsBuilder {
    pub fn new(ssl_mode: SslMode) -> Self {
        Self { ssl_mode }
    }

    /// Build a connector. Returns None if TLS is disabled.
    pub fn build(&self) -> Result<Option<MakeRustlsConnect>> {
        if !self.ssl_mode.uses_tls() {
            return Ok(None);
        }

        let config = self.build_client_config()?;
        Ok(Some(MakeRustlsConnect::new(config)))
    }

    /// Build the underlying rustls ClientConfig.
    pub fn build_client_config(&self) -> Result<ClientConfig> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| SyncError::Config(format!("TLS setup failed: {}", e)))?;

        let config = match self.ssl_mode {
            SslMode::Disable => {
                return Err(SyncError::Config(
                    "Cannot build TLS config for sslmode=disable".into(),
                ));
            }
            SslMode::Prefer => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth(),
            SslMode::Require => {
                warn!(
                    "sslmode=require enables TLS but does NOT verify the server certificate; \
                     use sslmode=verify-full to verify it"
                );
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoVerifier))
                    .with_no_client_auth()
            }
            SslMode::VerifyCa | SslMode::VerifyFull => {
                // rustls always checks the hostname, so verify-ca behaves as verify-full
                debug!("sslmode={:?}: certificate and hostname verification", self.ssl_mode);
                let mut root_store = rustls::RootCertStore::empty();
                root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                builder
                    .with_root_certificates(root_store)
                    .with_no_client_auth()
            }
        };

        Ok(config)
    }
}

/// Certificate verifier that accepts any certificate.
///
/// Only used for `prefer` and `require`, which encrypt without
/// authenticating the server.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssl_mode_parsing() {
        assert_eq!(SslMode::parse("disable").unwrap(), SslMode::Disable);
        assert_eq!(SslMode::parse("prefer").unwrap(), SslMode::Prefer);
        assert_eq!(SslMode::parse("REQUIRE").unwrap(), SslMode::Require);
        assert_eq!(SslMode::parse("verify-ca").unwrap(), SslMode::VerifyCa);
        assert_eq!(SslMode::parse("verify-full").unwrap(), SslMode::VerifyFull);
        assert!(SslMode::parse("sometimes").is_err());
    }

    #[test]
    fn test_driver_mode() {
        use tokio_postgres::config::SslMode as Driver;
        assert_eq!(SslMode::Disable.driver_mode(), Driver::Disable);
        assert_eq!(SslMode::VerifyFull.driver_mode(), Driver::Require);
    }

    #[test]
    fn test_tls_builder() {
        assert!(TlsBuilder::new(SslMode::Disable).build().unwrap().is_none());
        assert!(TlsBuilder::new(SslMode::Require).build().unwrap().is_some());
        assert!(TlsBuilder::new(SslMode::VerifyFull).build().unwrap().is_some());
    }
}
