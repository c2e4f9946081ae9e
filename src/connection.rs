//! PostgreSQL connection establishment with SSL/TLS support.
//!
//! The pool re-dials whenever it grows, so connection logic lives in a
//! reusable [`Connector`] that carries the resolved TLS configuration.

use crate::db::error::{DbError, Result as DbResult};
use crate::ssl::{self, CertError, SslCertConfig};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::DigitallySignedStruct;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio_postgres::Client;
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::warn;

/// Connection error types
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("PostgreSQL connection failed: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("certificate error: {0}")]
    Certificate(#[from] CertError),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Certificate verifier that accepts any certificate (for --ssl-insecure)
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

/// SSL connection mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslMode {
    None,
    Verified,
    Insecure,
}

impl SslMode {
    pub const fn label(&self) -> &'static str {
        match self {
            Self::None => "No TLS",
            Self::Verified => "SSL",
            Self::Insecure => "SSL (unverified)",
        }
    }
}

/// Spawn the connection handler task
fn spawn_connection<S, T>(connection: tokio_postgres::Connection<S, T>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!(error = %e, "PostgreSQL connection task ended with error");
        }
    });
}

/// Build TLS configuration with optional client certificate authentication.
fn build_tls_config(
    verify_server: bool,
    cert_config: &SslCertConfig,
) -> Result<rustls::ClientConfig, ConnectionError> {
    let mut root_store = rustls::RootCertStore::empty();

    if verify_server {
        // Use custom root cert if provided, otherwise use system roots
        if let Some(ref root_cert_path) = cert_config.root_cert_path {
            let certs = ssl::load_certs(root_cert_path)?;
            for cert in certs {
                root_store.add(cert).map_err(|e| {
                    ConnectionError::Tls(format!("failed to add root certificate: {e}"))
                })?;
            }
        } else {
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
    }

    let config_builder = if verify_server {
        rustls::ClientConfig::builder().with_root_certificates(root_store)
    } else {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
    };

    let tls_config = if cert_config.has_client_cert() {
        let cert_path = cert_config
            .cert_path
            .as_ref()
            .ok_or_else(|| ConnectionError::Tls("missing client certificate path".into()))?;
        let key_path = cert_config
            .key_path
            .as_ref()
            .ok_or_else(|| ConnectionError::Tls("missing client key path".into()))?;

        let certs = ssl::load_certs(cert_path)?;
        let key = ssl::load_private_key(key_path)?;

        config_builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| ConnectionError::Tls(format!("failed to configure client certificate: {e}")))?
    } else {
        config_builder.with_no_client_auth()
    };

    Ok(tls_config)
}

/// A reusable factory for database connections, pinned to one SSL mode.
#[derive(Clone)]
pub struct Connector {
    pg: tokio_postgres::Config,
    tls: Option<MakeRustlsConnect>,
    mode: SslMode,
}

impl Connector {
    pub fn plain(pg: tokio_postgres::Config) -> Self {
        Self {
            pg,
            tls: None,
            mode: SslMode::None,
        }
    }

    pub fn with_tls(
        pg: tokio_postgres::Config,
        mode: SslMode,
        cert_config: &SslCertConfig,
    ) -> Result<Self, ConnectionError> {
        match mode {
            SslMode::None => Ok(Self::plain(pg)),
            SslMode::Verified | SslMode::Insecure => {
                let tls_config = build_tls_config(mode == SslMode::Verified, cert_config)?;
                Ok(Self {
                    pg,
                    tls: Some(MakeRustlsConnect::new(tls_config)),
                    mode,
                })
            }
        }
    }

    /// Probes connection modes in order (plain, verified TLS,
    /// unverified TLS) and returns a connector pinned to the first one
    /// that works.
    pub async fn detect(
        pg: tokio_postgres::Config,
        cert_config: &SslCertConfig,
    ) -> Result<Self, ConnectionError> {
        let mut last_error = None;
        for mode in [SslMode::None, SslMode::Verified, SslMode::Insecure] {
            let connector = Self::with_tls(pg.clone(), mode, cert_config)?;
            match connector.connect().await {
                Ok(_probe) => return Ok(connector),
                Err(e) => last_error = Some(e),
            }
        }
        match last_error {
            Some(DbError::Postgres(e)) => Err(ConnectionError::Postgres(e)),
            _ => Err(ConnectionError::Tls("no connection mode succeeded".into())),
        }
    }

    pub fn ssl_mode(&self) -> SslMode {
        self.mode
    }

    /// Opens one connection and spawns its driver task.
    pub async fn connect(&self) -> DbResult<Client> {
        match &self.tls {
            None => {
                let (client, connection) = self.pg.connect(tokio_postgres::NoTls).await?;
                spawn_connection(connection);
                Ok(client)
            }
            Some(tls) => {
                let (client, connection) = self.pg.connect(tls.clone()).await?;
                spawn_connection(connection);
                Ok(client)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssl_mode_labels() {
        assert_eq!(SslMode::None.label(), "No TLS");
        assert_eq!(SslMode::Verified.label(), "SSL");
        assert_eq!(SslMode::Insecure.label(), "SSL (unverified)");
    }

    #[test]
    fn build_tls_config_without_client_cert() {
        let config = SslCertConfig::new();
        assert!(build_tls_config(true, &config).is_ok());
        assert!(build_tls_config(false, &config).is_ok());
    }

    #[test]
    fn build_tls_config_with_missing_cert_file() {
        let config = SslCertConfig {
            cert_path: Some("/nonexistent/cert.pem".into()),
            key_path: Some("/nonexistent/key.pem".into()),
            root_cert_path: None,
        };
        let result = build_tls_config(false, &config);
        assert!(matches!(result, Err(ConnectionError::Certificate(_))));
    }

    #[test]
    fn plain_connector_reports_mode() {
        let connector = Connector::plain(tokio_postgres::Config::new());
        assert_eq!(connector.ssl_mode(), SslMode::None);
    }

    #[test]
    fn with_tls_none_is_plain() {
        let connector = Connector::with_tls(
            tokio_postgres::Config::new(),
            SslMode::None,
            &SslCertConfig::new(),
        )
        .unwrap();
        assert_eq!(connector.ssl_mode(), SslMode::None);
    }
}
