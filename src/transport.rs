//! Connection parameters and the byte stream underneath a STOMP session.
//!
//! A [`ConnectionDescriptor`] is resolved once from configuration and never
//! changes afterwards. When TLS is enabled a rustls `TlsConnector` is built
//! up front, so unreadable certificate files are reported at registration
//! instead of on the first connect attempt.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{self, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::{self, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::debug;

use crate::client::ConnectError;
use crate::config::Secret;

/// Errors raised while preparing the TLS client configuration.
#[derive(Error, Debug)]
pub enum TlsError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates found in {}", .0.display())]
    NoCertificates(PathBuf),

    #[error("no private key found in {}", .0.display())]
    NoPrivateKey(PathBuf),

    #[error("tls configuration error: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Credentials sent in the CONNECT frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub login: String,
    pub passcode: Secret,
}

/// TLS options for the broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    pub enabled: bool,
    /// When false the server certificate is accepted without validation.
    pub verify: bool,
    pub ca_file: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            verify: true,
            ca_file: None,
            client_cert: None,
            client_key: None,
        }
    }
}

/// Everything needed to reach and authenticate against the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub host: String,
    pub port: u16,
    pub vhost: Option<String>,
    pub credentials: Credentials,
    pub tls: TlsSettings,
}

impl ConnectionDescriptor {
    /// `host:port` suitable for `TcpStream::connect`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Connection url for logs, e.g. `stomp+ssl://broker:61614`.
    ///
    /// The passcode never appears here.
    pub fn url(&self) -> String {
        let scheme = if self.tls.enabled { "stomp+ssl" } else { "stomp" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    /// Value of the CONNECT `host` header: the vhost when set, else the host.
    pub fn virtual_host(&self) -> &str {
        self.vhost.as_deref().unwrap_or(&self.host)
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// Byte stream carrying a STOMP session: plain TCP or TLS over TCP.
pub(crate) trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

pub(crate) type BoxedStream = Box<dyn Io>;

/// Build the rustls connector for `settings`.
///
/// Trust anchors come from `ca_file` when given, otherwise from the bundled
/// webpki roots. With `verify == false` any server certificate is accepted.
pub fn build_tls_connector(settings: &TlsSettings) -> Result<TlsConnector, TlsError> {
    let provider = Arc::new(crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;

    let builder = if settings.verify {
        let mut roots = RootCertStore::empty();
        match &settings.ca_file {
            Some(path) => {
                for cert in load_certs(path)? {
                    roots.add(cert)?;
                }
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }
        builder.with_root_certificates(roots)
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
    };

    let config = match (&settings.client_cert, &settings.client_key) {
        (Some(cert), Some(key)) => {
            builder.with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)?
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

fn open_pem(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open_pem(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    debug!(count = certs.len(), path = %path.display(), "loaded certificates");
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open_pem(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

/// Open the transport for `descriptor`, performing the TLS handshake when a
/// connector is supplied.
pub(crate) async fn open(
    descriptor: &ConnectionDescriptor,
    tls: Option<&TlsConnector>,
) -> Result<BoxedStream, ConnectError> {
    let tcp = TcpStream::connect(descriptor.address())
        .await
        .map_err(ConnectError::from_io)?;
    let _ = tcp.set_nodelay(true);

    let Some(connector) = tls else {
        return Ok(Box::new(tcp));
    };

    let server_name = ServerName::try_from(descriptor.host.clone()).map_err(|e| {
        ConnectError::Failed(format!("invalid tls server name '{}': {}", descriptor.host, e))
    })?;
    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| ConnectError::Failed(format!("tls handshake failed: {}", e)))?;
    Ok(Box::new(stream))
}

/// Verifier used when certificate validation is switched off. Handshake
/// signatures are still checked so the session keys belong to the peer.
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
        crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
