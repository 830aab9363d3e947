//! TLS 1.3 byte-stream transport
//!
//! Each channel is its own TCP connection and TLS session negotiated with the
//! `tsq/1` application protocol. Sessions are resumed where the server allows
//! it, so only the first channel to a server pays for a full handshake.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::{DigitallySignedStruct, SignatureScheme};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector as RustlsConnector;
use tracing::{debug, warn};

use super::{stream_channel, transport_error, ChannelReceiver, ChannelResult, ChannelSender, Connection, Connector};
use crate::core::{Error, ProbeError, Result, Target, ALPN_TSQ};

/// Client-side TLS settings
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Skip certificate verification entirely
    pub insecure: bool,
    /// PEM file of additional trust anchors
    pub ca_file: Option<PathBuf>,
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Builds the client configuration: TLS 1.3 only, ALPN `tsq/1`.
pub fn client_config(options: &TlsOptions) -> Result<rustls::ClientConfig> {
    let provider = crypto_provider();
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])?;

    let mut config = if options.insecure {
        warn!("certificate verification disabled; the measured offset can be forged by anyone on the path");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification(provider)))
            .with_no_client_auth()
    } else {
        let mut roots =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(path) = &options.ca_file {
            let (added, ignored) = roots.add_parsable_certificates(load_certs(path)?);
            debug!(path = %path.display(), added, ignored, "loaded CA file");
            if added == 0 {
                return Err(Error::tls(format!(
                    "no usable certificates in {}",
                    path.display()
                )));
            }
        }
        builder.with_root_certificates(roots).with_no_client_auth()
    };

    config.alpn_protocols = vec![ALPN_TSQ.to_vec()];
    Ok(config)
}

/// Builds the server configuration from PEM certificate chain and key files.
pub fn server_config(cert_path: &Path, key_path: &Path) -> Result<rustls::ServerConfig> {
    let certs = load_certs(cert_path)?;
    if certs.is_empty() {
        return Err(Error::tls(format!(
            "no certificates in {}",
            cert_path.display()
        )));
    }
    let key_pem = std::fs::read(key_path)?;
    let key = PrivateKeyDer::from_pem_slice(&key_pem)
        .map_err(|e| Error::tls(format!("invalid private key {}: {}", key_path.display(), e)))?;

    let mut config = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![ALPN_TSQ.to_vec()];
    Ok(config)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)?;
    CertificateDer::pem_slice_iter(&pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::tls(format!("invalid certificate file {}: {}", path.display(), e)))
}

/// Accepts any server certificate. Handshake signatures are still checked so
/// the session keys belong to whoever presented the certificate.
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerification {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Opens TLS connections to TSQ servers
#[derive(Clone)]
pub struct TlsConnector {
    connector: RustlsConnector,
}

impl TlsConnector {
    pub fn new(options: &TlsOptions) -> Result<Self> {
        let config = client_config(options)?;
        Ok(TlsConnector {
            connector: RustlsConnector::from(Arc::new(config)),
        })
    }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn open(&self, target: &Target) -> Result<Box<dyn Connection>> {
        let addr = tokio::net::lookup_host((target.host.as_str(), target.port))
            .await
            .map_err(|e| Error::network(format!("failed to resolve {}: {}", target, e)))?
            .next()
            .ok_or_else(|| Error::network(format!("no addresses for {}", target)))?;
        let server_name = ServerName::try_from(target.host.clone())
            .map_err(|e| Error::config(format!("invalid server name {:?}: {}", target.host, e)))?;

        debug!(%target, %addr, "resolved server");
        Ok(Box::new(TlsConnection {
            connector: self.connector.clone(),
            addr,
            server_name,
            target: target.clone(),
        }))
    }
}

struct TlsConnection {
    connector: RustlsConnector,
    addr: SocketAddr,
    server_name: ServerName<'static>,
    target: Target,
}

#[async_trait]
impl Connection for TlsConnection {
    async fn open_channel(
        &self,
    ) -> ChannelResult<(Box<dyn ChannelSender>, Box<dyn ChannelReceiver>)> {
        let tcp = TcpStream::connect(self.addr).await.map_err(transport_error)?;
        tcp.set_nodelay(true).map_err(transport_error)?;
        let stream = self
            .connector
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(transport_error)?;

        let (_, session) = stream.get_ref();
        if session.alpn_protocol() != Some(ALPN_TSQ) {
            return Err(ProbeError::Transport(format!(
                "{} did not negotiate {}",
                self.target,
                String::from_utf8_lossy(ALPN_TSQ)
            )));
        }

        let (sender, receiver) = stream_channel(stream);
        Ok((Box::new(sender), Box::new(receiver)))
    }

    fn peer(&self) -> String {
        format!("{} ({})", self.target, self.addr)
    }
}
