//! TLS material for the two legs of an intercepted connection.
//!
//! A [`ServerIdentity`] is what the proxy presents to the client, a
//! [`TrustPolicy`] is how the proxy verifies the real target. Both only
//! advertise `http/1.1` over ALPN since nothing else is relayed.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

const HTTP1_ALPN: &[u8] = b"http/1.1";

/// Errors while loading certificates, keys or trust anchors.
#[derive(Debug, Error)]
pub enum TlsMaterialError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates found in PEM input")]
    NoCertificates,

    #[error("no private key found in PEM input")]
    NoPrivateKey,

    #[error("malformed PEM input: {0}")]
    Pem(std::io::Error),

    #[error("rejected TLS material: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Certificate chain and key the proxy presents to intercepted clients.
#[derive(Clone)]
pub struct ServerIdentity {
    config: Arc<ServerConfig>,
}

impl ServerIdentity {
    /// Load a PEM certificate chain and PEM private key from disk.
    pub fn from_pem_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, TlsMaterialError> {
        let certs = read_file(cert_path.as_ref())?;
        let key = read_file(key_path.as_ref())?;
        Self::from_pem(&certs, &key)
    }

    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, TlsMaterialError> {
        let chain = parse_certs(cert_pem)?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem))
            .map_err(TlsMaterialError::Pem)?
            .ok_or(TlsMaterialError::NoPrivateKey)?;
        Self::from_der(chain, key)
    }

    pub fn from_der(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, TlsMaterialError> {
        if chain.is_empty() {
            return Err(TlsMaterialError::NoCertificates);
        }
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)?;
        Ok(Self::from_server_config(config))
    }

    /// Wrap a caller-built config. ALPN is forced to `http/1.1`.
    pub fn from_server_config(mut config: ServerConfig) -> Self {
        config.alpn_protocols = vec![HTTP1_ALPN.to_vec()];
        Self {
            config: Arc::new(config),
        }
    }

    pub(crate) fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(Arc::clone(&self.config))
    }
}

impl std::fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerIdentity").finish_non_exhaustive()
    }
}

/// How the proxy authenticates the real target.
#[derive(Clone)]
pub struct TrustPolicy {
    config: Arc<ClientConfig>,
}

impl TrustPolicy {
    /// Trust the Mozilla root program as bundled by `webpki-roots`.
    pub fn webpki_roots() -> Self {
        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self::from_roots(roots)
    }

    /// Trust only the CA certificates in a PEM file.
    pub fn from_ca_pem_file(path: impl AsRef<Path>) -> Result<Self, TlsMaterialError> {
        let pem = read_file(path.as_ref())?;
        Self::from_ca_pem(&pem)
    }

    pub fn from_ca_pem(pem: &[u8]) -> Result<Self, TlsMaterialError> {
        let mut roots = RootCertStore::empty();
        for cert in parse_certs(pem)? {
            roots.add(cert)?;
        }
        Ok(Self::from_roots(roots))
    }

    /// Wrap a caller-built config. ALPN is forced to `http/1.1`.
    pub fn from_client_config(mut config: ClientConfig) -> Self {
        config.alpn_protocols = vec![HTTP1_ALPN.to_vec()];
        Self {
            config: Arc::new(config),
        }
    }

    fn from_roots(roots: RootCertStore) -> Self {
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self::from_client_config(config)
    }

    pub(crate) fn connector(&self) -> TlsConnector {
        TlsConnector::from(Arc::clone(&self.config))
    }
}

impl std::fmt::Debug for TrustPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustPolicy").finish_non_exhaustive()
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, TlsMaterialError> {
    std::fs::read(path).map_err(|source| TlsMaterialError::Read {
        path: path.display().to_string(),
        source,
    })
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsMaterialError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(TlsMaterialError::Pem)?;
    if certs.is_empty() {
        return Err(TlsMaterialError::NoCertificates);
    }
    Ok(certs)
}
