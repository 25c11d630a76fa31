//! Mutual-TLS context construction.
//!
//! Both sides of a benchlink connection authenticate with a local
//! certificate/key pair and trust exactly one peer certificate — there is no
//! public CA involvement. The server requires and verifies a client
//! certificate, the client requires and verifies the server certificate, so
//! a configured pair gives mutual authentication rather than one-directional
//! encryption.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::error::{Error, Result};

/// Certificate paths for one side of a mutually authenticated connection.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    /// This side's certificate (PEM).
    pub local_cert: PathBuf,
    /// This side's private key (PEM).
    pub local_key: PathBuf,
    /// The single peer certificate to trust (PEM).
    pub peer_cert: PathBuf,
}

impl TlsSettings {
    pub fn new(
        local_cert: impl Into<PathBuf>,
        local_key: impl Into<PathBuf>,
        peer_cert: impl Into<PathBuf>,
    ) -> Self {
        Self {
            local_cert: local_cert.into(),
            local_key: local_key.into(),
            peer_cert: peer_cert.into(),
        }
    }

    /// Assemble settings from optional paths.
    ///
    /// No local certificate means transport security is disabled entirely
    /// and `Ok(None)` is returned. A certificate without a key or without a
    /// peer certificate is a configuration error.
    pub fn from_options(
        local_cert: Option<PathBuf>,
        local_key: Option<PathBuf>,
        peer_cert: Option<PathBuf>,
    ) -> Result<Option<Self>> {
        let Some(local_cert) = local_cert else {
            return Ok(None);
        };
        let local_key = local_key.ok_or_else(|| Error::Config {
            message: "local_key is required when local_cert is provided".to_string(),
        })?;
        let peer_cert = peer_cert.ok_or_else(|| Error::Config {
            message: "peer_cert is required when local_cert is provided".to_string(),
        })?;
        Ok(Some(Self {
            local_cert,
            local_key,
            peer_cert,
        }))
    }
}

/// Build a server-side config that requires and verifies a client certificate.
pub fn server_config(settings: &TlsSettings) -> Result<ServerConfig> {
    let roots = peer_roots(&settings.peer_cert)?;
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| Error::Tls {
            message: format!("cannot build client verifier: {e}"),
            source: None,
        })?;
    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(
            load_certs(&settings.local_cert)?,
            load_key(&settings.local_key)?,
        )?;
    Ok(config)
}

/// Build a client-side config that presents the local certificate and
/// verifies the server against the trusted peer certificate.
pub fn client_config(settings: &TlsSettings) -> Result<ClientConfig> {
    let roots = peer_roots(&settings.peer_cert)?;
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(
            load_certs(&settings.local_cert)?,
            load_key(&settings.local_key)?,
        )?;
    Ok(config)
}

fn open_pem(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).map_err(|e| Error::Config {
        message: format!("cannot open {}: {e}", path.display()),
    })?;
    Ok(BufReader::new(file))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open_pem(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::Config {
            message: format!("cannot parse certificate {}: {e}", path.display()),
        })?;
    if certs.is_empty() {
        return Err(Error::Config {
            message: format!("no certificate found in {}", path.display()),
        });
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open_pem(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::Config {
            message: format!("cannot parse private key {}: {e}", path.display()),
        })?
        .ok_or_else(|| Error::Config {
            message: format!("no private key found in {}", path.display()),
        })
}

fn peer_roots(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert).map_err(|e| Error::Tls {
            message: format!("cannot trust peer certificate {}: {e}", path.display()),
            source: Some(e),
        })?;
    }
    Ok(roots)
}
