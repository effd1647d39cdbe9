//! TLS material for HTTPS interception
//!
//! The server side of the MITM comes from an external certificate-generation
//! step invoked per hostname; the origin side uses a deliberately permissive
//! verifier, since the proxy impersonates clients rather than validating
//! origins.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use tokio::process::Command;
use tokio_rustls::TlsConnector;

use crate::config::TlsConfig;
use crate::error::CertError;

/// Provides a server TLS configuration for a hostname
///
/// Narrow capability so tests can mint certificates in-process instead of
/// shelling out.
#[async_trait]
pub trait CertificateProvisioner: Send + Sync {
    async fn provision(&self, host: &str) -> Result<Arc<ServerConfig>, CertError>;
}

/// Provisioner backed by an external generation script
///
/// The script is invoked as `script <host>` and is responsible for producing
/// (or reusing) the key/certificate pair at the configured paths; the on-disk
/// certificate directory is its cache.
pub struct ScriptProvisioner {
    script: PathBuf,
    cert_file: PathBuf,
    key_file: PathBuf,
}

impl ScriptProvisioner {
    pub fn new(config: &TlsConfig) -> Self {
        Self {
            script: config.cert_script.clone(),
            cert_file: config.cert_file.clone(),
            key_file: config.key_file.clone(),
        }
    }
}

#[async_trait]
impl CertificateProvisioner for ScriptProvisioner {
    async fn provision(&self, host: &str) -> Result<Arc<ServerConfig>, CertError> {
        let script = self.script.display().to_string();

        let status = Command::new(&self.script)
            .arg(host)
            .status()
            .await
            .map_err(|e| CertError::ScriptFailed {
                script: script.clone(),
                host: host.to_string(),
                reason: e.to_string(),
            })?;

        if !status.success() {
            return Err(CertError::ScriptFailed {
                script,
                host: host.to_string(),
                reason: format!("exit status {status}"),
            });
        }

        load_server_config(&self.cert_file, &self.key_file)
    }
}

/// Load a single-certificate server config from PEM files
pub fn load_server_config(
    cert_file: &PathBuf,
    key_file: &PathBuf,
) -> Result<Arc<ServerConfig>, CertError> {
    let open = |path: &PathBuf| {
        File::open(path).map_err(|e| CertError::KeyMaterial {
            path: path.display().to_string(),
            source: e,
        })
    };

    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(open(cert_file)?))
            .collect::<Result<_, _>>()
            .map_err(|e| CertError::KeyMaterial {
                path: cert_file.display().to_string(),
                source: e,
            })?;

    if certs.is_empty() {
        return Err(CertError::EmptyCertFile(cert_file.display().to_string()));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(open(key_file)?))
        .map_err(|e| CertError::KeyMaterial {
            path: key_file.display().to_string(),
            source: e,
        })?
        .ok_or_else(|| CertError::KeyMaterial {
            path: key_file.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "no private key in file"),
        })?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    // The tunnel speaks HTTP/1.1 only.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// TLS connector that accepts any origin certificate
pub fn permissive_connector() -> TlsConnector {
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}

/// Certificate verifier that accepts everything
#[derive(Debug)]
pub struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer,
        _intermediates: &[CertificateDer],
        _server_name: &ServerName,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
