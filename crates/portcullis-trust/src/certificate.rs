//! Certificate/key pair loading for TLS termination.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::error::TrustError;
use crate::expiry::refresh_within;

/// Metadata extracted from the leaf certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafInfo {
    /// Subject distinguished name.
    pub subject: String,
    /// Issuer distinguished name.
    pub issuer: String,
    /// Serial number, colon-separated hex.
    pub serial: String,
    /// Start of the validity period.
    pub not_before: DateTime<Utc>,
    /// End of the validity period.
    pub not_after: DateTime<Utc>,
}

/// A certificate chain and matching private key, parsed and ready to serve.
pub struct TrustedCertificate {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    certified: Arc<CertifiedKey>,
    leaf: LeafInfo,
}

impl fmt::Debug for TrustedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustedCertificate")
            .field("chain_len", &self.chain.len())
            .field("leaf", &self.leaf)
            .finish_non_exhaustive()
    }
}

/// Crypto provider used for key loading and TLS configs built here.
pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Load a PEM certificate chain and private key from disk.
///
/// The first certificate in `cert_path` is the leaf. Fails with
/// [`TrustError::Io`] when either file cannot be read,
/// [`TrustError::CertificateParse`] when the leaf is not valid DER and
/// [`TrustError::KeyPairMismatch`] when the key does not belong to the leaf.
pub fn load_certificate(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<TrustedCertificate, TrustError> {
    let cert_path = cert_path.as_ref();
    let key_path = key_path.as_ref();

    let cert_pem = std::fs::read(cert_path).map_err(|source| TrustError::Io {
        path: cert_path.to_path_buf(),
        source,
    })?;
    let key_pem = std::fs::read(key_path).map_err(|source| TrustError::Io {
        path: key_path.to_path_buf(),
        source,
    })?;

    let certificate = TrustedCertificate::from_pem(&cert_pem, &key_pem)?;

    tracing::debug!(
        cert_path = %cert_path.display(),
        subject = %certificate.leaf.subject,
        not_after = %certificate.leaf.not_after,
        "Loaded certificate"
    );

    Ok(certificate)
}

impl TrustedCertificate {
    /// Build from in-memory PEM data.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, TrustError> {
        let chain = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TrustError::CertificateParse(format!("invalid PEM: {}", e)))?;

        let leaf_der = chain.first().ok_or(TrustError::NoCertificate)?;
        let leaf = parse_leaf(leaf_der)?;

        let key = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(|e| TrustError::InvalidPrivateKey(e.to_string()))?
            .ok_or(TrustError::NoPrivateKey)?;

        let signing_key = crypto_provider()
            .key_provider
            .load_private_key(key.clone_key())
            .map_err(|e| TrustError::InvalidPrivateKey(e.to_string()))?;

        let certified = CertifiedKey::new(chain.clone(), signing_key);
        certified
            .keys_match()
            .map_err(TrustError::KeyPairMismatch)?;

        Ok(Self {
            chain,
            key,
            certified: Arc::new(certified),
            leaf,
        })
    }

    /// Metadata of the leaf certificate.
    pub fn leaf(&self) -> &LeafInfo {
        &self.leaf
    }

    /// The DER certificate chain, leaf first.
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// The certificate and signing key in rustls form.
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified)
    }

    /// Duration covering `fraction` of the time left before the leaf expires.
    pub fn refresh_within(&self, fraction: f64) -> Duration {
        refresh_within(self.leaf.not_after, fraction)
    }

    /// Build a rustls server config presenting this certificate.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, TrustError> {
        let mut config = ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(TrustError::Tls)?
            .with_no_client_auth()
            .with_single_cert(self.chain.clone(), self.key.clone_key())
            .map_err(TrustError::Tls)?;

        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Arc::new(config))
    }

    /// TLS acceptor for terminating client connections.
    pub fn tls_acceptor(&self) -> Result<TlsAcceptor, TrustError> {
        Ok(TlsAcceptor::from(self.server_config()?))
    }
}

fn parse_leaf(der: &CertificateDer<'_>) -> Result<LeafInfo, TrustError> {
    let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref())
        .map_err(|e| TrustError::CertificateParse(e.to_string()))?;

    let validity = cert.validity();

    Ok(LeafInfo {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        serial: cert.raw_serial_as_string(),
        not_before: to_utc(validity.not_before.timestamp())?,
        not_after: to_utc(validity.not_after.timestamp())?,
    })
}

fn to_utc(timestamp: i64) -> Result<DateTime<Utc>, TrustError> {
    DateTime::from_timestamp(timestamp, 0).ok_or_else(|| {
        TrustError::CertificateParse(format!("validity timestamp out of range: {}", timestamp))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    struct Material {
        cert_pem: String,
        key_pem: String,
    }

    fn generate(name: &str) -> Material {
        let generated = rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
        Material {
            cert_pem: generated.cert.pem(),
            key_pem: generated.key_pair.serialize_pem(),
        }
    }

    fn write(dir: &TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_matching_pair() {
        let dir = TempDir::new().unwrap();
        let material = generate("localhost");
        let cert = write(&dir, "tls.crt", &material.cert_pem);
        let key = write(&dir, "tls.key", &material.key_pem);

        let loaded = load_certificate(&cert, &key).unwrap();

        assert_eq!(loaded.chain().len(), 1);
        assert!(loaded.leaf().not_after > Utc::now());
        assert!(loaded.leaf().not_before <= loaded.leaf().not_after);
        assert!(!loaded.leaf().serial.is_empty());
        assert!(loaded.refresh_within(0.5) > Duration::ZERO);
    }

    #[test]
    fn builds_server_config() {
        let material = generate("localhost");
        let loaded =
            TrustedCertificate::from_pem(material.cert_pem.as_bytes(), material.key_pem.as_bytes())
                .unwrap();

        let config = loaded.server_config().unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
        assert!(loaded.tls_acceptor().is_ok());
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let material = generate("localhost");
        let key = write(&dir, "tls.key", &material.key_pem);

        let err = load_certificate(dir.path().join("absent.crt"), &key).unwrap_err();
        match err {
            TrustError::Io { path, .. } => assert!(path.ends_with("absent.crt")),
            other => panic!("expected Io error, got {:?}", other),
        }
    }

    #[test]
    fn missing_key_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let material = generate("localhost");
        let cert = write(&dir, "tls.crt", &material.cert_pem);

        let err = load_certificate(&cert, dir.path().join("absent.key")).unwrap_err();
        assert!(matches!(err, TrustError::Io { .. }));
    }

    #[test]
    fn mismatched_key_is_rejected() {
        let first = generate("first.local");
        let second = generate("second.local");

        let err =
            TrustedCertificate::from_pem(first.cert_pem.as_bytes(), second.key_pem.as_bytes())
                .unwrap_err();
        assert!(matches!(err, TrustError::KeyPairMismatch(_)));
    }

    #[test]
    fn malformed_der_is_a_parse_error() {
        let material = generate("localhost");
        let garbage = "-----BEGIN CERTIFICATE-----\nAAECAwQFBgcICQ==\n-----END CERTIFICATE-----\n";

        let err = TrustedCertificate::from_pem(garbage.as_bytes(), material.key_pem.as_bytes())
            .unwrap_err();
        assert!(matches!(err, TrustError::CertificateParse(_)));
    }

    #[test]
    fn empty_inputs_are_reported() {
        let material = generate("localhost");

        let err = TrustedCertificate::from_pem(b"", material.key_pem.as_bytes()).unwrap_err();
        assert!(matches!(err, TrustError::NoCertificate));

        let err = TrustedCertificate::from_pem(material.cert_pem.as_bytes(), b"").unwrap_err();
        assert!(matches!(err, TrustError::NoPrivateKey));
    }

    #[test]
    fn debug_output_hides_key() {
        let material = generate("localhost");
        let loaded =
            TrustedCertificate::from_pem(material.cert_pem.as_bytes(), material.key_pem.as_bytes())
                .unwrap();
        let debug = format!("{:?}", loaded);
        assert!(debug.contains("chain_len"));
        assert!(!debug.contains("PRIVATE KEY"));
    }
}
