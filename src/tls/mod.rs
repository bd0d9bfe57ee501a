//! The server's TLS identity.
//!
//! [`CertificateProvider::certificate`] resolves the identity once at
//! startup, in this order:
//!
//! 1. explicit override files, read verbatim (a read failure is fatal);
//! 2. the cached `cert.pem` / `key.pem` pair in the data directory, reused
//!    as-is with no validity check;
//! 3. a freshly generated key and certificate, persisted to the cache before
//!    being returned.
//!
//! Freshly generated self-signed certificates are pre-expired on purpose:
//! they are only meant for clients that skip chain validation. With remote
//! signing enabled, only a CSR leaves the process and the returned chain is
//! paired with the local key, after checking that its leaf certifies that
//! key; any signing failure is fatal.

pub mod probe;
pub mod signing;

use std::path::{Path, PathBuf};

use rand::Rng;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose, SerialNumber,
};
use time::OffsetDateTime;

use crate::error::{Error, Result};
use crate::util;
pub use probe::{ProbeTrust, ReachabilityProbe};
pub use signing::RemoteSigner;

pub const CERT_FILE: &str = "cert.pem";
pub const KEY_FILE: &str = "key.pem";

/// PEM-encoded certificate chain and private key.
#[derive(Clone, PartialEq, Eq)]
pub struct ServerIdentity {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

impl std::fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("cert_pem", &String::from_utf8_lossy(&self.cert_pem))
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

/// Where a resolved identity came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    Override,
    Cached,
    Generated,
}

pub enum SigningMode {
    SelfSigned,
    Remote(RemoteSigner),
}

pub struct CertificateProvider {
    data_dir: PathBuf,
    identity: String,
    overrides: Option<(PathBuf, PathBuf)>,
    signing: SigningMode,
}

impl CertificateProvider {
    /// `identity` is the server's public IP address or hostname.
    pub fn new(data_dir: &Path, identity: &str) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            identity: identity.to_string(),
            overrides: None,
            signing: SigningMode::SelfSigned,
        }
    }

    pub fn with_overrides(mut self, cert: PathBuf, key: PathBuf) -> Self {
        self.overrides = Some((cert, key));
        self
    }

    pub fn with_signing(mut self, signing: SigningMode) -> Self {
        self.signing = signing;
        self
    }

    pub fn cert_path(&self) -> PathBuf {
        self.data_dir.join(CERT_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.data_dir.join(KEY_FILE)
    }

    pub async fn certificate(&self) -> Result<ServerIdentity> {
        self.resolve().await.map(|(identity, _)| identity)
    }

    pub async fn resolve(&self) -> Result<(ServerIdentity, IdentitySource)> {
        if let Some((cert, key)) = &self.overrides {
            let read = |path: &Path| {
                std::fs::read(path).map_err(|e| {
                    Error::Config(format!("cannot read {}: {}", path.display(), e))
                })
            };
            log::info!("Using TLS identity from {}", cert.display());
            let identity = ServerIdentity {
                cert_pem: read(cert)?,
                key_pem: read(key)?,
            };
            return Ok((identity, IdentitySource::Override));
        }

        let cert = util::read_optional(&self.cert_path())?;
        let key = util::read_optional(&self.key_path())?;
        match (cert, key) {
            (Some(cert_pem), Some(key_pem)) => {
                log::debug!("Using existing certificate");
                return Ok((ServerIdentity { cert_pem, key_pem }, IdentitySource::Cached));
            }
            (Some(_), None) | (None, Some(_)) => {
                log::warn!("Incomplete certificate cache, generating a new identity");
            }
            (None, None) => {}
        }

        let identity = self.generate().await?;
        util::atomic_write(&self.cert_path(), &identity.cert_pem)?;
        util::atomic_write_private(&self.key_path(), &identity.key_pem)?;
        log::info!("Persisted new TLS identity for {}", self.identity);

        Ok((identity, IdentitySource::Generated))
    }

    async fn generate(&self) -> Result<ServerIdentity> {
        let key_pair = KeyPair::generate().map_err(cert_error)?;
        let params = certificate_params(&self.identity)?;

        let cert_pem = match &self.signing {
            SigningMode::SelfSigned => {
                log::debug!("Generating self-signed certificate");
                params.self_signed(&key_pair).map_err(cert_error)?.pem()
            }
            SigningMode::Remote(signer) => {
                let csr = params.serialize_request(&key_pair).map_err(cert_error)?;
                let csr_pem = csr.pem().map_err(cert_error)?;
                let chain = signer.sign(&csr_pem).await?;
                signing::ensure_key_matches(&chain, &key_pair)?;
                chain
            }
        };

        Ok(ServerIdentity {
            cert_pem: cert_pem.into_bytes(),
            key_pem: key_pair.serialize_pem().into_bytes(),
        })
    }
}

/// Subject, issuer and SAN all name `identity`. Validity is a zero-length
/// window starting now.
fn certificate_params(identity: &str) -> Result<CertificateParams> {
    let mut params = CertificateParams::new(vec![identity.to_string()]).map_err(cert_error)?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, identity);
    params.distinguished_name = dn;

    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now;

    let serial: u64 = rand::rng().random_range(1..1_000_000_000);
    params.serial_number = Some(SerialNumber::from_slice(&serial.to_be_bytes()));

    Ok(params)
}

fn cert_error(e: rcgen::Error) -> Error {
    Error::Config(format!("certificate generation failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_certs(pem: &[u8]) -> usize {
        rustls_pemfile::certs(&mut &pem[..])
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap()
            .len()
    }

    #[tokio::test]
    async fn fresh_identity_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let provider = CertificateProvider::new(dir.path(), "203.0.113.10");

        let (identity, source) = provider.resolve().await.unwrap();

        assert_eq!(source, IdentitySource::Generated);
        assert_eq!(count_certs(&identity.cert_pem), 1);
        assert!(String::from_utf8_lossy(&identity.key_pem).contains("PRIVATE KEY"));
        assert_eq!(std::fs::read(provider.cert_path()).unwrap(), identity.cert_pem);
        assert_eq!(std::fs::read(provider.key_path()).unwrap(), identity.key_pem);
    }

    #[tokio::test]
    async fn cached_identity_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let provider = CertificateProvider::new(dir.path(), "relay.example.net");

        let first = provider.certificate().await.unwrap();
        let (second, source) = provider.resolve().await.unwrap();
        let third = provider.certificate().await.unwrap();

        assert_eq!(source, IdentitySource::Cached);
        assert_eq!(first, second);
        assert_eq!(second, third);
    }

    #[tokio::test]
    async fn half_a_cache_is_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let provider = CertificateProvider::new(dir.path(), "203.0.113.10");
        std::fs::write(provider.cert_path(), b"stale").unwrap();

        let (identity, source) = provider.resolve().await.unwrap();

        assert_eq!(source, IdentitySource::Generated);
        assert_ne!(identity.cert_pem, b"stale".to_vec());
        assert!(provider.key_path().exists());
    }

    #[tokio::test]
    async fn overrides_are_used_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("custom.crt");
        let key = dir.path().join("custom.key");
        std::fs::write(&cert, b"CERT BYTES").unwrap();
        std::fs::write(&key, b"KEY BYTES").unwrap();

        let provider = CertificateProvider::new(dir.path(), "203.0.113.10")
            .with_overrides(cert, key);
        let (identity, source) = provider.resolve().await.unwrap();

        assert_eq!(source, IdentitySource::Override);
        assert_eq!(identity.cert_pem, b"CERT BYTES".to_vec());
        assert_eq!(identity.key_pem, b"KEY BYTES".to_vec());
        assert!(!provider.cert_path().exists());
    }

    #[tokio::test]
    async fn unreadable_override_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let provider = CertificateProvider::new(dir.path(), "203.0.113.10")
            .with_overrides(dir.path().join("missing.crt"), dir.path().join("missing.key"));

        assert!(matches!(provider.resolve().await, Err(Error::Config(_))));
    }

    #[test]
    fn params_name_the_identity() {
        let params = certificate_params("203.0.113.10").unwrap();
        assert_eq!(params.not_before, params.not_after);
        assert!(matches!(
            params.subject_alt_names.as_slice(),
            [rcgen::SanType::IpAddress(_)]
        ));

        let params = certificate_params("relay.example.net").unwrap();
        assert!(matches!(
            params.subject_alt_names.as_slice(),
            [rcgen::SanType::DnsName(_)]
        ));
    }

    mod remote {
        use super::*;
        use axum::http::StatusCode;
        use axum::routing::post;
        use axum::Router;
        use std::sync::{Arc, Mutex};
        use std::time::Duration;

        async fn mock_signer(status: StatusCode, captured: Arc<Mutex<Option<String>>>) -> String {
            let issued = {
                let key = KeyPair::generate().unwrap();
                CertificateParams::new(vec!["signed.example".to_string()])
                    .unwrap()
                    .self_signed(&key)
                    .unwrap()
                    .pem()
            };
            let router = Router::new().route(
                "/v1/certificate/sign",
                post(move |body: String| {
                    *captured.lock().unwrap() = Some(body);
                    let issued = issued.clone();
                    async move { (status, issued) }
                }),
            );
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, router).await.unwrap();
            });
            format!("http://{}/v1/certificate/sign", addr)
        }

        #[tokio::test]
        async fn chain_for_a_foreign_key_is_rejected() {
            // The mock answers with a certificate for an unrelated key.
            let captured = Arc::new(Mutex::new(None));
            let endpoint = mock_signer(StatusCode::OK, captured.clone()).await;
            let dir = tempfile::tempdir().unwrap();
            let signer = RemoteSigner::new(&endpoint, Duration::from_secs(5)).unwrap();
            let provider = CertificateProvider::new(dir.path(), "203.0.113.10")
                .with_signing(SigningMode::Remote(signer));

            assert!(matches!(provider.resolve().await, Err(Error::Signing(_))));

            let body = captured.lock().unwrap().clone().unwrap();
            assert!(body.contains("BEGIN CERTIFICATE REQUEST"));
            assert!(!body.contains("PRIVATE KEY"));
            assert!(!provider.cert_path().exists());
            assert!(!provider.key_path().exists());
        }

        #[tokio::test]
        async fn signing_failure_is_fatal_and_persists_nothing() {
            let captured = Arc::new(Mutex::new(None));
            let endpoint = mock_signer(StatusCode::INTERNAL_SERVER_ERROR, captured).await;
            let dir = tempfile::tempdir().unwrap();
            let signer = RemoteSigner::new(&endpoint, Duration::from_secs(5)).unwrap();
            let provider = CertificateProvider::new(dir.path(), "203.0.113.10")
                .with_signing(SigningMode::Remote(signer));

            assert!(matches!(provider.resolve().await, Err(Error::Signing(_))));
            assert!(!provider.cert_path().exists());
            assert!(!provider.key_path().exists());
        }
    }

    #[test]
    fn debug_redacts_the_key() {
        let identity = ServerIdentity {
            cert_pem: b"cert".to_vec(),
            key_pem: b"very secret".to_vec(),
        };
        assert!(!format!("{:?}", identity).contains("very secret"));
    }
}
