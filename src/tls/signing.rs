use std::time::Duration;

use rcgen::KeyPair;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;

use crate::error::{Error, Result};

/// Signing service used when remote signing is enabled.
pub const DEFAULT_SIGNING_ENDPOINT: &str = "https://bo.reflog.me/v1/certificate/sign";
pub const DEFAULT_SIGNING_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for the certificate signing service. The request is an
/// unauthenticated POST of a PEM CSR; a 200 response carries the signed
/// certificate followed by its chain.
pub struct RemoteSigner {
    endpoint: String,
    client: reqwest::Client,
}

impl RemoteSigner {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Signing(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Submit `csr_pem` and return the signed chain as PEM.
    pub async fn sign(&self, csr_pem: &str) -> Result<String> {
        log::debug!("Requesting signed certificate from {}", self.endpoint);

        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/x-pem-file")
            .body(csr_pem.to_string())
            .send()
            .await
            .map_err(|e| Error::Signing(format!("failed to send CSR: {}", e)))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(Error::Signing(format!(
                "failed to get signed certificate: {}",
                status
            )));
        }

        let chain = response
            .text()
            .await
            .map_err(|e| Error::Signing(format!("failed to read signed certificate: {}", e)))?;

        let certs = parse_chain(&chain)?;
        log::info!(
            "Received signed certificate chain ({} certificates)",
            certs.len()
        );
        Ok(chain)
    }
}

fn parse_chain(chain: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut chain.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Signing(format!("malformed certificate chain: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::Signing(
            "signing service returned no certificate".into(),
        ));
    }
    Ok(certs)
}

/// Fails unless the leaf of `chain_pem` certifies the public half of `key`.
pub fn ensure_key_matches(chain_pem: &str, key: &KeyPair) -> Result<()> {
    let certs = parse_chain(chain_pem)?;
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
    let signing_key = rustls::crypto::ring::default_provider()
        .key_provider
        .load_private_key(key_der)
        .map_err(|e| Error::Signing(format!("failed to load private key: {}", e)))?;

    CertifiedKey::new(certs, signing_key)
        .keys_match()
        .map_err(|e| Error::Signing(format!("signed certificate does not match our key: {}", e)))
}
