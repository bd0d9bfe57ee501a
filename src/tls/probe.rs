use std::net::Ipv6Addr;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
pub const PROBE_INITIAL_DELAY: Duration = Duration::from_secs(1);
pub const PROBE_PERIOD: Duration = Duration::from_secs(60);
const JITTER: f64 = 0.2;

/// How the probe decides to trust the server's certificate.
#[derive(Clone)]
pub enum ProbeTrust {
    /// Platform roots only.
    Platform,
    /// Platform roots plus the given PEM bundle.
    CaBundle(Vec<u8>),
    /// Accept any certificate, for self-signed identities.
    SkipVerification,
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(u16),
}

/// Periodically checks that the server's own health endpoint is reachable
/// through its public address. Failures are logged and never stop the loop.
pub struct ReachabilityProbe {
    url: String,
    client: reqwest::Client,
    initial_delay: Duration,
    period: Duration,
}

impl ReachabilityProbe {
    /// Probe `https://{public_ip}:{port}/api/v1/health`.
    pub fn new(public_ip: &str, port: u16, trust: ProbeTrust) -> Result<Self> {
        let host = if public_ip.parse::<Ipv6Addr>().is_ok() {
            format!("[{}]", public_ip)
        } else {
            public_ip.to_string()
        };
        Self::for_url(&format!("https://{}:{}/api/v1/health", host, port), trust)
    }

    pub fn for_url(url: &str, trust: ProbeTrust) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(PROBE_TIMEOUT);
        match trust {
            ProbeTrust::CaBundle(pem) => match reqwest::Certificate::from_pem_bundle(&pem) {
                Ok(certs) => {
                    for cert in certs {
                        builder = builder.add_root_certificate(cert);
                    }
                }
                // Platform roots still apply.
                Err(e) => log::error!("Failed to load probe CA bundle: {}", e),
            },
            ProbeTrust::SkipVerification => {
                builder = builder.danger_accept_invalid_certs(true);
            }
            ProbeTrust::Platform => {}
        }
        let client = builder
            .build()
            .map_err(|e| Error::Config(format!("failed to build probe client: {}", e)))?;

        Ok(Self {
            url: url.to_string(),
            client,
            initial_delay: PROBE_INITIAL_DELAY,
            period: PROBE_PERIOD,
        })
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// One probe. Any 2xx counts as reachable.
    pub async fn check(&self) -> std::result::Result<(), ProbeError> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::Status(status.as_u16()));
        }
        Ok(())
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut wait = self.initial_delay;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            match self.check().await {
                Ok(()) => log::debug!("Reachability check passed for {}", self.url),
                Err(e) => log::error!(
                    "Reachability check failed for {}: {}. Make sure the port is open to inbound traffic",
                    self.url,
                    e
                ),
            }

            wait = jittered(self.period, &mut rand::rng());
        }
        log::debug!("Reachability probe stopped");
    }
}

/// `period` scaled by a uniform factor in [0.8, 1.2].
pub fn jittered(period: Duration, rng: &mut impl Rng) -> Duration {
    period.mul_f64(rng.random_range((1.0 - JITTER)..=(1.0 + JITTER)))
}
