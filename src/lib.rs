pub mod api;
pub mod auth;
pub mod config;
pub mod credentials;
pub mod error;
pub mod proxy;
pub mod tls;
pub mod util;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use auth::TokenAuthority;
use config::{ServerConfig, Settings};
use credentials::CredentialStore;
use error::Result;
use proxy::singbox::{ServiceMode, SingBoxController};
use proxy::ProxyController;
use tls::{
    CertificateProvider, IdentitySource, ProbeTrust, ReachabilityProbe, RemoteSigner, SigningMode,
};

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub tokens: Arc<TokenAuthority>,
    pub credentials: Arc<CredentialStore>,
    pub server: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(server: ServerConfig, credentials: CredentialStore) -> Result<Self> {
        Ok(Self {
            tokens: Arc::new(server.token_authority()?),
            credentials: Arc::new(credentials),
            server: Arc::new(server),
        })
    }
}

/// `init`: write fresh server and proxy configuration.
pub fn init(settings: &Settings) -> Result<ServerConfig> {
    let server = config::initialize(settings)?;
    log::info!("Server initialized, import with: {}", server.new_server_url());
    Ok(server)
}

/// `serve`: bring the proxy up, then run the HTTPS API until `shutdown`.
pub async fn serve(settings: Settings, shutdown: CancellationToken) -> Result<()> {
    let server = config::load_or_initialize(&settings)?;

    let controller: Arc<dyn ProxyController> = Arc::new(SingBoxController::new(
        &settings.sing_box_binary,
        ServiceMode::select(settings.no_systemd),
    ));
    let credentials = CredentialStore::open(&settings.data_dir, Arc::clone(&controller))?;
    controller.restart(credentials.document_path()).await?;

    let mut provider = CertificateProvider::new(&settings.data_dir, &server.external_ip);
    if let Some((cert, key)) = settings.tls_overrides()? {
        provider = provider.with_overrides(cert, key);
    }
    if settings.sign_cert {
        let signer = RemoteSigner::new(&settings.signing_endpoint, settings.signing_timeout)?;
        provider = provider.with_signing(SigningMode::Remote(signer));
    }
    let (identity, source) = provider.resolve().await?;

    let probe = ReachabilityProbe::new(
        &server.external_ip,
        server.port,
        probe_trust(&settings, source),
    )?;

    log::info!("Import this server with: {}", server.new_server_url());

    let state = AppState::new(server, credentials)?;
    api::start_server(state, identity, Some(probe), shutdown).await
}

fn probe_trust(settings: &Settings, source: IdentitySource) -> ProbeTrust {
    if let Some(path) = &settings.ca_cert {
        match std::fs::read(path) {
            Ok(pem) => return ProbeTrust::CaBundle(pem),
            Err(e) => log::error!("Cannot read CA bundle {}: {}", path.display(), e),
        }
    }
    let self_signed = !settings.sign_cert && source != IdentitySource::Override;
    if self_signed {
        ProbeTrust::SkipVerification
    } else {
        ProbeTrust::Platform
    }
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
