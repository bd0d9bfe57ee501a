pub mod handlers;

use std::net::SocketAddr;
use std::time::Duration;

use axum::{middleware as axum_middleware, routing, Router};
use axum_server::tls_rustls::RustlsConfig;
use tokio_util::sync::CancellationToken;

use crate::auth::middleware::{admin_only, auth_middleware};
use crate::error::{Error, Result};
use crate::tls::{ReachabilityProbe, ServerIdentity};
use crate::AppState;

/// How long in-flight requests get to finish after shutdown is requested.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub fn router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/v1/share-link/{name}", routing::get(handlers::share_link))
        .route("/v1/revoke/{name}", routing::post(handlers::revoke))
        .route("/v1/users", routing::get(handlers::list_users))
        // Runs after auth_middleware has attached the principal.
        .layer(axum_middleware::from_fn(admin_only));

    let authenticated_routes = Router::new()
        .route("/v1/connect-config", routing::get(handlers::connect_config))
        .merge(admin_routes)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        // Public
        .route("/api/v1/health", routing::get(handlers::health))
        .nest("/api", authenticated_routes)
        .with_state(state)
}

/// Serve the API over HTTPS on all interfaces until `shutdown` fires. The
/// probe, if any, starts once the listener is bound and stops with it.
pub async fn start_server(
    state: AppState,
    identity: ServerIdentity,
    probe: Option<ReachabilityProbe>,
    shutdown: CancellationToken,
) -> Result<()> {
    let tls = RustlsConfig::from_pem(identity.cert_pem, identity.key_pem)
        .await
        .map_err(|e| Error::Config(format!("invalid TLS identity: {}", e)))?;

    let addr = SocketAddr::from(([0, 0, 0, 0], state.server.port));
    let app = router(state);
    let handle = axum_server::Handle::new();

    let supervisor = {
        let handle = handle.clone();
        tokio::spawn(async move {
            let Some(bound) = handle.listening().await else {
                return;
            };
            log::info!("API server listening on https://{}", bound);

            let probe_task = probe.map(|p| {
                log::info!("Checking reachability of {}", p.url());
                p.spawn(shutdown.clone())
            });

            shutdown.cancelled().await;
            log::info!(
                "Shutting down, allowing {}s for in-flight requests",
                SHUTDOWN_GRACE.as_secs()
            );
            handle.graceful_shutdown(Some(SHUTDOWN_GRACE));

            if let Some(task) = probe_task {
                let _ = task.await;
            }
        })
    };

    let served = axum_server::bind_rustls(addr, tls)
        .handle(handle)
        .serve(app.into_make_service())
        .await;

    supervisor.abort();
    served?;
    log::info!("API server stopped");
    Ok(())
}
