//! Risk scoring service: binary entrypoint.
//! Loads settings, wires collaborators and serves the Axum router on Shuttle.

use std::net::SocketAddr;

use axum::Router;
use cipherstorm_risk::{app, init_tracing, Settings};
use shuttle_runtime::{CustomError, Error};
use tracing::info;

/// Serves the router with connect info so handlers can see the peer address.
struct RiskServer(Router);

#[shuttle_runtime::async_trait]
impl shuttle_runtime::Service for RiskServer {
    async fn bind(self, addr: SocketAddr) -> Result<(), Error> {
        let listener = shuttle_runtime::tokio::net::TcpListener::bind(addr)
            .await
            .map_err(CustomError::new)?;
        info!(%addr, "listening");
        axum::serve(
            listener,
            self.0.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .map_err(CustomError::new)?;
        Ok(())
    }
}

#[shuttle_runtime::main]
async fn main() -> Result<RiskServer, Error> {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();

    init_tracing();

    let settings = Settings::load()?;
    info!(
        enrichment = settings.enrichment.enabled,
        trust_proxy_headers = settings.server.trust_proxy_headers,
        registry = %settings.registry.path.display(),
        "settings loaded"
    );

    let router = app(settings)?;
    Ok(RiskServer(router))
}
