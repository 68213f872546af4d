// src/lib.rs
// Public library surface for the binary, integration tests and embedding.

pub mod api;
pub mod auth;
pub mod config;
pub mod decision;
pub mod encode;
pub mod engine;
pub mod enrich;
pub mod error;
pub mod features;
pub mod history;
pub mod lookup_cache;
pub mod metrics;
pub mod otp;
pub mod pipeline;
pub mod policy;
pub mod rate_limit;
pub mod registry;
pub mod request;
pub mod score;

pub use crate::api::{build_router, AppState};
pub use crate::config::Settings;
pub use crate::error::{RiskError, RiskResult};
pub use crate::pipeline::RiskService;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber. `RUST_LOG` wins; JSON lines when
/// `RISK_LOG_JSON=1`. A second call is a no-op.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("cipherstorm_risk=info,warn"));

    let json = std::env::var("RISK_LOG_JSON").is_ok_and(|v| v == "1");
    let registry = tracing_subscriber::registry().with(filter);
    let _ = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
}

/// Build the full application from settings with default collaborators.
pub fn app(settings: Settings) -> anyhow::Result<axum::Router> {
    if settings.auth.jwt_secret == config::DEV_JWT_SECRET {
        tracing::warn!("using the development JWT secret; set RISK_JWT_SECRET");
    }
    let service = RiskService::builder(settings).build()?;
    Ok(build_router(AppState::new(service)))
}
