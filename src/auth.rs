// src/auth.rs
//! Bearer-token authentication and scope checks.
//!
//! Tokens are HS256 JWTs carrying `sub` (the requester id), `exp` and a
//! space-separated `scope`. The middleware turns a valid token plus the client
//! address into a [`Principal`] request extension; handlers never see a
//! request without one.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, Extensions, HeaderMap},
    middleware::Next,
    response::Response,
    Extension,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{AuthSettings, Settings};
use crate::error::{RiskError, RiskResult};
use crate::request::{Requester, UNKNOWN_IP};

pub const SCOPE_ANALYZE: &str = "analyze";
pub const SCOPE_HISTORY: &str = "history";

const DEVICE_HEADER: &str = "x-device-id";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: u64,
    #[serde(default)]
    pub scope: String,
}

impl Claims {
    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.scope.split_whitespace()
    }
}

/// Authenticated caller, attached to every protected request.
#[derive(Debug, Clone)]
pub struct Principal {
    pub requester: Requester,
    scopes: Vec<String>,
}

impl Principal {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    pub fn require(&self, scope: &str) -> RiskResult<()> {
        if self.has_scope(scope) {
            Ok(())
        } else {
            Err(RiskError::Forbidden(format!("token lacks the '{scope}' scope")))
        }
    }
}

pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(settings: &AuthSettings) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = settings.leeway_secs;
        Self {
            key: DecodingKey::from_secret(settings.jwt_secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> RiskResult<Claims> {
        let data = decode::<Claims>(token, &self.key, &self.validation)?;
        if data.claims.sub.trim().is_empty() {
            return Err(RiskError::Unauthorized);
        }
        Ok(data.claims)
    }
}

pub(crate) fn bearer(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn forwarded_ip(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| header_str(headers, "x-real-ip"))
}

/// The connection's peer address, present when served with connect info.
pub fn peer_addr(extensions: &Extensions) -> Option<SocketAddr> {
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

/// Client address for rate limiting.
///
/// Forwarding headers are client-controlled unless a proxy rewrites them, so
/// they are read only with `trust_proxy`. Otherwise the socket peer, else
/// [`UNKNOWN_IP`].
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trust_proxy: bool) -> String {
    trust_proxy
        .then(|| forwarded_ip(headers))
        .flatten()
        .map(str::to_string)
        .or_else(|| peer.map(|p| p.ip().to_string()))
        .unwrap_or_else(|| UNKNOWN_IP.to_string())
}

/// Token verification plus the client-address policy.
pub struct Authenticator {
    verifier: TokenVerifier,
    trust_proxy: bool,
}

impl Authenticator {
    pub fn new(settings: &Settings) -> Self {
        Self {
            verifier: TokenVerifier::new(&settings.auth),
            trust_proxy: settings.server.trust_proxy_headers,
        }
    }

    pub fn verifier(&self) -> &TokenVerifier {
        &self.verifier
    }

    pub fn client_ip(&self, headers: &HeaderMap, extensions: &Extensions) -> String {
        client_ip(headers, peer_addr(extensions), self.trust_proxy)
    }
}

fn principal(claims: Claims, headers: &HeaderMap, ip: String) -> Principal {
    let mut requester = Requester::new(claims.sub.clone(), ip);
    if let Some(device) = header_str(headers, DEVICE_HEADER) {
        requester = requester.with_device(device);
    }
    Principal {
        requester,
        scopes: claims.scopes().map(str::to_string).collect(),
    }
}

/// Rejects with 401 unless the request carries a valid bearer token.
pub async fn authenticate(
    State(auth): State<Arc<Authenticator>>,
    mut req: Request,
    next: Next,
) -> Result<Response, RiskError> {
    let token = bearer(req.headers()).ok_or(RiskError::Unauthorized)?;
    let claims = auth.verifier.verify(token).inspect_err(|_| {
        debug!(path = %req.uri().path(), "bearer token rejected");
    })?;
    let ip = auth.client_ip(req.headers(), req.extensions());
    let principal = principal(claims, req.headers(), ip);
    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}

pub async fn require_analyze(
    Extension(principal): Extension<Principal>,
    req: Request,
    next: Next,
) -> Result<Response, RiskError> {
    principal.require(SCOPE_ANALYZE)?;
    Ok(next.run(req).await)
}

pub async fn require_history(
    Extension(principal): Extension<Principal>,
    req: Request,
    next: Next,
) -> Result<Response, RiskError> {
    principal.require(SCOPE_HISTORY)?;
    Ok(next.run(req).await)
}
