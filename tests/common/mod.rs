// tests/common/mod.rs
//
// Shared fixtures for the HTTP-level tests: settings, token minting,
// request builders and a tiny WAV writer. Everything runs in-process.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::{self, Body},
    extract::ConnectInfo,
    Router,
};
use http::{header, HeaderMap, Request, StatusCode};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::Value as Json;
use tower::ServiceExt as _; // for `oneshot`

use cipherstorm_risk::auth::Claims;
use cipherstorm_risk::enrich::OfflineEnrichment;
use cipherstorm_risk::pipeline::RiskServiceBuilder;
use cipherstorm_risk::registry::FileRegistry;
use cipherstorm_risk::{build_router, AppState, RiskService, Settings};

pub const SECRET: &str = "integration-secret";
pub const BODY_LIMIT: usize = 1024 * 1024; // 1MB, safe for tests
pub const BOUNDARY: &str = "risk-test-boundary";
/// Peer address attached to every request unless a test overrides it.
pub const PEER: &str = "198.51.100.20:40000";

pub const REGISTRY: &str = r#"
[[company]]
name = "HDFC Bank"
aliases = ["HDFC"]
numbers = ["1800 202 6161", "1860 267 6161"]

[[company]]
name = "Flipkart"
numbers = ["1800 208 9898"]
"#;

pub fn settings() -> Settings {
    let mut s = Settings::default();
    s.auth.jwt_secret = SECRET.to_string();
    s.auth.leeway_secs = 0;
    s.enrichment.enabled = false;
    s
}

/// Offline enrichment and a fixed registry; history and scorers default.
pub fn service(settings: Settings) -> RiskServiceBuilder {
    RiskService::builder(settings)
        .enrichment(Arc::new(OfflineEnrichment))
        .registry(Arc::new(
            FileRegistry::from_toml_str(REGISTRY, 0.88).expect("registry toml"),
        ))
}

pub fn router(builder: RiskServiceBuilder) -> Router {
    build_router(AppState::new(builder.build().expect("service builds")))
}

pub fn default_router() -> Router {
    router(service(settings()))
}

pub fn token_with(secret: &str, sub: &str, scope: &str, ttl_secs: i64) -> String {
    let exp = (chrono::Utc::now().timestamp() + ttl_secs) as u64;
    let claims = Claims {
        sub: sub.to_string(),
        exp,
        scope: scope.to_string(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("mint token")
}

/// Token with both scopes for `sub`.
pub fn token(sub: &str) -> String {
    token_with(SECRET, sub, "analyze history", 600)
}

pub fn peer(addr: &str) -> ConnectInfo<SocketAddr> {
    ConnectInfo(addr.parse().expect("socket address"))
}

/// Same request, seen as coming from `addr`.
pub fn from_peer(mut req: Request<Body>, addr: &str) -> Request<Body> {
    req.extensions_mut().insert(peer(addr));
    req
}

/// Same request with no connection info, as when served without it.
pub fn without_peer(mut req: Request<Body>) -> Request<Body> {
    req.extensions_mut().remove::<ConnectInfo<SocketAddr>>();
    req
}

pub fn with_header(mut req: Request<Body>, name: &'static str, value: &str) -> Request<Body> {
    req.headers_mut()
        .insert(name, value.parse().expect("header value"));
    req
}

fn builder(method: &str, uri: &str, token: Option<&str>) -> http::request::Builder {
    let mut b = Request::builder()
        .method(method)
        .uri(uri)
        .extension(peer(PEER));
    if let Some(t) = token {
        b = b.header(header::AUTHORIZATION, format!("Bearer {t}"));
    }
    b
}

pub fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    builder("GET", uri, token)
        .body(Body::empty())
        .expect("build GET")
}

pub fn post_json(uri: &str, token: Option<&str>, payload: &Json) -> Request<Body> {
    post_raw(uri, token, &payload.to_string())
}

pub fn post_raw(uri: &str, token: Option<&str>, raw: &str) -> Request<Body> {
    builder("POST", uri, token)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(raw.to_string()))
        .expect("build POST")
}

pub enum Part<'a> {
    Text(&'a str, &'a str),
    File(&'a str, &'a str, &'a [u8]),
}

pub fn post_multipart(uri: &str, token: Option<&str>, parts: &[Part<'_>]) -> Request<Body> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match part {
            Part::Text(name, value) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                );
                body.extend_from_slice(value.as_bytes());
            }
            Part::File(name, file_name, bytes) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: audio/wav\r\n\r\n"
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(bytes);
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    builder("POST", uri, token)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .expect("build multipart POST")
}

/// Status, headers and body. Non-JSON bodies come back as a JSON string.
pub async fn send(app: &Router, req: Request<Body>) -> (StatusCode, HeaderMap, Json) {
    let resp = app.clone().oneshot(req).await.expect("oneshot");
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT)
        .await
        .expect("read body");
    let json = serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Json::String(String::from_utf8_lossy(&bytes).into_owned()));
    (status, headers, json)
}

/// Mono 16-bit PCM WAV.
pub fn wav_bytes(sample_rate: u32, samples: &[i16]) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVEfmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&1u16.to_le_bytes()); // mono
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// One second of a 440 Hz tone.
pub fn tone(sample_rate: u32) -> Vec<i16> {
    (0..sample_rate)
        .map(|i| {
            let t = f64::from(i) / f64::from(sample_rate);
            ((t * 440.0 * std::f64::consts::TAU).sin() * 8000.0) as i16
        })
        .collect()
}

/// Poll until `uri` reports at least `total` records; history writes are async.
pub async fn wait_for_history(app: &Router, uri: &str, token: &str, total: u64) -> Json {
    let mut last = Json::Null;
    for _ in 0..100 {
        let (status, _, body) = send(app, get(uri, Some(token))).await;
        assert_eq!(status, StatusCode::OK, "history read failed: {body}");
        if body["total"].as_u64().unwrap_or(0) >= total {
            return body;
        }
        last = body;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("history never reached {total} records: {last}");
}
