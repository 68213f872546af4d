// tests/api_client_ip.rs
//
// Client-address resolution and admission order:
// - per-IP windows isolate different peers
// - requests without any address are not pooled together
// - forwarding headers count only behind a trusted proxy
// - a rejected upload is answered without reading its body
// - introspection accepts the token as a bearer header

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::http::{header, Request, StatusCode};
use serde_json::json;

use common::*;

fn text(tok: &str) -> Request<Body> {
    post_json("/text/analyze", Some(tok), &json!({ "text": "Lunch at noon?" }))
}

fn per_ip_router(per_ip: u32, trust_proxy: bool) -> axum::Router {
    let mut s = settings();
    s.rate_limits.per_ip = per_ip;
    s.server.trust_proxy_headers = trust_proxy;
    router(service(s))
}

#[tokio::test]
async fn distinct_peers_have_distinct_windows() {
    let app = per_ip_router(1, false);

    let (status, _, _) = send(&app, from_peer(text(&token("alice")), "198.51.100.1:5000")).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = send(&app, from_peer(text(&token("bob")), "198.51.100.2:5000")).await;
    assert_eq!(status, StatusCode::OK);

    // Same address, different port and user: one shared window.
    let (status, _, v) = send(&app, from_peer(text(&token("carol")), "198.51.100.1:6000")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(v["code"], "rate_limited");
}

#[tokio::test]
async fn requests_without_an_address_are_not_pooled() {
    let app = per_ip_router(1, false);

    let (status, _, _) = send(&app, without_peer(text(&token("alice")))).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, v) = send(&app, without_peer(text(&token("bob")))).await;
    assert_eq!(status, StatusCode::OK, "{v}");

    let (status, _, _) = send(&app, without_peer(text(&token("alice")))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn spoofed_forwarding_headers_do_not_reset_the_window() {
    let app = per_ip_router(1, false);

    let first = with_header(text(&token("alice")), "x-forwarded-for", "10.9.9.1");
    assert_eq!(send(&app, first).await.0, StatusCode::OK);

    let second = with_header(text(&token("alice")), "x-forwarded-for", "10.9.9.2");
    let second = with_header(second, "x-real-ip", "10.9.9.3");
    assert_eq!(send(&app, second).await.0, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn trusted_proxy_separates_clients_sharing_one_peer() {
    let app = per_ip_router(1, true);

    let a = with_header(text(&token("alice")), "x-forwarded-for", "203.0.113.1, 10.0.0.1");
    assert_eq!(send(&app, a).await.0, StatusCode::OK);
    let b = with_header(text(&token("bob")), "x-forwarded-for", "203.0.113.2, 10.0.0.1");
    assert_eq!(send(&app, b).await.0, StatusCode::OK);
    let c = with_header(text(&token("carol")), "x-forwarded-for", "203.0.113.1");
    assert_eq!(send(&app, c).await.0, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn rejected_upload_is_answered_before_its_body_is_read() {
    let mut s = settings();
    s.rate_limits.vishing = 1;
    let app = router(service(s));
    let tok = token("caller");

    let first = post_multipart(
        "/services/vishing/analyze",
        Some(&tok),
        &[Part::Text("transcript", "Hello, this is your bank.")],
    );
    assert_eq!(send(&app, first).await.0, StatusCode::OK);

    let polled = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&polled);
    let stream = futures::stream::once(async move {
        flag.store(true, Ordering::SeqCst);
        Ok::<_, std::io::Error>(Bytes::from(vec![0u8; 2 * 1024 * 1024]))
    });
    let req = Request::builder()
        .method("POST")
        .uri("/services/vishing/analyze")
        .extension(peer(PEER))
        .header(header::AUTHORIZATION, format!("Bearer {tok}"))
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from_stream(stream))
        .unwrap();

    let (status, headers, v) = send(&app, req).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(v["code"], "rate_limited");
    assert!(headers.get(header::RETRY_AFTER).is_some());
    assert!(!polled.load(Ordering::SeqCst), "body was read before admission");
}

#[tokio::test]
async fn introspect_takes_the_bearer_header() {
    let app = default_router();

    let mut req = post_raw("/auth/introspect", Some(&token("dana")), "");
    req.headers_mut().remove(header::CONTENT_TYPE);
    let (status, _, v) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["active"], true);
    assert_eq!(v["sub"], "dana");

    // Header wins over a body token.
    let req = post_json("/auth/introspect", Some("garbage"), &json!({ "token": token("dana") }));
    let (_, _, v) = send(&app, req).await;
    assert_eq!(v["active"], false);

    // Neither header nor body.
    let mut req = post_raw("/auth/introspect", None, "");
    req.headers_mut().remove(header::CONTENT_TYPE);
    let (status, _, v) = send(&app, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(v["code"], "unauthorized");
}
