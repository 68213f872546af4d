// tests/metrics.rs
//
// Prometheus exposition after one scored request and one rate-limited one.
// Runs in its own process, so the global recorder belongs to this file.

mod common;

use axum::http::StatusCode;
use serde_json::json;

use common::*;

#[tokio::test]
async fn metrics_endpoint_contains_expected_series() {
    let mut s = settings();
    s.rate_limits.url = 1;
    let app = router(service(s));
    let t = token("metrics-user");

    let (status, _, _) = send(&app, post_json("/text/analyze", Some(&t), &json!({ "text": "Your parcel is waiting" }))).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = send(&app, post_json("/url/scan", Some(&t), &json!({ "url": "https://example.org" }))).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = send(&app, post_json("/url/scan", Some(&t), &json!({ "url": "https://example.org" }))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    let (status, _, body) = send(&app, get("/metrics", None)).await;
    assert_eq!(status, StatusCode::OK);
    let text = body.as_str().expect("exposition is plain text");

    for needle in [
        "risk_requests_total",
        "risk_decisions_total",
        "risk_rate_limited_total",
        "risk_pipeline_duration_ms",
        "lookup_cache_misses_total",
        "lookup_degraded_total",
        "lookup_cache_ttl_secs",
    ] {
        assert!(text.contains(needle), "missing series {needle} in:\n{text}");
    }
    assert!(text.contains(r#"kind="text""#));
    assert!(text.contains(r#"endpoint="url""#));
}
