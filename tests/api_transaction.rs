// tests/api_transaction.rs
//
// Transaction flow over HTTP: step-up policy and its one-time code,
// admission under concurrency, scorer failures and history-sink failures.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{header, StatusCode};
use serde_json::json;
use uuid::Uuid;

use cipherstorm_risk::decision::ScoreResult;
use cipherstorm_risk::features::FeatureVector;
use cipherstorm_risk::history::{AnalysisRecord, HistorySink, Page, PersistenceError, RecentQuery};
use cipherstorm_risk::otp::CapturedDelivery;
use cipherstorm_risk::request::AnalysisKind;
use cipherstorm_risk::score::{Scorer, ScorerError, ScorerSet};

use common::*;

/// Always returns the same raw score for one kind.
struct FixedScorer(AnalysisKind, f64);

#[async_trait]
impl Scorer for FixedScorer {
    fn kind(&self) -> AnalysisKind {
        self.0
    }
    fn name(&self) -> &str {
        "fixed-test"
    }
    async fn score(&self, _features: &FeatureVector) -> Result<ScoreResult, ScorerError> {
        Ok(ScoreResult::new(self.0, "fixed-test", self.1))
    }
}

struct BrokenScorer;

#[async_trait]
impl Scorer for BrokenScorer {
    fn kind(&self) -> AnalysisKind {
        AnalysisKind::Text
    }
    fn name(&self) -> &str {
        "broken-test"
    }
    async fn score(&self, _features: &FeatureVector) -> Result<ScoreResult, ScorerError> {
        Err(ScorerError::Unavailable("model host refused connection".into()))
    }
}

/// Refuses every write; reads see an empty store.
struct FailingHistory;

#[async_trait]
impl HistorySink for FailingHistory {
    async fn append(&self, _record: AnalysisRecord) -> Result<(), PersistenceError> {
        Err(PersistenceError::Unavailable("disk full".into()))
    }
    async fn recent(&self, _query: RecentQuery) -> Result<Vec<AnalysisRecord>, PersistenceError> {
        Ok(Vec::new())
    }
    async fn list(
        &self,
        _requester_id: &str,
        _kind: AnalysisKind,
        _page: Page,
    ) -> Result<(Vec<AnalysisRecord>, usize), PersistenceError> {
        Ok((Vec::new(), 0))
    }
    async fn get(&self, _id: Uuid) -> Result<Option<AnalysisRecord>, PersistenceError> {
        Ok(None)
    }
}

fn payment() -> serde_json::Value {
    json!({
        "amount": 2500.0,
        "transaction_type": "P2M",
        "payment_method": "UPI",
        "recipient_upi_id": "merchant@okaxis"
    })
}

#[tokio::test]
async fn high_risk_transaction_requires_step_up() {
    let scorers = ScorerSet::builtin().with(Arc::new(FixedScorer(AnalysisKind::Transaction, 0.92)));
    let app = router(service(settings()).scorers(scorers));
    let t = token("payer-1");

    let (status, _, v) = send(&app, post_json("/transaction/process", Some(&t), &payment())).await;
    assert_eq!(status, StatusCode::OK, "body: {v}");
    assert_eq!(v["tier"], "high");
    assert_eq!(v["action"], "step_up");
    assert_eq!(v["step_up_required"], true);
    assert_eq!(v["risk_score"], 92);
}

#[tokio::test]
async fn step_up_code_verifies_once_for_its_requester() {
    let codes = Arc::new(CapturedDelivery::default());
    let scorers = ScorerSet::builtin().with(Arc::new(FixedScorer(AnalysisKind::Transaction, 0.92)));
    let app = router(
        service(settings())
            .scorers(scorers)
            .otp_delivery(codes.clone()),
    );
    let t = token("payer-otp");

    let (status, _, v) = send(&app, post_json("/transaction/process", Some(&t), &payment())).await;
    assert_eq!(status, StatusCode::OK, "body: {v}");
    let challenge = &v["otp_challenge"];
    assert_eq!(challenge["analysis_id"], v["analysis_id"]);
    assert_eq!(challenge["expires_in_secs"], 600);
    let id: Uuid = serde_json::from_value(v["analysis_id"].clone()).expect("uuid");
    let code = codes.code_for(id).expect("code delivered");

    // Another requester cannot redeem it, and the miss does not consume it.
    let body = json!({ "analysis_id": id, "otp": code });
    let (status, _, v) = send(&app, post_json("/transaction/verify_otp", Some(&token("someone-else")), &body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(v["code"], "otp_invalid");

    let (status, _, v) = send(&app, post_json("/transaction/verify_otp", Some(&t), &body)).await;
    assert_eq!(status, StatusCode::OK, "body: {v}");
    assert_eq!(v["verified"], true);

    let (status, _, v) = send(&app, post_json("/transaction/verify_otp", Some(&t), &body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(v["detail"], "invalid or expired OTP");
}

#[tokio::test]
async fn unknown_challenge_and_missing_token_are_rejected() {
    let app = default_router();
    let body = json!({ "analysis_id": Uuid::new_v4(), "otp": "123456" });
    let (status, _, v) = send(&app, post_json("/transaction/verify_otp", Some(&token("p")), &body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(v["code"], "otp_invalid");

    let (status, _, _) = send(&app, post_json("/transaction/verify_otp", None, &body)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn ordinary_payment_with_builtin_scorer_is_not_stepped_up() {
    let app = default_router();
    let t = token("payer-2");
    let (status, _, v) = send(&app, post_json("/transaction/process", Some(&t), &payment())).await;
    assert_eq!(status, StatusCode::OK, "body: {v}");
    assert_eq!(v["kind"], "transaction");
    assert!(v["fraud_probability"].is_number());
    assert!(v["rules_triggered"].is_array());
    assert_eq!(v["step_up_required"], v["action"] == "step_up");
    assert_eq!(v.get("otp_challenge").is_some(), v["action"] == "step_up");
}

#[tokio::test]
async fn invalid_transactions_are_rejected() {
    let app = default_router();
    let t = token("payer-3");

    let mut bad_vpa = payment();
    bad_vpa["recipient_upi_id"] = json!("not a vpa");
    let (status, _, v) = send(&app, post_json("/transaction/process", Some(&t), &bad_vpa)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(v["code"], "invalid_input");

    let mut bad_method = payment();
    bad_method["payment_method"] = json!("CHEQUE");
    let (status, _, _) = send(&app, post_json("/transaction/process", Some(&t), &bad_method)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let mut negative = payment();
    negative["amount"] = json!(-10.0);
    let (status, _, v) = send(&app, post_json("/transaction/process", Some(&t), &negative)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(v["code"], "malformed_input");
}

#[tokio::test]
async fn concurrent_requests_over_the_limit_get_exactly_one_429() {
    let mut s = settings();
    s.rate_limits.transaction = 1;
    let app = router(service(s));
    let t = token("payer-4");

    let (a, b) = tokio::join!(
        send(&app, post_json("/transaction/process", Some(&t), &payment())),
        send(&app, post_json("/transaction/process", Some(&t), &payment())),
    );
    let mut statuses = [a.0, b.0];
    statuses.sort();
    assert_eq!(statuses, [StatusCode::OK, StatusCode::TOO_MANY_REQUESTS]);

    let limited = if a.0 == StatusCode::TOO_MANY_REQUESTS { a } else { b };
    assert_eq!(limited.2["code"], "rate_limited");
    let retry: u64 = limited
        .1
        .get(header::RETRY_AFTER)
        .expect("Retry-After header")
        .to_str()
        .expect("ascii")
        .parse()
        .expect("whole seconds");
    assert!((1..=60).contains(&retry));
}

#[tokio::test]
async fn scorer_failure_is_500_and_nothing_is_recorded() {
    let scorers = ScorerSet::builtin().with(Arc::new(BrokenScorer));
    let app = router(service(settings()).scorers(scorers));
    let t = token("alice");

    let (status, _, v) = send(&app, post_json("/text/analyze", Some(&t), &json!({ "text": "hello there" }))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(v["code"], "scoring_unavailable");
    assert!(!v["detail"].as_str().unwrap_or_default().contains("refused"));

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let (status, _, v) = send(&app, get("/text/history", Some(&t))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["total"], 0);
}

#[tokio::test]
async fn history_write_failure_does_not_fail_the_response() {
    let app = router(service(settings()).history(Arc::new(FailingHistory)));
    let t = token("alice");
    let (status, _, v) = send(&app, post_json("/transaction/process", Some(&t), &payment())).await;
    assert_eq!(status, StatusCode::OK, "body: {v}");
    assert!(v["risk_score"].is_number());
}
