// src/api.rs
//! HTTP surface: routing, request extraction and response shaping.
//! Scoring itself lives in [`crate::pipeline`]; handlers only translate.

use std::sync::Arc;

use axum::{
    extract::{
        multipart::MultipartRejection,
        rejection::{JsonRejection, PathRejection, QueryRejection},
        DefaultBodyLimit, Multipart, Path, Query, Request, State,
    },
    http::HeaderMap,
    middleware::{self, Next},
    response::Response,
    routing::{get, post, MethodRouter},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use crate::auth::{
    authenticate, bearer, require_analyze, require_history, Authenticator, Principal,
};
use crate::decision::{Action, Evidence, EvidenceKind, Tier};
use crate::encode::customer_care::MatchKind;
use crate::error::{RiskError, RiskResult};
use crate::features::FeatureVector;
use crate::history::{AnalysisRecord, Page};
use crate::metrics::Metrics;
use crate::otp::OtpChallenge;
use crate::pipeline::RiskService;
use crate::request::{
    AnalysisKind, AnalysisRequest, AudioClip, CustomerCarePayload, Payload, TextPayload,
    TransactionPayload, UrlPayload, UserOpinion, VishingPayload,
};

/// Room for multipart boundaries and the text fields next to the audio part.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<RiskService>,
    pub auth: Arc<Authenticator>,
}

impl AppState {
    pub fn new(service: RiskService) -> Self {
        let auth = Arc::new(Authenticator::new(service.settings()));
        Self {
            service: Arc::new(service),
            auth,
        }
    }
}

/// Per-route admission state: which rate-limit class the route draws on.
#[derive(Clone)]
struct Admission {
    service: Arc<RiskService>,
    kind: AnalysisKind,
}

/// Rate-limit admission. Runs as a route layer so a rejected request is
/// answered before its body is read.
async fn admit(
    State(adm): State<Admission>,
    Extension(principal): Extension<Principal>,
    req: Request,
    next: Next,
) -> Result<Response, RiskError> {
    adm.service.admit(adm.kind, &principal.requester)?;
    Ok(next.run(req).await)
}

fn admitted(state: &AppState, kind: AnalysisKind, route: MethodRouter<AppState>) -> MethodRouter<AppState> {
    let adm = Admission {
        service: Arc::clone(&state.service),
        kind,
    };
    route.route_layer(middleware::from_fn_with_state(adm, admit))
}

/// The auth endpoint class is limited per client address, before any body.
async fn admit_auth(State(state): State<AppState>, req: Request, next: Next) -> Result<Response, RiskError> {
    let ip = state.auth.client_ip(req.headers(), req.extensions());
    state.service.admit_auth(&ip)?;
    Ok(next.run(req).await)
}

pub fn build_router(state: AppState) -> Router {
    let metrics = Metrics::init(state.service.enricher().cache_ttl());
    let audio_limit = state.service.settings().limits.max_audio_bytes + MULTIPART_OVERHEAD;

    let analysis = Router::new()
        .route("/text/analyze", admitted(&state, AnalysisKind::Text, post(analyze_text)))
        .route("/url/scan", admitted(&state, AnalysisKind::Url, post(scan_url)))
        .route(
            "/transaction/process",
            admitted(&state, AnalysisKind::Transaction, post(process_transaction)),
        )
        .route(
            "/transaction/verify_otp",
            post(verify_otp).route_layer(middleware::from_fn_with_state(state.clone(), admit_auth)),
        )
        .route(
            "/services/vishing/analyze",
            admitted(
                &state,
                AnalysisKind::Vishing,
                post(analyze_vishing).layer(DefaultBodyLimit::max(audio_limit)),
            ),
        )
        .route(
            "/customer-care/verify",
            admitted(&state, AnalysisKind::CustomerCare, post(verify_customer_care)),
        )
        .route_layer(middleware::from_fn(require_analyze));

    let history = Router::new()
        .route("/text/history", history_for(AnalysisKind::Text))
        .route("/url/history", history_for(AnalysisKind::Url))
        .route("/transaction/history", history_for(AnalysisKind::Transaction))
        .route("/services/vishing/history", history_for(AnalysisKind::Vishing))
        .route("/customer-care/history", history_for(AnalysisKind::CustomerCare))
        .route("/analyses/{id}", get(get_analysis))
        .route_layer(middleware::from_fn(require_history));

    let protected = analysis
        .merge(history)
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.auth),
            authenticate,
        ));

    let auth_class = Router::new()
        .route("/auth/introspect", post(introspect))
        .route_layer(middleware::from_fn_with_state(state.clone(), admit_auth));

    Router::new()
        .route("/health", get(|| async { "OK" }))
        .merge(auth_class)
        .merge(protected)
        .merge(metrics.router())
        .fallback(|| async { RiskError::NotFound("no such route".into()) })
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

// ---------- response shapes ----------

/// Fields every analysis response carries.
#[derive(Debug, Serialize)]
struct Verdict {
    analysis_id: Uuid,
    kind: AnalysisKind,
    risk_score: u8,
    tier: Tier,
    action: Action,
    confidence: f32,
    model: String,
    evidence: Vec<Evidence>,
    created_at: DateTime<Utc>,
}

impl From<&AnalysisRecord> for Verdict {
    fn from(r: &AnalysisRecord) -> Self {
        Self {
            analysis_id: r.id,
            kind: r.kind,
            risk_score: r.risk.numeric(),
            tier: r.risk.tier(),
            action: r.risk.recommended_action(),
            confidence: r.score.confidence,
            model: r.score.model.clone(),
            evidence: r.score.evidence.clone(),
            created_at: r.created_at,
        }
    }
}

fn signal_factors(r: &AnalysisRecord) -> Vec<String> {
    r.score
        .evidence
        .iter()
        .filter(|e| e.kind == EvidenceKind::Signal)
        .map(|e| e.factor.clone())
        .collect()
}

#[derive(Debug, Serialize)]
struct TextResponse {
    #[serde(flatten)]
    verdict: Verdict,
    phishing_probability: f64,
    is_phishing: bool,
    risk_factors: Vec<String>,
}

#[derive(Debug, Serialize)]
struct DomainInfoOut {
    host: Option<String>,
    domain_age_days: Option<f64>,
    registration_days_left: Option<f64>,
    traffic_rank: Option<f64>,
}

#[derive(Debug, Serialize)]
struct UrlResponse {
    #[serde(flatten)]
    verdict: Verdict,
    /// `None` when no reputation source could answer.
    blacklisted: Option<bool>,
    features: FeatureVector,
    domain_info: DomainInfoOut,
}

#[derive(Debug, Serialize)]
struct TransactionResponse {
    #[serde(flatten)]
    verdict: Verdict,
    fraud_probability: f64,
    step_up_required: bool,
    rules_triggered: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    otp_challenge: Option<OtpChallenge>,
}

#[derive(Debug, Serialize)]
struct VishingResponse {
    #[serde(flatten)]
    verdict: Verdict,
    has_audio: bool,
    has_transcript: bool,
    voice_evidence: Vec<Evidence>,
    text_evidence: Vec<Evidence>,
    user_opinion: Option<String>,
}

#[derive(Debug, Serialize)]
struct CustomerCareResponse {
    #[serde(flatten)]
    verdict: Verdict,
    verification_status: &'static str,
    company_name: Option<String>,
    normalized_number: Option<String>,
    number_type: Option<String>,
    match_confidence: Option<f64>,
}

fn verification_status(kind: Option<MatchKind>) -> &'static str {
    match kind {
        Some(MatchKind::Exact) => "verified",
        Some(MatchKind::Similar) => "similar_to_official",
        Some(MatchKind::Unlisted) => "not_official",
        Some(MatchKind::CompanyUnknown) => "company_unknown",
        None => "unverified",
    }
}

// ---------- analysis handlers ----------

async fn run(
    state: &AppState,
    principal: Principal,
    payload: Payload,
) -> RiskResult<AnalysisRecord> {
    // Admission already ran in the route layer.
    state
        .service
        .analyze_admitted(AnalysisRequest::new(principal.requester, payload))
        .await
}

async fn analyze_text(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    body: Result<Json<TextPayload>, JsonRejection>,
) -> RiskResult<Json<TextResponse>> {
    let Json(payload) = body?;
    let rec = run(&state, principal, Payload::Text(payload)).await?;
    Ok(Json(TextResponse {
        phishing_probability: rec.score.raw_score,
        is_phishing: rec.risk.tier() == Tier::High,
        risk_factors: signal_factors(&rec),
        verdict: Verdict::from(&rec),
    }))
}

async fn scan_url(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    body: Result<Json<UrlPayload>, JsonRejection>,
) -> RiskResult<Json<UrlResponse>> {
    let Json(payload) = body?;
    let rec = run(&state, principal, Payload::Url(payload)).await?;
    let f = &rec.features;
    let domain_info = DomainInfoOut {
        host: f.category("host").map(str::to_string),
        domain_age_days: f.continuous("domain_age_days"),
        registration_days_left: f.continuous("registration_days_left"),
        traffic_rank: f.continuous("traffic_rank"),
    };
    Ok(Json(UrlResponse {
        verdict: Verdict::from(&rec),
        blacklisted: f.ternary("blacklisted").as_bool(),
        features: rec.features.clone(),
        domain_info,
    }))
}

async fn process_transaction(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    body: Result<Json<TransactionPayload>, JsonRejection>,
) -> RiskResult<Json<TransactionResponse>> {
    let Json(payload) = body?;
    let requester_id = principal.requester.user_id.clone();
    let rec = run(&state, principal, Payload::Transaction(payload)).await?;
    let step_up_required = rec.risk.recommended_action() == Action::StepUp;
    let otp_challenge =
        step_up_required.then(|| state.service.start_step_up(&requester_id, rec.id));
    Ok(Json(TransactionResponse {
        fraud_probability: rec.score.raw_score,
        step_up_required,
        rules_triggered: signal_factors(&rec),
        otp_challenge,
        verdict: Verdict::from(&rec),
    }))
}

#[derive(Debug, Deserialize)]
struct VerifyOtpRequest {
    analysis_id: Uuid,
    otp: String,
}

#[derive(Debug, Serialize)]
struct VerifyOtpResponse {
    analysis_id: Uuid,
    verified: bool,
}

/// Redeems the code issued with a step-up transaction. Shares the per-IP
/// auth limit; each challenge also allows only a few wrong guesses.
async fn verify_otp(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    body: Result<Json<VerifyOtpRequest>, JsonRejection>,
) -> RiskResult<Json<VerifyOtpResponse>> {
    let Json(req) = body?;
    state
        .service
        .verify_step_up(&principal.requester.user_id, req.analysis_id, &req.otp)?;
    Ok(Json(VerifyOtpResponse {
        analysis_id: req.analysis_id,
        verified: true,
    }))
}

fn malformed_multipart(e: impl std::fmt::Display) -> RiskError {
    RiskError::MalformedInput(format!("invalid multipart body: {e}"))
}

async fn read_vishing_form(mut form: Multipart) -> RiskResult<VishingPayload> {
    let mut payload = VishingPayload::default();
    while let Some(field) = form.next_field().await.map_err(malformed_multipart)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "audio_file" => {
                let file_name = field.file_name().unwrap_or("audio").to_string();
                let content_type = field.content_type().map(str::to_string);
                let bytes = field.bytes().await.map_err(malformed_multipart)?;
                if !bytes.is_empty() {
                    payload.audio = Some(AudioClip {
                        file_name,
                        content_type,
                        bytes: bytes.to_vec(),
                    });
                }
            }
            "transcript" => {
                let text = field.text().await.map_err(malformed_multipart)?;
                payload.transcript = Some(text);
            }
            "user_opinion" => {
                let raw = field.text().await.map_err(malformed_multipart)?;
                if raw.trim().is_empty() {
                    continue;
                }
                payload.user_opinion = Some(UserOpinion::parse(&raw).ok_or_else(|| {
                    RiskError::InvalidInput(format!(
                        "user_opinion must be confirm_suspicious or insufficient_evidence, got '{}'",
                        raw.trim()
                    ))
                })?);
            }
            // Unknown parts are ignored.
            _ => {}
        }
    }
    Ok(payload)
}

async fn analyze_vishing(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    form: Result<Multipart, MultipartRejection>,
) -> RiskResult<Json<VishingResponse>> {
    let form = form.map_err(|e| RiskError::MalformedInput(e.body_text()))?;
    let payload = read_vishing_form(form).await?;
    let rec = run(&state, principal, Payload::Vishing(payload)).await?;

    let (voice_evidence, text_evidence): (Vec<Evidence>, Vec<Evidence>) = rec
        .score
        .evidence
        .iter()
        .filter(|e| e.kind != EvidenceKind::Context)
        .cloned()
        .partition(|e| e.factor.starts_with("voice_"));
    let f = &rec.features;
    Ok(Json(VishingResponse {
        has_audio: f.flag("has_audio").unwrap_or(false),
        has_transcript: f.flag("has_transcript").unwrap_or(false),
        voice_evidence,
        text_evidence,
        user_opinion: f.category("user_opinion").map(str::to_string),
        verdict: Verdict::from(&rec),
    }))
}

async fn verify_customer_care(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    body: Result<Json<CustomerCarePayload>, JsonRejection>,
) -> RiskResult<Json<CustomerCareResponse>> {
    let Json(payload) = body?;
    let rec = run(&state, principal, Payload::CustomerCare(payload)).await?;
    let f = &rec.features;
    Ok(Json(CustomerCareResponse {
        verification_status: verification_status(
            f.category("match_kind").and_then(MatchKind::parse),
        ),
        company_name: f.category("company_name").map(str::to_string),
        normalized_number: f.category("normalized_number").map(str::to_string),
        number_type: f.category("number_type").map(str::to_string),
        match_confidence: f.continuous("match_confidence"),
        verdict: Verdict::from(&rec),
    }))
}

// ---------- history ----------

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Serialize)]
struct HistoryPage {
    kind: AnalysisKind,
    total: usize,
    limit: usize,
    offset: usize,
    items: Vec<AnalysisRecord>,
}

fn history_for(kind: AnalysisKind) -> MethodRouter<AppState> {
    get(
        move |State(state): State<AppState>,
              Extension(principal): Extension<Principal>,
              query: Result<Query<HistoryQuery>, QueryRejection>| async move {
            list_history(state, principal, query, kind).await
        },
    )
}

async fn list_history(
    state: AppState,
    principal: Principal,
    query: Result<Query<HistoryQuery>, QueryRejection>,
    kind: AnalysisKind,
) -> RiskResult<Json<HistoryPage>> {
    let Query(q) = query.map_err(|e| RiskError::MalformedInput(e.body_text()))?;
    let page = Page::new(q.limit, q.offset);
    let (items, total) = state
        .service
        .history_page(&principal.requester.user_id, kind, page)
        .await?;
    Ok(Json(HistoryPage {
        kind,
        total,
        limit: page.limit,
        offset: page.offset,
        items,
    }))
}

async fn get_analysis(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    id: Result<Path<Uuid>, PathRejection>,
) -> RiskResult<Json<AnalysisRecord>> {
    // An id that is not a UUID cannot name any analysis.
    let Path(id) = id.map_err(|_| RiskError::NotFound("analysis".into()))?;
    let record = state.service.record(&principal.requester.user_id, id).await?;
    Ok(Json(record))
}

// ---------- auth endpoint class ----------

#[derive(Debug, Deserialize)]
struct IntrospectRequest {
    token: String,
}

#[derive(Debug, Serialize)]
struct IntrospectResponse {
    active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exp: Option<u64>,
}

/// Token introspection for an embedding auth service. The token comes from
/// `Authorization: Bearer`, else from a JSON `{token}` body.
async fn introspect(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Option<Json<IntrospectRequest>>, JsonRejection>,
) -> RiskResult<Json<IntrospectResponse>> {
    let token = match bearer(&headers) {
        Some(t) => t.to_string(),
        None => match body? {
            Some(Json(req)) => req.token,
            None => return Err(RiskError::Unauthorized),
        },
    };
    let resp = match state.auth.verifier().verify(&token) {
        Ok(claims) => IntrospectResponse {
            active: true,
            sub: Some(claims.sub),
            scope: Some(claims.scope),
            exp: Some(claims.exp),
        },
        Err(_) => IntrospectResponse {
            active: false,
            sub: None,
            scope: None,
            exp: None,
        },
    };
    Ok(Json(resp))
}
