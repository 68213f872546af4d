// src/pipeline.rs
//! Request pipeline: admission → encoding → scoring → aggregation → policy →
//! history write.
//!
//! The service owns every collaborator behind a trait object so tests can
//! swap in stub scorers, failing history sinks or fixed enrichment sources.
//! History writes are spawned only once a final [`RiskScore`] exists; a
//! failed write is logged and counted but never fails the response.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use metrics::{counter, histogram};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::decision::{EvidenceKind, RiskScore};
use crate::encode::{encode, EncodeContext};
use crate::engine::aggregate;
use crate::enrich::{Blocklist, Enricher, EnrichmentSource, HttpEnrichment, OfflineEnrichment};
use crate::error::{RiskError, RiskResult};
use crate::history::{AnalysisRecord, HistorySink, InMemoryHistory, Page, PersistenceError};
use crate::lookup_cache::CacheConfig;
use crate::otp::{LogDelivery, OtpChallenge, OtpDelivery, OtpStore};
use crate::policy::{decide, PolicyContext};
use crate::rate_limit::{RateLimitResult, RateLimiter};
use crate::registry::{CompanyRegistry, FileRegistry};
use crate::request::{AnalysisKind, AnalysisRequest, Requester};
use crate::score::ScorerSet;

/// Short, stable fingerprint for logs. Raw identifiers never reach a log line.
pub(crate) fn anon_hash(text: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(12);
    for b in digest.iter().take(6) {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

pub struct RiskService {
    settings: Arc<Settings>,
    limiter: RateLimiter,
    enricher: Enricher,
    history: Arc<dyn HistorySink>,
    scorers: ScorerSet,
    otp: OtpStore,
}

pub struct RiskServiceBuilder {
    settings: Settings,
    source: Option<Arc<dyn EnrichmentSource>>,
    registry: Option<Arc<dyn CompanyRegistry>>,
    blocklist: Option<Blocklist>,
    history: Option<Arc<dyn HistorySink>>,
    scorers: Option<ScorerSet>,
    otp_delivery: Option<Arc<dyn OtpDelivery>>,
}

impl RiskServiceBuilder {
    pub fn enrichment(mut self, source: Arc<dyn EnrichmentSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn registry(mut self, registry: Arc<dyn CompanyRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn blocklist(mut self, blocklist: Blocklist) -> Self {
        self.blocklist = Some(blocklist);
        self
    }

    pub fn history(mut self, history: Arc<dyn HistorySink>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn scorers(mut self, scorers: ScorerSet) -> Self {
        self.scorers = Some(scorers);
        self
    }

    pub fn otp_delivery(mut self, delivery: Arc<dyn OtpDelivery>) -> Self {
        self.otp_delivery = Some(delivery);
        self
    }

    /// Fill every collaborator that was not injected from the settings.
    pub fn build(self) -> anyhow::Result<RiskService> {
        let settings = self.settings;

        let source: Arc<dyn EnrichmentSource> = match self.source {
            Some(s) => s,
            None if settings.enrichment.enabled => Arc::new(
                HttpEnrichment::new(settings.enrichment.clone(), settings.cache.lookup_timeout())
                    .context("building HTTP enrichment client")?,
            ),
            None => {
                info!("enrichment disabled; domain and geo lookups resolve to unknown");
                Arc::new(OfflineEnrichment)
            }
        };

        let registry: Arc<dyn CompanyRegistry> = match self.registry {
            Some(r) => r,
            None => {
                let path = settings.registry.path.as_path();
                if path.exists() {
                    let reg = FileRegistry::load(path, settings.registry.min_similarity)?;
                    info!(companies = reg.len(), path = %path.display(), "customer-care registry loaded");
                    Arc::new(reg)
                } else {
                    warn!(path = %path.display(), "customer-care registry not found; starting empty");
                    Arc::new(FileRegistry::empty())
                }
            }
        };

        let history = self
            .history
            .unwrap_or_else(|| Arc::new(InMemoryHistory::with_capacity(settings.history.capacity)));

        let blocklist = match self.blocklist {
            Some(b) => b,
            None => {
                let path = settings.reputation.blocklist_path.as_path();
                if path.exists() {
                    let list = Blocklist::load(path)?;
                    info!(urls = list.len(), path = %path.display(), "phishing list loaded");
                    list
                } else {
                    warn!(path = %path.display(), "phishing list not found; reputation relies on the enrichment source");
                    Blocklist::empty()
                }
            }
        };

        let enricher = Enricher::new(source, registry, CacheConfig::from(&settings.cache))
            .with_blocklist(blocklist);
        let limiter = RateLimiter::new(settings.rate_limits.clone());
        let otp = OtpStore::new(
            settings.otp.clone(),
            self.otp_delivery.unwrap_or_else(|| Arc::new(LogDelivery)),
        );

        Ok(RiskService {
            settings: Arc::new(settings),
            limiter,
            enricher,
            history,
            scorers: self.scorers.unwrap_or_else(ScorerSet::builtin),
            otp,
        })
    }
}

impl RiskService {
    pub fn builder(settings: Settings) -> RiskServiceBuilder {
        RiskServiceBuilder {
            settings,
            source: None,
            registry: None,
            blocklist: None,
            history: None,
            scorers: None,
            otp_delivery: None,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn enricher(&self) -> &Enricher {
        &self.enricher
    }

    /// Score one request end to end. Returns the record that is (or is about
    /// to be) written to history.
    pub async fn analyze(&self, req: AnalysisRequest) -> RiskResult<AnalysisRecord> {
        self.admit(req.kind(), req.requester())?;
        self.analyze_admitted(req).await
    }

    /// Rate-limit admission for one analysis. Callers that must not read a
    /// request body before admission run this first, then
    /// [`Self::analyze_admitted`].
    pub fn admit(&self, kind: AnalysisKind, requester: &Requester) -> RiskResult<()> {
        counter!("risk_requests_total", "kind" => kind.as_str()).increment(1);
        match self
            .limiter
            .check_analysis(kind, &requester.user_id, &requester.ip)
        {
            RateLimitResult::Allowed => Ok(()),
            RateLimitResult::Limited {
                endpoint,
                retry_after,
            } => {
                info!(
                    kind = %kind,
                    requester = %anon_hash(&requester.user_id),
                    endpoint = endpoint.as_str(),
                    "rate limited"
                );
                Err(RiskError::RateLimitExceeded {
                    endpoint: endpoint.as_str().to_string(),
                    retry_after,
                })
            }
        }
    }

    /// Everything after admission.
    pub async fn analyze_admitted(&self, req: AnalysisRequest) -> RiskResult<AnalysisRecord> {
        let started = Instant::now();
        let kind = req.kind();
        let requester = req.requester();
        let who = anon_hash(&requester.user_id);

        let ctx = EncodeContext::new(&self.settings, &self.enricher, self.history.as_ref());
        let features = encode(&req, &ctx).await?;
        debug!(kind = %kind, requester = %who, unknown = features.unknown_count(), "features encoded");

        let scorer = self.scorers.get(kind).ok_or_else(|| {
            RiskError::ScoringUnavailable(format!("no scorer registered for {kind}"))
        })?;
        let result = match timeout(self.settings.scoring.timeout(), scorer.score(&features)).await
        {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                return Err(RiskError::ScoringUnavailable(format!(
                    "scorer '{}' failed: {e}",
                    scorer.name()
                )))
            }
            Err(_) => {
                return Err(RiskError::ScoringUnavailable(format!(
                    "scorer '{}' timed out after {:?}",
                    scorer.name(),
                    self.settings.scoring.timeout()
                )))
            }
        };

        let risk = aggregate(kind, &result)?;
        let policy_ctx = PolicyContext {
            requester: who.clone(),
            degraded: result
                .evidence
                .iter()
                .filter(|e| e.kind == EvidenceKind::Degraded)
                .count(),
        };
        let risk: RiskScore = risk.with_action(decide(kind, &risk, &policy_ctx));

        let record = AnalysisRecord {
            id: req.id(),
            requester_id: requester.user_id.clone(),
            device_id: requester.device_id.clone(),
            kind,
            features,
            score: result,
            risk,
            created_at: req.submitted_at(),
        };

        let tier = record.risk.tier().as_str();
        let action = record.risk.recommended_action().as_str();
        counter!(
            "risk_decisions_total",
            "kind" => kind.as_str(),
            "tier" => tier,
            "action" => action
        )
        .increment(1);
        histogram!("risk_pipeline_duration_ms", "kind" => kind.as_str())
            .record(started.elapsed().as_secs_f64() * 1000.0);
        info!(
            kind = %kind,
            requester = %who,
            numeric = record.risk.numeric(),
            tier,
            action,
            degraded = policy_ctx.degraded,
            "analysis complete"
        );

        self.persist(record.clone());
        Ok(record)
    }

    fn persist(&self, record: AnalysisRecord) {
        let history = Arc::clone(&self.history);
        let limit = self.settings.history.timeout();
        tokio::spawn(async move {
            let id = record.id;
            let outcome = match timeout(limit, history.append(record)).await {
                Ok(r) => r,
                Err(_) => Err(PersistenceError::Timeout),
            };
            match outcome {
                Ok(()) => debug!(analysis_id = %id, "analysis recorded"),
                Err(e) => {
                    counter!("history_write_failures_total").increment(1);
                    warn!(analysis_id = %id, error = %e, "history write failed; needs reconciliation");
                }
            }
        });
    }

    /// One page of the requester's own records of `kind`, plus the total.
    pub async fn history_page(
        &self,
        requester_id: &str,
        kind: AnalysisKind,
        page: Page,
    ) -> RiskResult<(Vec<AnalysisRecord>, usize)> {
        match timeout(
            self.settings.history.timeout(),
            self.history.list(requester_id, kind, page),
        )
        .await
        {
            Ok(r) => Ok(r?),
            Err(_) => Err(PersistenceError::Timeout.into()),
        }
    }

    /// A record is visible only to the requester who created it.
    pub async fn record(&self, requester_id: &str, id: Uuid) -> RiskResult<AnalysisRecord> {
        let found = match timeout(self.settings.history.timeout(), self.history.get(id)).await {
            Ok(r) => r?,
            Err(_) => return Err(PersistenceError::Timeout.into()),
        };
        match found {
            None => Err(RiskError::NotFound(format!("analysis {id}"))),
            Some(r) if r.requester_id != requester_id => Err(RiskError::Forbidden(
                "analysis belongs to another requester".into(),
            )),
            Some(r) => Ok(r),
        }
    }

    /// Challenge a transaction the policy sent to step-up.
    pub fn start_step_up(&self, requester_id: &str, analysis_id: Uuid) -> OtpChallenge {
        self.otp.issue(requester_id, analysis_id)
    }

    /// Redeem the one-time code for `analysis_id`.
    pub fn verify_step_up(&self, requester_id: &str, analysis_id: Uuid, code: &str) -> RiskResult<()> {
        self.otp.verify(requester_id, analysis_id, code)?;
        info!(requester = %anon_hash(requester_id), analysis_id = %analysis_id, "step-up verified");
        Ok(())
    }

    /// Admission for the authentication endpoint class.
    pub fn admit_auth(&self, ip: &str) -> RiskResult<()> {
        match self.limiter.check_auth(ip) {
            RateLimitResult::Allowed => Ok(()),
            RateLimitResult::Limited {
                endpoint,
                retry_after,
            } => Err(RiskError::RateLimitExceeded {
                endpoint: endpoint.as_str().to_string(),
                retry_after,
            }),
        }
    }
}
