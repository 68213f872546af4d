// src/score/url.rs
//! Logistic weighted sum over the URL ternaries. A reputation-list hit
//! floors the score instead of adding weight.

use async_trait::async_trait;

use super::{degraded_evidence, ensure_kind, known_fraction, logistic, Scorer, ScorerError};
use crate::decision::{Evidence, ScoreResult};
use crate::features::{FeatureVector, Ternary};
use crate::request::AnalysisKind;

const BIAS: f64 = -3.0;
/// Share of its weight an unknown feature contributes.
const UNKNOWN_SHARE: f64 = 0.25;
/// Ceiling for URLs every enrichment lookup vouched for.
const TRUSTED_CAP: f64 = 0.3;
/// Minimum for URLs a phishing list or scanning engine reports.
const LISTED_FLOOR: f64 = 0.9;

/// (feature, weight, explanation shown when present)
const WEIGHTS: &[(&str, f64, &str)] = &[
    ("ip_literal", 2.0, "host is a raw IP address"),
    ("at_symbol", 1.5, "'@' in the URL hides the real destination"),
    ("free_tld", 1.5, "uses a free or frequently abused top-level domain"),
    ("shortener", 1.0, "link shortener hides the destination"),
    ("double_slash_redirect", 1.0, "'//' redirect inside the path"),
    ("young_domain", 1.2, "domain registered less than a year ago"),
    ("missing_dns", 1.2, "host does not resolve"),
    ("invalid_tls", 1.0, "TLS certificate is invalid"),
    ("deep_subdomain", 0.8, "many nested subdomains"),
    ("suspicious_words", 0.8, "credential or banking bait words in the URL"),
    ("low_traffic", 0.8, "domain has little or no traffic"),
    ("prefix_suffix", 0.7, "hyphenated host imitating a brand"),
    ("long_url", 0.6, "unusually long URL"),
    ("no_https", 0.6, "not served over HTTPS"),
    ("short_registration", 0.6, "registration expires within a year"),
];

/// Page and registrant signals. Often unavailable, so an unknown value adds
/// nothing here.
const CONTENT_WEIGHTS: &[(&str, f64, &str)] = &[
    ("foreign_form_handler", 1.2, "page form submits to another site or nowhere"),
    ("hidden_iframe", 1.0, "page embeds a hidden iframe"),
    ("abnormal_registration", 0.8, "registrant details do not match the domain"),
    ("excessive_redirects", 0.8, "reached through a chain of redirects"),
    ("external_favicon", 0.5, "favicon is served from another site"),
];

pub const ENRICHMENT_FEATURES: &[&str] = &[
    "young_domain",
    "short_registration",
    "invalid_tls",
    "missing_dns",
    "low_traffic",
];

const TRUST_BLOCKERS: &[&str] = &["ip_literal", "at_symbol"];

#[derive(Debug, Default, Clone, Copy)]
pub struct UrlScorer;

#[async_trait]
impl Scorer for UrlScorer {
    fn kind(&self) -> AnalysisKind {
        AnalysisKind::Url
    }

    fn name(&self) -> &str {
        "url-logistic-v1"
    }

    async fn score(&self, fv: &FeatureVector) -> Result<ScoreResult, ScorerError> {
        ensure_kind(self, fv)?;

        let mut z = BIAS;
        let mut evidence = Vec::new();
        for (name, w, why) in WEIGHTS {
            match fv.ternary(name) {
                Ternary::Present => {
                    z += w;
                    evidence.push(Evidence::signal(*name, *why).weighted((*w / 4.0) as f32));
                }
                Ternary::Unknown => z += w * UNKNOWN_SHARE,
                Ternary::Absent => {}
            }
        }
        for (name, w, why) in CONTENT_WEIGHTS {
            if fv.ternary(name) == Ternary::Present {
                z += w;
                evidence.push(Evidence::signal(*name, *why).weighted((*w / 4.0) as f32));
            }
        }
        let mut raw = logistic(z);

        let vouched = ENRICHMENT_FEATURES
            .iter()
            .chain(TRUST_BLOCKERS)
            .all(|f| fv.ternary(f) == Ternary::Absent)
            && CONTENT_WEIGHTS
                .iter()
                .all(|(f, _, _)| fv.ternary(f) != Ternary::Present);
        if vouched && raw > TRUSTED_CAP {
            raw = TRUSTED_CAP;
            evidence.push(Evidence::context(
                "established_domain",
                "registration, TLS, DNS and traffic all look established",
            ));
        }
        match fv.ternary("blacklisted") {
            Ternary::Present => {
                raw = raw.max(LISTED_FLOOR);
                let detections = fv.continuous("reputation_detections").unwrap_or(0.0);
                let why = if detections > 0.0 {
                    format!("reported as malicious by {detections} scanning engines")
                } else {
                    "listed as a known phishing URL".to_string()
                };
                evidence.push(Evidence::signal("blacklisted", why).weighted(1.0));
            }
            Ternary::Unknown => evidence.extend(degraded_evidence(fv, &["blacklisted"])),
            Ternary::Absent => {}
        }
        evidence.extend(degraded_evidence(fv, ENRICHMENT_FEATURES));

        let all: Vec<&str> = WEIGHTS.iter().map(|(n, _, _)| *n).collect();
        let confidence = 0.5 + 0.5 * known_fraction(fv, &all);
        Ok(ScoreResult::new(AnalysisKind::Url, self.name(), raw)
            .with_confidence(confidence as f32)
            .extend_evidence(evidence))
    }
}
