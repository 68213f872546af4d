// src/score/text.rs
//! Two-layer heuristic for message text: a lexical layer over marker counts
//! and a pattern layer for credential requests and obfuscation.

use async_trait::async_trait;

use super::{ensure_kind, Scorer, ScorerError};
use crate::decision::{Evidence, ScoreResult};
use crate::features::{FeatureVector, Ternary};
use crate::request::AnalysisKind;

const KEYWORD_SATURATION: f64 = 10.0;
const LINK_WEIGHT: f64 = 0.3;
const URGENCY_WEIGHT: f64 = 0.4;
const MONEY_WEIGHT: f64 = 0.5;
const THREAT_WEIGHT: f64 = 0.6;

const CREDENTIAL_BUMP: f64 = 0.2;
const CHARSET_BUMP: f64 = 0.15;
const SHOUTING_BUMP: f64 = 0.05;
const EXCLAMATION_BUMP: f64 = 0.05;

#[derive(Debug, Default, Clone, Copy)]
pub struct TextScorer;

fn count(fv: &FeatureVector, name: &str) -> f64 {
    fv.continuous(name).unwrap_or(0.0)
}

#[async_trait]
impl Scorer for TextScorer {
    fn kind(&self) -> AnalysisKind {
        AnalysisKind::Text
    }

    fn name(&self) -> &str {
        "text-heuristic-v1"
    }

    async fn score(&self, fv: &FeatureVector) -> Result<ScoreResult, ScorerError> {
        ensure_kind(self, fv)?;
        let mut evidence = Vec::new();

        let keywords = count(fv, "keyword_hits");
        let keyword_part = (keywords / KEYWORD_SATURATION).min(1.0);
        if keywords > 0.0 {
            evidence.push(
                Evidence::signal("scam_keywords", format!("{keywords} known scam phrases"))
                    .weighted(keyword_part as f32),
            );
        }
        let mut lexical = keyword_part;
        for (feature, factor, weight, detail) in [
            ("link_count", "contains_links", LINK_WEIGHT, "message contains links"),
            ("urgency_hits", "urgency", URGENCY_WEIGHT, "pressure to act quickly"),
            ("money_terms", "money_lure", MONEY_WEIGHT, "mentions money, prizes or refunds"),
            ("threat_terms", "threat", THREAT_WEIGHT, "threatens suspension or legal action"),
        ] {
            if count(fv, feature) > 0.0 {
                lexical += weight;
                evidence.push(Evidence::signal(factor, detail).weighted(weight as f32));
            }
        }
        let mut raw = (lexical / 2.0).min(1.0);

        if fv.ternary("credential_request") == Ternary::Present {
            raw += CREDENTIAL_BUMP;
            evidence.push(
                Evidence::signal("credential_request", "asks for a password, PIN or OTP")
                    .weighted(CREDENTIAL_BUMP as f32 * 2.0),
            );
        }
        if fv.ternary("charset_anomaly") == Ternary::Present {
            raw += CHARSET_BUMP;
            evidence.push(
                Evidence::signal("charset_anomaly", "lookalike or invisible characters")
                    .weighted(CHARSET_BUMP as f32 * 2.0),
            );
        }
        if count(fv, "caps_ratio") > 0.3 && count(fv, "word_count") >= 5.0 {
            raw += SHOUTING_BUMP;
            evidence.push(Evidence::signal("shouting", "mostly upper-case text").weighted(0.1));
        }
        if count(fv, "exclamations") >= 3.0 {
            raw += EXCLAMATION_BUMP;
            evidence.push(Evidence::signal("exclamations", "many exclamation marks").weighted(0.1));
        }
        let raw = raw.min(1.0);

        Ok(ScoreResult::new(AnalysisKind::Text, self.name(), raw)
            .with_confidence((0.5 + (raw - 0.5).abs()) as f32)
            .extend_evidence(evidence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InputLimits;
    use crate::encode::text::encode;
    use crate::request::TextPayload;

    async fn score(text: &str) -> ScoreResult {
        let fv = encode(&TextPayload { text: text.into() }, &InputLimits::default()).unwrap();
        TextScorer.score(&fv).await.unwrap()
    }

    #[tokio::test]
    async fn phishing_sms_scores_high() {
        let r = score(
            "URGENT: your SBI account is locked. Verify now at http://sbi-kyc.tk and share OTP \
             to avoid suspension and claim Rs 2,000 cashback!!!",
        )
        .await;
        assert!(r.raw_score >= 0.75, "{}", r.raw_score);
        assert!(r.evidence.iter().any(|e| e.factor == "credential_request"));
        assert!(r.confidence > 0.7);
    }

    #[tokio::test]
    async fn small_talk_scores_low() {
        let r = score("Running ten minutes late, order me a coffee please").await;
        assert!(r.raw_score < 0.2, "{}", r.raw_score);
        assert!(r.evidence.is_empty());
    }

    #[tokio::test]
    async fn raw_score_never_exceeds_one() {
        let r = score(
            "URGENT WINNER!!! Congratulations, you won the lottery prize. Click here, verify now, \
             confirm password and PIN for your bank account or it will be suspended and police \
             will arrest you. Act now: http://a.tk http://b.ml Rs 50,000 refund \u{200B}",
        )
        .await;
        assert!(r.raw_score <= 1.0);
        assert!(r.raw_score > 0.9);
    }
}
