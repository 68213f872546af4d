// src/score/vishing.rs
//! Voice-call ensemble: transcript markers, voice anomalies and marker
//! breadth, renormalized over whichever inputs the caller supplied.

use async_trait::async_trait;

use super::{ensure_kind, Scorer, ScorerError};
use crate::decision::{Evidence, ScoreResult};
use crate::features::FeatureVector;
use crate::request::{AnalysisKind, UserOpinion};

const TEXT_WEIGHT: f64 = 0.60;
const VOICE_WEIGHT: f64 = 0.15;
const BREADTH_WEIGHT: f64 = 0.25;

/// Hits at which a marker category saturates.
const MARKER_SATURATION: f64 = 2.0;

/// (feature, factor, weight within the text component, explanation)
const MARKERS: &[(&str, &str, f64, &str)] = &[
    ("urgency_hits", "urgency_language", 0.15, "caller pushes for immediate action"),
    ("threat_hits", "threat_language", 0.20, "threats of arrest, blocking or legal action"),
    ("impersonation_hits", "impersonation", 0.20, "claims to call from a bank or authority"),
    ("info_request_hits", "sensitive_info_request", 0.20, "asks for OTP, PIN or card details"),
    ("payment_demand_hits", "payment_demand", 0.15, "demands a payment or transfer"),
    ("action_command_hits", "remote_action", 0.10, "tells the victim to install or press something"),
];

const MONOTONE_VARIANCE: f64 = 0.0005;
const DEAD_AIR_RATIO: f64 = 0.6;
const NOISY_ZCR: f64 = 0.25;

const CONFIRM_BIAS: f64 = 0.10;
const DOUBT_BIAS: f64 = -0.05;

#[derive(Debug, Default, Clone, Copy)]
pub struct VishingScorer;

fn text_component(fv: &FeatureVector, evidence: &mut Vec<Evidence>) -> (f64, f64) {
    let mut score = 0.0;
    let mut categories = 0usize;
    for (feature, factor, weight, detail) in MARKERS {
        let hits = fv.continuous(feature).unwrap_or(0.0);
        if hits > 0.0 {
            let saturation = (hits / MARKER_SATURATION).min(1.0);
            score += weight * saturation;
            categories += 1;
            evidence.push(
                Evidence::signal(*factor, format!("{detail} ({hits} mentions)"))
                    .weighted((weight * 2.0 * saturation) as f32),
            );
        }
    }
    (score, categories as f64 / MARKERS.len() as f64)
}

fn voice_component(fv: &FeatureVector, evidence: &mut Vec<Evidence>) -> f64 {
    let checks = [
        (
            fv.continuous("energy_variance").is_some_and(|v| v < MONOTONE_VARIANCE),
            "voice_monotone",
            "flat energy profile typical of recorded or synthetic speech",
        ),
        (
            fv.continuous("silence_ratio").is_some_and(|s| s > DEAD_AIR_RATIO),
            "voice_dead_air",
            "mostly silence",
        ),
        (
            fv.continuous("zero_crossing_rate").is_some_and(|z| z > NOISY_ZCR),
            "voice_noisy_signal",
            "noisy or heavily compressed line",
        ),
    ];
    let mut hits = 0.0;
    for (hit, factor, detail) in checks {
        if hit {
            hits += 1.0;
            evidence.push(Evidence::signal(factor, detail).weighted(0.3));
        }
    }
    hits / 3.0
}

#[async_trait]
impl Scorer for VishingScorer {
    fn kind(&self) -> AnalysisKind {
        AnalysisKind::Vishing
    }

    fn name(&self) -> &str {
        "vishing-ensemble-v1"
    }

    async fn score(&self, fv: &FeatureVector) -> Result<ScoreResult, ScorerError> {
        ensure_kind(self, fv)?;
        let has_audio = fv.flag("has_audio").unwrap_or(false);
        let has_transcript = fv.flag("has_transcript").unwrap_or(false);
        if !has_audio && !has_transcript {
            return Err(ScorerError::Malformed(
                "vishing vector carries neither audio nor transcript".into(),
            ));
        }

        let mut evidence = Vec::new();
        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        if has_transcript {
            let (text, breadth) = text_component(fv, &mut evidence);
            weighted += TEXT_WEIGHT * text + BREADTH_WEIGHT * breadth;
            total_weight += TEXT_WEIGHT + BREADTH_WEIGHT;
        }
        if has_audio {
            weighted += VOICE_WEIGHT * voice_component(fv, &mut evidence);
            total_weight += VOICE_WEIGHT;
        }
        let mut raw = weighted / total_weight;

        match fv.category("user_opinion").and_then(UserOpinion::parse) {
            Some(UserOpinion::ConfirmSuspicious) => {
                raw += CONFIRM_BIAS;
                evidence.push(Evidence::context(
                    "user_opinion",
                    "caller reported the call as suspicious",
                ));
            }
            Some(UserOpinion::InsufficientEvidence) => {
                raw += DOUBT_BIAS;
                evidence.push(Evidence::context(
                    "user_opinion",
                    "caller was unsure the call was a scam",
                ));
            }
            None => {}
        }
        let raw = raw.clamp(0.0, 1.0);

        let confidence = match (has_audio, has_transcript) {
            (true, true) => 0.9,
            (false, true) => 0.75,
            _ => 0.4,
        };
        Ok(ScoreResult::new(AnalysisKind::Vishing, self.name(), raw)
            .with_confidence(confidence)
            .extend_evidence(evidence))
    }
}
