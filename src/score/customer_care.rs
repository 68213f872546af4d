// src/score/customer_care.rs
//! Points-based verdict for a claimed customer-care number.

use async_trait::async_trait;

use super::{ensure_kind, Scorer, ScorerError};
use crate::decision::{Evidence, ScoreResult};
use crate::encode::customer_care::MatchKind;
use crate::features::FeatureVector;
use crate::request::AnalysisKind;

/// Fewer official numbers than this counts as a thin listing.
const THIN_LISTING: f64 = 5.0;

#[derive(Debug, Default, Clone, Copy)]
pub struct CustomerCareScorer;

#[async_trait]
impl Scorer for CustomerCareScorer {
    fn kind(&self) -> AnalysisKind {
        AnalysisKind::CustomerCare
    }

    fn name(&self) -> &str {
        "customer-care-rules-v1"
    }

    async fn score(&self, fv: &FeatureVector) -> Result<ScoreResult, ScorerError> {
        ensure_kind(self, fv)?;
        let mut points: i32 = 0;
        let mut evidence = Vec::new();

        let kind = fv.category("match_kind").and_then(MatchKind::parse);
        let confidence = match kind {
            Some(MatchKind::Exact) => {
                points += 5;
                evidence.push(Evidence::context("listed_number", "number is on the official list"));
                0.9
            }
            Some(MatchKind::Similar) => {
                points += 15;
                evidence.push(
                    Evidence::signal(
                        "similar_listed_number",
                        "close to an official toll-free number but not identical",
                    )
                    .weighted(0.15),
                );
                0.7
            }
            Some(MatchKind::Unlisted) => {
                points += 75;
                evidence.push(
                    Evidence::signal(
                        "unlisted_number",
                        "company is known but this number is not one of its official numbers",
                    )
                    .weighted(0.75),
                );
                0.8
            }
            Some(MatchKind::CompanyUnknown) => {
                points += 40;
                evidence.push(
                    Evidence::signal("company_not_in_registry", "no official numbers on record")
                        .weighted(0.4),
                );
                0.5
            }
            None => {
                points += 40;
                evidence.push(Evidence::degraded(
                    "registry_unavailable",
                    "official number registry could not be consulted",
                ));
                0.3
            }
        };

        if fv.continuous("listed_numbers").is_some_and(|n| n < THIN_LISTING) {
            points += 20;
            evidence.push(
                Evidence::signal("thin_listing", "few official numbers to compare against")
                    .weighted(0.2),
            );
        }

        match fv.category("number_type") {
            Some("toll_free") => points -= 15,
            Some("mobile") => {
                points += 10;
                evidence.push(
                    Evidence::signal("mobile_number", "companies rarely use personal mobiles for support")
                        .weighted(0.1),
                );
            }
            Some("landline") => points -= 5,
            _ => {}
        }

        let digits = fv.continuous("digit_count").unwrap_or(10.0);
        if digits < 10.0 {
            points += 30;
            evidence.push(Evidence::signal("short_number", "fewer than 10 digits").weighted(0.3));
        } else if digits > 12.0 {
            points += 20;
            evidence.push(Evidence::signal("long_number", "more than 12 digits").weighted(0.2));
        }

        let points = points.clamp(0, 100);
        Ok(
            ScoreResult::new(AnalysisKind::CustomerCare, self.name(), f64::from(points) / 100.0)
                .with_confidence(confidence)
                .extend_evidence(evidence),
        )
    }
}
