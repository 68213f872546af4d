// src/score/transaction.rs
//! Hybrid transaction scorer: a logistic global layer over amount, time and
//! novelty, plus an expert rule layer once the requester has enough history.

use async_trait::async_trait;

use super::{ensure_kind, logistic, Scorer, ScorerError};
use crate::decision::{Evidence, ScoreResult};
use crate::features::{FeatureVector, Ternary};
use crate::request::AnalysisKind;

/// Rules need this many prior transactions to have a baseline.
pub const MIN_HISTORY_FOR_RULES: f64 = 10.0;
const BURST_DEVICE_10M: f64 = 3.0;
const BURST_REQUESTER_1H: f64 = 10.0;
const FAR_KM: f64 = 500.0;

#[derive(Debug, Default, Clone, Copy)]
pub struct TransactionScorer;

struct Rule {
    factor: &'static str,
    detail: &'static str,
    weight: f64,
}

fn global_layer(fv: &FeatureVector, evidence: &mut Vec<Evidence>) -> f64 {
    let mut z = -3.0;
    match fv.continuous("amount_bin").unwrap_or(0.0) as u8 {
        1 => z += 0.8,
        2 => {
            z += 1.8;
            evidence.push(Evidence::signal("high_amount", "amount above 16,000").weighted(0.45));
        }
        _ => {}
    }
    match fv.ternary("amount_outlier") {
        Ternary::Present => {
            z += 2.0;
            evidence.push(
                Evidence::signal("amount_outlier", "far outside this requester's usual amounts")
                    .weighted(0.5),
            );
        }
        Ternary::Unknown => z += 0.3,
        Ternary::Absent => {}
    }
    if fv.flag("is_night") == Some(true) {
        z += 0.7;
        evidence.push(Evidence::signal("night_time", "made between 23:00 and 06:00").weighted(0.2));
    }
    if fv.ternary("new_device") == Ternary::Present {
        z += 0.6;
        evidence.push(Evidence::signal("new_device", "first payment from this device").weighted(0.15));
    }
    if fv.ternary("new_recipient") == Ternary::Present {
        z += 0.4;
        evidence.push(Evidence::signal("new_recipient", "first payment to this recipient").weighted(0.1));
    }
    if fv.continuous("device_txn_10m").unwrap_or(0.0) >= BURST_DEVICE_10M {
        z += 1.0;
    }
    if fv.continuous("requester_txn_1h").unwrap_or(0.0) >= BURST_REQUESTER_1H {
        z += 0.8;
    }
    if fv.category("transaction_type") == Some("P2P") {
        z += 0.2;
    }
    logistic(z)
}

fn rule_layer(fv: &FeatureVector) -> Vec<Rule> {
    let mut fired = Vec::new();
    if fv.continuous("history_len").unwrap_or(0.0) < MIN_HISTORY_FOR_RULES {
        return fired;
    }
    let pct = fv.continuous("amount_percentile").unwrap_or(0.0);
    let night = fv.flag("is_night") == Some(true);
    if pct >= 0.98 {
        fired.push(Rule {
            factor: "extreme_amount",
            detail: "larger than 98% of this requester's payments",
            weight: 1.0,
        });
    }
    if night && pct >= 0.8 {
        fired.push(Rule {
            factor: "night_high_amount",
            detail: "large payment at night",
            weight: 0.7,
        });
    }
    if fv.continuous("distance_from_last_km").unwrap_or(0.0) > FAR_KM && pct >= 0.8 {
        fired.push(Rule {
            factor: "distant_high_amount",
            detail: "large payment far from the previous location",
            weight: 0.8,
        });
    }
    if fv.category("payment_method") == Some("QR") && pct >= 0.9 {
        fired.push(Rule {
            factor: "qr_high_amount",
            detail: "large payment through a scanned QR code",
            weight: 0.6,
        });
    }
    if fv.ternary("new_device") == Ternary::Present && fv.ternary("new_recipient") == Ternary::Present {
        fired.push(Rule {
            factor: "new_device_and_recipient",
            detail: "new device paying a new recipient",
            weight: 0.9,
        });
    }
    let device_burst = fv.continuous("device_txn_10m").unwrap_or(0.0) >= BURST_DEVICE_10M;
    let requester_burst = fv.continuous("requester_txn_1h").unwrap_or(0.0) >= BURST_REQUESTER_1H;
    if device_burst || requester_burst {
        fired.push(Rule {
            factor: "velocity_burst",
            detail: "many payments in a short time",
            weight: 0.8,
        });
    }
    fired
}

#[async_trait]
impl Scorer for TransactionScorer {
    fn kind(&self) -> AnalysisKind {
        AnalysisKind::Transaction
    }

    fn name(&self) -> &str {
        "transaction-hybrid-v1"
    }

    async fn score(&self, fv: &FeatureVector) -> Result<ScoreResult, ScorerError> {
        ensure_kind(self, fv)?;
        let mut evidence = Vec::new();
        let global = global_layer(fv, &mut evidence);
        let rules = rule_layer(fv);

        let rules_conf = rules.iter().map(|r| r.weight).fold(0.0, f64::max);
        let raw = if rules.is_empty() {
            global
        } else {
            (0.3 * global + 0.4 + 0.3 * rules_conf).min(1.0)
        };
        evidence.extend(
            rules
                .iter()
                .map(|r| Evidence::signal(r.factor, r.detail).weighted(r.weight as f32)),
        );
        if fv.continuous("history_len").is_none() {
            evidence.push(Evidence::degraded(
                "history_unavailable",
                "velocity features could not be read",
            ));
        }

        let confidence = if rules.is_empty() {
            0.5 + (global - 0.5).abs() * 0.6
        } else {
            0.6 + 0.3 * rules_conf
        };
        Ok(ScoreResult::new(AnalysisKind::Transaction, self.name(), raw)
            .with_confidence(confidence as f32)
            .extend_evidence(evidence))
    }
}
