//! # Risk Aggregator
//! Pure, testable logic that maps a scorer's `ScoreResult` → `RiskScore`.
//! No I/O, suitable for unit tests and offline recalibration.
//!
//! Each kind gets a monotonic calibration from raw score to `[0, 1]`; the
//! numeric score is `round(100 · calibrated)` and the tier comes from the
//! fixed thresholds in [`crate::decision`].

use crate::decision::{RiskScore, ScoreResult};
use crate::error::{RiskError, RiskResult};
use crate::request::AnalysisKind;

/// Piecewise-linear map for customer-care points. Moves the 25/55 point
/// boundaries onto the 40/75 tier thresholds.
const CUSTOMER_CARE_KNOTS: &[(f64, f64)] = &[
    (0.0, 0.0),
    (0.25, 0.39),
    (0.26, 0.40),
    (0.55, 0.74),
    (0.56, 0.75),
    (1.0, 1.0),
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Calibration {
    Identity,
    Piecewise(&'static [(f64, f64)]),
}

impl Calibration {
    pub fn for_kind(kind: AnalysisKind) -> Self {
        match kind {
            AnalysisKind::CustomerCare => Calibration::Piecewise(CUSTOMER_CARE_KNOTS),
            AnalysisKind::Text
            | AnalysisKind::Url
            | AnalysisKind::Transaction
            | AnalysisKind::Vishing => Calibration::Identity,
        }
    }

    pub fn apply(self, raw: f64) -> f64 {
        let x = raw.clamp(0.0, 1.0);
        match self {
            Calibration::Identity => x,
            Calibration::Piecewise(knots) => {
                for pair in knots.windows(2) {
                    let ((x0, y0), (x1, y1)) = (pair[0], pair[1]);
                    if x <= x1 {
                        if x1 <= x0 {
                            return y1;
                        }
                        return y0 + (x - x0) * (y1 - y0) / (x1 - x0);
                    }
                }
                knots.last().map_or(x, |(_, y)| *y)
            }
        }
    }
}

pub fn calibrate(raw: f64, kind: AnalysisKind) -> f64 {
    Calibration::for_kind(kind).apply(raw)
}

/// Refuses to invent a score: a non-finite raw score or a result for the
/// wrong kind is `ScoringUnavailable`.
pub fn aggregate(kind: AnalysisKind, result: &ScoreResult) -> RiskResult<RiskScore> {
    if result.kind != kind {
        return Err(RiskError::ScoringUnavailable(format!(
            "scorer '{}' returned a {} result for a {} request",
            result.model, result.kind, kind
        )));
    }
    if !result.raw_score.is_finite() {
        return Err(RiskError::ScoringUnavailable(format!(
            "scorer '{}' returned a non-finite score",
            result.model
        )));
    }
    let numeric = (calibrate(result.raw_score, kind) * 100.0).round().clamp(0.0, 100.0) as u8;
    Ok(RiskScore::new(numeric))
}
