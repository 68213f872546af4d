//! decision.rs: scorer output, calibrated risk score and the recommended action.
//!
//! `ScoreResult` is what a scorer hands back; `RiskScore` is what the client
//! sees. Tier boundaries are the same for every kind so scores compare across
//! kinds.

use serde::Serialize;

use crate::request::AnalysisKind;

/// Lower bound (inclusive) of the medium tier.
pub const MEDIUM_FROM: u8 = 40;
/// Lower bound (inclusive) of the high tier.
pub const HIGH_FROM: u8 = 75;

/// What a piece of evidence is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    /// A risk indicator that contributed to the score.
    Signal,
    /// Enrichment fell back to unknown; the score ran on less information.
    Degraded,
    /// Caller-supplied or environmental context.
    Context,
}

/// One named risk factor shown to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evidence {
    /// Stable snake_case identifier.
    pub factor: String,
    pub detail: String,
    /// Contribution weight in `[0, 1]`.
    pub weight: f32,
    pub kind: EvidenceKind,
}

impl Evidence {
    pub fn signal(factor: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(factor, detail, EvidenceKind::Signal)
    }

    pub fn degraded(factor: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(factor, detail, EvidenceKind::Degraded)
    }

    pub fn context(factor: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(factor, detail, EvidenceKind::Context)
    }

    fn new(factor: impl Into<String>, detail: impl Into<String>, kind: EvidenceKind) -> Self {
        Self {
            factor: factor.into(),
            detail: detail.into(),
            weight: 0.0,
            kind,
        }
    }

    pub fn weighted(mut self, w: f32) -> Self {
        self.weight = clamp01(w);
        self
    }
}

/// Output of a scorer. Transient; only persisted inside an `AnalysisRecord`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreResult {
    pub kind: AnalysisKind,
    /// Model-specific; the built-in scorers emit a probability in `[0, 1]`.
    pub raw_score: f64,
    pub evidence: Vec<Evidence>,
    pub confidence: f32,
    /// Name of the scorer that produced this result.
    pub model: String,
}

impl ScoreResult {
    pub fn new(kind: AnalysisKind, model: impl Into<String>, raw_score: f64) -> Self {
        Self {
            kind,
            raw_score,
            evidence: Vec::new(),
            confidence: 0.5,
            model: model.into(),
        }
    }

    pub fn with_confidence(mut self, c: f32) -> Self {
        self.confidence = clamp01(c);
        self
    }

    pub fn with_evidence(mut self, e: Evidence) -> Self {
        self.evidence.push(e);
        self
    }

    pub fn extend_evidence(mut self, items: impl IntoIterator<Item = Evidence>) -> Self {
        self.evidence.extend(items);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Low,
    Medium,
    High,
}

impl Tier {
    /// The unique tier containing `numeric`.
    pub fn for_score(numeric: u8) -> Self {
        if numeric >= HIGH_FROM {
            Tier::High
        } else if numeric >= MEDIUM_FROM {
            Tier::Medium
        } else {
            Tier::Low
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Low => "low",
            Tier::Medium => "medium",
            Tier::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Allow,
    Warn,
    StepUp,
    Block,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Allow => "allow",
            Action::Warn => "warn",
            Action::StepUp => "step_up",
            Action::Block => "block",
        }
    }
}

/// Calibrated 0–100 score. The tier is always derived from `numeric`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RiskScore {
    numeric: u8,
    tier: Tier,
    recommended_action: Action,
}

impl RiskScore {
    /// Clamps to 100 and derives the tier. The action starts at the uniform
    /// tier default until the policy engine decides.
    pub fn new(numeric: u8) -> Self {
        let numeric = numeric.min(100);
        let tier = Tier::for_score(numeric);
        let recommended_action = match tier {
            Tier::Low => Action::Allow,
            Tier::Medium => Action::Warn,
            Tier::High => Action::Block,
        };
        Self {
            numeric,
            tier,
            recommended_action,
        }
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.recommended_action = action;
        self
    }

    pub fn numeric(&self) -> u8 {
        self.numeric
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn recommended_action(&self) -> Action {
        self.recommended_action
    }
}

fn clamp01(x: f32) -> f32 {
    if x.is_nan() {
        0.0
    } else {
        x.clamp(0.0, 1.0)
    }
}
