// src/score/mod.rs
//! Signal scorers: one per analysis kind, behind the [`Scorer`] trait.
//!
//! The service never reaches a model through a global. A [`ScorerSet`] is
//! built at startup (or by a test) and handed to the pipeline.

pub mod customer_care;
pub mod text;
pub mod transaction;
pub mod url;
pub mod vishing;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::decision::{Evidence, ScoreResult};
use crate::features::{FeatureVector, Ternary};
use crate::request::AnalysisKind;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScorerError {
    #[error("scorer unavailable: {0}")]
    Unavailable(String),
    #[error("scorer for {expected} received a {got} feature vector")]
    KindMismatch {
        expected: AnalysisKind,
        got: AnalysisKind,
    },
    #[error("malformed scorer output: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait Scorer: Send + Sync {
    fn kind(&self) -> AnalysisKind;

    /// Recorded as `ScoreResult::model`.
    fn name(&self) -> &str;

    async fn score(&self, features: &FeatureVector) -> Result<ScoreResult, ScorerError>;
}

/// Guard shared by the built-in scorers.
pub(crate) fn ensure_kind(scorer: &dyn Scorer, fv: &FeatureVector) -> Result<(), ScorerError> {
    if fv.kind() == scorer.kind() {
        Ok(())
    } else {
        Err(ScorerError::KindMismatch {
            expected: scorer.kind(),
            got: fv.kind(),
        })
    }
}

pub(crate) fn logistic(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

/// Fraction of the named ternaries that are known.
pub(crate) fn known_fraction(fv: &FeatureVector, names: &[&str]) -> f64 {
    if names.is_empty() {
        return 1.0;
    }
    let known = names.iter().filter(|n| fv.ternary(n).is_known()).count();
    known as f64 / names.len() as f64
}

/// One degraded evidence entry per unknown feature in `names`.
pub(crate) fn degraded_evidence(fv: &FeatureVector, names: &[&str]) -> Vec<Evidence> {
    names
        .iter()
        .filter(|n| fv.ternary(n) == Ternary::Unknown)
        .map(|n| Evidence::degraded(*n, format!("{n} could not be determined; scored conservatively")))
        .collect()
}

/// Scorers keyed by kind.
#[derive(Clone, Default)]
pub struct ScorerSet {
    by_kind: HashMap<AnalysisKind, Arc<dyn Scorer>>,
}

impl ScorerSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The heuristic scorers that ship with the service.
    pub fn builtin() -> Self {
        Self::empty()
            .with(Arc::new(text::TextScorer))
            .with(Arc::new(url::UrlScorer))
            .with(Arc::new(transaction::TransactionScorer))
            .with(Arc::new(vishing::VishingScorer))
            .with(Arc::new(customer_care::CustomerCareScorer))
    }

    /// Replaces any scorer already registered for the same kind.
    pub fn with(mut self, scorer: Arc<dyn Scorer>) -> Self {
        self.by_kind.insert(scorer.kind(), scorer);
        self
    }

    pub fn get(&self, kind: AnalysisKind) -> Option<Arc<dyn Scorer>> {
        self.by_kind.get(&kind).cloned()
    }
}
