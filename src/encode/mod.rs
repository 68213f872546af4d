// src/encode/mod.rs
//! Feature encoders: raw payload -> fixed-shape [`FeatureVector`].
//!
//! Encoders reject payloads that break basic shape rules and otherwise always
//! succeed; enrichment or history failures only leave features at unknown.

pub mod audio;
pub mod customer_care;
pub mod text;
pub mod transaction;
pub mod url;
pub mod vishing;

use std::time::Duration;

use chrono::FixedOffset;
use regex::Regex;

use crate::config::{InputLimits, Settings};
use crate::enrich::Enricher;
use crate::error::{RiskError, RiskResult};
use crate::features::{FeatureError, FeatureVector};
use crate::history::HistorySink;
use crate::request::{AnalysisRequest, Payload};

/// Everything an encoder may consult besides the payload.
pub struct EncodeContext<'a> {
    pub enricher: &'a Enricher,
    pub history: &'a dyn HistorySink,
    pub limits: &'a InputLimits,
    pub offset: FixedOffset,
    pub velocity_lookback: usize,
    pub history_timeout: Duration,
}

impl<'a> EncodeContext<'a> {
    pub fn new(settings: &'a Settings, enricher: &'a Enricher, history: &'a dyn HistorySink) -> Self {
        Self {
            enricher,
            history,
            limits: &settings.limits,
            offset: settings.locale.offset(),
            velocity_lookback: settings.history.velocity_lookback,
            history_timeout: settings.history.timeout(),
        }
    }
}

pub async fn encode(req: &AnalysisRequest, ctx: &EncodeContext<'_>) -> RiskResult<FeatureVector> {
    match req.payload() {
        Payload::Text(p) => text::encode(p, ctx.limits),
        Payload::Url(p) => url::encode(p, ctx, req.submitted_at()).await,
        Payload::Transaction(p) => {
            transaction::encode(p, req.requester(), req.submitted_at(), ctx).await
        }
        Payload::Vishing(p) => vishing::encode(p, ctx.limits),
        Payload::CustomerCare(p) => customer_care::encode(p, ctx).await,
    }
}

impl From<FeatureError> for RiskError {
    fn from(e: FeatureError) -> Self {
        RiskError::Internal(e.to_string())
    }
}

pub(crate) fn count_matches(re: &Regex, text: &str) -> usize {
    re.find_iter(text).count()
}

pub(crate) fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}
