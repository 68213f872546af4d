//! history.rs: append-only store of completed analyses.
//!
//! The pipeline writes one `AnalysisRecord` per request that reached a final
//! risk score, and encoders read recent records back for velocity features.
//! Durable storage lives behind [`HistorySink`]; `InMemoryHistory` is the
//! bounded default used in development and tests.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

use crate::decision::{RiskScore, ScoreResult};
use crate::features::FeatureVector;
use crate::request::AnalysisKind;

/// Immutable once written.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRecord {
    pub id: Uuid,
    pub requester_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub kind: AnalysisKind,
    pub features: FeatureVector,
    pub score: ScoreResult,
    pub risk: RiskScore,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PersistenceError {
    #[error("history store unavailable: {0}")]
    Unavailable(String),
    #[error("history operation timed out")]
    Timeout,
}

/// Whose records to read back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    Requester(String),
    Device(String),
}

#[derive(Debug, Clone)]
pub struct RecentQuery {
    pub kind: AnalysisKind,
    pub subject: Subject,
    /// Only records created at or after this instant.
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Page {
    pub const DEFAULT_LIMIT: usize = 20;
    pub const MAX_LIMIT: usize = 100;

    /// Clamp caller-supplied paging into the supported range.
    pub fn new(limit: Option<usize>, offset: Option<usize>) -> Self {
        Self {
            limit: limit
                .unwrap_or(Self::DEFAULT_LIMIT)
                .clamp(1, Self::MAX_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }
}

#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn append(&self, record: AnalysisRecord) -> Result<(), PersistenceError>;

    /// Newest first.
    async fn recent(&self, query: RecentQuery) -> Result<Vec<AnalysisRecord>, PersistenceError>;

    /// One requester's records of one kind, newest first, plus the total count.
    async fn list(
        &self,
        requester_id: &str,
        kind: AnalysisKind,
        page: Page,
    ) -> Result<(Vec<AnalysisRecord>, usize), PersistenceError>;

    async fn get(&self, id: Uuid) -> Result<Option<AnalysisRecord>, PersistenceError>;
}

#[derive(Debug)]
pub struct InMemoryHistory {
    inner: RwLock<VecDeque<AnalysisRecord>>,
    cap: usize,
}

impl InMemoryHistory {
    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            inner: RwLock::new(VecDeque::with_capacity(cap.min(10_000))),
            cap,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn matches_subject(r: &AnalysisRecord, subject: &Subject) -> bool {
    match subject {
        Subject::Requester(id) => r.requester_id == *id,
        Subject::Device(id) => r.device_id.as_deref() == Some(id.as_str()),
    }
}

#[async_trait]
impl HistorySink for InMemoryHistory {
    async fn append(&self, record: AnalysisRecord) -> Result<(), PersistenceError> {
        let mut v = self.inner.write();
        v.push_back(record);
        while v.len() > self.cap {
            v.pop_front();
        }
        Ok(())
    }

    async fn recent(&self, query: RecentQuery) -> Result<Vec<AnalysisRecord>, PersistenceError> {
        let v = self.inner.read();
        Ok(v.iter()
            .rev()
            .filter(|r| r.kind == query.kind && matches_subject(r, &query.subject))
            .filter(|r| query.since.map_or(true, |since| r.created_at >= since))
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn list(
        &self,
        requester_id: &str,
        kind: AnalysisKind,
        page: Page,
    ) -> Result<(Vec<AnalysisRecord>, usize), PersistenceError> {
        let v = self.inner.read();
        let mine: Vec<&AnalysisRecord> = v
            .iter()
            .rev()
            .filter(|r| r.kind == kind && r.requester_id == requester_id)
            .collect();
        let total = mine.len();
        let items = mine
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect();
        Ok((items, total))
    }

    async fn get(&self, id: Uuid) -> Result<Option<AnalysisRecord>, PersistenceError> {
        Ok(self.inner.read().iter().find(|r| r.id == id).cloned())
    }
}
