//! Inbound analysis requests: one strongly typed payload per analysis kind.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The five things the service knows how to score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisKind {
    Text,
    Url,
    Transaction,
    Vishing,
    CustomerCare,
}

impl AnalysisKind {
    pub const ALL: [AnalysisKind; 5] = [
        AnalysisKind::Text,
        AnalysisKind::Url,
        AnalysisKind::Transaction,
        AnalysisKind::Vishing,
        AnalysisKind::CustomerCare,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisKind::Text => "text",
            AnalysisKind::Url => "url",
            AnalysisKind::Transaction => "transaction",
            AnalysisKind::Vishing => "vishing",
            AnalysisKind::CustomerCare => "customer_care",
        }
    }
}

impl fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const UNKNOWN_IP: &str = "unknown";

/// Who is asking. Built from the bearer token and request headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub user_id: String,
    /// Client IP: the socket peer, or the first forwarded hop behind a
    /// trusted proxy. [`UNKNOWN_IP`] when neither is available.
    pub ip: String,
    pub device_id: Option<String>,
}

impl Requester {
    pub fn new(user_id: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ip: ip.into(),
            device_id: None,
        }
    }

    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextPayload {
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UrlPayload {
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionType {
    P2P,
    P2M,
}

impl TransactionType {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionType::P2P => "P2P",
            TransactionType::P2M => "P2M",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentMethod {
    Upi,
    Card,
    Qr,
    Netbanking,
    Wallet,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Upi => "UPI",
            PaymentMethod::Card => "CARD",
            PaymentMethod::Qr => "QR",
            PaymentMethod::Netbanking => "NETBANKING",
            PaymentMethod::Wallet => "WALLET",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransactionPayload {
    pub amount: f64,
    pub transaction_type: TransactionType,
    pub payment_method: PaymentMethod,
    pub recipient_upi_id: String,
}

/// The caller's own read of the call. Context, never ground truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserOpinion {
    ConfirmSuspicious,
    InsufficientEvidence,
}

impl UserOpinion {
    pub fn as_str(self) -> &'static str {
        match self {
            UserOpinion::ConfirmSuspicious => "confirm_suspicious",
            UserOpinion::InsufficientEvidence => "insufficient_evidence",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "confirm_suspicious" => Some(UserOpinion::ConfirmSuspicious),
            "insufficient_evidence" => Some(UserOpinion::InsufficientEvidence),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AudioClip {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct VishingPayload {
    pub audio: Option<AudioClip>,
    pub transcript: Option<String>,
    pub user_opinion: Option<UserOpinion>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CustomerCarePayload {
    pub company_name: String,
    pub phone_number: String,
}

/// Tagged union of every payload shape. The kind is derived from the tag.
#[derive(Debug, Clone)]
pub enum Payload {
    Text(TextPayload),
    Url(UrlPayload),
    Transaction(TransactionPayload),
    Vishing(VishingPayload),
    CustomerCare(CustomerCarePayload),
}

impl Payload {
    pub fn kind(&self) -> AnalysisKind {
        match self {
            Payload::Text(_) => AnalysisKind::Text,
            Payload::Url(_) => AnalysisKind::Url,
            Payload::Transaction(_) => AnalysisKind::Transaction,
            Payload::Vishing(_) => AnalysisKind::Vishing,
            Payload::CustomerCare(_) => AnalysisKind::CustomerCare,
        }
    }
}

/// Immutable once created.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    id: Uuid,
    requester: Requester,
    payload: Payload,
    submitted_at: DateTime<Utc>,
}

impl AnalysisRequest {
    pub fn new(requester: Requester, payload: Payload) -> Self {
        Self::at(requester, payload, Utc::now())
    }

    pub fn at(requester: Requester, payload: Payload, submitted_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            requester,
            payload,
            submitted_at,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> AnalysisKind {
        self.payload.kind()
    }

    pub fn requester(&self) -> &Requester {
        &self.requester
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }
}
