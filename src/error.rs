//! Service error taxonomy and its HTTP mapping.
//!
//! Every failure that reaches a client is rendered as `{detail, code}` with a
//! stable snake_case `code`. Internal causes are logged, never echoed back.

use std::time::Duration;

use axum::{
    extract::rejection::JsonRejection,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::history::PersistenceError;
use crate::otp::OtpError;

pub type RiskResult<T> = Result<T, RiskError>;

#[derive(Debug, thiserror::Error)]
pub enum RiskError {
    /// Payload violates a shape constraint (size, parse, codec).
    #[error("{0}")]
    MalformedInput(String),

    /// Payload is well-formed but semantically unusable.
    #[error("{0}")]
    InvalidInput(String),

    #[error("rate limit exceeded for {endpoint}; retry after {}s", retry_after_secs(.retry_after))]
    RateLimitExceeded {
        endpoint: String,
        retry_after: Duration,
    },

    /// A scorer failed, timed out or produced an unusable result.
    #[error("scoring unavailable: {0}")]
    ScoringUnavailable(String),

    #[error("missing or invalid bearer token")]
    Unauthorized,

    #[error("insufficient permission: {0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    OtpRejected(OtpError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RiskError {
    pub fn code(&self) -> &'static str {
        match self {
            RiskError::MalformedInput(_) => "malformed_input",
            RiskError::InvalidInput(_) => "invalid_input",
            RiskError::RateLimitExceeded { .. } => "rate_limited",
            RiskError::ScoringUnavailable(_) => "scoring_unavailable",
            RiskError::Unauthorized => "unauthorized",
            RiskError::Forbidden(_) => "forbidden",
            RiskError::NotFound(_) => "not_found",
            RiskError::OtpRejected(_) => "otp_invalid",
            RiskError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            RiskError::MalformedInput(_) | RiskError::OtpRejected(_) => StatusCode::BAD_REQUEST,
            RiskError::InvalidInput(_) => StatusCode::UNPROCESSABLE_ENTITY,
            RiskError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            RiskError::ScoringUnavailable(_) | RiskError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            RiskError::Unauthorized => StatusCode::UNAUTHORIZED,
            RiskError::Forbidden(_) => StatusCode::FORBIDDEN,
            RiskError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    /// Detail text safe to show to the caller.
    fn public_detail(&self) -> String {
        match self {
            RiskError::ScoringUnavailable(_) => {
                "risk scoring is temporarily unavailable; the request was not scored".to_string()
            }
            RiskError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

fn retry_after_secs(d: &Duration) -> u64 {
    // Retry-After is whole seconds; never advertise 0.
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    secs.max(1)
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub detail: String,
    pub code: &'static str,
}

impl IntoResponse for RiskError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            RiskError::ScoringUnavailable(cause) => {
                tracing::error!(cause = %cause, "scoring unavailable");
            }
            RiskError::Internal(cause) => {
                tracing::error!(cause = %cause, "internal error");
            }
            RiskError::RateLimitExceeded { endpoint, .. } => {
                tracing::debug!(endpoint = %endpoint, "request rejected by rate limiter");
            }
            _ => {}
        }

        let body = Json(ErrorBody {
            detail: self.public_detail(),
            code: self.code(),
        });
        let mut resp = (status, body).into_response();

        if let RiskError::RateLimitExceeded { retry_after, .. } = &self {
            let secs = retry_after_secs(retry_after);
            if let Ok(v) = HeaderValue::from_str(&secs.to_string()) {
                resp.headers_mut().insert(header::RETRY_AFTER, v);
            }
        }
        resp
    }
}

impl From<JsonRejection> for RiskError {
    fn from(rej: JsonRejection) -> Self {
        match rej {
            // Syntactically valid JSON that does not fit the payload type.
            JsonRejection::JsonDataError(e) => RiskError::InvalidInput(e.body_text()),
            other => RiskError::MalformedInput(other.body_text()),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for RiskError {
    fn from(_: jsonwebtoken::errors::Error) -> Self {
        RiskError::Unauthorized
    }
}

/// History reads that fail surface as 500; writes never reach the client.
impl From<PersistenceError> for RiskError {
    fn from(e: PersistenceError) -> Self {
        RiskError::Internal(e.to_string())
    }
}

impl From<OtpError> for RiskError {
    fn from(e: OtpError) -> Self {
        RiskError::OtpRejected(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_statuses_line_up() {
        let cases = [
            (RiskError::MalformedInput("x".into()), 400, "malformed_input"),
            (RiskError::InvalidInput("x".into()), 422, "invalid_input"),
            (
                RiskError::RateLimitExceeded {
                    endpoint: "text".into(),
                    retry_after: Duration::from_secs(3),
                },
                429,
                "rate_limited",
            ),
            (RiskError::ScoringUnavailable("x".into()), 500, "scoring_unavailable"),
            (RiskError::Unauthorized, 401, "unauthorized"),
            (RiskError::Forbidden("history".into()), 403, "forbidden"),
            (RiskError::NotFound("x".into()), 404, "not_found"),
            (RiskError::OtpRejected(OtpError::Rejected), 400, "otp_invalid"),
            (RiskError::Internal("x".into()), 500, "internal_error"),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.status().as_u16(), status, "{code}");
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn rate_limited_response_carries_retry_after() {
        let resp = RiskError::RateLimitExceeded {
            endpoint: "url".into(),
            retry_after: Duration::from_millis(12_300),
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            resp.headers().get(header::RETRY_AFTER).unwrap(),
            &HeaderValue::from_static("13")
        );
    }

    #[test]
    fn internal_causes_are_not_leaked() {
        let err = RiskError::ScoringUnavailable("model socket reset at 10.0.0.7".into());
        assert!(!err.public_detail().contains("10.0.0.7"));
        let err = RiskError::Internal("pool exhausted".into());
        assert_eq!(err.public_detail(), "internal server error");
    }

    #[test]
    fn history_read_failure_is_an_opaque_500() {
        let err = RiskError::from(PersistenceError::Unavailable("replica lag".into()));
        assert_eq!(err.code(), "internal_error");
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.public_detail().contains("replica"));
    }

    #[test]
    fn sub_second_retry_rounds_up_to_one() {
        assert_eq!(retry_after_secs(&Duration::from_millis(10)), 1);
        assert_eq!(retry_after_secs(&Duration::ZERO), 1);
        assert_eq!(retry_after_secs(&Duration::from_secs(60)), 60);
    }
}
