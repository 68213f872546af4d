//! One-time codes for transactions the policy sends to step-up.
//!
//! A challenge is keyed by the analysis that raised it and bound to the
//! requester. Only a SHA-256 digest of the code is kept; a code is single
//! use, expires after the configured TTL and is burned after too many wrong
//! guesses. Delivery is pluggable through [`OtpDelivery`].

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use metrics::counter;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::OtpSettings;
use crate::pipeline::anon_hash;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OtpError {
    /// Unknown, expired, foreign, exhausted or wrong. Callers cannot tell
    /// which.
    #[error("invalid or expired OTP")]
    Rejected,
}

/// Sends the code to the requester out of band.
pub trait OtpDelivery: Send + Sync {
    fn deliver(&self, requester_id: &str, analysis_id: Uuid, code: &str);
}

/// Records that a code was issued. The code itself is never logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDelivery;

impl OtpDelivery for LogDelivery {
    fn deliver(&self, requester_id: &str, analysis_id: Uuid, _code: &str) {
        info!(
            requester = %anon_hash(requester_id),
            analysis_id = %analysis_id,
            "step-up code issued; no delivery channel configured"
        );
    }
}

/// What the client learns about a pending challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OtpChallenge {
    pub analysis_id: Uuid,
    pub expires_in_secs: u64,
}

struct Pending {
    requester_id: String,
    digest: [u8; 32],
    expires_at: Instant,
    attempts_left: u32,
}

fn digest(analysis_id: Uuid, code: &str) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(analysis_id.as_bytes());
    h.update(code.trim().as_bytes());
    h.finalize().into()
}

pub struct OtpStore {
    cfg: OtpSettings,
    pending: Mutex<LruCache<Uuid, Pending>>,
    delivery: Arc<dyn OtpDelivery>,
}

impl OtpStore {
    pub fn new(cfg: OtpSettings, delivery: Arc<dyn OtpDelivery>) -> Self {
        let cap = NonZeroUsize::new(cfg.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cfg,
            pending: Mutex::new(LruCache::new(cap)),
            delivery,
        }
    }

    /// Issue (or reissue) the code for `analysis_id` and hand it to delivery.
    pub fn issue(&self, requester_id: &str, analysis_id: Uuid) -> OtpChallenge {
        let code = format!("{:06}", rand::rng().random_range(100_000..1_000_000u32));
        let ttl = self.cfg.ttl();
        self.pending.lock().put(
            analysis_id,
            Pending {
                requester_id: requester_id.to_string(),
                digest: digest(analysis_id, &code),
                expires_at: Instant::now() + ttl,
                attempts_left: self.cfg.max_attempts,
            },
        );
        counter!("otp_issued_total").increment(1);
        self.delivery.deliver(requester_id, analysis_id, &code);
        OtpChallenge {
            analysis_id,
            expires_in_secs: ttl.as_secs(),
        }
    }

    /// Consume the challenge when `code` matches.
    pub fn verify(&self, requester_id: &str, analysis_id: Uuid, code: &str) -> Result<(), OtpError> {
        let mut pending = self.pending.lock();
        let outcome = match pending.get_mut(&analysis_id) {
            None => Err("no challenge"),
            Some(p) if p.requester_id != requester_id => Err("requester mismatch"),
            Some(p) if Instant::now() >= p.expires_at => {
                pending.pop(&analysis_id);
                Err("expired")
            }
            Some(p) if p.digest == digest(analysis_id, code) => {
                pending.pop(&analysis_id);
                Ok(())
            }
            Some(p) => {
                p.attempts_left = p.attempts_left.saturating_sub(1);
                if p.attempts_left == 0 {
                    pending.pop(&analysis_id);
                }
                Err("wrong code")
            }
        };
        drop(pending);

        match outcome {
            Ok(()) => {
                counter!("otp_verifications_total", "outcome" => "verified").increment(1);
                Ok(())
            }
            Err(reason) => {
                counter!("otp_verifications_total", "outcome" => "rejected").increment(1);
                debug!(analysis_id = %analysis_id, reason, "step-up code rejected");
                Err(OtpError::Rejected)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keeps the last issued code in memory, for local runs and tests.
#[derive(Debug, Default)]
pub struct CapturedDelivery {
    last: Mutex<Option<(Uuid, String)>>,
}

impl CapturedDelivery {
    pub fn code_for(&self, analysis_id: Uuid) -> Option<String> {
        self.last
            .lock()
            .as_ref()
            .filter(|(id, _)| *id == analysis_id)
            .map(|(_, code)| code.clone())
    }
}

impl OtpDelivery for CapturedDelivery {
    fn deliver(&self, _requester_id: &str, analysis_id: Uuid, code: &str) {
        *self.last.lock() = Some((analysis_id, code.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn store(max_attempts: u32) -> (OtpStore, Arc<CapturedDelivery>) {
        let sink = Arc::new(CapturedDelivery::default());
        let cfg = OtpSettings {
            ttl_secs: 600,
            max_attempts,
            capacity: 4,
        };
        (OtpStore::new(cfg, sink.clone()), sink)
    }

    #[tokio::test]
    async fn code_is_six_digits_and_single_use() {
        let (otp, sink) = store(3);
        let id = Uuid::new_v4();
        let challenge = otp.issue("payer", id);
        assert_eq!(challenge.expires_in_secs, 600);
        let code = sink.code_for(id).unwrap();
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));

        assert_eq!(otp.verify("payer", id, &code), Ok(()));
        assert_eq!(otp.verify("payer", id, &code), Err(OtpError::Rejected));
        assert!(otp.is_empty());
    }

    #[tokio::test]
    async fn another_requester_cannot_use_the_code() {
        let (otp, sink) = store(3);
        let id = Uuid::new_v4();
        otp.issue("payer", id);
        let code = sink.code_for(id).unwrap();
        assert_eq!(otp.verify("intruder", id, &code), Err(OtpError::Rejected));
        assert_eq!(otp.verify("payer", id, &code), Ok(()));
    }

    #[tokio::test]
    async fn wrong_guesses_burn_the_challenge() {
        let (otp, sink) = store(2);
        let id = Uuid::new_v4();
        otp.issue("payer", id);
        let code = sink.code_for(id).unwrap();
        let wrong = if code == "000000" { "111111" } else { "000000" };
        assert!(otp.verify("payer", id, wrong).is_err());
        assert!(otp.verify("payer", id, wrong).is_err());
        assert_eq!(otp.verify("payer", id, &code), Err(OtpError::Rejected));
    }

    #[tokio::test(start_paused = true)]
    async fn code_expires_after_ttl() {
        let (otp, sink) = store(3);
        let id = Uuid::new_v4();
        otp.issue("payer", id);
        let code = sink.code_for(id).unwrap();
        tokio::time::advance(Duration::from_secs(601)).await;
        assert_eq!(otp.verify("payer", id, &code), Err(OtpError::Rejected));
        assert!(otp.is_empty());
    }

    #[tokio::test]
    async fn reissue_replaces_the_previous_code() {
        let (otp, sink) = store(3);
        let id = Uuid::new_v4();
        otp.issue("payer", id);
        let first = sink.code_for(id).unwrap();
        otp.issue("payer", id);
        let second = sink.code_for(id).unwrap();
        if first != second {
            assert!(otp.verify("payer", id, &first).is_err());
        }
        assert_eq!(otp.verify("payer", id, &second), Ok(()));
    }
}
