// src/encode/vishing.rs
//! Voice-call encoder: acoustic statistics from the recording plus social
//! engineering markers from the transcript.

use once_cell::sync::Lazy;
use regex::Regex;

use super::audio;
use super::{count_matches, word_count};
use crate::config::InputLimits;
use crate::error::{RiskError, RiskResult};
use crate::features::FeatureVector;
use crate::request::{AnalysisKind, VishingPayload};

/// Values clients send when they have no transcript.
const PLACEHOLDERS: &[&str] = &["string", "none", "null", "no transcript provided"];

fn marker(pattern: &str) -> Regex {
    Regex::new(pattern).expect("marker regex")
}

static URGENCY: Lazy<Regex> = Lazy::new(|| {
    marker(r"(?i)\b(?:immediately|urgent(?:ly)?|right now|right away|today itself|last chance|within \d+ (?:minutes?|hours?)|before it expires|expire[sd]?)\b")
});

static THREAT: Lazy<Regex> = Lazy::new(|| {
    marker(r"(?i)\b(?:arrest(?:ed)?|police|legal action|warrant|jail|court|case (?:registered|filed)|block(?:ed)?|suspend(?:ed)?|freez(?:e|ing)|frozen|penalty|fir)\b")
});

static IMPERSONATION: Lazy<Regex> = Lazy::new(|| {
    marker(r"(?i)\b(?:(?:calling|speaking|this is \w+) from (?:the )?(?:bank|rbi|reserve bank|police|customs|income tax|cbi|trai|telecom|customer care|head office)|bank (?:manager|officer|official)|rbi|reserve bank|cyber ?cell|income tax department|customs department|customer care executive)\b")
});

static INFO_REQUEST: Lazy<Regex> = Lazy::new(|| {
    marker(r"(?i)\b(?:otp|one time password|pin|cvv|password|card number|account number|aadhaar|pan (?:card|number)|verification code|date of birth|expiry date)\b")
});

static PAYMENT: Lazy<Regex> = Lazy::new(|| {
    marker(r"(?i)\b(?:pay(?:ment)?|transfer|send (?:the )?(?:money|amount)|deposit|processing fee|fine of|gift cards?|upi|refundable fee)\b")
});

static ACTION: Lazy<Regex> = Lazy::new(|| {
    marker(r"(?i)\b(?:press \d|dial|click (?:the|on)|download|install|anydesk|teamviewer|quick ?support|screen ?share|read (?:out|me)|tell me|share (?:the|your))\b")
});

/// `None` for blank input and known placeholder values.
pub fn usable_transcript(raw: Option<&str>) -> Option<&str> {
    let t = raw?.trim();
    if t.is_empty() || PLACEHOLDERS.contains(&t.to_ascii_lowercase().as_str()) {
        None
    } else {
        Some(t)
    }
}

pub fn encode(p: &VishingPayload, limits: &InputLimits) -> RiskResult<FeatureVector> {
    let transcript = usable_transcript(p.transcript.as_deref());
    if p.audio.is_none() && transcript.is_none() {
        return Err(RiskError::InvalidInput(
            "provide an audio recording or a transcript".into(),
        ));
    }
    if let Some(t) = transcript {
        if t.chars().count() > limits.max_text_chars {
            return Err(RiskError::MalformedInput(format!(
                "transcript exceeds {} characters",
                limits.max_text_chars
            )));
        }
    }
    let acoustic = p
        .audio
        .as_ref()
        .map(|clip| audio::analyze(clip, limits))
        .transpose()?;

    let mut fv = FeatureVector::new(AnalysisKind::Vishing);
    fv.set_flag("has_audio", acoustic.is_some())?;
    fv.set_flag("has_transcript", transcript.is_some())?;

    if let Some(a) = &acoustic {
        fv.set_continuous("duration_secs", a.duration_secs)?;
        fv.set_continuous("rms_energy", a.rms_energy)?;
        fv.set_continuous("energy_variance", a.energy_variance)?;
        fv.set_continuous("zero_crossing_rate", a.zero_crossing_rate)?;
        fv.set_continuous("silence_ratio", a.silence_ratio)?;
    }

    if let Some(t) = transcript {
        let words = word_count(t);
        fv.set_continuous("word_count", words as f64)?;
        fv.set_continuous("urgency_hits", count_matches(&URGENCY, t) as f64)?;
        fv.set_continuous("threat_hits", count_matches(&THREAT, t) as f64)?;
        fv.set_continuous("impersonation_hits", count_matches(&IMPERSONATION, t) as f64)?;
        fv.set_continuous("info_request_hits", count_matches(&INFO_REQUEST, t) as f64)?;
        fv.set_continuous("payment_demand_hits", count_matches(&PAYMENT, t) as f64)?;
        fv.set_continuous("action_command_hits", count_matches(&ACTION, t) as f64)?;
        if let Some(a) = acoustic.as_ref().filter(|a| a.duration_secs > 0.0) {
            fv.set_continuous("speech_rate", words as f64 / a.duration_secs)?;
        }
    }

    if let Some(opinion) = p.user_opinion {
        fv.set_category("user_opinion", opinion.as_str())?;
    }
    Ok(fv)
}
