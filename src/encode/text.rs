// src/encode/text.rs
//! Message text encoder. Purely lexical; never touches the network.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{count_matches, word_count};
use crate::config::InputLimits;
use crate::error::{RiskError, RiskResult};
use crate::features::{FeatureVector, Ternary};
use crate::request::{AnalysisKind, TextPayload};

/// Phrases typical of phishing and scam messages; each counts once.
pub const SCAM_KEYWORDS: &[&str] = &[
    "urgent",
    "click here",
    "verify now",
    "suspend",
    "confirm",
    "password",
    "login",
    "account",
    "security",
    "winner",
    "congratulations",
    "limited time",
    "act now",
    "free",
    "prize",
    "lottery",
    "bank",
    "paypal",
    "amazon",
    "microsoft",
    "apple",
    "virus",
    "malware",
    "infected",
    "update required",
    "expired",
    "locked",
];

static URGENCY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:urgent(?:ly)?|immediately|right now|act now|asap|hurry|last chance|limited time|expires? (?:today|soon)|within \d+ (?:hours?|minutes?|mins?))\b",
    )
    .expect("urgency regex")
});

static MONEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:₹|\brs\.?|\binr|\$)\s?\d[\d,]*|\b(?:lottery|prize|reward|cash ?back|refund|jackpot|gift card|bitcoin|crypto|won)\b",
    )
    .expect("money regex")
});

static THREAT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:suspend(?:ed)?|block(?:ed)?|locked|legal action|arrest(?:ed)?|police|penalty|terminat(?:e|ed)|deactivat(?:e|ed)|frozen|disconnect(?:ed)?)\b",
    )
    .expect("threat regex")
});

static CREDENTIAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:password|passcode|pin|otp|one[- ]time password|cvv|card number|account number|login details|credentials|aadhaar|pan card)\b",
    )
    .expect("credential regex")
});

static LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:https?://|\bwww\.)\S+").expect("link regex"));

fn is_invisible(c: char) -> bool {
    matches!(c, '\u{200B}'..='\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2060}' | '\u{FEFF}')
}

#[derive(PartialEq)]
enum Script {
    Latin,
    Cyrillic,
    Greek,
    Other,
}

fn script(c: char) -> Script {
    match c {
        'a'..='z' | 'A'..='Z' | '\u{00C0}'..='\u{024F}' => Script::Latin,
        '\u{0400}'..='\u{04FF}' => Script::Cyrillic,
        '\u{0370}'..='\u{03FF}' => Script::Greek,
        _ => Script::Other,
    }
}

/// Invisible formatting characters, or a single word mixing Latin letters
/// with Cyrillic/Greek lookalikes ("pаypal" with a Cyrillic а).
pub fn charset_anomaly(text: &str) -> bool {
    if text.chars().any(is_invisible) {
        return true;
    }
    text.split_whitespace().any(|word| {
        let latin = word.chars().any(|c| script(c) == Script::Latin);
        let lookalike = word
            .chars()
            .any(|c| matches!(script(c), Script::Cyrillic | Script::Greek));
        latin && lookalike
    })
}

pub fn keyword_hits(text: &str) -> usize {
    let lower = text.to_lowercase();
    SCAM_KEYWORDS.iter().filter(|k| lower.contains(*k)).count()
}

fn caps_ratio(text: &str) -> f64 {
    let (upper, letters) = text
        .chars()
        .filter(|c| c.is_alphabetic())
        .fold((0usize, 0usize), |(u, l), c| {
            (u + usize::from(c.is_uppercase()), l + 1)
        });
    if letters == 0 {
        0.0
    } else {
        upper as f64 / letters as f64
    }
}

pub fn encode(p: &TextPayload, limits: &InputLimits) -> RiskResult<FeatureVector> {
    let text = p.text.as_str();
    if text.trim().is_empty() {
        return Err(RiskError::InvalidInput("text must not be empty".into()));
    }
    let chars = text.chars().count();
    if chars > limits.max_text_chars {
        return Err(RiskError::MalformedInput(format!(
            "text exceeds {} characters",
            limits.max_text_chars
        )));
    }

    let words = word_count(text);
    let links = count_matches(&LINK, text);
    let mut fv = FeatureVector::new(AnalysisKind::Text);
    fv.set_continuous("char_count", chars as f64)?;
    fv.set_continuous("word_count", words as f64)?;
    fv.set_continuous("keyword_hits", keyword_hits(text) as f64)?;
    fv.set_continuous("urgency_hits", count_matches(&URGENCY, text) as f64)?;
    fv.set_continuous("money_terms", count_matches(&MONEY, text) as f64)?;
    fv.set_continuous("threat_terms", count_matches(&THREAT, text) as f64)?;
    fv.set_ternary(
        "credential_request",
        Ternary::from_bool(CREDENTIAL.is_match(text)),
    )?;
    fv.set_continuous("link_count", links as f64)?;
    fv.set_continuous(
        "link_density",
        if words == 0 {
            0.0
        } else {
            links as f64 * 100.0 / words as f64
        },
    )?;
    fv.set_continuous("caps_ratio", caps_ratio(text))?;
    fv.set_continuous("exclamations", text.matches('!').count() as f64)?;
    fv.set_ternary("charset_anomaly", Ternary::from_bool(charset_anomaly(text)))?;
    Ok(fv)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(text: &str) -> RiskResult<FeatureVector> {
        encode(&TextPayload { text: text.into() }, &InputLimits::default())
    }

    #[test]
    fn scam_message_lights_up_markers() {
        let fv = enc(
            "URGENT! Your bank account will be suspended. Verify now at http://sbi-kyc.tk/login \
             and share your OTP to claim Rs 5,000 refund!!",
        )
        .unwrap();
        assert!(fv.continuous("keyword_hits").unwrap() >= 5.0);
        assert!(fv.continuous("urgency_hits").unwrap() >= 1.0);
        assert!(fv.continuous("money_terms").unwrap() >= 1.0);
        assert!(fv.continuous("threat_terms").unwrap() >= 1.0);
        assert_eq!(fv.continuous("link_count"), Some(1.0));
        assert_eq!(fv.continuous("exclamations"), Some(3.0));
        assert_eq!(fv.ternary("credential_request"), Ternary::Present);
        assert_eq!(fv.ternary("charset_anomaly"), Ternary::Absent);
        assert_eq!(fv.unknown_count(), 0);
    }

    #[test]
    fn ordinary_message_is_quiet() {
        let fv = enc("See you at lunch tomorrow, bring the slides.").unwrap();
        assert_eq!(fv.continuous("keyword_hits"), Some(0.0));
        assert_eq!(fv.continuous("link_density"), Some(0.0));
        assert_eq!(fv.ternary("credential_request"), Ternary::Absent);
    }

    #[test]
    fn homoglyphs_and_invisible_characters() {
        assert!(charset_anomaly("log in to p\u{0430}ypal"));
        assert!(charset_anomaly("hello\u{200B}world"));
        assert!(!charset_anomaly("привет друг"));
        assert!(!charset_anomaly("plain ascii"));
    }

    #[test]
    fn blank_and_oversized_text_are_rejected() {
        assert!(matches!(enc("  \n "), Err(RiskError::InvalidInput(_))));
        let long = "a".repeat(5001);
        assert!(matches!(enc(&long), Err(RiskError::MalformedInput(_))));
        assert!(enc(&"a".repeat(5000)).is_ok());
    }
}
