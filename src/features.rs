//! Fixed-shape feature vectors.
//!
//! Each analysis kind declares its features up front ([`schema_for`]). A new
//! [`FeatureVector`] is pre-filled with the unknown sentinel for every declared
//! feature, so encoders can only *refine* values and a scorer always sees the
//! full shape. The `-1 / 0 / 1` ternary encoding exists only on the wire.

use std::fmt;

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

use crate::request::AnalysisKind;

/// Three-state indicator. `Present` always means "the risk indicator named by
/// the feature holds".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ternary {
    Unknown,
    Absent,
    Present,
}

impl Ternary {
    pub fn from_bool(present: bool) -> Self {
        if present {
            Ternary::Present
        } else {
            Ternary::Absent
        }
    }

    pub fn from_option(v: Option<bool>) -> Self {
        v.map_or(Ternary::Unknown, Ternary::from_bool)
    }

    /// Wire encoding: unknown = -1, absent = 0, present = 1.
    pub fn wire(self) -> i8 {
        match self {
            Ternary::Unknown => -1,
            Ternary::Absent => 0,
            Ternary::Present => 1,
        }
    }

    pub fn is_known(self) -> bool {
        self != Ternary::Unknown
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            Ternary::Unknown => None,
            Ternary::Absent => Some(false),
            Ternary::Present => Some(true),
        }
    }
}

impl Serialize for Ternary {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i8(self.wire())
    }
}

/// Declared type of a feature slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Ternary,
    Continuous,
    Flag,
    Category,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeatureValue {
    Ternary(Ternary),
    Continuous(f64),
    Flag(bool),
    Category(String),
    /// Continuous, flag or categorical value that could not be determined.
    Unknown,
}

impl FeatureValue {
    fn fits(&self, slot: Slot) -> bool {
        matches!(
            (self, slot),
            (FeatureValue::Ternary(_), Slot::Ternary)
                | (FeatureValue::Continuous(_), Slot::Continuous)
                | (FeatureValue::Flag(_), Slot::Flag)
                | (FeatureValue::Category(_), Slot::Category)
                | (FeatureValue::Unknown, Slot::Continuous | Slot::Flag | Slot::Category)
        )
    }

    fn sentinel(slot: Slot) -> Self {
        match slot {
            Slot::Ternary => FeatureValue::Ternary(Ternary::Unknown),
            _ => FeatureValue::Unknown,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(
            self,
            FeatureValue::Unknown | FeatureValue::Ternary(Ternary::Unknown)
        )
    }
}

impl Serialize for FeatureValue {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            FeatureValue::Ternary(t) => t.serialize(s),
            FeatureValue::Continuous(v) => s.serialize_f64(*v),
            FeatureValue::Flag(b) => s.serialize_bool(*b),
            FeatureValue::Category(c) => s.serialize_str(c),
            FeatureValue::Unknown => s.serialize_i8(-1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FeatureError {
    #[error("feature '{name}' is not declared for {kind}")]
    Undeclared { kind: AnalysisKind, name: String },
    #[error("feature '{name}' expects a {expected:?} value")]
    SlotMismatch { name: String, expected: Slot },
    #[error("feature '{name}' must be finite")]
    NonFinite { name: String },
}

pub type Schema = &'static [(&'static str, Slot)];

pub const TEXT_SCHEMA: Schema = &[
    ("char_count", Slot::Continuous),
    ("word_count", Slot::Continuous),
    ("keyword_hits", Slot::Continuous),
    ("urgency_hits", Slot::Continuous),
    ("money_terms", Slot::Continuous),
    ("threat_terms", Slot::Continuous),
    ("credential_request", Slot::Ternary),
    ("link_count", Slot::Continuous),
    ("link_density", Slot::Continuous),
    ("caps_ratio", Slot::Continuous),
    ("exclamations", Slot::Continuous),
    ("charset_anomaly", Slot::Ternary),
];

pub const URL_SCHEMA: Schema = &[
    ("host", Slot::Category),
    ("ip_literal", Slot::Ternary),
    ("long_url", Slot::Ternary),
    ("shortener", Slot::Ternary),
    ("at_symbol", Slot::Ternary),
    ("double_slash_redirect", Slot::Ternary),
    ("prefix_suffix", Slot::Ternary),
    ("deep_subdomain", Slot::Ternary),
    ("free_tld", Slot::Ternary),
    ("no_https", Slot::Ternary),
    ("suspicious_words", Slot::Ternary),
    ("young_domain", Slot::Ternary),
    ("short_registration", Slot::Ternary),
    ("invalid_tls", Slot::Ternary),
    ("missing_dns", Slot::Ternary),
    ("low_traffic", Slot::Ternary),
    ("blacklisted", Slot::Ternary),
    ("abnormal_registration", Slot::Ternary),
    ("hidden_iframe", Slot::Ternary),
    ("external_favicon", Slot::Ternary),
    ("foreign_form_handler", Slot::Ternary),
    ("excessive_redirects", Slot::Ternary),
    ("url_length", Slot::Continuous),
    ("subdomain_depth", Slot::Continuous),
    ("domain_age_days", Slot::Continuous),
    ("registration_days_left", Slot::Continuous),
    ("traffic_rank", Slot::Continuous),
    ("reputation_detections", Slot::Continuous),
    ("registration_abnormality", Slot::Continuous),
    ("redirect_count", Slot::Continuous),
];

pub const TRANSACTION_SCHEMA: Schema = &[
    ("amount", Slot::Continuous),
    ("transaction_type", Slot::Category),
    ("payment_method", Slot::Category),
    ("recipient_vpa", Slot::Category),
    ("day_of_week", Slot::Continuous),
    ("hour", Slot::Continuous),
    ("minute", Slot::Continuous),
    ("is_night", Slot::Flag),
    ("amount_bin", Slot::Continuous),
    ("device_id", Slot::Category),
    ("country", Slot::Category),
    ("city", Slot::Category),
    ("latitude", Slot::Continuous),
    ("longitude", Slot::Continuous),
    ("history_len", Slot::Continuous),
    ("device_txn_10m", Slot::Continuous),
    ("requester_txn_1h", Slot::Continuous),
    ("amount_zscore", Slot::Continuous),
    ("amount_outlier", Slot::Ternary),
    ("amount_percentile", Slot::Continuous),
    ("distance_from_last_km", Slot::Continuous),
    ("new_device", Slot::Ternary),
    ("new_recipient", Slot::Ternary),
];

pub const VISHING_SCHEMA: Schema = &[
    ("has_audio", Slot::Flag),
    ("has_transcript", Slot::Flag),
    ("duration_secs", Slot::Continuous),
    ("rms_energy", Slot::Continuous),
    ("energy_variance", Slot::Continuous),
    ("zero_crossing_rate", Slot::Continuous),
    ("silence_ratio", Slot::Continuous),
    ("speech_rate", Slot::Continuous),
    ("word_count", Slot::Continuous),
    ("urgency_hits", Slot::Continuous),
    ("threat_hits", Slot::Continuous),
    ("impersonation_hits", Slot::Continuous),
    ("info_request_hits", Slot::Continuous),
    ("payment_demand_hits", Slot::Continuous),
    ("action_command_hits", Slot::Continuous),
    ("user_opinion", Slot::Category),
];

pub const CUSTOMER_CARE_SCHEMA: Schema = &[
    ("company_name", Slot::Category),
    ("normalized_number", Slot::Category),
    ("number_type", Slot::Category),
    ("toll_free", Slot::Flag),
    ("mobile", Slot::Flag),
    ("landline", Slot::Flag),
    ("digit_count", Slot::Continuous),
    ("irregular_length", Slot::Ternary),
    ("number_unlisted", Slot::Ternary),
    ("match_kind", Slot::Category),
    ("match_confidence", Slot::Continuous),
    ("listed_numbers", Slot::Continuous),
];

pub fn schema_for(kind: AnalysisKind) -> Schema {
    match kind {
        AnalysisKind::Text => TEXT_SCHEMA,
        AnalysisKind::Url => URL_SCHEMA,
        AnalysisKind::Transaction => TRANSACTION_SCHEMA,
        AnalysisKind::Vishing => VISHING_SCHEMA,
        AnalysisKind::CustomerCare => CUSTOMER_CARE_SCHEMA,
    }
}

/// Kind-tagged, ordered feature map whose shape never varies per kind.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    kind: AnalysisKind,
    values: Vec<(&'static str, FeatureValue)>,
}

impl FeatureVector {
    pub fn new(kind: AnalysisKind) -> Self {
        let values = schema_for(kind)
            .iter()
            .map(|(name, slot)| (*name, FeatureValue::sentinel(*slot)))
            .collect();
        Self { kind, values }
    }

    pub fn kind(&self) -> AnalysisKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &FeatureValue)> {
        self.values.iter().map(|(n, v)| (*n, v))
    }

    pub fn set(&mut self, name: &str, value: FeatureValue) -> Result<(), FeatureError> {
        let slot = schema_for(self.kind)
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, s)| *s)
            .ok_or_else(|| FeatureError::Undeclared {
                kind: self.kind,
                name: name.to_string(),
            })?;
        if !value.fits(slot) {
            return Err(FeatureError::SlotMismatch {
                name: name.to_string(),
                expected: slot,
            });
        }
        if let FeatureValue::Continuous(v) = value {
            if !v.is_finite() {
                return Err(FeatureError::NonFinite {
                    name: name.to_string(),
                });
            }
        }
        if let Some(entry) = self.values.iter_mut().find(|(n, _)| *n == name) {
            entry.1 = value;
        }
        Ok(())
    }

    pub fn set_ternary(&mut self, name: &str, t: Ternary) -> Result<(), FeatureError> {
        self.set(name, FeatureValue::Ternary(t))
    }

    pub fn set_continuous(&mut self, name: &str, v: f64) -> Result<(), FeatureError> {
        self.set(name, FeatureValue::Continuous(v))
    }

    /// `None` leaves the slot at its unknown sentinel.
    pub fn set_maybe(&mut self, name: &str, v: Option<f64>) -> Result<(), FeatureError> {
        match v {
            Some(v) => self.set_continuous(name, v),
            None => self.set(name, FeatureValue::Unknown),
        }
    }

    pub fn set_flag(&mut self, name: &str, b: bool) -> Result<(), FeatureError> {
        self.set(name, FeatureValue::Flag(b))
    }

    pub fn set_category(&mut self, name: &str, c: impl Into<String>) -> Result<(), FeatureError> {
        self.set(name, FeatureValue::Category(c.into()))
    }

    pub fn get(&self, name: &str) -> Option<&FeatureValue> {
        self.values.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    /// Unknown when the feature is undeclared or not a ternary.
    pub fn ternary(&self, name: &str) -> Ternary {
        match self.get(name) {
            Some(FeatureValue::Ternary(t)) => *t,
            _ => Ternary::Unknown,
        }
    }

    pub fn continuous(&self, name: &str) -> Option<f64> {
        match self.get(name) {
            Some(FeatureValue::Continuous(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn flag(&self, name: &str) -> Option<bool> {
        match self.get(name) {
            Some(FeatureValue::Flag(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn category(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(FeatureValue::Category(c)) => Some(c.as_str()),
            _ => None,
        }
    }

    pub fn unknown_count(&self) -> usize {
        self.values.iter().filter(|(_, v)| v.is_unknown()).count()
    }
}

impl Serialize for FeatureVector {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut map = s.serialize_map(Some(self.values.len()))?;
        for (name, value) in &self.values {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl fmt::Display for FeatureVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{} features, {} unknown]",
            self.kind,
            self.values.len(),
            self.unknown_count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_vector_is_full_shape_and_all_unknown() {
        for kind in AnalysisKind::ALL {
            let fv = FeatureVector::new(kind);
            assert_eq!(fv.len(), schema_for(kind).len());
            assert_eq!(fv.unknown_count(), fv.len(), "{kind}");
        }
    }

    #[test]
    fn ternary_reads_back_as_optional_bool() {
        assert_eq!(Ternary::from_option(Some(true)).as_bool(), Some(true));
        assert_eq!(Ternary::from_bool(false).as_bool(), Some(false));
        assert_eq!(Ternary::Unknown.as_bool(), None);
    }

    #[test]
    fn undeclared_and_mistyped_features_are_rejected() {
        let mut fv = FeatureVector::new(AnalysisKind::Url);
        assert!(matches!(
            fv.set_flag("not_a_feature", true),
            Err(FeatureError::Undeclared { .. })
        ));
        assert!(matches!(
            fv.set_continuous("ip_literal", 1.0),
            Err(FeatureError::SlotMismatch { .. })
        ));
        assert!(matches!(
            fv.set_continuous("url_length", f64::NAN),
            Err(FeatureError::NonFinite { .. })
        ));
        assert_eq!(fv.ternary("ip_literal"), Ternary::Unknown);
    }

    #[test]
    fn ternaries_serialize_to_minus_one_zero_one() {
        let mut fv = FeatureVector::new(AnalysisKind::Url);
        fv.set_ternary("ip_literal", Ternary::Present).unwrap();
        fv.set_ternary("shortener", Ternary::Absent).unwrap();
        fv.set_continuous("url_length", 43.0).unwrap();
        let v = serde_json::to_value(&fv).unwrap();
        assert_eq!(v["ip_literal"], 1);
        assert_eq!(v["shortener"], 0);
        assert_eq!(v["young_domain"], -1);
        assert_eq!(v["domain_age_days"], -1);
        assert_eq!(v["url_length"], 43.0);
    }

    #[test]
    fn serialized_order_follows_schema() {
        let fv = FeatureVector::new(AnalysisKind::CustomerCare);
        let s = serde_json::to_string(&fv).unwrap();
        let first = s.find("company_name").unwrap();
        let last = s.find("listed_numbers").unwrap();
        assert!(first < last);
    }
}
