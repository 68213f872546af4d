// src/encode/customer_care.rs
//! Customer-care number encoder: number shape plus a cross-check of the
//! claimed company against the official-number registry.

use super::EncodeContext;
use crate::error::{RiskError, RiskResult};
use crate::features::{FeatureVector, Ternary};
use crate::lookup_cache::Lookup;
use crate::registry::{normalize_phone, RegistryMatch};
use crate::request::{AnalysisKind, CustomerCarePayload};

pub const MIN_DIGITS: usize = 7;
pub const MAX_DIGITS: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberType {
    TollFree,
    Mobile,
    Landline,
    Unknown,
}

impl NumberType {
    pub fn classify(digits: &str) -> Self {
        let first = digits.chars().next().unwrap_or('0');
        if digits.starts_with("1800") || digits.starts_with("1860") {
            NumberType::TollFree
        } else if digits.len() == 10 && ('6'..='9').contains(&first) {
            NumberType::Mobile
        } else if (10..=11).contains(&digits.len()) {
            NumberType::Landline
        } else {
            NumberType::Unknown
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NumberType::TollFree => "toll_free",
            NumberType::Mobile => "mobile",
            NumberType::Landline => "landline",
            NumberType::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// The number is one the registry lists for the company.
    Exact,
    /// A listed toll-free number with the same last four digits.
    Similar,
    Unlisted,
    CompanyUnknown,
}

impl MatchKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchKind::Exact => "exact",
            MatchKind::Similar => "similar",
            MatchKind::Unlisted => "unlisted",
            MatchKind::CompanyUnknown => "company_unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exact" => Some(MatchKind::Exact),
            "similar" => Some(MatchKind::Similar),
            "unlisted" => Some(MatchKind::Unlisted),
            "company_unknown" => Some(MatchKind::CompanyUnknown),
            _ => None,
        }
    }
}

fn last4(digits: &str) -> &str {
    &digits[digits.len().saturating_sub(4)..]
}

pub fn match_number(digits: &str, m: &RegistryMatch) -> MatchKind {
    let listed = &m.listing.numbers;
    if listed.iter().any(|n| n == digits) {
        return MatchKind::Exact;
    }
    let toll_free = NumberType::classify(digits) == NumberType::TollFree;
    let near = listed.iter().any(|n| {
        NumberType::classify(n) == NumberType::TollFree && last4(n) == last4(digits)
    });
    if toll_free && near {
        MatchKind::Similar
    } else {
        MatchKind::Unlisted
    }
}

pub async fn encode(p: &CustomerCarePayload, ctx: &EncodeContext<'_>) -> RiskResult<FeatureVector> {
    let company = p.company_name.trim();
    if company.is_empty() {
        return Err(RiskError::InvalidInput("company_name must not be empty".into()));
    }
    if company.chars().count() > ctx.limits.max_company_chars {
        return Err(RiskError::MalformedInput(format!(
            "company_name exceeds {} characters",
            ctx.limits.max_company_chars
        )));
    }
    let digits = normalize_phone(&p.phone_number);
    if !(MIN_DIGITS..=MAX_DIGITS).contains(&digits.len()) {
        return Err(RiskError::InvalidInput(format!(
            "phone_number must have {MIN_DIGITS} to {MAX_DIGITS} digits"
        )));
    }

    let number_type = NumberType::classify(&digits);
    let mut fv = FeatureVector::new(AnalysisKind::CustomerCare);
    fv.set_category("company_name", company)?;
    fv.set_category("normalized_number", digits.clone())?;
    fv.set_category("number_type", number_type.as_str())?;
    fv.set_flag("toll_free", number_type == NumberType::TollFree)?;
    fv.set_flag("mobile", number_type == NumberType::Mobile)?;
    fv.set_flag("landline", number_type == NumberType::Landline)?;
    fv.set_continuous("digit_count", digits.len() as f64)?;
    fv.set_ternary(
        "irregular_length",
        Ternary::from_bool(digits.len() < 10 || digits.len() > 12),
    )?;

    match ctx.enricher.company(company).await {
        Lookup::Known(Some(m)) => {
            let kind = match_number(&digits, &m);
            fv.set_category("match_kind", kind.as_str())?;
            fv.set_ternary(
                "number_unlisted",
                Ternary::from_bool(kind == MatchKind::Unlisted),
            )?;
            fv.set_continuous("match_confidence", m.similarity)?;
            fv.set_continuous("listed_numbers", m.listing.numbers.len() as f64)?;
        }
        Lookup::Known(None) => {
            // No official list to compare against: the number itself stays unknown.
            fv.set_category("match_kind", MatchKind::CompanyUnknown.as_str())?;
            fv.set_continuous("match_confidence", 0.0)?;
            fv.set_continuous("listed_numbers", 0.0)?;
        }
        Lookup::Unknown => {}
    }
    Ok(fv)
}
