//! Reference registry of official customer-care numbers.
//!
//! The default implementation reads a TOML file of `[[company]]` tables and
//! matches claimed company names exactly (name or alias) or fuzzily with
//! Jaro-Winkler.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::enrich::EnrichmentError;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CompanyListing {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Official numbers, stored normalized.
    #[serde(default)]
    pub numbers: Vec<String>,
    /// Where the numbers were published.
    #[serde(default)]
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegistryMatch {
    pub listing: CompanyListing,
    /// 1.0 for an exact name/alias match.
    pub similarity: f64,
}

#[async_trait]
pub trait CompanyRegistry: Send + Sync {
    /// `Ok(None)` when no listed company is close enough.
    async fn find(&self, company: &str) -> Result<Option<RegistryMatch>, EnrichmentError>;
}

/// Digits only, with a leading `91` country code removed from numbers of 12
/// or more digits.
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() >= 12 && digits.starts_with("91") {
        digits[2..].to_string()
    } else {
        digits
    }
}

/// Lowercase alphanumerics separated by single spaces.
pub fn normalize_company(raw: &str) -> String {
    raw.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    company: Vec<CompanyListing>,
}

#[derive(Debug)]
pub struct FileRegistry {
    entries: Vec<(CompanyListing, Vec<String>)>,
    min_similarity: f64,
}

impl FileRegistry {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            min_similarity: 0.88,
        }
    }

    pub fn load(path: &Path, min_similarity: f64) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading company registry from {}", path.display()))?;
        Self::from_toml_str(&content, min_similarity)
            .with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_toml_str(s: &str, min_similarity: f64) -> Result<Self> {
        let file: RegistryFile = toml::from_str(s)?;
        let entries = file
            .company
            .into_iter()
            .filter(|c| !c.name.trim().is_empty())
            .map(|mut c| {
                c.numbers = c
                    .numbers
                    .iter()
                    .map(|n| normalize_phone(n))
                    .filter(|n| !n.is_empty())
                    .collect();
                let names = std::iter::once(&c.name)
                    .chain(c.aliases.iter())
                    .map(|n| normalize_company(n))
                    .filter(|n| !n.is_empty())
                    .collect();
                (c, names)
            })
            .collect();
        Ok(Self {
            entries,
            min_similarity,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn best_match(&self, company: &str) -> Option<RegistryMatch> {
        let wanted = normalize_company(company);
        if wanted.is_empty() {
            return None;
        }
        let mut best: Option<(f64, &CompanyListing)> = None;
        for (listing, names) in &self.entries {
            for name in names {
                let sim = if *name == wanted {
                    1.0
                } else {
                    strsim::jaro_winkler(name, &wanted)
                };
                if best.map_or(true, |(b, _)| sim > b) {
                    best = Some((sim, listing));
                }
            }
        }
        best.filter(|(sim, _)| *sim >= self.min_similarity)
            .map(|(similarity, listing)| RegistryMatch {
                listing: listing.clone(),
                similarity,
            })
    }
}

#[async_trait]
impl CompanyRegistry for FileRegistry {
    async fn find(&self, company: &str) -> Result<Option<RegistryMatch>, EnrichmentError> {
        Ok(self.best_match(company))
    }
}
