//! URL reputation: a local phishing-URL export (PhishTank CSV layout) and
//! VirusTotal analysis stats.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use super::EnrichmentError;

/// Lowercased, scheme and `www.` stripped, no trailing slash. Both list
/// entries and lookups go through this before comparing.
pub fn normalize_url(url: &str) -> String {
    let lower = url.trim().to_ascii_lowercase();
    let rest = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"))
        .unwrap_or(&lower);
    let rest = rest.strip_prefix("www.").unwrap_or(rest);
    rest.trim_end_matches('/').to_string()
}

/// Known-bad URLs, matched exactly after [`normalize_url`].
#[derive(Debug, Default)]
pub struct Blocklist {
    urls: HashSet<String>,
}

impl Blocklist {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading phishing list from {}", path.display()))?;
        Self::from_csv_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Header row required; only the `url` column is read. Quoted fields
    /// are unwrapped but may not contain commas.
    pub fn from_csv_str(s: &str) -> Result<Self> {
        let mut lines = s.lines().filter(|l| !l.trim().is_empty());
        let Some(header) = lines.next() else {
            return Ok(Self::empty());
        };
        let Some(col) = header
            .split(',')
            .position(|h| h.trim().trim_matches('"').eq_ignore_ascii_case("url"))
        else {
            bail!("no 'url' column in header");
        };
        let urls = lines
            .filter_map(|line| line.split(',').nth(col))
            .map(|field| normalize_url(field.trim().trim_matches('"')))
            .filter(|u| !u.is_empty())
            .collect();
        Ok(Self { urls })
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    pub fn contains(&self, url: &str) -> bool {
        self.urls.contains(&normalize_url(url))
    }
}

/// Engine verdict counts for one URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reputation {
    pub malicious: u32,
    pub suspicious: u32,
    /// Matched the local phishing list.
    pub listed_locally: bool,
}

impl Reputation {
    pub fn local_match() -> Self {
        Self {
            listed_locally: true,
            ..Self::default()
        }
    }

    pub fn detections(&self) -> u32 {
        self.malicious + self.suspicious
    }

    pub fn is_listed(&self) -> bool {
        self.listed_locally || self.detections() > 0
    }
}

/// `data.id` from `POST /urls`.
pub(crate) fn parse_vt_submission(body: &str) -> Result<String, EnrichmentError> {
    #[derive(Deserialize)]
    struct Submission {
        data: Data,
    }
    #[derive(Deserialize)]
    struct Data {
        id: String,
    }
    let s: Submission =
        serde_json::from_str(body).map_err(|e| EnrichmentError::Unexpected(e.to_string()))?;
    Ok(s.data.id)
}

/// `data.attributes.stats` from `GET /analyses/{id}`. Phishing verdicts
/// count as malicious.
pub(crate) fn parse_vt_analysis(body: &str) -> Result<Reputation, EnrichmentError> {
    #[derive(Deserialize)]
    struct Analysis {
        data: Data,
    }
    #[derive(Deserialize)]
    struct Data {
        attributes: Attributes,
    }
    #[derive(Deserialize)]
    struct Attributes {
        stats: Stats,
    }
    #[derive(Deserialize)]
    struct Stats {
        #[serde(default)]
        malicious: u32,
        #[serde(default)]
        phishing: u32,
        #[serde(default)]
        suspicious: u32,
    }
    let a: Analysis =
        serde_json::from_str(body).map_err(|e| EnrichmentError::Unexpected(e.to_string()))?;
    let stats = a.data.attributes.stats;
    Ok(Reputation {
        malicious: stats.malicious + stats.phishing,
        suspicious: stats.suspicious,
        listed_locally: false,
    })
}
