//! Third-party enrichment: domain registration, TLS validity, DNS, traffic
//! rank, geo-IP, URL reputation and landing-page content, each behind its
//! own [`LookupCache`].
//!
//! Sources never fail an analysis. Every lookup goes through the cache, which
//! turns errors and timeouts into [`Lookup::Unknown`].

pub mod page;
pub mod reputation;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::Deserialize;

use crate::config::EnrichmentSettings;
use crate::lookup_cache::{CacheConfig, Lookup, LookupCache};
use crate::registry::{normalize_company, CompanyRegistry, RegistryMatch};

pub use page::{PageSignals, PageSnapshot};
pub use reputation::{normalize_url, Blocklist, Reputation};

#[derive(Debug, thiserror::Error)]
pub enum EnrichmentError {
    #[error("enrichment disabled")]
    Disabled,
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected response: {0}")]
    Unexpected(String),
}

/// Registration dates and contacts from RDAP.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DomainInfo {
    pub registered_on: Option<DateTime<Utc>>,
    pub expires_on: Option<DateTime<Utc>>,
    pub registrar: Option<String>,
    pub registrant_org: Option<String>,
    pub registrant_email: Option<String>,
}

/// Budget registrars common behind throwaway phishing domains.
const BUDGET_REGISTRARS: &[&str] = &[
    "godaddy", "namecheap", "hostgator", "bluehost", "dreamhost", "hostinger", "siteground",
    "a2hosting", "1and1", "ionos", "cheapdomains", "dynadot", "porkbun", "namesilo", "hover",
];

const FREE_MAIL: &[&str] = &[
    "gmail.com", "yahoo.com", "hotmail.com", "outlook.com", "aol.com", "protonmail.com",
];

const REDACTED_MARKERS: &[&str] = &["redacted", "privacy", "not disclosed", "data protected", "withheld"];

/// At or above this the registration counts as abnormal.
pub const ABNORMAL_REGISTRATION: f64 = 0.5;

fn compact(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase()
}

impl DomainInfo {
    pub fn age_days(&self, now: DateTime<Utc>) -> Option<i64> {
        self.registered_on.map(|r| (now - r).num_days())
    }

    pub fn days_until_expiry(&self, now: DateTime<Utc>) -> Option<i64> {
        self.expires_on.map(|e| (e - now).num_days())
    }

    /// 0..=1 mismatch between who registered `domain` and the domain
    /// itself. `None` when the record carries no contacts at all.
    pub fn abnormality(&self, domain: &str) -> Option<f64> {
        if self.registrar.is_none() && self.registrant_org.is_none() && self.registrant_email.is_none()
        {
            return None;
        }
        let label = compact(domain.split('.').next().unwrap_or(domain));
        let mut score: f64 = 0.0;

        match self.registrant_org.as_deref().map(str::trim) {
            Some(org)
                if !org.is_empty()
                    && !REDACTED_MARKERS.iter().any(|m| org.to_ascii_lowercase().contains(m)) =>
            {
                let org = compact(org);
                let related = !label.is_empty()
                    && !org.is_empty()
                    && (org.contains(&label) || label.contains(&org));
                if !related {
                    score += 0.3;
                }
            }
            _ => score += 0.2,
        }

        if let Some(registrar) = &self.registrar {
            let r = compact(registrar);
            if BUDGET_REGISTRARS.iter().any(|b| r.contains(b)) {
                score += 0.2;
            }
        }

        if let Some(email_domain) = self
            .registrant_email
            .as_deref()
            .and_then(|e| e.rsplit_once('@'))
            .map(|(_, d)| d.trim().to_ascii_lowercase())
        {
            if FREE_MAIL.contains(&email_domain.as_str()) {
                score += 0.1;
            } else if !email_domain.ends_with(&domain.to_ascii_lowercase()) {
                score += 0.25;
            }
        }
        Some(score.min(1.0))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeoInfo {
    pub country: Option<String>,
    pub city: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
}

#[async_trait]
pub trait EnrichmentSource: Send + Sync {
    async fn registration(&self, domain: &str) -> Result<DomainInfo, EnrichmentError>;
    /// `Ok(false)` when the handshake fails on the certificate.
    async fn tls_valid(&self, host: &str) -> Result<bool, EnrichmentError>;
    async fn dns_resolves(&self, host: &str) -> Result<bool, EnrichmentError>;
    /// `Ok(None)` when the domain is not in the ranking.
    async fn traffic_rank(&self, domain: &str) -> Result<Option<u64>, EnrichmentError>;
    async fn geo_ip(&self, ip: &str) -> Result<GeoInfo, EnrichmentError>;

    /// Engine verdicts for a full URL.
    async fn reputation(&self, _url: &str) -> Result<Reputation, EnrichmentError> {
        Err(EnrichmentError::Disabled)
    }

    /// Landing page after redirects.
    async fn fetch_page(&self, _url: &str) -> Result<PageSnapshot, EnrichmentError> {
        Err(EnrichmentError::Disabled)
    }
}

/// Every lookup fails, so every enrichment feature stays unknown.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineEnrichment;

#[async_trait]
impl EnrichmentSource for OfflineEnrichment {
    async fn registration(&self, _domain: &str) -> Result<DomainInfo, EnrichmentError> {
        Err(EnrichmentError::Disabled)
    }
    async fn tls_valid(&self, _host: &str) -> Result<bool, EnrichmentError> {
        Err(EnrichmentError::Disabled)
    }
    async fn dns_resolves(&self, _host: &str) -> Result<bool, EnrichmentError> {
        Err(EnrichmentError::Disabled)
    }
    async fn traffic_rank(&self, _domain: &str) -> Result<Option<u64>, EnrichmentError> {
        Err(EnrichmentError::Disabled)
    }
    async fn geo_ip(&self, _ip: &str) -> Result<GeoInfo, EnrichmentError> {
        Err(EnrichmentError::Disabled)
    }
}

/// Public HTTP sources: RDAP, Tranco, ipapi and VirusTotal, plus a TLS
/// handshake check, the system resolver and a direct page fetch.
pub struct HttpEnrichment {
    http: reqwest::Client,
    cfg: EnrichmentSettings,
}

impl HttpEnrichment {
    pub fn new(cfg: EnrichmentSettings, timeout: Duration) -> Result<Self, EnrichmentError> {
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .connect_timeout(timeout)
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { http, cfg })
    }

    async fn get_text(&self, url: &str) -> Result<String, EnrichmentError> {
        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(String::new());
        }
        if !status.is_success() {
            return Err(EnrichmentError::Unexpected(format!("{url} returned {status}")));
        }
        Ok(resp.text().await?)
    }

    async fn get_with_key(&self, url: &str, key: &str) -> Result<String, EnrichmentError> {
        let resp = self
            .http
            .get(url)
            .header("x-apikey", key)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.text().await?)
    }

    /// Reads at most `cap` bytes of the body.
    async fn read_capped(mut resp: reqwest::Response, cap: usize) -> Result<String, EnrichmentError> {
        let mut buf = Vec::new();
        while let Some(chunk) = resp.chunk().await? {
            let room = cap.saturating_sub(buf.len());
            buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
            if buf.len() >= cap {
                break;
            }
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

fn is_address_literal(url: &Url) -> bool {
    url.host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
        .is_some_and(|h| h.parse::<IpAddr>().is_ok())
}

#[async_trait]
impl EnrichmentSource for HttpEnrichment {
    async fn registration(&self, domain: &str) -> Result<DomainInfo, EnrichmentError> {
        let url = format!("{}/{}", self.cfg.rdap_base.trim_end_matches('/'), domain);
        let body = self.get_text(&url).await?;
        if body.is_empty() {
            return Err(EnrichmentError::Unexpected(format!("no RDAP record for {domain}")));
        }
        parse_rdap(&body)
    }

    async fn tls_valid(&self, host: &str) -> Result<bool, EnrichmentError> {
        match self.http.head(format!("https://{host}/")).send().await {
            // Any HTTP status means the handshake completed.
            Ok(_) => Ok(true),
            Err(e) if is_certificate_error(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn dns_resolves(&self, host: &str) -> Result<bool, EnrichmentError> {
        match tokio::net::lookup_host((host, 443)).await {
            Ok(mut addrs) => Ok(addrs.next().is_some()),
            // The resolver reports NXDOMAIN as an io error.
            Err(e) if e.kind() != std::io::ErrorKind::TimedOut => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn traffic_rank(&self, domain: &str) -> Result<Option<u64>, EnrichmentError> {
        let url = format!("{}/{}", self.cfg.tranco_base.trim_end_matches('/'), domain);
        let body = self.get_text(&url).await?;
        if body.is_empty() {
            return Ok(None);
        }
        parse_tranco(&body)
    }

    async fn geo_ip(&self, ip: &str) -> Result<GeoInfo, EnrichmentError> {
        let url = format!("{}/{}/json/", self.cfg.geoip_base.trim_end_matches('/'), ip);
        let body = self.get_text(&url).await?;
        parse_ipapi(&body)
    }

    async fn reputation(&self, url: &str) -> Result<Reputation, EnrichmentError> {
        let Some(key) = self.cfg.virustotal_api_key.as_deref() else {
            return Err(EnrichmentError::Disabled);
        };
        let base = self.cfg.virustotal_base.trim_end_matches('/');
        let resp = self
            .http
            .post(format!("{base}/urls"))
            .header("x-apikey", key)
            .form(&[("url", url)])
            .send()
            .await?
            .error_for_status()?;
        let id = reputation::parse_vt_submission(&resp.text().await?)?;
        let body = self.get_with_key(&format!("{base}/analyses/{id}"), key).await?;
        reputation::parse_vt_analysis(&body)
    }

    /// Follows redirects by hand so the hop count is known. Hops onto
    /// address literals are refused.
    async fn fetch_page(&self, url: &str) -> Result<PageSnapshot, EnrichmentError> {
        let mut current =
            Url::parse(url).map_err(|e| EnrichmentError::Unexpected(format!("{url}: {e}")))?;
        let mut redirects = 0;
        loop {
            if is_address_literal(&current) {
                return Err(EnrichmentError::Unexpected(format!(
                    "refusing to fetch address literal {current}"
                )));
            }
            let resp = self.http.get(current.clone()).send().await?;
            let status = resp.status();
            if status.is_redirection() {
                let location = resp
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        EnrichmentError::Unexpected(format!("{status} without Location"))
                    })?;
                current = current
                    .join(location)
                    .map_err(|e| EnrichmentError::Unexpected(format!("bad Location: {e}")))?;
                redirects += 1;
                if redirects > self.cfg.max_redirects {
                    // The chain itself is the signal; no page to read.
                    return Ok(PageSnapshot {
                        final_url: current.to_string(),
                        redirects,
                        html: String::new(),
                    });
                }
                continue;
            }
            if !status.is_success() {
                return Err(EnrichmentError::Unexpected(format!("{current} returned {status}")));
            }
            let html = Self::read_capped(resp, self.cfg.max_page_bytes).await?;
            return Ok(PageSnapshot {
                final_url: current.to_string(),
                redirects,
                html,
            });
        }
    }
}

fn is_certificate_error(e: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(e);
    while let Some(err) = source {
        let msg = err.to_string().to_ascii_lowercase();
        if msg.contains("certificate") || msg.contains("handshake") {
            return true;
        }
        source = err.source();
    }
    false
}

/// RDAP entity with its jCard (`["vcard", [[name, params, type, value], ...]]`).
#[derive(Deserialize)]
struct Entity {
    #[serde(default)]
    roles: Vec<String>,
    #[serde(rename = "vcardArray", default)]
    vcard: Option<serde_json::Value>,
    #[serde(default)]
    entities: Vec<Entity>,
}

impl Entity {
    fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.eq_ignore_ascii_case(role))
    }

    fn vcard_text(&self, property: &str) -> Option<String> {
        self.vcard
            .as_ref()?
            .get(1)?
            .as_array()?
            .iter()
            .filter_map(|entry| entry.as_array())
            .find(|entry| entry.first().and_then(|n| n.as_str()) == Some(property))
            .and_then(|entry| entry.get(3))
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }

    fn find<'a>(entities: &'a [Entity], role: &str) -> Option<&'a Entity> {
        entities.iter().find_map(|e| {
            if e.has_role(role) {
                Some(e)
            } else {
                Self::find(&e.entities, role)
            }
        })
    }
}

fn parse_rdap(body: &str) -> Result<DomainInfo, EnrichmentError> {
    #[derive(Deserialize)]
    struct Rdap {
        #[serde(default)]
        events: Vec<Event>,
        #[serde(default)]
        entities: Vec<Entity>,
    }
    #[derive(Deserialize)]
    struct Event {
        #[serde(rename = "eventAction")]
        action: String,
        #[serde(rename = "eventDate")]
        date: Option<String>,
    }

    let rdap: Rdap =
        serde_json::from_str(body).map_err(|e| EnrichmentError::Unexpected(e.to_string()))?;
    let find = |action: &str| {
        rdap.events
            .iter()
            .find(|e| e.action.eq_ignore_ascii_case(action))
            .and_then(|e| e.date.as_deref())
            .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
            .map(|d| d.with_timezone(&Utc))
    };
    let registrar = Entity::find(&rdap.entities, "registrar");
    let registrant = Entity::find(&rdap.entities, "registrant");
    Ok(DomainInfo {
        registered_on: find("registration"),
        expires_on: find("expiration"),
        registrar: registrar.and_then(|e| e.vcard_text("fn")),
        registrant_org: registrant.and_then(|e| e.vcard_text("org").or_else(|| e.vcard_text("fn"))),
        registrant_email: registrant.and_then(|e| e.vcard_text("email")),
    })
}

fn parse_tranco(body: &str) -> Result<Option<u64>, EnrichmentError> {
    #[derive(Deserialize)]
    struct Ranks {
        #[serde(default)]
        ranks: Vec<Rank>,
    }
    #[derive(Deserialize)]
    struct Rank {
        rank: u64,
    }
    let r: Ranks =
        serde_json::from_str(body).map_err(|e| EnrichmentError::Unexpected(e.to_string()))?;
    // Newest list first.
    Ok(r.ranks.first().map(|r| r.rank))
}

fn parse_ipapi(body: &str) -> Result<GeoInfo, EnrichmentError> {
    #[derive(Deserialize)]
    struct IpApi {
        #[serde(default)]
        error: bool,
        reason: Option<String>,
        country_name: Option<String>,
        city: Option<String>,
        latitude: Option<f64>,
        longitude: Option<f64>,
    }
    let v: IpApi =
        serde_json::from_str(body).map_err(|e| EnrichmentError::Unexpected(e.to_string()))?;
    if v.error {
        return Err(EnrichmentError::Unexpected(
            v.reason.unwrap_or_else(|| "geo-ip error".to_string()),
        ));
    }
    match (v.latitude, v.longitude) {
        (Some(latitude), Some(longitude)) if latitude.is_finite() && longitude.is_finite() => {
            Ok(GeoInfo {
                country: v.country_name,
                city: v.city,
                latitude,
                longitude,
            })
        }
        _ => Err(EnrichmentError::Unexpected("geo-ip without coordinates".into())),
    }
}

/// Cached front door used by the encoders.
pub struct Enricher {
    source: Arc<dyn EnrichmentSource>,
    registry: Arc<dyn CompanyRegistry>,
    blocklist: Blocklist,
    domains: LookupCache<DomainInfo>,
    reputations: LookupCache<Reputation>,
    pages: LookupCache<PageSignals>,
    tls: LookupCache<bool>,
    dns: LookupCache<bool>,
    ranks: LookupCache<Option<u64>>,
    geo: LookupCache<GeoInfo>,
    companies: LookupCache<Option<RegistryMatch>>,
}

impl Enricher {
    pub fn new(
        source: Arc<dyn EnrichmentSource>,
        registry: Arc<dyn CompanyRegistry>,
        cfg: CacheConfig,
    ) -> Self {
        Self {
            source,
            registry,
            blocklist: Blocklist::empty(),
            domains: LookupCache::new("domain_registration", cfg.clone()),
            reputations: LookupCache::new("url_reputation", cfg.clone()),
            pages: LookupCache::new("page_content", cfg.clone()),
            tls: LookupCache::new("tls", cfg.clone()),
            dns: LookupCache::new("dns", cfg.clone()),
            ranks: LookupCache::new("traffic_rank", cfg.clone()),
            geo: LookupCache::new("geo_ip", cfg.clone()),
            companies: LookupCache::new("company_registry", cfg),
        }
    }

    pub fn with_blocklist(mut self, blocklist: Blocklist) -> Self {
        self.blocklist = blocklist;
        self
    }

    /// Local list first, then the source. With a loaded list, a source that
    /// cannot answer leaves the URL as not listed rather than unknown.
    pub async fn reputation(&self, url: &str) -> Lookup<Reputation> {
        if self.blocklist.contains(url) {
            return Lookup::Known(Reputation::local_match());
        }
        let key = normalize_url(url);
        match self.reputations.get(&key, || self.source.reputation(url)).await {
            Lookup::Unknown if !self.blocklist.is_empty() => Lookup::Known(Reputation::default()),
            other => other,
        }
    }

    pub async fn page(&self, url: &str) -> Lookup<PageSignals> {
        self.pages
            .get(url, || async {
                self.source
                    .fetch_page(url)
                    .await
                    .map(|snapshot| page::extract(&snapshot))
            })
            .await
    }

    pub async fn domain(&self, domain: &str) -> Lookup<DomainInfo> {
        let key = domain.to_ascii_lowercase();
        self.domains
            .get(&key, || self.source.registration(&key))
            .await
    }

    pub async fn tls_valid(&self, host: &str) -> Lookup<bool> {
        let key = host.to_ascii_lowercase();
        self.tls.get(&key, || self.source.tls_valid(&key)).await
    }

    pub async fn dns_resolves(&self, host: &str) -> Lookup<bool> {
        let key = host.to_ascii_lowercase();
        self.dns.get(&key, || self.source.dns_resolves(&key)).await
    }

    pub async fn traffic_rank(&self, domain: &str) -> Lookup<Option<u64>> {
        let key = domain.to_ascii_lowercase();
        self.ranks.get(&key, || self.source.traffic_rank(&key)).await
    }

    pub async fn geo_ip(&self, ip: &str) -> Lookup<GeoInfo> {
        self.geo.get(ip, || self.source.geo_ip(ip)).await
    }

    /// `Known(None)` means the registry answered and has no such company.
    pub async fn company(&self, company: &str) -> Lookup<Option<RegistryMatch>> {
        let key = normalize_company(company);
        self.companies
            .get(&key, || self.registry.find(company))
            .await
    }

    pub fn cache_ttl(&self) -> Duration {
        self.domains.default_ttl()
    }
}
