//! URL encoder: lexical red flags from the URL itself, reputation-list
//! lookups, and enrichment (registration age and contacts, TLS, DNS,
//! traffic rank, landing-page content) for domain hosts.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;

use super::EncodeContext;
use crate::enrich::ABNORMAL_REGISTRATION;
use crate::error::{RiskError, RiskResult};
use crate::features::{FeatureVector, Ternary};
use crate::lookup_cache::Lookup;
use crate::request::{AnalysisKind, UrlPayload};

pub const LONG_URL_CHARS: usize = 75;
pub const YOUNG_DOMAIN_DAYS: i64 = 365;
pub const SHORT_REGISTRATION_DAYS: i64 = 365;
pub const LOW_TRAFFIC_RANK: u64 = 100_000;

const SHORTENERS: &[&str] = &[
    "bit.ly", "goo.gl", "tinyurl.com", "ow.ly", "is.gd", "t.co", "short.link", "tiny.cc",
    "buff.ly", "rebrand.ly", "cutt.ly",
];

const FREE_TLDS: &[&str] = &[
    "tk", "ml", "ga", "cf", "gq", "xyz", "top", "club", "work", "click", "link", "buzz", "rest",
    "fit", "country", "loan", "win", "zip", "mov",
];

/// Second-level labels that sit under a ccTLD (`example.co.in`).
const CC_SECOND_LEVEL: &[&str] = &["co", "com", "org", "net", "gov", "ac", "edu"];

static IP_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^https?://(?:\d{1,3}\.){3}\d{1,3}(?::\d+)?(?:[/?#]|$)").expect("ip url regex"));

static SUSPICIOUS_WORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)login|log-in|signin|sign-in|verify|secure|update|bank|account|confirm|password")
        .expect("suspicious words regex")
});

/// Validated URL plus the pieces the features read.
#[derive(Debug)]
struct ParsedUrl {
    raw: String,
    url: Url,
    host: String,
    ip_host: bool,
}

fn parse(input: &str, max_chars: usize) -> RiskResult<ParsedUrl> {
    let raw = input.trim();
    if raw.is_empty() {
        return Err(RiskError::MalformedInput("url must not be empty".into()));
    }
    if raw.chars().count() > max_chars {
        return Err(RiskError::MalformedInput(format!(
            "url exceeds {max_chars} characters"
        )));
    }
    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    };
    let url = Url::parse(&candidate)
        .map_err(|e| RiskError::MalformedInput(format!("url does not parse: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(RiskError::MalformedInput(format!(
            "unsupported scheme '{}'",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| RiskError::MalformedInput("url has no host".into()))?
        .to_ascii_lowercase();
    let ip_host = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok();
    Ok(ParsedUrl {
        raw: candidate,
        url,
        host,
        ip_host,
    })
}

/// Last two labels, or three under a `co.in`-style ccTLD.
pub fn registrable_domain(host: &str) -> String {
    let labels: Vec<&str> = host.trim_end_matches('.').split('.').collect();
    let n = labels.len();
    let take = if n >= 3 && labels[n - 1].len() == 2 && CC_SECOND_LEVEL.contains(&labels[n - 2]) {
        3
    } else {
        2
    };
    labels[n.saturating_sub(take)..].join(".")
}

fn is_shortener(host: &str) -> bool {
    let host = host.strip_prefix("www.").unwrap_or(host);
    SHORTENERS
        .iter()
        .any(|s| host == *s || host.ends_with(&format!(".{s}")))
}

/// Checks the host and any hostname-looking token embedded in the URL, so
/// `https://example.com@evil.tk/` is caught too.
fn uses_free_tld(raw: &str) -> bool {
    raw.to_ascii_lowercase()
        .split(|c: char| matches!(c, '/' | '@' | '?' | '#' | '=' | '&' | ':'))
        .filter(|tok| tok.contains('.'))
        .filter_map(|tok| tok.trim_end_matches('.').rsplit('.').next())
        .any(|tld| FREE_TLDS.contains(&tld))
}

fn lexical(p: &ParsedUrl, fv: &mut FeatureVector) -> RiskResult<()> {
    let length = p.raw.chars().count();
    fv.set_category("host", p.host.clone())?;
    fv.set_continuous("url_length", length as f64)?;
    fv.set_ternary(
        "ip_literal",
        Ternary::from_bool(p.ip_host || IP_URL.is_match(&p.raw)),
    )?;
    fv.set_ternary("long_url", Ternary::from_bool(length > LONG_URL_CHARS))?;
    fv.set_ternary("shortener", Ternary::from_bool(is_shortener(&p.host)))?;
    fv.set_ternary("at_symbol", Ternary::from_bool(p.raw.contains('@')))?;
    fv.set_ternary(
        "double_slash_redirect",
        Ternary::from_bool(p.raw.rfind("//").is_some_and(|i| i > 6)),
    )?;
    fv.set_ternary("free_tld", Ternary::from_bool(uses_free_tld(&p.raw)))?;
    fv.set_ternary("no_https", Ternary::from_bool(p.url.scheme() == "http"))?;
    fv.set_ternary(
        "suspicious_words",
        Ternary::from_bool(SUSPICIOUS_WORDS.is_match(&p.raw)),
    )?;

    if p.ip_host {
        fv.set_ternary("prefix_suffix", Ternary::Absent)?;
        fv.set_ternary("deep_subdomain", Ternary::Absent)?;
    } else {
        let bare = p.host.strip_prefix("www.").unwrap_or(&p.host);
        let dots = bare.matches('.').count();
        fv.set_ternary("prefix_suffix", Ternary::from_bool(p.host.contains('-')))?;
        fv.set_ternary("deep_subdomain", Ternary::from_bool(dots >= 2))?;
        fv.set_continuous("subdomain_depth", dots as f64)?;
    }
    Ok(())
}

async fn enrichment(
    p: &ParsedUrl,
    ctx: &EncodeContext<'_>,
    now: DateTime<Utc>,
    fv: &mut FeatureVector,
) -> RiskResult<()> {
    let domain = registrable_domain(&p.host);
    let (registration, tls, dns, rank, page) = tokio::join!(
        ctx.enricher.domain(&domain),
        ctx.enricher.tls_valid(&p.host),
        ctx.enricher.dns_resolves(&p.host),
        ctx.enricher.traffic_rank(&domain),
        ctx.enricher.page(&p.raw),
    );

    if let Lookup::Known(info) = &registration {
        let age = info.age_days(now);
        let left = info.days_until_expiry(now);
        fv.set_ternary(
            "young_domain",
            Ternary::from_option(age.map(|d| d < YOUNG_DOMAIN_DAYS)),
        )?;
        fv.set_ternary(
            "short_registration",
            Ternary::from_option(left.map(|d| d <= SHORT_REGISTRATION_DAYS)),
        )?;
        fv.set_maybe("domain_age_days", age.map(|d| d.max(0) as f64))?;
        fv.set_maybe("registration_days_left", left.map(|d| d as f64))?;

        let abnormality = info.abnormality(&domain);
        fv.set_ternary(
            "abnormal_registration",
            Ternary::from_option(abnormality.map(|s| s >= ABNORMAL_REGISTRATION)),
        )?;
        fv.set_maybe("registration_abnormality", abnormality)?;
    }
    if let Lookup::Known(valid) = tls {
        fv.set_ternary("invalid_tls", Ternary::from_bool(!valid))?;
    }
    if let Lookup::Known(resolves) = dns {
        fv.set_ternary("missing_dns", Ternary::from_bool(!resolves))?;
    }
    if let Lookup::Known(rank) = rank {
        fv.set_ternary(
            "low_traffic",
            Ternary::from_bool(rank.map_or(true, |r| r >= LOW_TRAFFIC_RANK)),
        )?;
        fv.set_maybe("traffic_rank", rank.map(|r| r as f64))?;
    }
    if let Lookup::Known(page) = page {
        fv.set_ternary("hidden_iframe", Ternary::from_bool(page.hidden_iframe))?;
        fv.set_ternary("external_favicon", Ternary::from_bool(page.external_favicon))?;
        fv.set_ternary(
            "foreign_form_handler",
            Ternary::from_bool(page.foreign_form_handler),
        )?;
        fv.set_ternary(
            "excessive_redirects",
            Ternary::from_bool(page.excessive_redirects()),
        )?;
        fv.set_continuous("redirect_count", f64::from(page.redirects))?;
    }
    Ok(())
}

/// Local phishing list and engine verdicts. Applies to address literals too.
async fn reputation(p: &ParsedUrl, ctx: &EncodeContext<'_>, fv: &mut FeatureVector) -> RiskResult<()> {
    if let Lookup::Known(rep) = ctx.enricher.reputation(&p.raw).await {
        fv.set_ternary("blacklisted", Ternary::from_bool(rep.is_listed()))?;
        fv.set_continuous("reputation_detections", f64::from(rep.detections()))?;
    }
    Ok(())
}

pub async fn encode(
    p: &UrlPayload,
    ctx: &EncodeContext<'_>,
    now: DateTime<Utc>,
) -> RiskResult<FeatureVector> {
    let parsed = parse(&p.url, ctx.limits.max_url_chars)?;
    let mut fv = FeatureVector::new(AnalysisKind::Url);
    lexical(&parsed, &mut fv)?;
    reputation(&parsed, ctx, &mut fv).await?;
    // Nothing to look up for a bare IP; enrichment features stay unknown.
    if !parsed.ip_host {
        enrichment(&parsed, ctx, now, &mut fv).await?;
    }
    Ok(fv)
}
