// src/config/mod.rs
//! Service settings: TOML file + env overrides.
//!
//! Resolution order:
//! 1) `$RISK_CONFIG_PATH` (must exist when set)
//! 2) `config/risk.toml`
//! 3) built-in defaults
//!
//! Env overrides are applied last, then every value is sanitized.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{FixedOffset, Offset, Utc};
use serde::Deserialize;

use crate::request::AnalysisKind;

pub const ENV_CONFIG_PATH: &str = "RISK_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/risk.toml";
pub const ENV_JWT_SECRET: &str = "RISK_JWT_SECRET";
pub const ENV_ENRICHMENT_ENABLED: &str = "RISK_ENRICHMENT_ENABLED";
pub const ENV_TZ_OFFSET_MINUTES: &str = "RISK_TIMEZONE_OFFSET_MINUTES";
pub const ENV_TRUST_PROXY_HEADERS: &str = "RISK_TRUST_PROXY_HEADERS";
pub const ENV_VIRUSTOTAL_API_KEY: &str = "RISK_VIRUSTOTAL_API_KEY";

/// Placeholder secret; startup logs a warning when it is still in use.
pub const DEV_JWT_SECRET: &str = "dev-only-change-me";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub auth: AuthSettings,
    pub limits: InputLimits,
    pub rate_limits: RateLimitSettings,
    pub cache: CacheSettings,
    pub enrichment: EnrichmentSettings,
    pub scoring: ScoringSettings,
    pub history: HistorySettings,
    pub registry: RegistrySettings,
    pub reputation: ReputationSettings,
    pub otp: OtpSettings,
    pub locale: LocaleSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Take the client address from `X-Forwarded-For` / `X-Real-IP`. Only
    /// safe behind a proxy that overwrites those headers; otherwise the
    /// socket peer address is used.
    pub trust_proxy_headers: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// HS256 secret used to validate bearer tokens.
    pub jwt_secret: String,
    /// Clock skew tolerated on `exp`.
    pub leeway_secs: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: DEV_JWT_SECRET.to_string(),
            leeway_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InputLimits {
    pub max_text_chars: usize,
    pub max_url_chars: usize,
    pub max_audio_bytes: usize,
    pub max_audio_secs: f64,
    pub max_transaction_amount: f64,
    pub max_company_chars: usize,
}

impl Default for InputLimits {
    fn default() -> Self {
        Self {
            max_text_chars: 5000,
            max_url_chars: 2048,
            max_audio_bytes: 10 * 1024 * 1024,
            max_audio_secs: 300.0,
            max_transaction_amount: 10_000_000.0,
            max_company_chars: 200,
        }
    }
}

/// Requests per window. Per-kind limits are keyed by requester; `per_ip`
/// spans every kind and `auth_per_ip` covers the auth endpoint class.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub window_secs: u64,
    pub text: u32,
    pub url: u32,
    pub transaction: u32,
    pub vishing: u32,
    pub customer_care: u32,
    pub per_ip: u32,
    pub auth_per_ip: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window_secs: 60,
            text: 20,
            url: 15,
            transaction: 10,
            vishing: 5,
            customer_care: 10,
            per_ip: 100,
            auth_per_ip: 5,
        }
    }
}

impl RateLimitSettings {
    pub fn for_kind(&self, kind: AnalysisKind) -> u32 {
        match kind {
            AnalysisKind::Text => self.text,
            AnalysisKind::Url => self.url,
            AnalysisKind::Transaction => self.transaction,
            AnalysisKind::Vishing => self.vishing,
            AnalysisKind::CustomerCare => self.customer_care,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub capacity: usize,
    pub ttl_secs: u64,
    /// How long a failed lookup is remembered as unknown. 0 disables.
    pub negative_ttl_secs: u64,
    pub lookup_timeout_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl_secs: 3600,
            negative_ttl_secs: 60,
            lookup_timeout_ms: 2500,
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl_secs)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnrichmentSettings {
    /// Off means every enrichment lookup resolves to unknown.
    pub enabled: bool,
    pub rdap_base: String,
    pub tranco_base: String,
    pub geoip_base: String,
    pub virustotal_base: String,
    /// No key, no VirusTotal lookups.
    pub virustotal_api_key: Option<String>,
    pub user_agent: String,
    /// Page-content features read at most this much HTML.
    pub max_page_bytes: usize,
    pub max_redirects: u32,
}

impl Default for EnrichmentSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            rdap_base: "https://rdap.org/domain".to_string(),
            tranco_base: "https://tranco-list.eu/api/ranks/domain".to_string(),
            geoip_base: "https://ipapi.co".to_string(),
            virustotal_base: "https://www.virustotal.com/api/v3".to_string(),
            virustotal_api_key: None,
            user_agent: "cipherstorm-risk/0.1".to_string(),
            max_page_bytes: 512 * 1024,
            max_redirects: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScoringSettings {
    pub timeout_ms: u64,
}

impl Default for ScoringSettings {
    fn default() -> Self {
        Self { timeout_ms: 2000 }
    }
}

impl ScoringSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistorySettings {
    /// In-memory sink capacity; oldest records are dropped first.
    pub capacity: usize,
    /// Prior records read for velocity features.
    pub velocity_lookback: usize,
    pub timeout_ms: u64,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            capacity: 50_000,
            velocity_lookback: 500,
            timeout_ms: 1000,
        }
    }
}

impl HistorySettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub path: PathBuf,
    /// Minimum Jaro-Winkler similarity for a fuzzy company-name match.
    pub min_similarity: f64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("config/customer_care.toml"),
            min_similarity: 0.88,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReputationSettings {
    /// PhishTank-style CSV export with a `url` column. Missing file: empty list.
    pub blocklist_path: PathBuf,
}

impl Default for ReputationSettings {
    fn default() -> Self {
        Self {
            blocklist_path: PathBuf::from("config/phishing_urls.csv"),
        }
    }
}

/// Step-up challenges issued for transactions the policy holds back.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OtpSettings {
    pub ttl_secs: u64,
    pub max_attempts: u32,
    /// Open challenges kept at once; the oldest is dropped beyond this.
    pub capacity: usize,
}

impl Default for OtpSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 600,
            max_attempts: 3,
            capacity: 10_000,
        }
    }
}

impl OtpSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocaleSettings {
    /// Offset used for temporal transaction features (default IST, +05:30).
    pub utc_offset_minutes: i32,
}

impl Default for LocaleSettings {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 330,
        }
    }
}

impl LocaleSettings {
    pub fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }
}

impl Settings {
    /// Load using env var + fallbacks, then apply env overrides.
    pub fn load() -> Result<Self> {
        let mut settings = if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
            }
            Self::load_from(&pb)?
        } else {
            let default = PathBuf::from(DEFAULT_CONFIG_PATH);
            if default.exists() {
                Self::load_from(&default)?
            } else {
                Self::default()
            }
        };
        settings.apply_env();
        settings.sanitize();
        Ok(settings)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading settings from {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let mut cfg: Settings = toml::from_str(s)?;
        cfg.sanitize();
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(secret) = std::env::var(ENV_JWT_SECRET) {
            if !secret.trim().is_empty() {
                self.auth.jwt_secret = secret;
            }
        }
        if let Ok(v) = std::env::var(ENV_ENRICHMENT_ENABLED) {
            self.enrichment.enabled = matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        if let Ok(v) = std::env::var(ENV_TRUST_PROXY_HEADERS) {
            self.server.trust_proxy_headers = matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        if let Ok(key) = std::env::var(ENV_VIRUSTOTAL_API_KEY) {
            if !key.trim().is_empty() {
                self.enrichment.virustotal_api_key = Some(key.trim().to_string());
            }
        }
        if let Some(m) = std::env::var(ENV_TZ_OFFSET_MINUTES)
            .ok()
            .and_then(|v| v.trim().parse::<i32>().ok())
        {
            self.locale.utc_offset_minutes = m;
        }
    }

    /// Clamp values into usable ranges instead of failing startup.
    pub fn sanitize(&mut self) {
        let d = InputLimits::default();
        if self.limits.max_text_chars == 0 {
            self.limits.max_text_chars = d.max_text_chars;
        }
        if self.limits.max_url_chars == 0 {
            self.limits.max_url_chars = d.max_url_chars;
        }
        if self.limits.max_audio_bytes == 0 {
            self.limits.max_audio_bytes = d.max_audio_bytes;
        }
        if !(self.limits.max_audio_secs.is_finite() && self.limits.max_audio_secs > 0.0) {
            self.limits.max_audio_secs = d.max_audio_secs;
        }
        if !(self.limits.max_transaction_amount.is_finite()
            && self.limits.max_transaction_amount > 0.0)
        {
            self.limits.max_transaction_amount = d.max_transaction_amount;
        }
        if self.limits.max_company_chars == 0 {
            self.limits.max_company_chars = d.max_company_chars;
        }

        let r = &mut self.rate_limits;
        r.window_secs = r.window_secs.max(1);
        for limit in [
            &mut r.text,
            &mut r.url,
            &mut r.transaction,
            &mut r.vishing,
            &mut r.customer_care,
            &mut r.per_ip,
            &mut r.auth_per_ip,
        ] {
            *limit = (*limit).max(1);
        }

        self.cache.capacity = self.cache.capacity.max(1);
        self.cache.lookup_timeout_ms = self.cache.lookup_timeout_ms.max(1);
        self.scoring.timeout_ms = self.scoring.timeout_ms.max(1);
        self.history.capacity = self.history.capacity.max(1);
        self.history.timeout_ms = self.history.timeout_ms.max(1);
        self.enrichment.max_page_bytes = self.enrichment.max_page_bytes.max(1024);
        self.otp.ttl_secs = self.otp.ttl_secs.max(1);
        self.otp.max_attempts = self.otp.max_attempts.max(1);
        self.otp.capacity = self.otp.capacity.max(1);

        if !(0.0..=1.0).contains(&self.registry.min_similarity) {
            self.registry.min_similarity = RegistrySettings::default().min_similarity;
        }
        // chrono accepts strictly less than a day either way.
        if self.locale.utc_offset_minutes.abs() >= 24 * 60 {
            self.locale.utc_offset_minutes = LocaleSettings::default().utc_offset_minutes;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs};

    #[test]
    fn partial_toml_keeps_defaults_for_the_rest() {
        let s = Settings::from_toml_str(
            r#"
            [rate_limits]
            transaction = 3

            [cache]
            ttl_secs = 120
            "#,
        )
        .unwrap();
        assert_eq!(s.rate_limits.transaction, 3);
        assert_eq!(s.rate_limits.text, 20);
        assert_eq!(s.cache.ttl(), Duration::from_secs(120));
        assert_eq!(s.limits.max_text_chars, 5000);
        assert!(!s.server.trust_proxy_headers, "proxy headers are opt-in");
        assert_eq!(s.otp.ttl(), Duration::from_secs(600));
    }

    #[test]
    fn sanitize_lifts_zero_limits() {
        let s = Settings::from_toml_str(
            r#"
            [rate_limits]
            window_secs = 0
            vishing = 0
            [locale]
            utc_offset_minutes = 99999
            "#,
        )
        .unwrap();
        assert_eq!(s.rate_limits.window_secs, 1);
        assert_eq!(s.rate_limits.vishing, 1);
        assert_eq!(s.locale.utc_offset_minutes, 330);
        assert_eq!(s.locale.offset().local_minus_utc(), 330 * 60);
    }

    #[serial_test::serial]
    #[test]
    fn load_uses_env_path_then_env_overrides() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("risk.toml");
        fs::write(&p, "[enrichment]\nenabled = true\n[auth]\njwt_secret = \"from-file\"\n")
            .unwrap();

        env::set_var(ENV_CONFIG_PATH, p.display().to_string());
        env::set_var(ENV_ENRICHMENT_ENABLED, "0");
        env::set_var(ENV_TRUST_PROXY_HEADERS, "true");
        env::remove_var(ENV_JWT_SECRET);
        let s = Settings::load().unwrap();
        assert!(!s.enrichment.enabled, "env override wins over file");
        assert!(s.server.trust_proxy_headers);
        assert_eq!(s.auth.jwt_secret, "from-file");
        env::remove_var(ENV_TRUST_PROXY_HEADERS);

        env::set_var(ENV_CONFIG_PATH, tmp.path().join("missing.toml").display().to_string());
        assert!(Settings::load().is_err());

        env::remove_var(ENV_CONFIG_PATH);
        env::remove_var(ENV_ENRICHMENT_ENABLED);
    }
}
