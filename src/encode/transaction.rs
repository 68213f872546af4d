// src/encode/transaction.rs
//! Payment encoder: declared fields, local-time features, geo-IP and
//! velocity against the requester's own transaction history.

use std::net::IpAddr;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::time::timeout;
use tracing::warn;

use super::EncodeContext;
use crate::error::{RiskError, RiskResult};
use crate::features::{FeatureVector, Ternary};
use crate::history::{AnalysisRecord, PersistenceError, RecentQuery, Subject};
use crate::lookup_cache::Lookup;
use crate::request::{AnalysisKind, Requester, TransactionPayload};

/// `amount_bin` upper bounds (inclusive) for bins 0 and 1.
pub const AMOUNT_BINS: [f64; 2] = [2_000.0, 16_000.0];
pub const OUTLIER_Z: f64 = 3.0;
/// Used for the z-score until the requester has a usable spread of amounts.
pub const DEFAULT_MEAN: f64 = 5_000.0;
pub const DEFAULT_STD: f64 = 2_500.0;
const EARTH_RADIUS_KM: f64 = 6_371.0;

static UPI_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9._-]{2,256}@[a-zA-Z][a-zA-Z0-9]{1,64}$").expect("upi regex")
});

/// 23:00 through 05:59 local time.
pub fn is_night(hour: u32) -> bool {
    hour < 6 || hour > 22
}

pub fn amount_bin(amount: f64) -> u8 {
    if amount <= AMOUNT_BINS[0] {
        0
    } else if amount <= AMOUNT_BINS[1] {
        1
    } else {
        2
    }
}

pub fn haversine_km(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());
    let h = ((lat2 - lat1) / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * ((lon2 - lon1) / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

fn is_public(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation())
        }
        IpAddr::V6(v6) => !(v6.is_loopback() || v6.is_unspecified()),
    }
}

fn validate(p: &TransactionPayload, max_amount: f64) -> RiskResult<()> {
    if !p.amount.is_finite() || p.amount <= 0.0 {
        return Err(RiskError::MalformedInput(
            "amount must be a positive number".into(),
        ));
    }
    if p.amount > max_amount {
        return Err(RiskError::InvalidInput(format!(
            "amount exceeds the {max_amount} limit"
        )));
    }
    if !UPI_ID.is_match(p.recipient_upi_id.trim()) {
        return Err(RiskError::InvalidInput(
            "recipient_upi_id must look like handle@provider".into(),
        ));
    }
    Ok(())
}

async fn read_history(
    ctx: &EncodeContext<'_>,
    query: RecentQuery,
) -> Result<Vec<AnalysisRecord>, PersistenceError> {
    match timeout(ctx.history_timeout, ctx.history.recent(query)).await {
        Ok(res) => res,
        Err(_) => Err(PersistenceError::Timeout),
    }
}

/// Amount statistics against prior amounts (newest first).
struct AmountStats {
    zscore: f64,
    percentile: Option<f64>,
}

fn amount_stats(amount: f64, prior: &[f64]) -> AmountStats {
    let (mut mean, mut std) = (DEFAULT_MEAN, DEFAULT_STD);
    if prior.len() >= 2 {
        let n = prior.len() as f64;
        let m = prior.iter().sum::<f64>() / n;
        let var = prior.iter().map(|a| (a - m).powi(2)).sum::<f64>() / n;
        if var > 0.0 {
            mean = m;
            std = var.sqrt();
        }
    }
    let percentile = if prior.is_empty() {
        None
    } else {
        Some(prior.iter().filter(|a| **a <= amount).count() as f64 / prior.len() as f64)
    };
    AmountStats {
        zscore: (amount - mean) / std,
        percentile,
    }
}

fn velocity(
    p: &TransactionPayload,
    requester: &Requester,
    past: &[AnalysisRecord],
    now: DateTime<Utc>,
    fv: &mut FeatureVector,
) -> RiskResult<()> {
    let hour_ago = now - ChronoDuration::hours(1);
    fv.set_continuous("history_len", past.len() as f64)?;
    fv.set_continuous(
        "requester_txn_1h",
        past.iter().filter(|r| r.created_at >= hour_ago).count() as f64,
    )?;

    let prior: Vec<f64> = past
        .iter()
        .filter_map(|r| r.features.continuous("amount"))
        .collect();
    let stats = amount_stats(p.amount, &prior);
    fv.set_continuous("amount_zscore", stats.zscore)?;
    fv.set_ternary(
        "amount_outlier",
        Ternary::from_bool(stats.zscore.abs() > OUTLIER_Z),
    )?;
    fv.set_maybe("amount_percentile", stats.percentile)?;

    if let (Some(lat), Some(lon)) = (fv.continuous("latitude"), fv.continuous("longitude")) {
        let last = past.iter().find_map(|r| {
            Some((r.features.continuous("latitude")?, r.features.continuous("longitude")?))
        });
        fv.set_maybe("distance_from_last_km", last.map(|prev| haversine_km((lat, lon), prev)))?;
    }

    // Nothing to compare against on a first transaction.
    if !past.is_empty() {
        if let Some(device) = requester.device_id.as_deref() {
            let seen = past.iter().any(|r| r.device_id.as_deref() == Some(device));
            fv.set_ternary("new_device", Ternary::from_bool(!seen))?;
        }
        let recipient = p.recipient_upi_id.trim().to_ascii_lowercase();
        let paid_before = past
            .iter()
            .any(|r| r.features.category("recipient_vpa") == Some(recipient.as_str()));
        fv.set_ternary("new_recipient", Ternary::from_bool(!paid_before))?;
    }
    Ok(())
}

pub async fn encode(
    p: &TransactionPayload,
    requester: &Requester,
    now: DateTime<Utc>,
    ctx: &EncodeContext<'_>,
) -> RiskResult<FeatureVector> {
    validate(p, ctx.limits.max_transaction_amount)?;

    let mut fv = FeatureVector::new(AnalysisKind::Transaction);
    fv.set_continuous("amount", p.amount)?;
    fv.set_category("transaction_type", p.transaction_type.as_str())?;
    fv.set_category("payment_method", p.payment_method.as_str())?;
    fv.set_category("recipient_vpa", p.recipient_upi_id.trim().to_ascii_lowercase())?;
    fv.set_continuous("amount_bin", f64::from(amount_bin(p.amount)))?;

    let local = now.with_timezone(&ctx.offset);
    fv.set_continuous("day_of_week", f64::from(local.weekday().num_days_from_monday()))?;
    fv.set_continuous("hour", f64::from(local.hour()))?;
    fv.set_continuous("minute", f64::from(local.minute()))?;
    fv.set_flag("is_night", is_night(local.hour()))?;

    if let Some(device) = &requester.device_id {
        fv.set_category("device_id", device.clone())?;
    }

    let public_ip = requester
        .ip
        .parse::<IpAddr>()
        .ok()
        .filter(is_public)
        .map(|ip| ip.to_string());
    if let Some(ip) = public_ip {
        if let Lookup::Known(geo) = ctx.enricher.geo_ip(&ip).await {
            if let Some(country) = geo.country {
                fv.set_category("country", country)?;
            }
            if let Some(city) = geo.city {
                fv.set_category("city", city)?;
            }
            fv.set_continuous("latitude", geo.latitude)?;
            fv.set_continuous("longitude", geo.longitude)?;
        }
    }

    let past = read_history(
        ctx,
        RecentQuery {
            kind: AnalysisKind::Transaction,
            subject: Subject::Requester(requester.user_id.clone()),
            since: None,
            limit: ctx.velocity_lookback,
        },
    )
    .await;
    match past {
        Ok(past) => velocity(p, requester, &past, now, &mut fv)?,
        Err(e) => warn!(error = %e, "transaction history unavailable; velocity features left unknown"),
    }

    if let Some(device) = &requester.device_id {
        let recent = read_history(
            ctx,
            RecentQuery {
                kind: AnalysisKind::Transaction,
                subject: Subject::Device(device.clone()),
                since: Some(now - ChronoDuration::minutes(10)),
                limit: ctx.velocity_lookback,
            },
        )
        .await;
        match recent {
            Ok(recent) => fv.set_continuous("device_txn_10m", recent.len() as f64)?,
            Err(e) => warn!(error = %e, "device history unavailable"),
        }
    }

    Ok(fv)
}
