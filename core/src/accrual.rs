//! Accrual calculator: time-based holding fee since the last checkpoint.
//!
//! Elapsed time is never negative. A missing or unparseable anchor is
//! treated as "now", which bills zero time for that pass instead of failing.

use crate::{
    rate::DailyRate,
    types::{Money, MS_PER_DAY},
};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};

/// Accepts RFC 3339 and the `YYYY-MM-DD HH:MM:SS[.fff]` form SQL
/// timestamp columns produce (taken as UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Where this pass's accrual window opens.
pub fn accrual_start(anchor: Option<&str>, now: DateTime<Utc>) -> DateTime<Utc> {
    match anchor {
        Some(raw) => parse_timestamp(raw).unwrap_or_else(|| {
            log::debug!("unparseable accrual anchor {raw:?}; billing no time this pass");
            now
        }),
        None => now,
    }
}

pub fn fractional_days_elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let elapsed_ms = (now - since).num_milliseconds() as f64;
    (elapsed_ms / MS_PER_DAY).max(0.0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Accrual {
    pub fractional_days: f64,
    pub daily_rate: Option<DailyRate>,
    pub amount: Money,
    /// `None` leaves the stored checkpoint untouched.
    pub next_checkpoint: Option<DateTime<Utc>>,
}

/// Accrual for the window `[anchor, now]`.
///
/// Without a billable rate nothing is charged and the checkpoint stays put,
/// so the window is billed once a rate becomes available. The checkpoint
/// never moves backwards when the anchor lies in the future.
pub fn compute_accrual(
    anchor: Option<&str>,
    now: DateTime<Utc>,
    daily_rate: Option<DailyRate>,
) -> Accrual {
    let start = accrual_start(anchor, now);
    let fractional_days = fractional_days_elapsed(start, now);

    match daily_rate {
        Some(rate) => Accrual {
            fractional_days,
            daily_rate,
            amount: fractional_days * rate.amount,
            next_checkpoint: Some(start.max(now)),
        },
        None => Accrual {
            fractional_days,
            daily_rate: None,
            amount: 0.0,
            next_checkpoint: None,
        },
    }
}
