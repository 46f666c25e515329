//! Rate resolver: currency + category (+ USD override) → daily rate.
//!
//! Pure and deterministic. A resolved rate that is not strictly positive
//! comes back as `None`, meaning "bill no time for this record this pass".

use crate::{
    config::RateTable,
    record::{Currency, HeldRecord, RateCategory},
    types::Money,
};
use serde::{Deserialize, Serialize};

/// Which row of the rate table produced a rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateBasis {
    UsdOverride,
    UsdFallback,
    KesPremium,
    KesBasic,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DailyRate {
    pub amount: Money,
    pub basis: RateBasis,
}

pub fn resolve_daily_rate(
    currency: Currency,
    category: RateCategory,
    usd_daily_rate: Option<Money>,
    table: &RateTable,
) -> Option<DailyRate> {
    let (amount, basis) = match (currency, category) {
        (Currency::Usd, _) => match usd_daily_rate {
            Some(rate) if rate > 0.0 => (rate, RateBasis::UsdOverride),
            _ => (table.usd_fallback, RateBasis::UsdFallback),
        },
        (Currency::Kes, RateCategory::Premium) => (table.kes_premium, RateBasis::KesPremium),
        (Currency::Kes, RateCategory::Standard) => (table.kes_basic, RateBasis::KesBasic),
    };

    // NaN fails this comparison too.
    if amount > 0.0 {
        Some(DailyRate { amount, basis })
    } else {
        None
    }
}

pub fn resolve_for_record(record: &HeldRecord, table: &RateTable) -> Option<DailyRate> {
    resolve_daily_rate(
        record.currency,
        record.rate_category,
        record.usd_daily_rate,
        table,
    )
}
