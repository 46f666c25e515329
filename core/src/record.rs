//! Typed view of a `held_records` row.
//!
//! Every nullable column stays an `Option`: a missing rate override or
//! embalming cost is not the same thing as an explicit zero.

use crate::types::{Money, RecordId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Kes,
    Usd,
}

impl Currency {
    /// Unset and unrecognised currencies bill in KES.
    pub fn from_column(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("usd") => Currency::Usd,
            _ => Currency::Kes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateCategory {
    Premium,
    Standard,
}

impl RateCategory {
    /// Only `premium` selects the premium rate; `basic`, unset and
    /// anything else bill at the standard rate.
    pub fn from_column(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("premium") => RateCategory::Premium,
            _ => RateCategory::Standard,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeldRecord {
    pub id: RecordId,
    pub status: Option<String>,
    pub rate_category: RateCategory,
    pub currency: Currency,
    pub usd_daily_rate: Option<Money>,
    pub created_at: Option<String>,
    pub last_charge_checkpoint: Option<String>,
    pub embalming_cost: Option<Money>,
    pub accumulated_total: Option<Money>,
}

impl HeldRecord {
    /// Whether `status` equals the terminal value. Comparison is exact,
    /// matching the selector's SQL.
    pub fn is_terminal(&self, terminal_status: &str) -> bool {
        self.status.as_deref() == Some(terminal_status)
    }

    /// The instant accrual resumes from: the checkpoint if one was ever
    /// written, otherwise the creation time.
    pub fn accrual_anchor(&self) -> Option<&str> {
        self.last_charge_checkpoint
            .as_deref()
            .or(self.created_at.as_deref())
    }

    /// Running balance; a record never billed before starts from zero.
    pub fn current_total(&self) -> Money {
        self.accumulated_total.unwrap_or(0.0)
    }
}
