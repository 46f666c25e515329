//! Charge aggregator: folds accrual and unbilled charge-source lines into
//! the record's new running total.
//!
//! Every contribution is gated: time by the checkpoint, coffin and extra
//! rows by the charge ledger, embalming by the amount already billed.
//! The planner is pure; the store persists whatever plan it returns.

use crate::{
    accrual::{compute_accrual, format_timestamp},
    config::RateTable,
    rate::{resolve_for_record, DailyRate},
    record::HeldRecord,
    types::{Money, RecordId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeSource {
    Coffin,
    Extra,
}

impl ChargeSource {
    /// Value stored in `charge_ledger.source`.
    pub fn as_str(self) -> &'static str {
        match self {
            ChargeSource::Coffin => "coffin",
            ChargeSource::Extra => "extra",
        }
    }
}

/// One charge-source row not yet in the ledger. `amount` is `None` when a
/// price, quantity or amount column is empty.
///
/// Only a positive amount is billable. Ledgering a zero line would hide it
/// for good once its quantity or amount is corrected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeLine {
    pub source: ChargeSource,
    pub source_id: i64,
    pub amount: Option<Money>,
}

impl ChargeLine {
    fn billable_amount(&self) -> Option<Money> {
        self.amount.filter(|a| a.is_finite() && *a > 0.0)
    }
}

/// Everything the planner needs for one record, read inside the record's
/// transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct ChargeSnapshot {
    pub record: HeldRecord,
    pub coffin_lines: Vec<ChargeLine>,
    pub extra_lines: Vec<ChargeLine>,
    pub embalming_billed: Money,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ChargeBreakdown {
    pub fractional_days: f64,
    pub daily_rate: Option<Money>,
    pub accrual: Money,
    pub coffin: Money,
    pub extras: Money,
    pub embalming: Money,
}

impl ChargeBreakdown {
    pub fn charges(&self) -> Money {
        self.coffin + self.extras + self.embalming
    }

    pub fn increment(&self) -> Money {
        self.accrual + self.charges()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecomputePlan {
    pub record_id: RecordId,
    pub previous_total: Option<Money>,
    pub new_total: Money,
    pub previous_checkpoint: Option<String>,
    /// `None` keeps the stored checkpoint.
    pub next_checkpoint: Option<String>,
    pub daily_rate: Option<DailyRate>,
    pub billed_lines: Vec<(ChargeLine, Money)>,
    /// New embalming high-water mark, when an embalming delta is billed.
    pub embalming_billed_through: Option<Money>,
    /// Lines left unbilled because their amount is missing, zero or negative.
    pub pending_lines: Vec<ChargeLine>,
    pub breakdown: ChargeBreakdown,
}

impl RecomputePlan {
    /// Nothing to bill and no checkpoint to move: the store skips the write.
    pub fn is_noop(&self) -> bool {
        self.next_checkpoint.is_none()
            && self.billed_lines.is_empty()
            && self.embalming_billed_through.is_none()
    }

    /// Checkpoint value the writer persists.
    pub fn checkpoint_to_write(&self) -> Option<&str> {
        self.next_checkpoint
            .as_deref()
            .or(self.previous_checkpoint.as_deref())
    }
}

pub fn plan_recompute(
    snapshot: &ChargeSnapshot,
    rates: &RateTable,
    now: DateTime<Utc>,
) -> RecomputePlan {
    let record = &snapshot.record;
    let daily_rate = resolve_for_record(record, rates);
    let accrual = compute_accrual(record.accrual_anchor(), now, daily_rate);

    let mut billed_lines = Vec::new();
    let mut pending_lines = Vec::new();
    let mut coffin = 0.0;
    let mut extras = 0.0;

    for line in snapshot.coffin_lines.iter().chain(&snapshot.extra_lines) {
        match line.billable_amount() {
            Some(amount) => {
                match line.source {
                    ChargeSource::Coffin => coffin += amount,
                    ChargeSource::Extra => extras += amount,
                }
                billed_lines.push((line.clone(), amount));
            }
            None => pending_lines.push(line.clone()),
        }
    }

    let (embalming, embalming_billed_through) = match record.embalming_cost {
        Some(cost) if cost.is_finite() && cost > snapshot.embalming_billed => {
            (cost - snapshot.embalming_billed, Some(cost))
        }
        _ => (0.0, None),
    };

    let breakdown = ChargeBreakdown {
        fractional_days: accrual.fractional_days,
        daily_rate: daily_rate.map(|r| r.amount),
        accrual: accrual.amount,
        coffin,
        extras,
        embalming,
    };

    RecomputePlan {
        record_id: record.id.clone(),
        previous_total: record.accumulated_total,
        new_total: record.current_total() + breakdown.increment(),
        previous_checkpoint: record.last_charge_checkpoint.clone(),
        next_checkpoint: accrual.next_checkpoint.map(format_timestamp),
        daily_rate,
        billed_lines,
        embalming_billed_through,
        pending_lines,
        breakdown,
    }
}
