//! Pass reports: what one recomputation pass did to each record.

use crate::{
    accrual::format_timestamp,
    aggregator::{ChargeBreakdown, RecomputePlan},
    error::AccrualError,
    store::PassLogRow,
    types::{Money, PassId, RecordId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Resolved daily rate ≤ 0 and no charge-source line to bill.
    NoBillableRate,
    /// Reached the terminal status after selection.
    Finalized,
    /// Deleted after selection.
    Missing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub record_id: RecordId,
    pub message: String,
    /// Error followed by its source chain.
    pub trace: Vec<String>,
}

impl RecordFailure {
    pub fn new(record_id: &str, error: &AccrualError) -> Self {
        Self {
            record_id: record_id.to_string(),
            message: error.to_string(),
            trace: error.trace(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordOutcome {
    Updated {
        record_id: RecordId,
        previous_total: Option<Money>,
        new_total: Money,
        checkpoint: Option<String>,
        breakdown: ChargeBreakdown,
    },
    Skipped {
        record_id: RecordId,
        reason: SkipReason,
    },
    Failed(RecordFailure),
}

impl RecordOutcome {
    pub fn updated(plan: &RecomputePlan) -> Self {
        RecordOutcome::Updated {
            record_id: plan.record_id.clone(),
            previous_total: plan.previous_total,
            new_total: plan.new_total,
            checkpoint: plan.checkpoint_to_write().map(str::to_string),
            breakdown: plan.breakdown,
        }
    }

    pub fn record_id(&self) -> &str {
        match self {
            RecordOutcome::Updated { record_id, .. } => record_id,
            RecordOutcome::Skipped { record_id, .. } => record_id,
            RecordOutcome::Failed(failure) => &failure.record_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassReport {
    pub pass_id: PassId,
    pub trigger: String,
    /// Instant accrual was billed up to.
    pub billed_through: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<RecordOutcome>,
    /// Stopped early on shutdown; unvisited records are untouched.
    pub cancelled: bool,
}

impl PassReport {
    pub fn examined(&self) -> usize {
        self.outcomes.len()
    }

    pub fn updated(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, RecordOutcome::Updated { .. }))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, RecordOutcome::Skipped { .. }))
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &RecordFailure> {
        self.outcomes.iter().filter_map(|o| match o {
            RecordOutcome::Failed(failure) => Some(failure),
            _ => None,
        })
    }

    pub fn failed(&self) -> usize {
        self.failures().count()
    }

    pub fn outcome_for(&self, record_id: &str) -> Option<&RecordOutcome> {
        self.outcomes.iter().find(|o| o.record_id() == record_id)
    }

    pub fn log_row(&self) -> PassLogRow {
        PassLogRow {
            pass_id: self.pass_id.clone(),
            trigger_name: self.trigger.clone(),
            started_at: format_timestamp(self.started_at),
            finished_at: format_timestamp(self.finished_at),
            examined: self.examined() as i64,
            updated: self.updated() as i64,
            skipped: self.skipped() as i64,
            failed: self.failed() as i64,
            cancelled: self.cancelled,
        }
    }
}
