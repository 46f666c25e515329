//! The charge accrual engine: one recomputation pass over every held body.
//!
//! PASS ORDER (per record, sequential):
//!   1. Record selector      (store, once per pass)
//!   2. Rate resolver        (rate.rs)
//!   3. Charge-source reads  (store, inside the record's transaction)
//!   4. Accrual calculator   (accrual.rs)
//!   5. Charge aggregator    (aggregator.rs)
//!   6. Persistence writer   (store, same transaction)
//!
//! RULES:
//!   - Only a selector failure aborts a pass.
//!   - Every other failure is confined to its record: logged, reported,
//!     journaled, and the pass moves on.
//!   - Cancellation is honoured between records, never inside one.

use crate::{
    accrual::format_timestamp,
    aggregator::{plan_recompute, RecomputePlan},
    config::EngineConfig,
    error::{AccrualError, AccrualResult},
    journal::FailureJournal,
    report::{PassReport, RecordFailure, RecordOutcome, SkipReason},
    store::{ChargeStore, Recompute},
};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

pub struct ChargeEngine {
    store: ChargeStore,
    config: EngineConfig,
    journal: FailureJournal,
}

impl ChargeEngine {
    pub fn new(store: ChargeStore, config: EngineConfig) -> Self {
        let journal = FailureJournal::new(config.failure_journal.clone());
        Self {
            store,
            config,
            journal,
        }
    }

    /// In-memory store, migrated, with test configuration.
    pub fn build_test() -> AccrualResult<Self> {
        Self::build_test_with(EngineConfig::default_test())
    }

    pub fn build_test_with(config: EngineConfig) -> AccrualResult<Self> {
        let store = ChargeStore::in_memory()?;
        store.migrate()?;
        Ok(Self::new(store, config))
    }

    pub fn store(&self) -> &ChargeStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Recompute every eligible record as of `now`.
    ///
    /// Returns `Err` only when the eligible records cannot be enumerated;
    /// nothing has been written in that case.
    pub fn run_pass(
        &mut self,
        trigger: &str,
        now: DateTime<Utc>,
        cancel: &AtomicBool,
    ) -> AccrualResult<PassReport> {
        let pass_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        log::info!(
            "pass {pass_id} ({trigger}) started, billing through {}",
            format_timestamp(now)
        );

        let record_ids = match self.store.eligible_record_ids(&self.config.terminal_status) {
            Ok(ids) => ids,
            Err(e) => {
                log::error!("pass {pass_id} ({trigger}) aborted: cannot select held records: {e}");
                let journaled = self.journal.pass_aborted(&pass_id, trigger, &e, started_at);
                if let Err(journal_err) = journaled {
                    log::error!("failure journal write failed: {journal_err}");
                }
                return Err(e);
            }
        };

        let mut outcomes = Vec::with_capacity(record_ids.len());
        let mut cancelled = false;
        for record_id in &record_ids {
            if cancel.load(Ordering::SeqCst) {
                cancelled = true;
                log::warn!(
                    "pass {pass_id} ({trigger}) cancelled after {} of {} records",
                    outcomes.len(),
                    record_ids.len()
                );
                break;
            }
            outcomes.push(self.recompute_isolated(record_id, now));
        }

        let report = PassReport {
            pass_id,
            trigger: trigger.to_string(),
            billed_through: now,
            started_at,
            finished_at: Utc::now(),
            outcomes,
            cancelled,
        };

        if let Err(e) = self.journal.record_failures(&report) {
            log::error!("failure journal write failed: {e}");
        }
        if let Err(e) = self.store.append_pass_log(&report.log_row()) {
            log::error!("pass {} could not be logged: {e}", report.pass_id);
        }

        log::info!(
            "pass {} ({}) finished: {} examined, {} updated, {} skipped, {} failed",
            report.pass_id,
            report.trigger,
            report.examined(),
            report.updated(),
            report.skipped(),
            report.failed()
        );
        Ok(report)
    }

    /// Recompute one record, surfacing its error to the caller.
    pub fn recompute_record(
        &mut self,
        record_id: &str,
        now: DateTime<Utc>,
    ) -> AccrualResult<RecordOutcome> {
        let rates = &self.config.rates;
        let result = self.store.recompute_record(
            record_id,
            &self.config.terminal_status,
            now,
            |snapshot| plan_recompute(snapshot, rates, now),
        )?;

        let outcome = match result {
            Recompute::Applied(plan) => {
                warn_pending(&plan);
                log::debug!(
                    "record {record_id}: {:.2} -> {:.2} (accrual {:.2} over {:.4} days, charges {:.2})",
                    plan.previous_total.unwrap_or(0.0),
                    plan.new_total,
                    plan.breakdown.accrual,
                    plan.breakdown.fractional_days,
                    plan.breakdown.charges()
                );
                RecordOutcome::updated(&plan)
            }
            Recompute::Unchanged(plan) => {
                warn_pending(&plan);
                log::debug!("record {record_id}: no billable daily rate; time not billed");
                RecordOutcome::Skipped {
                    record_id: record_id.to_string(),
                    reason: SkipReason::NoBillableRate,
                }
            }
            Recompute::Finalized => RecordOutcome::Skipped {
                record_id: record_id.to_string(),
                reason: SkipReason::Finalized,
            },
            Recompute::Missing => RecordOutcome::Skipped {
                record_id: record_id.to_string(),
                reason: SkipReason::Missing,
            },
        };
        Ok(outcome)
    }

    /// Operator entry point for a single record. Unlike a pass, a record
    /// that does not exist is an error.
    pub fn recompute_one(
        &mut self,
        record_id: &str,
        now: DateTime<Utc>,
    ) -> AccrualResult<RecordOutcome> {
        match self.recompute_record(record_id, now)? {
            RecordOutcome::Skipped {
                reason: SkipReason::Missing,
                ..
            } => Err(AccrualError::RecordNotFound {
                record_id: record_id.to_string(),
            }),
            outcome => Ok(outcome),
        }
    }

    fn recompute_isolated(&mut self, record_id: &str, now: DateTime<Utc>) -> RecordOutcome {
        match self.recompute_record(record_id, now) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("record {record_id}: recomputation failed: {e}");
                RecordOutcome::Failed(RecordFailure::new(record_id, &e))
            }
        }
    }
}

fn warn_pending(plan: &RecomputePlan) {
    for line in &plan.pending_lines {
        log::warn!(
            "record {}: {} charge {} has no billable amount; left pending",
            plan.record_id,
            line.source.as_str(),
            line.source_id
        );
    }
}
