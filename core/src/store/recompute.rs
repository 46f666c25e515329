//! Persistence writer: one record, one IMMEDIATE transaction.
//!
//! The record and its unbilled charge lines are read inside the same
//! transaction that writes the result, so a pass can stop between any two
//! records without leaving one half-billed.

use super::{charges, ChargeStore};
use crate::{
    accrual::format_timestamp,
    aggregator::{ChargeSnapshot, ChargeSource, RecomputePlan},
    error::{AccrualError, AccrualResult},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, types::Value, Transaction, TransactionBehavior};

#[derive(Debug, Clone, PartialEq)]
pub enum Recompute {
    /// Plan written and committed.
    Applied(RecomputePlan),
    /// Nothing to bill and no checkpoint to move; nothing written.
    Unchanged(RecomputePlan),
    /// Record reached the terminal status after it was selected.
    Finalized,
    /// Record deleted after it was selected.
    Missing,
}

impl ChargeStore {
    /// Read, plan and write one record atomically.
    ///
    /// `plan` receives the snapshot read inside the transaction. Any error
    /// rolls back every write made for this record.
    pub fn recompute_record<F>(
        &mut self,
        record_id: &str,
        terminal_status: &str,
        billed_at: DateTime<Utc>,
        plan: F,
    ) -> AccrualResult<Recompute>
    where
        F: FnOnce(&ChargeSnapshot) -> RecomputePlan,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some((record, stored_checkpoint)) =
            charges::read_held_record_for_update(&tx, record_id)?
        else {
            return Ok(Recompute::Missing);
        };
        if record.is_terminal(terminal_status) {
            return Ok(Recompute::Finalized);
        }

        let snapshot = ChargeSnapshot {
            coffin_lines: charges::unbilled_lines(&tx, ChargeSource::Coffin, record_id)?,
            extra_lines: charges::unbilled_lines(&tx, ChargeSource::Extra, record_id)?,
            embalming_billed: charges::embalming_billed(&tx, record_id)?,
            record,
        };

        let plan = plan(&snapshot);
        if plan.is_noop() {
            return Ok(Recompute::Unchanged(plan));
        }

        write_plan(&tx, &plan, &stored_checkpoint, terminal_status, billed_at)?;
        tx.commit()?;
        Ok(Recompute::Applied(plan))
    }
}

fn write_plan(
    tx: &Transaction<'_>,
    plan: &RecomputePlan,
    stored_checkpoint: &Value,
    terminal_status: &str,
    billed_at: DateTime<Utc>,
) -> AccrualResult<()> {
    let billed_at = format_timestamp(billed_at);

    for (line, amount) in &plan.billed_lines {
        tx.execute(
            "INSERT INTO charge_ledger (source, source_id, record_id, amount, billed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                line.source.as_str(),
                line.source_id,
                plan.record_id,
                amount,
                billed_at
            ],
        )?;
    }

    if let Some(through) = plan.embalming_billed_through {
        tx.execute(
            "INSERT INTO embalming_billing (record_id, billed_amount, billed_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (record_id) DO UPDATE
               SET billed_amount = excluded.billed_amount,
                   billed_at     = excluded.billed_at",
            params![plan.record_id, through, billed_at],
        )?;
    }

    // Compare-and-swap on the checkpoint exactly as it was read, whatever its
    // storage class. A `None` next checkpoint leaves the column untouched.
    //
    // The IMMEDIATE transaction already keeps other writers out between the
    // read and this update, so a zero-row match only happens when the plan
    // does not describe the row that was read. It is a second guard, not a
    // path a normal pass takes.
    let changed = tx.execute(
        "UPDATE held_records
         SET accumulated_total = ?1,
             last_charge_checkpoint = COALESCE(?2, last_charge_checkpoint)
         WHERE id = ?3
           AND last_charge_checkpoint IS ?4
           AND (status IS NULL OR status <> ?5)",
        params![
            plan.new_total,
            plan.next_checkpoint,
            plan.record_id,
            stored_checkpoint,
            terminal_status
        ],
    )?;
    if changed != 1 {
        return Err(AccrualError::StaleCheckpoint {
            record_id: plan.record_id.clone(),
        });
    }
    Ok(())
}
