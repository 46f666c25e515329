//! Charge-source readers.
//!
//! The gated readers return only rows with no `charge_ledger` entry; the
//! totals at the bottom are ungated sums for reporting.

use super::{
    held_record_from_row, held_record_with_raw_checkpoint, ChargeStore, HELD_RECORD_COLUMNS,
};
use crate::{
    aggregator::{ChargeLine, ChargeSource},
    error::AccrualResult,
    record::HeldRecord,
    types::Money,
};
use rusqlite::{params, types::Value, Connection, OptionalExtension};

pub(super) fn read_held_record(
    conn: &Connection,
    record_id: &str,
) -> AccrualResult<Option<HeldRecord>> {
    let record = conn
        .query_row(
            &format!("SELECT {HELD_RECORD_COLUMNS} FROM held_records WHERE id = ?1"),
            params![record_id],
            held_record_from_row,
        )
        .optional()?;
    Ok(record)
}

/// `read_held_record` plus the stored checkpoint value, untouched.
pub(super) fn read_held_record_for_update(
    conn: &Connection,
    record_id: &str,
) -> AccrualResult<Option<(HeldRecord, Value)>> {
    let record = conn
        .query_row(
            &format!("SELECT {HELD_RECORD_COLUMNS} FROM held_records WHERE id = ?1"),
            params![record_id],
            held_record_with_raw_checkpoint,
        )
        .optional()?;
    Ok(record)
}

pub(super) fn unbilled_lines(
    conn: &Connection,
    source: ChargeSource,
    record_id: &str,
) -> AccrualResult<Vec<ChargeLine>> {
    let lines = match source {
        ChargeSource::Coffin => {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.unit_price, c.quantity
                 FROM coffin_issuance c
                 LEFT JOIN charge_ledger l ON l.source = 'coffin' AND l.source_id = c.id
                 WHERE c.record_id = ?1 AND l.source_id IS NULL
                 ORDER BY c.id",
            )?;
            let rows = stmt.query_map(params![record_id], |row| {
                let unit_price: Option<Money> = row.get(1)?;
                let quantity: Option<f64> = row.get(2)?;
                Ok(ChargeLine {
                    source,
                    source_id: row.get(0)?,
                    amount: unit_price.zip(quantity).map(|(p, q)| p * q),
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
        ChargeSource::Extra => {
            let mut stmt = conn.prepare(
                "SELECT e.id, e.amount
                 FROM extra_charges e
                 LEFT JOIN charge_ledger l ON l.source = 'extra' AND l.source_id = e.id
                 WHERE e.record_id = ?1 AND l.source_id IS NULL
                 ORDER BY e.id",
            )?;
            let rows = stmt.query_map(params![record_id], |row| {
                Ok(ChargeLine {
                    source,
                    source_id: row.get(0)?,
                    amount: row.get(1)?,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
    };
    Ok(lines)
}

pub(super) fn embalming_billed(conn: &Connection, record_id: &str) -> AccrualResult<Money> {
    let billed: Option<Money> = conn
        .query_row(
            "SELECT billed_amount FROM embalming_billing WHERE record_id = ?1",
            params![record_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(billed.unwrap_or(0.0))
}

impl ChargeStore {
    // ── Gated readers ──────────────────────────────────────────

    pub fn unbilled_coffin_lines(&self, record_id: &str) -> AccrualResult<Vec<ChargeLine>> {
        unbilled_lines(&self.conn, ChargeSource::Coffin, record_id)
    }

    pub fn unbilled_extra_lines(&self, record_id: &str) -> AccrualResult<Vec<ChargeLine>> {
        unbilled_lines(&self.conn, ChargeSource::Extra, record_id)
    }

    /// Embalming amount already folded into the record's total.
    pub fn embalming_billed(&self, record_id: &str) -> AccrualResult<Money> {
        embalming_billed(&self.conn, record_id)
    }

    // ── Ungated totals ─────────────────────────────────────────

    /// Σ unit_price × quantity over every coffin row of the record.
    pub fn coffin_charges_total(&self, record_id: &str) -> AccrualResult<Money> {
        let total: Money = self.conn.query_row(
            "SELECT COALESCE(SUM(unit_price * quantity), 0.0)
             FROM coffin_issuance WHERE record_id = ?1",
            params![record_id],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    pub fn extra_charges_total(&self, record_id: &str) -> AccrualResult<Money> {
        let total: Money = self.conn.query_row(
            "SELECT COALESCE(SUM(amount), 0.0) FROM extra_charges WHERE record_id = ?1",
            params![record_id],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    /// The record's embedded embalming cost; `None` when the record is
    /// missing or the field is empty.
    pub fn embalming_cost(&self, record_id: &str) -> AccrualResult<Option<Money>> {
        let cost: Option<Option<Money>> = self
            .conn
            .query_row(
                "SELECT embalming_cost FROM held_records WHERE id = ?1",
                params![record_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(cost.flatten())
    }

    // ── Ledger ─────────────────────────────────────────────────

    /// Σ amount of ledgered coffin and extra lines for the record.
    pub fn ledgered_amount(&self, record_id: &str) -> AccrualResult<Money> {
        let total: Money = self.conn.query_row(
            "SELECT COALESCE(SUM(amount), 0.0) FROM charge_ledger WHERE record_id = ?1",
            params![record_id],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    pub fn ledger_entry_count(&self, record_id: &str) -> AccrualResult<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM charge_ledger WHERE record_id = ?1",
            params![record_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
