//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! The engine and the planner never execute SQL directly.

mod charges;
mod pass_log;
mod recompute;

pub use pass_log::PassLogRow;
pub use recompute::Recompute;

use crate::{
    error::AccrualResult,
    record::{Currency, HeldRecord, RateCategory},
    types::{Money, RecordId},
};
use rusqlite::{params, types::Value, Connection, OpenFlags};

pub struct ChargeStore {
    conn: Connection,
    path: Option<String>, // None for :memory:, Some(path) for file
}

impl ChargeStore {
    pub fn open(path: &str) -> AccrualResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> AccrualResult<Self> {
        let conn = Connection::open(":memory:")?;
        Ok(Self { conn, path: None })
    }

    /// Reopen a new connection to the same database.
    /// For in-memory databases, this returns a new in-memory database (isolated).
    pub fn reopen(&self) -> AccrualResult<Self> {
        match &self.path {
            Some(p) => Self::open(p),
            None => Self::in_memory(),
        }
    }

    /// Apply all schema migrations in order. Every statement is
    /// `IF NOT EXISTS`, so this is safe against an externally provisioned
    /// schema.
    pub fn migrate(&self) -> AccrualResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_held_records.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_charge_sources.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/003_charge_ledger.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/004_pass_log.sql"))?;
        Ok(())
    }

    // ── Record selection ───────────────────────────────────────

    /// Ids of every record the engine may recompute: `created_at` set and
    /// status not terminal. Read-only.
    ///
    /// Only ids are selected so that one malformed row fails its own
    /// recomputation instead of the whole selection.
    pub fn eligible_record_ids(&self, terminal_status: &str) -> AccrualResult<Vec<RecordId>> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM held_records
             WHERE created_at IS NOT NULL AND created_at <> ''
               AND (status IS NULL OR status <> ?1)
             ORDER BY created_at ASC, id ASC",
        )?;
        let ids = stmt
            .query_map(params![terminal_status], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Full rows of every eligible record, for reporting.
    pub fn select_eligible(&self, terminal_status: &str) -> AccrualResult<Vec<HeldRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {HELD_RECORD_COLUMNS} FROM held_records
             WHERE created_at IS NOT NULL AND created_at <> ''
               AND (status IS NULL OR status <> ?1)
             ORDER BY created_at ASC, id ASC"
        ))?;
        let records = stmt
            .query_map(params![terminal_status], held_record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn held_record(&self, record_id: &str) -> AccrualResult<Option<HeldRecord>> {
        charges::read_held_record(&self.conn, record_id)
    }

    // ── Intake (owned by the case-management layer in production) ──

    pub fn insert_held_record(&self, record: &HeldRecord) -> AccrualResult<()> {
        self.conn.execute(
            "INSERT INTO held_records (
                id, status, rate_category, currency, usd_daily_rate, created_at,
                last_charge_checkpoint, embalming_cost, accumulated_total
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.id,
                record.status,
                match record.rate_category {
                    RateCategory::Premium => "premium",
                    RateCategory::Standard => "basic",
                },
                match record.currency {
                    Currency::Kes => "KES",
                    Currency::Usd => "USD",
                },
                record.usd_daily_rate,
                record.created_at,
                record.last_charge_checkpoint,
                record.embalming_cost,
                record.accumulated_total,
            ],
        )?;
        Ok(())
    }

    /// Returns the new row id.
    pub fn insert_coffin_issuance(
        &self,
        record_id: &str,
        unit_price: Option<Money>,
        quantity: Option<f64>,
    ) -> AccrualResult<i64> {
        self.conn.execute(
            "INSERT INTO coffin_issuance (record_id, unit_price, quantity) VALUES (?1, ?2, ?3)",
            params![record_id, unit_price, quantity],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Returns the new row id.
    pub fn insert_extra_charge(
        &self,
        record_id: &str,
        amount: Option<Money>,
    ) -> AccrualResult<i64> {
        self.conn.execute(
            "INSERT INTO extra_charges (record_id, amount) VALUES (?1, ?2)",
            params![record_id, amount],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn set_status(&self, record_id: &str, status: Option<&str>) -> AccrualResult<()> {
        self.conn.execute(
            "UPDATE held_records SET status = ?1 WHERE id = ?2",
            params![status, record_id],
        )?;
        Ok(())
    }

    pub fn set_embalming_cost(&self, record_id: &str, cost: Option<Money>) -> AccrualResult<()> {
        self.conn.execute(
            "UPDATE held_records SET embalming_cost = ?1 WHERE id = ?2",
            params![cost, record_id],
        )?;
        Ok(())
    }

    // ── Test helper methods ───────────────────────────────────────

    /// Run arbitrary SQL. Fixtures use this to plant malformed rows.
    pub fn execute_raw(&self, sql: &str) -> AccrualResult<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }
}

const HELD_RECORD_COLUMNS: &str = "id, status, rate_category, currency, usd_daily_rate, \
     created_at, last_charge_checkpoint, embalming_cost, accumulated_total";

/// Column index of `last_charge_checkpoint` in `HELD_RECORD_COLUMNS`.
const CHECKPOINT_COLUMN: usize = 6;

fn held_record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HeldRecord> {
    let rate_category: Option<String> = row.get(2)?;
    let currency: Option<String> = row.get(3)?;
    Ok(HeldRecord {
        id: row.get(0)?,
        status: row.get(1)?,
        rate_category: RateCategory::from_column(rate_category.as_deref()),
        currency: Currency::from_column(currency.as_deref()),
        usd_daily_rate: row.get(4)?,
        created_at: timestamp_column(row.get(5)?),
        last_charge_checkpoint: timestamp_column(row.get(CHECKPOINT_COLUMN)?),
        embalming_cost: row.get(7)?,
        accumulated_total: row.get(8)?,
    })
}

/// The record plus its checkpoint exactly as stored, for the guarded update.
fn held_record_with_raw_checkpoint(
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<(HeldRecord, Value)> {
    Ok((held_record_from_row(row)?, row.get(CHECKPOINT_COLUMN)?))
}

/// Timestamp columns are TEXT by contract. An externally provisioned schema
/// may hold other storage classes there (epoch numbers in a DATETIME
/// column); those are kept as a value `parse_timestamp` rejects, so they
/// count as a malformed anchor rather than a read error.
fn timestamp_column(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Text(text) => Some(text),
        Value::Integer(n) => Some(format!("<integer {n}>")),
        Value::Real(x) => Some(format!("<real {x}>")),
        Value::Blob(bytes) => Some(format!("<blob {} bytes>", bytes.len())),
    }
}
