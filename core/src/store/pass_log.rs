//! Store methods for the pass history.

use super::ChargeStore;
use crate::{error::AccrualResult, types::PassId};
use rusqlite::params;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassLogRow {
    pub pass_id: PassId,
    pub trigger_name: String,
    pub started_at: String,
    pub finished_at: String,
    pub examined: i64,
    pub updated: i64,
    pub skipped: i64,
    pub failed: i64,
    pub cancelled: bool,
}

impl ChargeStore {
    pub fn append_pass_log(&self, row: &PassLogRow) -> AccrualResult<()> {
        self.conn.execute(
            "INSERT INTO pass_log (
                pass_id, trigger_name, started_at, finished_at,
                examined, updated, skipped, failed, cancelled
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                row.pass_id,
                row.trigger_name,
                row.started_at,
                row.finished_at,
                row.examined,
                row.updated,
                row.skipped,
                row.failed,
                row.cancelled as i32,
            ],
        )?;
        Ok(())
    }

    /// Most recent passes first.
    pub fn recent_passes(&self, limit: usize) -> AccrualResult<Vec<PassLogRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT pass_id, trigger_name, started_at, finished_at,
                    examined, updated, skipped, failed, cancelled
             FROM pass_log
             ORDER BY started_at DESC, rowid DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(PassLogRow {
                pass_id: row.get(0)?,
                trigger_name: row.get(1)?,
                started_at: row.get(2)?,
                finished_at: row.get(3)?,
                examined: row.get(4)?,
                updated: row.get(5)?,
                skipped: row.get(6)?,
                failed: row.get(7)?,
                cancelled: row.get::<_, i32>(8)? != 0,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn pass_count(&self) -> AccrualResult<i64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM pass_log", [], |row| row.get(0))?;
        Ok(count)
    }
}
