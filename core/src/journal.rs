//! Append-only failure journal (JSON lines).
//!
//! One line per pass-level abort and one per failed record. A pass's
//! record failures go out in a single append when the pass ends.

use crate::{
    accrual::format_timestamp,
    error::{AccrualError, AccrualResult},
    report::PassReport,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalKind {
    PassAborted,
    RecordFailed,
}

#[derive(Debug, Serialize)]
struct JournalEntry<'a> {
    timestamp: String,
    kind: JournalKind,
    pass_id: &'a str,
    trigger: &'a str,
    record_id: Option<&'a str>,
    message: &'a str,
    trace: &'a [String],
}

#[derive(Debug, Clone, Default)]
pub struct FailureJournal {
    path: Option<PathBuf>,
}

impl FailureJournal {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    /// Append every record failure of `report`. Returns how many were written.
    pub fn record_failures(&self, report: &PassReport) -> AccrualResult<usize> {
        let timestamp = format_timestamp(report.finished_at);
        let mut lines = String::new();
        let mut written = 0;
        for failure in report.failures() {
            let entry = JournalEntry {
                timestamp: timestamp.clone(),
                kind: JournalKind::RecordFailed,
                pass_id: &report.pass_id,
                trigger: &report.trigger,
                record_id: Some(&failure.record_id),
                message: &failure.message,
                trace: &failure.trace,
            };
            lines.push_str(&serde_json::to_string(&entry)?);
            lines.push('\n');
            written += 1;
        }
        if written > 0 {
            self.append(&lines)?;
        }
        Ok(written)
    }

    pub fn pass_aborted(
        &self,
        pass_id: &str,
        trigger: &str,
        error: &AccrualError,
        at: DateTime<Utc>,
    ) -> AccrualResult<()> {
        let message = error.to_string();
        let trace = error.trace();
        let entry = JournalEntry {
            timestamp: format_timestamp(at),
            kind: JournalKind::PassAborted,
            pass_id,
            trigger,
            record_id: None,
            message: &message,
            trace: &trace,
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        self.append(&line)
    }

    fn append(&self, lines: &str) -> AccrualResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(lines.as_bytes())?;
        Ok(())
    }
}
