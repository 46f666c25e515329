//! Shared primitive types used across the accrual engine.

/// Primary key of a row in `held_records`.
pub type RecordId = String;

/// Monetary amount in the record's billing currency.
pub type Money = f64;

/// Identifier of one recomputation pass (uuid v4, hyphenated).
pub type PassId = String;

/// Status value that takes a record permanently out of the engine's scope.
pub const DEFAULT_TERMINAL_STATUS: &str = "Complete";

pub const MS_PER_DAY: f64 = 86_400_000.0;
