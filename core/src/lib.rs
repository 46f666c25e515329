//! Mortuary charge accrual engine.
//!
//! Periodically recomputes the balance owed for every body currently held:
//! time-based holding fees since the last checkpoint plus coffin, embalming
//! and extra charges, each billed exactly once.

pub mod accrual;
pub mod aggregator;
pub mod config;
pub mod engine;
pub mod error;
pub mod journal;
pub mod rate;
pub mod record;
pub mod report;
pub mod scheduler;
pub mod store;
pub mod types;
