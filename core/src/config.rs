use crate::types::{Money, DEFAULT_TERMINAL_STATUS};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Daily holding rates. A non-positive value disables time-based accrual
/// for every record that resolves to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateTable {
    pub kes_basic: Money,
    pub kes_premium: Money,
    /// Used for USD records without a positive per-record override.
    pub usd_fallback: Money,
}

impl Default for RateTable {
    fn default() -> Self {
        Self {
            kes_basic: 3000.0,
            kes_premium: 5000.0,
            usd_fallback: 130.0,
        }
    }
}

/// When a named trigger fires. Daily times are UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CadenceConfig {
    EverySecs(u64),
    DailyAt(NaiveTime),
    OnceAfterSecs(u64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub name: String,
    pub cadence: CadenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub rates: RateTable,
    pub terminal_status: String,
    /// Append-only JSON-lines file receiving pass and record failures.
    pub failure_journal: Option<PathBuf>,
    pub triggers: Vec<TriggerConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rates: RateTable::default(),
            terminal_status: DEFAULT_TERMINAL_STATUS.to_string(),
            failure_journal: None,
            triggers: default_triggers(),
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {}: {e}", path.display()))?;
        let config: EngineConfig = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Invalid engine config {}: {e}", path.display()))?;
        if config.terminal_status.trim().is_empty() {
            anyhow::bail!("{}: terminal_status must not be empty", path.display());
        }
        Ok(config)
    }

    /// Default rates, no journal and no triggers. Tests drive passes directly.
    pub fn default_test() -> Self {
        Self {
            triggers: Vec::new(),
            ..Self::default()
        }
    }
}

/// Short interval tick, coarse nightly run, and a one-shot kick after startup.
fn default_triggers() -> Vec<TriggerConfig> {
    vec![
        TriggerConfig {
            name: "tick".into(),
            cadence: CadenceConfig::EverySecs(10),
        },
        TriggerConfig {
            name: "nightly".into(),
            cadence: CadenceConfig::DailyAt(NaiveTime::MIN),
        },
        TriggerConfig {
            name: "startup".into(),
            cadence: CadenceConfig::OnceAfterSecs(5),
        },
    ]
}
