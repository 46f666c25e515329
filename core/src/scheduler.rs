//! Scheduler: named triggers feeding one serialized pass entry point.
//!
//! Each trigger is a task that sleeps until its next fire time and offers a
//! firing into a capacity-1 channel. A single driver task consumes firings
//! and runs the pass on the blocking pool. Two passes never run at once:
//! firings that arrive while one is already queued are coalesced, and
//! `run_exclusive` refuses to start a pass while another holds the engine.

use crate::{
    config::{CadenceConfig, EngineConfig},
    engine::ChargeEngine,
    error::{AccrualError, AccrualResult},
    report::PassReport,
};
use chrono::{DateTime, NaiveTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

pub type SharedEngine = Arc<Mutex<ChargeEngine>>;

/// Shortest period an interval trigger may use.
const MIN_PERIOD: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum PassOutcome {
    Completed(PassReport),
    /// Another pass held the engine; this request did nothing.
    Coalesced,
    /// The selector failed; the engine has already logged and journaled it.
    Aborted(AccrualError),
}

/// The one entry point every trigger goes through.
pub fn run_exclusive(
    engine: &SharedEngine,
    trigger: &str,
    now: DateTime<Utc>,
    cancel: &AtomicBool,
) -> PassOutcome {
    let mut guard = match engine.try_lock() {
        Ok(guard) => guard,
        Err(TryLockError::WouldBlock) => {
            log::debug!("trigger {trigger}: pass already running, coalesced");
            return PassOutcome::Coalesced;
        }
        Err(TryLockError::Poisoned(poisoned)) => {
            // Record writes are transactional, so a panicked pass left no
            // partial state behind.
            log::warn!("engine lock poisoned by an earlier pass; continuing");
            poisoned.into_inner()
        }
    };
    match guard.run_pass(trigger, now, cancel) {
        Ok(report) => PassOutcome::Completed(report),
        Err(e) => PassOutcome::Aborted(e),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Every(Duration),
    /// Once a day at this UTC time.
    DailyAt(NaiveTime),
    Once(Duration),
}

impl Cadence {
    /// Delay from `now` until the next firing, or `None` once the cadence
    /// is exhausted.
    pub fn next_delay(&self, now: DateTime<Utc>, fired_before: bool) -> Option<Duration> {
        match *self {
            Cadence::Every(period) => Some(period.max(MIN_PERIOD)),
            Cadence::DailyAt(at) => Some(until_next_daily(now, at)),
            Cadence::Once(delay) if !fired_before => Some(delay),
            Cadence::Once(_) => None,
        }
    }
}

impl From<&CadenceConfig> for Cadence {
    fn from(config: &CadenceConfig) -> Self {
        match *config {
            CadenceConfig::EverySecs(secs) => Cadence::Every(Duration::from_secs(secs)),
            CadenceConfig::DailyAt(at) => Cadence::DailyAt(at),
            CadenceConfig::OnceAfterSecs(secs) => Cadence::Once(Duration::from_secs(secs)),
        }
    }
}

/// Strictly after `now`: firing exactly at `at` schedules tomorrow's run.
pub fn until_next_daily(now: DateTime<Utc>, at: NaiveTime) -> Duration {
    let today = now.date_naive().and_time(at).and_utc();
    let next = if today > now {
        today
    } else {
        today + chrono::Duration::days(1)
    };
    (next - now).to_std().unwrap_or(Duration::ZERO)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub name: String,
    pub cadence: Cadence,
}

impl Trigger {
    pub fn new(name: impl Into<String>, cadence: Cadence) -> Self {
        Self {
            name: name.into(),
            cadence,
        }
    }
}

#[derive(Debug, Default)]
struct SchedulerStats {
    completed: AtomicU64,
    coalesced: AtomicU64,
    aborted: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub completed: u64,
    pub coalesced: u64,
    pub aborted: u64,
}

pub struct Scheduler {
    engine: SharedEngine,
    triggers: Vec<Trigger>,
}

impl Scheduler {
    pub fn new(engine: SharedEngine, triggers: Vec<Trigger>) -> Self {
        Self { engine, triggers }
    }

    pub fn from_config(engine: SharedEngine, config: &EngineConfig) -> Self {
        let triggers = config
            .triggers
            .iter()
            .map(|t| Trigger::new(t.name.clone(), Cadence::from(&t.cadence)))
            .collect();
        Self::new(engine, triggers)
    }

    /// Spawn the trigger tasks and the driver. Must be called from within
    /// a Tokio runtime.
    pub fn start(self) -> SchedulerHandle {
        let (fire_tx, fire_rx) = mpsc::channel::<String>(1);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let cancel = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(SchedulerStats::default());

        log::info!(
            "scheduler starting with triggers: {}",
            self.triggers
                .iter()
                .map(|t| t.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let trigger_tasks: Vec<JoinHandle<()>> = self
            .triggers
            .into_iter()
            .map(|trigger| {
                tokio::spawn(trigger_loop(trigger, fire_tx.clone(), Arc::clone(&stats)))
            })
            .collect();
        drop(fire_tx);

        let driver = tokio::spawn(drive(
            self.engine,
            fire_rx,
            shutdown_rx,
            Arc::clone(&cancel),
            Arc::clone(&stats),
            trigger_tasks,
        ));

        SchedulerHandle {
            shutdown_tx,
            cancel,
            stats,
            driver,
        }
    }
}

pub struct SchedulerHandle {
    shutdown_tx: mpsc::Sender<()>,
    cancel: Arc<AtomicBool>,
    stats: Arc<SchedulerStats>,
    driver: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn stats(&self) -> StatsSnapshot {
        snapshot(&self.stats)
    }

    /// Cancel any running pass at its next record boundary, stop the
    /// triggers and wait for the driver to exit. Returns the final counts.
    pub async fn shutdown(self) -> AccrualResult<StatsSnapshot> {
        self.cancel.store(true, Ordering::SeqCst);
        // The driver may already be gone; joining below is what matters.
        let _ = self.shutdown_tx.send(()).await;
        let stats = Arc::clone(&self.stats);
        self.driver
            .await
            .map_err(|e| AccrualError::Task(e.to_string()))?;
        Ok(snapshot(&stats))
    }
}

fn snapshot(stats: &SchedulerStats) -> StatsSnapshot {
    StatsSnapshot {
        completed: stats.completed.load(Ordering::SeqCst),
        coalesced: stats.coalesced.load(Ordering::SeqCst),
        aborted: stats.aborted.load(Ordering::SeqCst),
    }
}

async fn trigger_loop(trigger: Trigger, fire_tx: mpsc::Sender<String>, stats: Arc<SchedulerStats>) {
    let mut fired = false;
    while let Some(delay) = trigger.cadence.next_delay(Utc::now(), fired) {
        tokio::time::sleep(delay).await;
        fired = true;
        match fire_tx.try_send(trigger.name.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                stats.coalesced.fetch_add(1, Ordering::SeqCst);
                log::debug!("trigger {}: a pass is already queued, coalesced", trigger.name);
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }
    log::debug!("trigger {} finished", trigger.name);
}

async fn drive(
    engine: SharedEngine,
    mut fire_rx: mpsc::Receiver<String>,
    mut shutdown_rx: mpsc::Receiver<()>,
    cancel: Arc<AtomicBool>,
    stats: Arc<SchedulerStats>,
    trigger_tasks: Vec<JoinHandle<()>>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                log::info!("scheduler received shutdown signal");
                break;
            }
            fired = fire_rx.recv() => {
                let Some(trigger) = fired else {
                    log::info!("all triggers exhausted; waiting for shutdown");
                    shutdown_rx.recv().await;
                    break;
                };
                if cancel.load(Ordering::SeqCst) {
                    break;
                }
                let engine = Arc::clone(&engine);
                let cancel = Arc::clone(&cancel);
                let outcome = tokio::task::spawn_blocking(move || {
                    run_exclusive(&engine, &trigger, Utc::now(), &cancel)
                })
                .await;

                match outcome {
                    Ok(PassOutcome::Completed(_)) => {
                        stats.completed.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(PassOutcome::Coalesced) => {
                        stats.coalesced.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(PassOutcome::Aborted(_)) => {
                        stats.aborted.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => {
                        stats.aborted.fetch_add(1, Ordering::SeqCst);
                        log::error!("pass task failed: {e}");
                    }
                }
            }
        }
    }

    for task in trigger_tasks {
        task.abort();
    }
    log::info!("scheduler stopped");
}
