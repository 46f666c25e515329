//! Scheduler: triggers feed one serialized pass entry point.

use chrono::{Duration as ChronoDuration, Utc};
use mortuary_core::{
    accrual::format_timestamp,
    config::{CadenceConfig, EngineConfig, TriggerConfig},
    engine::ChargeEngine,
    record::{Currency, HeldRecord, RateCategory},
    scheduler::{
        run_exclusive, Cadence, PassOutcome, Scheduler, SchedulerHandle, SharedEngine,
        StatsSnapshot, Trigger,
    },
};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn held_since_yesterday(id: &str) -> HeldRecord {
    HeldRecord {
        id: id.into(),
        status: None,
        rate_category: RateCategory::Standard,
        currency: Currency::Kes,
        usd_daily_rate: None,
        created_at: Some(format_timestamp(Utc::now() - ChronoDuration::days(1))),
        last_charge_checkpoint: None,
        embalming_cost: None,
        accumulated_total: Some(0.0),
    }
}

fn shared_engine() -> SharedEngine {
    let engine = ChargeEngine::build_test().unwrap();
    engine
        .store()
        .insert_held_record(&held_since_yesterday("R1"))
        .unwrap();
    engine.store().insert_extra_charge("R1", Some(500.0)).unwrap();
    Arc::new(Mutex::new(engine))
}

async fn wait_for_passes(handle: &SchedulerHandle, at_least: u64) {
    for _ in 0..200 {
        if handle.stats().completed >= at_least {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!(
        "expected at least {at_least} passes, saw {:?}",
        handle.stats()
    );
}

async fn wait_for_stats(handle: &SchedulerHandle, done: impl Fn(&StatsSnapshot) -> bool) {
    for _ in 0..400 {
        if done(&handle.stats()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("scheduler stats never settled: {:?}", handle.stats());
}

#[test]
fn run_exclusive_coalesces_while_engine_is_busy() {
    let engine = shared_engine();
    let cancel = AtomicBool::new(false);

    let busy = engine.lock().unwrap();
    let outcome = run_exclusive(&engine, "tick", Utc::now(), &cancel);
    assert!(matches!(outcome, PassOutcome::Coalesced));
    drop(busy);

    let outcome = run_exclusive(&engine, "tick", Utc::now(), &cancel);
    assert!(matches!(outcome, PassOutcome::Completed(_)));
    assert_eq!(engine.lock().unwrap().store().pass_count().unwrap(), 1);
}

#[test]
fn run_exclusive_reports_selector_abort() {
    let engine = shared_engine();
    engine
        .lock()
        .unwrap()
        .store()
        .execute_raw("DROP TABLE held_records")
        .unwrap();

    let outcome = run_exclusive(&engine, "nightly", Utc::now(), &AtomicBool::new(false));

    assert!(matches!(outcome, PassOutcome::Aborted(_)));
}

#[test]
fn scheduler_builds_triggers_from_config() {
    let config = EngineConfig {
        triggers: vec![
            TriggerConfig {
                name: "tick".into(),
                cadence: CadenceConfig::EverySecs(10),
            },
            TriggerConfig {
                name: "startup".into(),
                cadence: CadenceConfig::OnceAfterSecs(0),
            },
        ],
        ..EngineConfig::default_test()
    };
    // Construction alone must not need a runtime.
    let _scheduler = Scheduler::from_config(shared_engine(), &config);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn startup_trigger_runs_one_pass() {
    let engine = shared_engine();
    let handle = Scheduler::new(
        Arc::clone(&engine),
        vec![Trigger::new("startup", Cadence::Once(Duration::ZERO))],
    )
    .start();

    wait_for_passes(&handle, 1).await;
    let stats = handle.stats();
    handle.shutdown().await.unwrap();

    assert_eq!(stats.completed, 1);
    let engine = engine.lock().unwrap();
    assert_eq!(engine.store().pass_count().unwrap(), 1);
    let total = engine
        .store()
        .held_record("R1")
        .unwrap()
        .unwrap()
        .accumulated_total
        .unwrap();
    // One day at 3000 plus the 500 extra, give or take test runtime.
    assert!((3500.0..3510.0).contains(&total), "total was {total}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overlapping_triggers_never_double_bill() {
    let engine = shared_engine();
    let handle = Scheduler::new(
        Arc::clone(&engine),
        vec![
            Trigger::new("tick", Cadence::Every(Duration::from_millis(100))),
            Trigger::new("fast", Cadence::Every(Duration::from_millis(100))),
            Trigger::new("startup", Cadence::Once(Duration::ZERO)),
        ],
    )
    .start();

    wait_for_passes(&handle, 4).await;
    handle.shutdown().await.unwrap();

    let engine = engine.lock().unwrap();
    let total = engine
        .store()
        .held_record("R1")
        .unwrap()
        .unwrap()
        .accumulated_total
        .unwrap();
    assert!((3500.0..3510.0).contains(&total), "total was {total}");
    assert_eq!(engine.store().ledger_entry_count("R1").unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_stops_further_passes() {
    let engine = shared_engine();
    let handle = Scheduler::new(
        Arc::clone(&engine),
        vec![Trigger::new("tick", Cadence::Every(Duration::from_millis(100)))],
    )
    .start();

    wait_for_passes(&handle, 1).await;
    handle.shutdown().await.unwrap();
    let logged = engine.lock().unwrap().store().pass_count().unwrap();

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(engine.lock().unwrap().store().pass_count().unwrap(), logged);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn firings_during_a_running_pass_are_coalesced() {
    let engine = shared_engine();
    {
        let engine = engine.lock().unwrap();
        for n in 0..500 {
            engine
                .store()
                .insert_held_record(&held_since_yesterday(&format!("BULK-{n:03}")))
                .unwrap();
        }
    }

    // Five firings at once into a one-slot queue while the first pass runs.
    let triggers: Vec<Trigger> = (0..5)
        .map(|n| Trigger::new(format!("burst-{n}"), Cadence::Once(Duration::ZERO)))
        .collect();
    let handle = Scheduler::new(Arc::clone(&engine), triggers).start();

    wait_for_stats(&handle, |s| s.completed + s.coalesced == 5).await;
    let stats = handle.shutdown().await.unwrap();

    assert!(stats.coalesced > 0, "stats: {stats:?}");
    assert!(stats.completed >= 1, "stats: {stats:?}");
    assert_eq!(stats.aborted, 0);
    let engine = engine.lock().unwrap();
    assert_eq!(engine.store().pass_count().unwrap() as u64, stats.completed);
    assert_eq!(engine.store().ledger_entry_count("R1").unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn firing_while_engine_is_held_is_coalesced() {
    let engine = shared_engine();
    let busy = engine.lock().unwrap();

    let handle = Scheduler::new(
        Arc::clone(&engine),
        vec![Trigger::new("startup", Cadence::Once(Duration::ZERO))],
    )
    .start();
    wait_for_stats(&handle, |s| s.coalesced >= 1).await;
    drop(busy);

    let stats = handle.shutdown().await.unwrap();
    assert_eq!(stats.completed, 0);
    assert_eq!(stats.coalesced, 1);
    assert_eq!(engine.lock().unwrap().store().pass_count().unwrap(), 0);
}
