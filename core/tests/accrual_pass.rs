//! Time-based accrual through full passes.
//!
//! Covers the reference scenario (36 h at the basic KES rate), single
//! application of each elapsed window, non-negative elapsed time, terminal
//! exclusion, and the non-positive-rate skip.

use chrono::{DateTime, Utc};
use mortuary_core::{
    accrual::parse_timestamp,
    aggregator::plan_recompute,
    config::{EngineConfig, RateTable},
    engine::ChargeEngine,
    error::AccrualError,
    record::{Currency, HeldRecord, RateCategory},
    report::{RecordOutcome, SkipReason},
    store::ChargeStore,
};
use std::sync::atomic::AtomicBool;

fn ts(raw: &str) -> DateTime<Utc> {
    parse_timestamp(raw).expect("valid timestamp")
}

fn held(id: &str, created_at: &str) -> HeldRecord {
    HeldRecord {
        id: id.into(),
        status: None,
        rate_category: RateCategory::Standard,
        currency: Currency::Kes,
        usd_daily_rate: None,
        created_at: Some(created_at.into()),
        last_charge_checkpoint: None,
        embalming_cost: None,
        accumulated_total: Some(0.0),
    }
}

fn run(engine: &mut ChargeEngine, now: &str) -> mortuary_core::report::PassReport {
    engine
        .run_pass("test", ts(now), &AtomicBool::new(false))
        .expect("pass should not abort")
}

fn total(engine: &ChargeEngine, id: &str) -> f64 {
    engine
        .store()
        .held_record(id)
        .unwrap()
        .expect("record exists")
        .accumulated_total
        .expect("total written")
}

fn checkpoint(engine: &ChargeEngine, id: &str) -> Option<DateTime<Utc>> {
    engine
        .store()
        .held_record(id)
        .unwrap()
        .expect("record exists")
        .last_charge_checkpoint
        .as_deref()
        .and_then(parse_timestamp)
}

#[test]
fn thirty_six_hours_at_basic_rate() {
    let mut engine = ChargeEngine::build_test().unwrap();
    engine
        .store()
        .insert_held_record(&held("R1", "2024-01-01T00:00:00Z"))
        .unwrap();

    let report = run(&mut engine, "2024-01-02T12:00:00Z");

    assert_eq!(report.updated(), 1);
    assert!((total(&engine, "R1") - 4500.0).abs() < 1e-6);
    assert_eq!(checkpoint(&engine, "R1"), Some(ts("2024-01-02T12:00:00Z")));
}

#[test]
fn same_window_is_never_billed_twice() {
    let mut engine = ChargeEngine::build_test().unwrap();
    let mut record = held("R1", "2023-12-25T00:00:00Z");
    record.last_charge_checkpoint = Some("2024-01-01T00:00:00Z".into());
    record.accumulated_total = Some(1000.0);
    engine.store().insert_held_record(&record).unwrap();

    run(&mut engine, "2024-01-02T12:00:00Z");
    assert!((total(&engine, "R1") - 5500.0).abs() < 1e-6);

    // Immediately again: nothing elapsed, nothing added.
    run(&mut engine, "2024-01-02T12:00:00Z");
    assert!((total(&engine, "R1") - 5500.0).abs() < 1e-6);

    // One second later: one second's worth.
    run(&mut engine, "2024-01-02T12:00:01Z");
    let expected = 5500.0 + 3000.0 / 86_400.0;
    assert!((total(&engine, "R1") - expected).abs() < 1e-6);
    assert_eq!(checkpoint(&engine, "R1"), Some(ts("2024-01-02T12:00:01Z")));
}

#[test]
fn split_passes_bill_the_same_as_one() {
    let mut split = ChargeEngine::build_test().unwrap();
    let mut single = ChargeEngine::build_test().unwrap();
    for engine in [&split, &single] {
        engine
            .store()
            .insert_held_record(&held("R1", "2024-01-01T00:00:00Z"))
            .unwrap();
    }

    for now in [
        "2024-01-01T06:00:00Z",
        "2024-01-01T18:00:00Z",
        "2024-01-02T03:30:00Z",
        "2024-01-03T00:00:00Z",
    ] {
        run(&mut split, now);
    }
    run(&mut single, "2024-01-03T00:00:00Z");

    assert!((total(&split, "R1") - 6000.0).abs() < 1e-6);
    assert!((total(&split, "R1") - total(&single, "R1")).abs() < 1e-6);
}

#[test]
fn premium_and_usd_rates_apply() {
    let mut engine = ChargeEngine::build_test().unwrap();

    let mut premium = held("P", "2024-01-01T00:00:00Z");
    premium.rate_category = RateCategory::Premium;
    let mut usd_override = held("U1", "2024-01-01T00:00:00Z");
    usd_override.currency = Currency::Usd;
    usd_override.usd_daily_rate = Some(200.0);
    let mut usd_fallback = held("U2", "2024-01-01T00:00:00Z");
    usd_fallback.currency = Currency::Usd;

    for r in [&premium, &usd_override, &usd_fallback] {
        engine.store().insert_held_record(r).unwrap();
    }

    run(&mut engine, "2024-01-02T00:00:00Z");

    assert!((total(&engine, "P") - 5000.0).abs() < 1e-6);
    assert!((total(&engine, "U1") - 200.0).abs() < 1e-6);
    assert!((total(&engine, "U2") - 130.0).abs() < 1e-6);
}

#[test]
fn malformed_checkpoint_bills_nothing_and_is_repaired() {
    let mut engine = ChargeEngine::build_test().unwrap();
    let mut record = held("R1", "2024-01-01T00:00:00Z");
    record.last_charge_checkpoint = Some("last tuesday".into());
    record.accumulated_total = Some(700.0);
    engine.store().insert_held_record(&record).unwrap();

    let report = run(&mut engine, "2024-01-05T00:00:00Z");

    assert_eq!(report.failed(), 0);
    assert_eq!(total(&engine, "R1"), 700.0);
    assert_eq!(checkpoint(&engine, "R1"), Some(ts("2024-01-05T00:00:00Z")));
}

#[test]
fn future_checkpoint_bills_nothing_and_does_not_move_back() {
    let mut engine = ChargeEngine::build_test().unwrap();
    let mut record = held("R1", "2024-01-01T00:00:00Z");
    record.last_charge_checkpoint = Some("2024-01-03T00:00:00Z".into());
    engine.store().insert_held_record(&record).unwrap();

    run(&mut engine, "2024-01-02T00:00:00Z");

    assert_eq!(total(&engine, "R1"), 0.0);
    assert_eq!(checkpoint(&engine, "R1"), Some(ts("2024-01-03T00:00:00Z")));

    // Once the clock catches up only time after the checkpoint is billed.
    run(&mut engine, "2024-01-03T12:00:00Z");
    assert!((total(&engine, "R1") - 1500.0).abs() < 1e-6);
}

#[test]
fn sql_style_created_at_is_accepted() {
    let mut engine = ChargeEngine::build_test().unwrap();
    engine
        .store()
        .insert_held_record(&held("R1", "2024-01-01 00:00:00"))
        .unwrap();

    run(&mut engine, "2024-01-02T00:00:00Z");

    assert!((total(&engine, "R1") - 3000.0).abs() < 1e-6);
}

#[test]
fn complete_records_are_never_selected_or_touched() {
    let mut engine = ChargeEngine::build_test().unwrap();
    let mut done = held("DONE", "2024-01-01T00:00:00Z");
    done.status = Some("Complete".into());
    done.accumulated_total = Some(123.0);
    done.last_charge_checkpoint = Some("2024-01-01T00:00:00Z".into());
    done.embalming_cost = Some(900.0);
    let mut active = held("ACTIVE", "2024-01-01T00:00:00Z");
    active.status = Some("In storage".into());
    let unset = held("UNSET", "2024-01-01T00:00:00Z");
    let mut no_created = held("NO_CREATED", "2024-01-01T00:00:00Z");
    no_created.created_at = None;

    for r in [&done, &active, &unset, &no_created] {
        engine.store().insert_held_record(r).unwrap();
    }
    engine.store().insert_extra_charge("DONE", Some(50.0)).unwrap();

    let ids = engine.store().eligible_record_ids("Complete").unwrap();
    assert_eq!(ids, vec!["ACTIVE".to_string(), "UNSET".to_string()]);

    let before = engine.store().held_record("DONE").unwrap();
    let report = run(&mut engine, "2024-01-02T00:00:00Z");
    let after = engine.store().held_record("DONE").unwrap();

    assert!(report.outcome_for("DONE").is_none());
    assert_eq!(before, after);
    assert_eq!(engine.store().ledger_entry_count("DONE").unwrap(), 0);
    assert_eq!(engine.store().embalming_billed("DONE").unwrap(), 0.0);
}

#[test]
fn record_finalized_after_selection_is_skipped() {
    let mut engine = ChargeEngine::build_test().unwrap();
    engine
        .store()
        .insert_held_record(&held("R1", "2024-01-01T00:00:00Z"))
        .unwrap();
    engine.store().set_status("R1", Some("Complete")).unwrap();

    let outcome = engine
        .recompute_record("R1", ts("2024-01-02T00:00:00Z"))
        .unwrap();

    assert_eq!(
        outcome,
        RecordOutcome::Skipped {
            record_id: "R1".into(),
            reason: SkipReason::Finalized,
        }
    );
    assert_eq!(total(&engine, "R1"), 0.0);
}

#[test]
fn non_positive_rate_leaves_record_untouched() {
    let config = EngineConfig {
        rates: RateTable {
            kes_basic: 0.0,
            ..RateTable::default()
        },
        ..EngineConfig::default_test()
    };
    let mut engine = ChargeEngine::build_test_with(config).unwrap();
    let mut basic = held("BASIC", "2024-01-01T00:00:00Z");
    basic.last_charge_checkpoint = Some("2024-01-01T00:00:00Z".into());
    basic.accumulated_total = Some(250.0);
    let mut premium = held("PREMIUM", "2024-01-01T00:00:00Z");
    premium.rate_category = RateCategory::Premium;
    engine.store().insert_held_record(&basic).unwrap();
    engine.store().insert_held_record(&premium).unwrap();

    let report = run(&mut engine, "2024-01-02T00:00:00Z");

    assert_eq!(
        report.outcome_for("BASIC"),
        Some(&RecordOutcome::Skipped {
            record_id: "BASIC".into(),
            reason: SkipReason::NoBillableRate,
        })
    );
    assert_eq!(total(&engine, "BASIC"), 250.0);
    assert_eq!(checkpoint(&engine, "BASIC"), Some(ts("2024-01-01T00:00:00Z")));
    assert!((total(&engine, "PREMIUM") - 5000.0).abs() < 1e-6);
}

#[test]
fn billing_state_survives_reopen() {
    let path = std::env::temp_dir().join(format!("accrual-{}.db", uuid::Uuid::new_v4()));
    let path = path.to_string_lossy().into_owned();

    let store = ChargeStore::open(&path).unwrap();
    store.migrate().unwrap();
    store
        .insert_held_record(&held("R1", "2024-01-01T00:00:00Z"))
        .unwrap();
    store.insert_extra_charge("R1", Some(200.0)).unwrap();
    let reopened = store.reopen().unwrap();

    let mut first = ChargeEngine::new(store, EngineConfig::default_test());
    run(&mut first, "2024-01-02T00:00:00Z");
    drop(first);

    let mut second = ChargeEngine::new(reopened, EngineConfig::default_test());
    assert_eq!(second.store().select_eligible("Complete").unwrap().len(), 1);
    assert_eq!(total(&second, "R1"), 3200.0);

    // Same instant again: the extra is ledgered and no time has passed.
    run(&mut second, "2024-01-02T00:00:00Z");
    assert_eq!(total(&second, "R1"), 3200.0);

    drop(second);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn single_record_recompute_rejects_unknown_id() {
    let mut engine = ChargeEngine::build_test().unwrap();
    engine
        .store()
        .insert_held_record(&held("R1", "2024-01-01T00:00:00Z"))
        .unwrap();

    let outcome = engine
        .recompute_one("R1", ts("2024-01-01T12:00:00Z"))
        .unwrap();
    assert!(matches!(outcome, RecordOutcome::Updated { .. }));
    assert_eq!(total(&engine, "R1"), 1500.0);

    let err = engine
        .recompute_one("NOPE", ts("2024-01-01T12:00:00Z"))
        .unwrap_err();
    assert!(matches!(err, AccrualError::RecordNotFound { .. }));
}

#[test]
fn non_text_timestamps_are_treated_as_malformed() {
    let mut engine = ChargeEngine::build_test().unwrap();
    // Externally provisioned schema: DATETIME columns holding epoch millis.
    engine
        .store()
        .execute_raw(
            "DROP TABLE held_records;
             CREATE TABLE held_records (
                 id                      TEXT PRIMARY KEY,
                 status                  TEXT,
                 rate_category           TEXT,
                 currency                TEXT,
                 usd_daily_rate          REAL,
                 created_at              DATETIME,
                 last_charge_checkpoint  DATETIME,
                 embalming_cost          REAL,
                 accumulated_total       REAL
             );
             INSERT INTO held_records (id, created_at, last_charge_checkpoint, accumulated_total)
             VALUES ('EPOCH_CP', '2024-01-01T00:00:00Z', 1704067200000, 700.0),
                    ('EPOCH_CREATED', 1704067200000, NULL, 0.0);",
        )
        .unwrap();

    let report = run(&mut engine, "2024-01-02T00:00:00Z");

    assert_eq!(report.failed(), 0);
    assert_eq!(report.updated(), 2);
    assert_eq!(total(&engine, "EPOCH_CP"), 700.0);
    assert_eq!(total(&engine, "EPOCH_CREATED"), 0.0);
    for id in ["EPOCH_CP", "EPOCH_CREATED"] {
        assert_eq!(checkpoint(&engine, id), Some(ts("2024-01-02T00:00:00Z")));
    }

    // Repaired checkpoints accrue normally from here on.
    run(&mut engine, "2024-01-03T00:00:00Z");
    assert!((total(&engine, "EPOCH_CP") - 3700.0).abs() < 1e-6);
    assert!((total(&engine, "EPOCH_CREATED") - 3000.0).abs() < 1e-6);
}

#[test]
fn update_only_lands_on_the_row_that_was_read() {
    let mut store = ChargeStore::in_memory().unwrap();
    store.migrate().unwrap();
    store
        .insert_held_record(&held("R1", "2024-01-01T00:00:00Z"))
        .unwrap();
    store.insert_extra_charge("R1", Some(100.0)).unwrap();
    let now = ts("2024-01-02T00:00:00Z");
    let rates = RateTable::default();

    let err = store
        .recompute_record("R1", "Complete", now, |snapshot| {
            let mut plan = plan_recompute(snapshot, &rates, now);
            plan.record_id = "ELSEWHERE".into();
            plan
        })
        .unwrap_err();

    assert!(matches!(err, AccrualError::StaleCheckpoint { .. }));
    // Ledger rows written before the failed update are rolled back too.
    let record = store.held_record("R1").unwrap().unwrap();
    assert_eq!(record.accumulated_total, Some(0.0));
    assert_eq!(record.last_charge_checkpoint, None);
    assert_eq!(store.ledger_entry_count("ELSEWHERE").unwrap(), 0);
    assert_eq!(store.unbilled_extra_lines("R1").unwrap().len(), 1);
}
