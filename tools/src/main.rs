//! accrual-runner: host process for the mortuary charge accrual engine.
//!
//! Usage:
//!   accrual-runner --db mortuary.db --config accrual.json
//!   accrual-runner --db mortuary.db --once [--now 2024-01-02T12:00:00Z] [--trigger manual]
//!   accrual-runner --db mortuary.db --once --record BODY-0042

use anyhow::{Context, Result};
use chrono::Utc;
use mortuary_core::{
    accrual::parse_timestamp,
    config::EngineConfig,
    engine::ChargeEngine,
    report::{PassReport, RecordOutcome},
    scheduler::Scheduler,
    store::ChargeStore,
};
use std::env;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    check_flags(&args)?;
    let db = flag_value(&args, "--db").unwrap_or("mortuary.db");
    let once = args.iter().any(|a| a == "--once");
    let trigger = flag_value(&args, "--trigger").unwrap_or("manual");

    let config = match flag_value(&args, "--config") {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    println!("Mortuary charge accrual: accrual-runner");
    println!("  db:        {db}");
    println!("  mode:      {}", if once { "single pass" } else { "scheduled" });
    println!(
        "  rates:     KES basic {:.2} / premium {:.2}, USD fallback {:.2}",
        config.rates.kes_basic, config.rates.kes_premium, config.rates.usd_fallback
    );
    if let Some(journal) = &config.failure_journal {
        println!("  journal:   {}", journal.display());
    }

    let store = ChargeStore::open(db)?;
    store.migrate()?;
    // A malformed row only fails its own record during a pass; don't let it
    // stop startup here.
    match store.select_eligible(&config.terminal_status) {
        Ok(held) => println!("  held:      {} record(s) eligible for accrual", held.len()),
        Err(e) => log::warn!("cannot preview held records: {e}"),
    }
    println!();
    let mut engine = ChargeEngine::new(store, config);

    if once {
        let now = match flag_value(&args, "--now") {
            Some(raw) => parse_timestamp(raw).with_context(|| format!("invalid --now {raw:?}"))?,
            None => Utc::now(),
        };
        if let Some(record_id) = flag_value(&args, "--record") {
            let outcome = engine.recompute_one(record_id, now)?;
            print_outcome(&outcome);
            return Ok(());
        }
        let report = engine.run_pass(trigger, now, &AtomicBool::new(false))?;
        print_report(&report);
        print_history(&engine)?;
        return Ok(());
    }

    let triggers = engine.config().triggers.clone();
    if triggers.is_empty() {
        anyhow::bail!("no triggers configured; use --once for a single pass");
    }
    for t in &triggers {
        println!("  trigger {:<10} {:?}", t.name, t.cadence);
    }

    let config = engine.config().clone();
    let shared = Arc::new(Mutex::new(engine));
    let handle = Scheduler::from_config(Arc::clone(&shared), &config).start();

    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for ctrl-c")?;
    log::info!("ctrl-c received, shutting down");

    let stats = handle.shutdown().await?;

    println!();
    println!("=== SCHEDULER SUMMARY ===");
    println!("  passes completed: {}", stats.completed);
    println!("  triggers coalesced: {}", stats.coalesced);
    println!("  passes aborted:   {}", stats.aborted);

    let engine = shared
        .lock()
        .map_err(|_| anyhow::anyhow!("engine lock poisoned"))?;
    print_history(&engine)?;
    Ok(())
}

fn print_report(report: &PassReport) {
    println!("=== PASS {} ({}) ===", report.pass_id, report.trigger);
    println!("  billed through: {}", report.billed_through.to_rfc3339());
    println!("  examined:       {}", report.examined());
    println!("  updated:        {}", report.updated());
    println!("  skipped:        {}", report.skipped());
    println!("  failed:         {}", report.failed());
    if report.cancelled {
        println!("  (cancelled before completion)");
    }

    for outcome in &report.outcomes {
        print_outcome(outcome);
    }
}

fn print_outcome(outcome: &RecordOutcome) {
    match outcome {
        RecordOutcome::Updated {
            record_id,
            previous_total,
            new_total,
            breakdown,
            ..
        } => println!(
            "  {record_id:<16} {:>12.2} -> {new_total:>12.2}  (time {:.2}, charges {:.2})",
            previous_total.unwrap_or(0.0),
            breakdown.accrual,
            breakdown.charges()
        ),
        RecordOutcome::Skipped { record_id, reason } => {
            println!("  {record_id:<16} skipped: {reason:?}")
        }
        RecordOutcome::Failed(failure) => {
            println!("  {:<16} FAILED: {}", failure.record_id, failure.message)
        }
    }
}

fn print_history(engine: &ChargeEngine) -> Result<()> {
    println!();
    println!("=== RECENT PASSES ===");
    let passes = engine.store().recent_passes(5)?;
    if passes.is_empty() {
        println!("  (no passes logged yet)");
    }
    for p in &passes {
        println!(
            "  {} | {:<8} | examined {} updated {} skipped {} failed {}{}",
            p.started_at,
            p.trigger_name,
            p.examined,
            p.updated,
            p.skipped,
            p.failed,
            if p.cancelled { " (cancelled)" } else { "" }
        );
    }
    Ok(())
}

/// `--now` and `--record` only make sense for a single pass.
fn check_flags(args: &[String]) -> Result<()> {
    if args.iter().any(|a| a == "--once") {
        return Ok(());
    }
    for flag in ["--now", "--record"] {
        if args.iter().any(|a| a == flag) {
            anyhow::bail!(
                "{flag} requires --once\n\
                 usage: accrual-runner --db <path> --once [--now <RFC3339>] [--record <id>]"
            );
        }
    }
    Ok(())
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].as_str())
}
