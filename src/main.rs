//! ⚖️ Mandate Arbiter - Deterministic Decision Gate
//!
//! Sits between strategy policy modules and the execution layer. Each cycle
//! it gathers proposals per tracked symbol, validates them, arbitrates the
//! competing mandates under a fixed precedence (veto, EXIT, BLOCK, ENTRY)
//! and emits at most one audited decision per (symbol, cycle).
//!
//! ## Architecture
//! - Proposal Bus (UDP): proposals, vetoes and execution reports in
//! - Decision Bus (UDP): arbitrated decisions out
//! - Per-symbol workers: one single-writer task per tracked symbol
//! - Audit trail: CSV append, flushed before outward publication
//! - Position snapshot: JSON, reloaded on restart

mod bus;
mod config;
mod cycle;
mod emitter;
mod mandate;
mod position;
mod registry;

use anyhow::{Context, Result};
use log::{error, info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bus::{ExecutionEvent, ProposalBusReceiver, ProposalInbox};
use config::Config;
use cycle::{CycleConfig, SymbolWorker};
use emitter::{AuditWriter, DecisionEmitter, DecisionPublisher, HaltLedger, PublisherConfig};
use mandate::validator::ProposalValidator;
use position::{PositionStateMachine, PositionStore};
use registry::{PolicyRegistry, Universe, VetoSource};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    dotenv::dotenv().ok();
    let config = Arc::new(Config::from_env().context("Failed to load configuration")?);
    config.validate().context("Invalid configuration")?;

    // RUST_LOG still wins; the config level is the fallback.
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.log_level.as_str()),
    )
    .init();
    info!("✅ Configuration: Loaded");

    print_banner(&config);

    // Tracked universe and validator
    let universe = Arc::new(Universe::new(
        config.universe.symbols.clone(),
        config.universe.primitives.clone(),
    ));
    let validator = Arc::new(ProposalValidator::new(universe.clone()));
    info!(
        "✅ Universe: {} symbol(s), {} primitive(s)",
        universe.symbol_count(),
        config.universe.primitives.len()
    );

    // Restore persisted position states
    let store = Arc::new(PositionStore::new(&config.persistence.snapshot_path));
    let restored = store
        .load()
        .context("Failed to load position snapshot")?;
    if restored.is_empty() {
        info!("✅ Position states: cold start");
    } else {
        info!("✅ Position states: restored {} symbol(s)", restored.len());
    }
    let machine = Arc::new(Mutex::new(PositionStateMachine::from_states(restored)));

    // Halt ledger and emitter stack
    let halts = Arc::new(HaltLedger::new());
    let publisher = Arc::new(
        DecisionPublisher::new(
            PublisherConfig {
                target_addr: config.network.decision_bus_addr,
                queue_bound: config.emitter.publish_queue_bound,
                max_retries: config.emitter.publish_max_retries,
                backoff_base_ms: config.emitter.publish_backoff_ms,
            },
            halts.clone(),
        )
        .await
        .context("Failed to create decision publisher")?,
    );
    tokio::spawn(publisher.clone().run());
    info!(
        "✅ Decision bus: publishing to {}",
        config.network.decision_bus_addr
    );

    let audit = AuditWriter::new(&config.persistence.audit_path)
        .context("Failed to open audit trail")?;
    let emitter = Arc::new(DecisionEmitter::new(
        audit,
        publisher.clone(),
        config.emitter.audit_max_retries,
        config.emitter.audit_backoff_ms,
    ));
    info!(
        "✅ Audit trail: {}",
        config.persistence.audit_path.display()
    );

    // Proposal bus: out-of-process policy sources, vetoes, execution reports
    let inbox = Arc::new(ProposalInbox::new(universe.clone()));
    let receiver = ProposalBusReceiver::new(config.network.proposal_bus_addr, inbox.clone())
        .await
        .context("Failed to start proposal bus receiver")?;
    let mut execution_events = receiver.start();

    // In-process policy sources register here; the bus inbox covers the rest.
    let registry = Arc::new(PolicyRegistry::new(vec![]));
    if registry.is_empty() {
        info!("ℹ️  No in-process policy sources; proposals arrive on the bus");
    }

    // One single-writer worker per tracked symbol
    let cycle_config = CycleConfig {
        interval: Duration::from_millis(config.arbitration.cycle_interval_ms),
        budget: Duration::from_millis(config.arbitration.cycle_budget_ms),
    };
    for symbol in universe.symbols() {
        let worker = SymbolWorker::new(
            symbol.to_string(),
            cycle_config.clone(),
            validator.clone(),
            registry.clone(),
            Some(inbox.clone()),
            Some(inbox.clone() as Arc<dyn VetoSource>),
            machine.clone(),
            store.clone(),
            emitter.clone(),
            halts.clone(),
        );
        tokio::spawn(worker.run());
    }
    info!("✅ Workers: {} spawned", universe.symbol_count());

    // Periodic stats heartbeat
    {
        let halts = halts.clone();
        let publisher = publisher.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                let (sent, errors, dropped) = publisher.stats();
                info!(
                    "📊 Stats: sent={} send_errors={} dropped={} backlog={} halted={}",
                    sent,
                    errors,
                    dropped,
                    publisher.backlog(),
                    halts.halted_count()
                );
            }
        });
    }

    info!("🔍 Status: ARBITRATING...");

    // Execution reports drive lifecycle transitions outside the cycle path
    while let Some(event) = execution_events.recv().await {
        match event {
            ExecutionEvent::Confirm { symbol, cycle_id } => {
                if let Err(e) = apply_confirm(&machine, &store, &symbol, cycle_id) {
                    warn!("⚠️  Confirm refused for {} cycle {}: {}", symbol, cycle_id, e);
                }
            }
            ExecutionEvent::Fault { symbol, cycle_id } => {
                if let Err(e) = apply_fault(&machine, &store, &symbol, cycle_id) {
                    error!("❌ Fault not applied for {} cycle {}: {}", symbol, cycle_id, e);
                }
            }
        }
    }

    warn!("⚠️  Proposal bus receiver stopped, shutting down");
    Ok(())
}

fn apply_confirm(
    machine: &Arc<Mutex<PositionStateMachine>>,
    store: &Arc<PositionStore>,
    symbol: &str,
    cycle_id: u64,
) -> Result<()> {
    let mut guard = machine
        .lock()
        .map_err(|_| anyhow::anyhow!("state machine lock poisoned"))?;
    let event = guard.confirm(symbol, cycle_id)?;
    store.save(&guard.snapshot())?;
    info!(
        "✅ Execution confirmed: {} {} -> {}",
        symbol,
        event.from_state.as_str(),
        event.to_state.as_str()
    );
    Ok(())
}

fn apply_fault(
    machine: &Arc<Mutex<PositionStateMachine>>,
    store: &Arc<PositionStore>,
    symbol: &str,
    cycle_id: u64,
) -> Result<()> {
    let mut guard = machine
        .lock()
        .map_err(|_| anyhow::anyhow!("state machine lock poisoned"))?;
    let event = guard.fault(symbol, cycle_id)?;
    store.save(&guard.snapshot())?;
    error!(
        "💥 Execution fault: {} {} -> {}",
        symbol,
        event.from_state.as_str(),
        event.to_state.as_str()
    );
    Ok(())
}

fn print_banner(config: &Config) {
    println!("\n======================================================================");
    println!("⚖️  MANDATE ARBITER - DECISION GATE");
    println!("======================================================================");
    println!("⏰ {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
    println!("📈 Symbols: {}", config.universe.symbols.join(", "));
    println!(
        "🔁 Cycle: every {}ms, budget {}ms",
        config.arbitration.cycle_interval_ms, config.arbitration.cycle_budget_ms
    );
    println!("📻 Proposal bus: {}", config.network.proposal_bus_addr);
    println!("📣 Decision bus: {}", config.network.decision_bus_addr);
    println!("📝 Audit: {}", config.persistence.audit_path.display());
    println!("======================================================================\n");
}
