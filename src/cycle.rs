//! 🔁 Per-Symbol Cycle Runner
//!
//! One worker per symbol owns the whole read-state → arbitrate → emit →
//! transition → persist sequence, so a cycle is never partially applied and
//! the state read by arbitration is serialized against the transition that
//! follows it. Different symbols run fully in parallel.
//!
//! Each cycle has a bounded time budget aligned to the evaluation interval;
//! exceeding it aborts the cycle and yields NO_ACTION/CYCLE_TIMEOUT instead
//! of a half-evaluated decision. The timeout is the only cancellation path.

use crate::bus::ProposalInbox;
use crate::emitter::{DecisionEmitter, HaltLedger};
use crate::mandate::engine::arbitrate;
use crate::mandate::types::{PolicyDecision, RejectionReason, ValidProposal, VetoSignal};
use crate::mandate::validator::{ProposalValidator, SymbolWatermark};
use crate::position::{PositionStateMachine, PositionStore, TransitionEvent};
use crate::registry::{PolicyRegistry, VetoSource};
use anyhow::Result;
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Cycle runner tuning
#[derive(Debug, Clone)]
pub struct CycleConfig {
    /// Evaluation interval between cycles
    pub interval: Duration,
    /// Time budget for one cycle's evaluation
    pub budget: Duration,
}

/// Single-writer worker for one symbol
pub struct SymbolWorker {
    symbol: String,
    config: CycleConfig,
    validator: Arc<ProposalValidator>,
    registry: Arc<PolicyRegistry>,
    inbox: Option<Arc<ProposalInbox>>,
    veto_source: Option<Arc<dyn VetoSource>>,
    machine: Arc<Mutex<PositionStateMachine>>,
    store: Arc<PositionStore>,
    emitter: Arc<DecisionEmitter>,
    halts: Arc<HaltLedger>,

    // Worker-local ledgers; only this task touches them.
    watermark: SymbolWatermark,
    last_cycle: Option<u64>,
}

impl SymbolWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: String,
        config: CycleConfig,
        validator: Arc<ProposalValidator>,
        registry: Arc<PolicyRegistry>,
        inbox: Option<Arc<ProposalInbox>>,
        veto_source: Option<Arc<dyn VetoSource>>,
        machine: Arc<Mutex<PositionStateMachine>>,
        store: Arc<PositionStore>,
        emitter: Arc<DecisionEmitter>,
        halts: Arc<HaltLedger>,
    ) -> Self {
        Self {
            symbol,
            config,
            validator,
            registry,
            inbox,
            veto_source,
            machine,
            store,
            emitter,
            halts,
            watermark: SymbolWatermark::default(),
            last_cycle: None,
        }
    }

    /// Drive cycles forever at the configured interval
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut cycle_id = self.watermark.cycle_id;

        loop {
            ticker.tick().await;
            cycle_id += 1;
            let timestamp = chrono::Utc::now().timestamp_millis().max(0) as u64;

            if let Err(e) = self.run_cycle(cycle_id, timestamp).await {
                error!("❌ Cycle {} failed for {}: {}", cycle_id, self.symbol, e);
            }
        }
    }

    /// Evaluate exactly one cycle for this symbol
    ///
    /// Produces at most one PolicyDecision per (symbol, cycle_id); a halted
    /// or already-arbitrated cycle produces none.
    pub async fn run_cycle(&mut self, cycle_id: u64, timestamp: u64) -> Result<()> {
        if self.halts.is_halted(&self.symbol) {
            // Keep the inbox bounded while the symbol sits halted.
            if let Some(inbox) = &self.inbox {
                let dropped = inbox.discard(&self.symbol);
                if dropped > 0 {
                    warn!(
                        "🗑️  {} halted, discarded {} staged proposal(s)",
                        self.symbol, dropped
                    );
                }
            }
            debug!("⏸️  {} halted, skipping cycle {}", self.symbol, cycle_id);
            return Ok(());
        }

        // Exactly-once guard per (symbol, cycle_id).
        if let Some(last) = self.last_cycle {
            if cycle_id <= last {
                warn!(
                    "⚠️  Duplicate cycle {} for {} (last arbitrated {}), refusing",
                    cycle_id, self.symbol, last
                );
                return Ok(());
            }
        }

        let current_state = self
            .machine
            .lock()
            .map_err(|_| anyhow::anyhow!("state machine lock poisoned"))?
            .state(&self.symbol);

        // Gathering, validation and arbitration are pure CPU work; run them
        // off the reactor under the cycle budget. A budget overrun discards
        // the result and resolves to CYCLE_TIMEOUT, leaving no partial state.
        let evaluation = self.evaluate_off_thread(cycle_id, timestamp, current_state);
        let outcome = tokio::time::timeout(self.config.budget, evaluation).await;

        let (decision, max_observed) = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!(
                    "⏰ Cycle {} for {} exceeded budget {:?}",
                    cycle_id, self.symbol, self.config.budget
                );
                (
                    PolicyDecision::no_action(
                        &self.symbol,
                        cycle_id,
                        RejectionReason::CycleTimeout,
                        vec![],
                    ),
                    timestamp,
                )
            }
        };

        info!(
            "⚖️  {} cycle {}: {} ({} considered)",
            self.symbol,
            cycle_id,
            decision.rationale(),
            decision.considered_proposals.len()
        );

        // Apply the transition before emission so the published record can
        // carry the resulting lifecycle event.
        let transition = self.apply_transition(&decision);

        if let Err(failure) = self.emitter.publish(decision, transition).await {
            self.halts.halt(&self.symbol, failure.to_string());
            return Ok(());
        }

        self.watermark.advance(cycle_id, max_observed);
        self.last_cycle = Some(cycle_id);
        Ok(())
    }

    async fn evaluate_off_thread(
        &self,
        cycle_id: u64,
        timestamp: u64,
        current_state: crate::position::PositionState,
    ) -> Result<(PolicyDecision, u64)> {
        let symbol = self.symbol.clone();
        let registry = self.registry.clone();
        let inbox = self.inbox.clone();
        let validator = self.validator.clone();
        let veto_source = self.veto_source.clone();
        let watermark = self.watermark;

        let handle = tokio::task::spawn_blocking(move || {
            let mut raw = registry.gather(&symbol, cycle_id, timestamp);
            if let Some(inbox) = &inbox {
                raw.extend(inbox.drain(&symbol, cycle_id));
            }

            let mut validated: Vec<ValidProposal> = Vec::with_capacity(raw.len());
            for proposal in raw {
                match validator.validate(proposal, &watermark) {
                    Ok(valid) => validated.push(valid),
                    Err(e) => {
                        // Dropped and logged; the cycle continues with the rest.
                        warn!("🚮 Dropped proposal for {}: {}", symbol, e);
                    }
                }
            }

            let veto: Option<VetoSignal> =
                veto_source.as_ref().and_then(|v| v.veto(&symbol, cycle_id));

            let max_observed = validated
                .iter()
                .map(|p| p.observed_timestamp)
                .max()
                .unwrap_or(timestamp);

            let decision = arbitrate(
                &symbol,
                cycle_id,
                &validated,
                veto.as_ref(),
                current_state,
            );
            (decision, max_observed)
        });

        handle
            .await
            .map_err(|e| anyhow::anyhow!("cycle evaluation task failed: {}", e))
    }

    /// Apply the decision to the state machine and persist the new snapshot
    ///
    /// An InvalidTransition is fatal for this symbol: the machine does not
    /// move, the symbol is halted and flagged for manual inspection.
    fn apply_transition(&self, decision: &PolicyDecision) -> Option<TransitionEvent> {
        let mut machine = match self.machine.lock() {
            Ok(guard) => guard,
            Err(_) => {
                self.halts
                    .halt(&self.symbol, "state machine lock poisoned".to_string());
                return None;
            }
        };

        match machine.transition(decision) {
            Ok(event) => {
                if event.is_some() {
                    if let Err(e) = self.store.save(&machine.snapshot()) {
                        error!("❌ Snapshot persist failed for {}: {}", self.symbol, e);
                    }
                }
                event
            }
            Err(invalid) => {
                self.halts.halt(&self.symbol, invalid.to_string());
                None
            }
        }
    }

    /// Execution collaborator confirmed the in-flight order for this symbol
    pub fn confirm(&self, cycle_id: u64) -> Result<TransitionEvent> {
        let mut machine = self
            .machine
            .lock()
            .map_err(|_| anyhow::anyhow!("state machine lock poisoned"))?;
        let event = machine.confirm(&self.symbol, cycle_id)?;
        self.store.save(&machine.snapshot())?;
        Ok(event)
    }

    /// Execution collaborator reported an irrecoverable error
    pub fn fault(&self, cycle_id: u64) -> Result<TransitionEvent> {
        let mut machine = self
            .machine
            .lock()
            .map_err(|_| anyhow::anyhow!("state machine lock poisoned"))?;
        let event = machine.fault(&self.symbol, cycle_id)?;
        self.store.save(&machine.snapshot())?;
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::{AuditWriter, DecisionPublisher, PublisherConfig};
    use crate::mandate::types::{MandateType, StrategyProposal};
    use crate::position::PositionState;
    use crate::registry::{PolicySource, Universe};
    use std::collections::BTreeSet;
    use std::fs;
    use std::path::PathBuf;

    const SYMBOL: &str = "SOL-PERP";

    struct FixedPolicy {
        id: &'static str,
        mandate: MandateType,
        delay: Option<Duration>,
    }

    impl PolicySource for FixedPolicy {
        fn policy_id(&self) -> &str {
            self.id
        }

        fn evaluate(
            &self,
            symbol: &str,
            cycle_id: u64,
            timestamp: u64,
        ) -> Option<StrategyProposal> {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            Some(StrategyProposal::new(
                symbol,
                self.mandate,
                self.id,
                BTreeSet::new(),
                timestamp,
                cycle_id,
            ))
        }
    }

    struct AlwaysDeny;

    impl VetoSource for AlwaysDeny {
        fn veto(&self, _symbol: &str, _cycle_id: u64) -> Option<VetoSignal> {
            Some(VetoSignal::denied("RISK_HALT"))
        }
    }

    fn temp_path(name: &str, ext: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "mandate_cycle_{}_{}.{}",
            name,
            std::process::id(),
            ext
        ))
    }

    async fn worker(
        name: &str,
        policies: Vec<Box<dyn PolicySource>>,
        veto: Option<Arc<dyn VetoSource>>,
        budget: Duration,
    ) -> (SymbolWorker, Arc<HaltLedger>, Arc<Mutex<PositionStateMachine>>, Vec<PathBuf>) {
        let audit_path = temp_path(name, "csv");
        let snapshot_path = temp_path(name, "json");
        let _ = fs::remove_file(&audit_path);
        let _ = fs::remove_file(&snapshot_path);

        let halts = Arc::new(HaltLedger::new());
        let universe = Arc::new(Universe::new(vec![SYMBOL.to_string()], vec![]));
        let machine = Arc::new(Mutex::new(PositionStateMachine::new()));
        let publisher = Arc::new(
            DecisionPublisher::new(
                PublisherConfig {
                    target_addr: "127.0.0.1:45110".parse().unwrap(),
                    queue_bound: 64,
                    max_retries: 2,
                    backoff_base_ms: 5,
                },
                halts.clone(),
            )
            .await
            .unwrap(),
        );
        let emitter = Arc::new(DecisionEmitter::new(
            AuditWriter::new(&audit_path).unwrap(),
            publisher,
            2,
            5,
        ));

        let worker = SymbolWorker::new(
            SYMBOL.to_string(),
            CycleConfig {
                interval: Duration::from_millis(50),
                budget,
            },
            Arc::new(ProposalValidator::new(universe)),
            Arc::new(PolicyRegistry::new(policies)),
            None,
            veto,
            machine.clone(),
            Arc::new(PositionStore::new(&snapshot_path)),
            emitter,
            halts.clone(),
        );
        (worker, halts, machine, vec![audit_path, snapshot_path])
    }

    fn cleanup(paths: &[PathBuf]) {
        for path in paths {
            let _ = fs::remove_file(path);
        }
    }

    #[tokio::test]
    async fn test_entry_cycle_moves_state_and_audits() {
        let (mut worker, _halts, machine, paths) = worker(
            "entry",
            vec![Box::new(FixedPolicy {
                id: "momentum",
                mandate: MandateType::Entry,
                delay: None,
            })],
            None,
            Duration::from_secs(1),
        )
        .await;

        worker.run_cycle(1, 1_000).await.unwrap();

        assert_eq!(
            machine.lock().unwrap().state(SYMBOL),
            PositionState::Entering
        );
        let audit = fs::read_to_string(&paths[0]).unwrap();
        assert!(audit.contains("ENTRY"));
        assert!(audit.contains("IDLE--enter-->ENTERING"));

        // Snapshot persisted for restart recovery.
        let snapshot = fs::read_to_string(&paths[1]).unwrap();
        assert!(snapshot.contains("Entering"));

        cleanup(&paths);
    }

    #[tokio::test]
    async fn test_denied_veto_leaves_state_untouched() {
        let (mut worker, _halts, machine, paths) = worker(
            "veto",
            vec![Box::new(FixedPolicy {
                id: "momentum",
                mandate: MandateType::Entry,
                delay: None,
            })],
            Some(Arc::new(AlwaysDeny)),
            Duration::from_secs(1),
        )
        .await;

        worker.run_cycle(1, 1_000).await.unwrap();

        assert_eq!(machine.lock().unwrap().state(SYMBOL), PositionState::Idle);
        let audit = fs::read_to_string(&paths[0]).unwrap();
        assert!(audit.contains("VETOED"));

        cleanup(&paths);
    }

    #[tokio::test]
    async fn test_duplicate_cycle_refused() {
        let (mut worker, _halts, _machine, paths) = worker(
            "dup",
            vec![Box::new(FixedPolicy {
                id: "momentum",
                mandate: MandateType::Entry,
                delay: None,
            })],
            None,
            Duration::from_secs(1),
        )
        .await;

        worker.run_cycle(1, 1_000).await.unwrap();
        worker.run_cycle(1, 2_000).await.unwrap();

        let audit = fs::read_to_string(&paths[0]).unwrap();
        // Header plus exactly one decision record.
        assert_eq!(audit.lines().count(), 2);

        cleanup(&paths);
    }

    #[tokio::test]
    async fn test_halted_symbol_skips_cycles() {
        let (mut worker, halts, _machine, paths) = worker(
            "halt",
            vec![Box::new(FixedPolicy {
                id: "momentum",
                mandate: MandateType::Entry,
                delay: None,
            })],
            None,
            Duration::from_secs(1),
        )
        .await;

        halts.halt(SYMBOL, "operator".to_string());
        worker.run_cycle(1, 1_000).await.unwrap();

        let audit = fs::read_to_string(&paths[0]).unwrap();
        assert_eq!(audit.lines().count(), 1); // header only

        cleanup(&paths);
    }

    #[tokio::test]
    async fn test_halted_symbol_discards_staged_proposals() {
        let (mut worker, halts, _machine, paths) =
            worker("halt_inbox", vec![], None, Duration::from_secs(1)).await;
        let inbox = Arc::new(ProposalInbox::new(Arc::new(Universe::new(
            vec![SYMBOL.to_string()],
            vec![],
        ))));
        inbox.push_proposal(StrategyProposal::new(
            SYMBOL,
            MandateType::Entry,
            "p1",
            BTreeSet::new(),
            1_000,
            9,
        ));
        worker.inbox = Some(inbox.clone());

        halts.halt(SYMBOL, "operator".to_string());
        worker.run_cycle(1, 1_000).await.unwrap();

        // The skipped cycle still emptied the symbol's staging area.
        assert_eq!(inbox.staged_count(SYMBOL), 0);

        cleanup(&paths);
    }

    #[tokio::test]
    async fn test_budget_overrun_yields_cycle_timeout() {
        let (mut worker, _halts, machine, paths) = worker(
            "timeout",
            vec![Box::new(FixedPolicy {
                id: "slow",
                mandate: MandateType::Entry,
                delay: Some(Duration::from_millis(500)),
            })],
            None,
            Duration::from_millis(20),
        )
        .await;

        worker.run_cycle(1, 1_000).await.unwrap();

        assert_eq!(machine.lock().unwrap().state(SYMBOL), PositionState::Idle);
        let audit = fs::read_to_string(&paths[0]).unwrap();
        assert!(audit.contains("CYCLE_TIMEOUT"));

        cleanup(&paths);
    }

    #[tokio::test]
    async fn test_full_lifecycle_with_confirms() {
        let (mut worker, _halts, machine, paths) = worker(
            "lifecycle",
            vec![Box::new(FixedPolicy {
                id: "momentum",
                mandate: MandateType::Entry,
                delay: None,
            })],
            None,
            Duration::from_secs(1),
        )
        .await;

        worker.run_cycle(1, 1_000).await.unwrap();
        worker.confirm(1).unwrap();
        assert_eq!(machine.lock().unwrap().state(SYMBOL), PositionState::Open);

        // Next cycle: ENTRY against an open position resolves AMBIGUOUS and
        // the machine stays Open.
        worker.run_cycle(2, 2_000).await.unwrap();
        assert_eq!(machine.lock().unwrap().state(SYMBOL), PositionState::Open);
        let audit = fs::read_to_string(&paths[0]).unwrap();
        assert!(audit.contains("AMBIGUOUS"));

        cleanup(&paths);
    }

    #[tokio::test]
    async fn test_fault_marks_symbol_failed() {
        let (worker, _halts, machine, paths) = worker(
            "fault",
            vec![],
            None,
            Duration::from_secs(1),
        )
        .await;

        let event = worker.fault(1).unwrap();
        assert_eq!(event.to_state, PositionState::Failed);
        assert_eq!(machine.lock().unwrap().state(SYMBOL), PositionState::Failed);

        // Failed has no outgoing transitions, confirm must refuse.
        assert!(worker.confirm(2).is_err());

        cleanup(&paths);
    }
}
