//! 🎯 Position State Machine
//!
//! Applies authorized decisions to each symbol's lifecycle state against the
//! canonical transition table. Guarantees:
//! - HoldAck / NoAction are identity actions (state unchanged)
//! - An illegal (state, action) pair returns InvalidTransition and does NOT
//!   move the state; the symbol is flagged for manual inspection
//! - Failed is terminal: only an operator reset recreates the machine
//! - Only this machine mutates PositionState; it persists across cycles

use crate::mandate::types::{DecisionCode, PolicyDecision};
use crate::position::table::{next_state, LifecycleAction, PositionState};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Requested action is not defined for the current state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub symbol: String,
    pub from_state: PositionState,
    pub action: LifecycleAction,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Illegal transition for {}: ({}, {}) is not in the canonical table",
            self.symbol,
            self.from_state.as_str(),
            self.action.as_str()
        )
    }
}

impl std::error::Error for InvalidTransition {}

/// A completed lifecycle transition, published alongside the decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub symbol: String,
    pub cycle_id: u64,
    pub from_state: PositionState,
    pub to_state: PositionState,
    pub action: LifecycleAction,
}

/// Map a decision code to its lifecycle action; None means identity
pub fn action_for_decision(code: DecisionCode) -> Option<LifecycleAction> {
    match code {
        DecisionCode::Exit => Some(LifecycleAction::Exit),
        DecisionCode::Reduce => Some(LifecycleAction::Reduce),
        DecisionCode::Entry => Some(LifecycleAction::Enter),
        DecisionCode::HoldAck | DecisionCode::NoAction => None,
    }
}

/// Per-symbol lifecycle tracker
pub struct PositionStateMachine {
    states: HashMap<String, PositionState>,
    /// Symbols that produced an InvalidTransition and await manual inspection
    flagged: HashSet<String>,
}

impl PositionStateMachine {
    pub fn new() -> Self {
        Self {
            states: HashMap::new(),
            flagged: HashSet::new(),
        }
    }

    /// Rebuild from persisted snapshots (restart recovery)
    pub fn from_states(states: HashMap<String, PositionState>) -> Self {
        Self {
            states,
            flagged: HashSet::new(),
        }
    }

    /// Current state for a symbol (default: Idle)
    pub fn state(&self, symbol: &str) -> PositionState {
        self.states.get(symbol).copied().unwrap_or(PositionState::Idle)
    }

    pub fn is_flagged(&self, symbol: &str) -> bool {
        self.flagged.contains(symbol)
    }

    /// Snapshot of all tracked states, for persistence
    pub fn snapshot(&self) -> HashMap<String, PositionState> {
        self.states.clone()
    }

    /// Apply an authorized decision to the symbol's current state
    ///
    /// Identity decisions (HoldAck, NoAction) return the current state
    /// unchanged. Actionable decisions are looked up in the canonical table;
    /// an absent pair flags the symbol and leaves the state untouched.
    pub fn transition(
        &mut self,
        decision: &PolicyDecision,
    ) -> Result<Option<TransitionEvent>, InvalidTransition> {
        let symbol = decision.symbol.as_str();
        let action = match action_for_decision(decision.decision_code) {
            Some(action) => action,
            None => return Ok(None),
        };

        let event = self.apply(symbol, decision.cycle_id, action)?;
        Ok(Some(event))
    }

    /// Execution collaborator confirmed the in-flight order
    pub fn confirm(&mut self, symbol: &str, cycle_id: u64) -> Result<TransitionEvent, InvalidTransition> {
        self.apply(symbol, cycle_id, LifecycleAction::Confirm)
    }

    /// Execution collaborator reported an irrecoverable error
    pub fn fault(&mut self, symbol: &str, cycle_id: u64) -> Result<TransitionEvent, InvalidTransition> {
        self.apply(symbol, cycle_id, LifecycleAction::Fault)
    }

    /// Start a fresh position instance after a clean close
    ///
    /// Closed is terminal for the instance; the same symbol trades again by
    /// resetting to Idle.
    pub fn begin_new_instance(&mut self, symbol: &str) -> Result<(), InvalidTransition> {
        match self.state(symbol) {
            PositionState::Closed => {
                info!("🔄 {} → IDLE (new position instance)", symbol);
                self.states.insert(symbol.to_string(), PositionState::Idle);
                Ok(())
            }
            other => Err(InvalidTransition {
                symbol: symbol.to_string(),
                from_state: other,
                action: LifecycleAction::Enter,
            }),
        }
    }

    /// Operator reset: recreate the machine for a Failed or flagged symbol
    pub fn operator_reset(&mut self, symbol: &str) {
        warn!("🔧 Operator reset for {}: machine recreated at IDLE", symbol);
        self.states.insert(symbol.to_string(), PositionState::Idle);
        self.flagged.remove(symbol);
    }

    fn apply(
        &mut self,
        symbol: &str,
        cycle_id: u64,
        action: LifecycleAction,
    ) -> Result<TransitionEvent, InvalidTransition> {
        let current = self.state(symbol);

        match next_state(current, action) {
            Some(to_state) => {
                info!(
                    "🟢 {} {} --{}--> {}",
                    symbol,
                    current.as_str(),
                    action.as_str(),
                    to_state.as_str()
                );
                self.states.insert(symbol.to_string(), to_state);
                Ok(TransitionEvent {
                    symbol: symbol.to_string(),
                    cycle_id,
                    from_state: current,
                    to_state,
                    action,
                })
            }
            None => {
                warn!(
                    "⚠️  Refusing illegal transition for {}: ({}, {}); flagged for inspection",
                    symbol,
                    current.as_str(),
                    action.as_str()
                );
                self.flagged.insert(symbol.to_string());
                Err(InvalidTransition {
                    symbol: symbol.to_string(),
                    from_state: current,
                    action,
                })
            }
        }
    }
}

impl Default for PositionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mandate::types::{MandateType, RejectionReason, StrategyProposal, ValidProposal};
    use std::collections::BTreeSet;

    const SYMBOL: &str = "SOL-PERP";

    fn decision(code: DecisionCode) -> PolicyDecision {
        let proposal = ValidProposal::seal(StrategyProposal::new(
            SYMBOL,
            MandateType::Entry,
            "p1",
            BTreeSet::new(),
            100,
            1,
        ));
        match code {
            DecisionCode::NoAction => {
                PolicyDecision::no_action(SYMBOL, 1, RejectionReason::NoProposals, vec![])
            }
            DecisionCode::HoldAck => PolicyDecision::hold_ack(SYMBOL, 1, vec![]),
            actionable => PolicyDecision::action(actionable, proposal, vec![]),
        }
    }

    #[test]
    fn test_entry_decision_moves_idle_to_entering() {
        // Scenario A tail
        let mut machine = PositionStateMachine::new();
        let event = machine.transition(&decision(DecisionCode::Entry)).unwrap().unwrap();
        assert_eq!(event.from_state, PositionState::Idle);
        assert_eq!(event.to_state, PositionState::Entering);
        assert_eq!(machine.state(SYMBOL), PositionState::Entering);
    }

    #[test]
    fn test_identity_decisions_leave_state_unchanged() {
        let mut machine = PositionStateMachine::new();
        machine.transition(&decision(DecisionCode::Entry)).unwrap();

        for code in [DecisionCode::HoldAck, DecisionCode::NoAction] {
            let event = machine.transition(&decision(code)).unwrap();
            assert!(event.is_none(), "{:?} must be identity", code);
            assert_eq!(machine.state(SYMBOL), PositionState::Entering);
        }
    }

    #[test]
    fn test_exit_then_confirm_then_closed_refuses_further_exit() {
        // Scenario C
        let mut machine = PositionStateMachine::new();
        machine.transition(&decision(DecisionCode::Entry)).unwrap();
        machine.confirm(SYMBOL, 2).unwrap();
        assert_eq!(machine.state(SYMBOL), PositionState::Open);

        let event = machine.transition(&decision(DecisionCode::Exit)).unwrap().unwrap();
        assert_eq!(event.to_state, PositionState::Exiting);

        let event = machine.confirm(SYMBOL, 3).unwrap();
        assert_eq!(event.to_state, PositionState::Closed);

        let err = machine.transition(&decision(DecisionCode::Exit)).unwrap_err();
        assert_eq!(err.from_state, PositionState::Closed);
        assert_eq!(err.action, LifecycleAction::Exit);
        assert_eq!(machine.state(SYMBOL), PositionState::Closed);
    }

    #[test]
    fn test_failed_rejects_every_decision_variant() {
        let mut machine = PositionStateMachine::new();
        machine.fault(SYMBOL, 1).unwrap();
        assert_eq!(machine.state(SYMBOL), PositionState::Failed);

        for code in [DecisionCode::Exit, DecisionCode::Reduce, DecisionCode::Entry] {
            let result = machine.transition(&decision(code));
            assert!(result.is_err(), "{:?} must be refused from Failed", code);
            assert_eq!(machine.state(SYMBOL), PositionState::Failed);
        }
        // Identity codes do not move the state either.
        for code in [DecisionCode::HoldAck, DecisionCode::NoAction] {
            assert!(machine.transition(&decision(code)).unwrap().is_none());
            assert_eq!(machine.state(SYMBOL), PositionState::Failed);
        }
        assert!(machine.confirm(SYMBOL, 2).is_err());
        assert!(machine.fault(SYMBOL, 2).is_err());
    }

    #[test]
    fn test_invalid_transition_flags_symbol_without_moving() {
        let mut machine = PositionStateMachine::new();
        machine.transition(&decision(DecisionCode::Entry)).unwrap();

        // Reduce from Entering is not in the table.
        let err = machine.transition(&decision(DecisionCode::Reduce)).unwrap_err();
        assert_eq!(err.from_state, PositionState::Entering);
        assert_eq!(machine.state(SYMBOL), PositionState::Entering);
        assert!(machine.is_flagged(SYMBOL));
    }

    #[test]
    fn test_new_instance_only_from_closed() {
        let mut machine = PositionStateMachine::new();
        assert!(machine.begin_new_instance(SYMBOL).is_err());

        machine.transition(&decision(DecisionCode::Entry)).unwrap();
        machine.confirm(SYMBOL, 1).unwrap();
        machine.transition(&decision(DecisionCode::Exit)).unwrap();
        machine.confirm(SYMBOL, 2).unwrap();
        assert_eq!(machine.state(SYMBOL), PositionState::Closed);

        machine.begin_new_instance(SYMBOL).unwrap();
        assert_eq!(machine.state(SYMBOL), PositionState::Idle);
    }

    #[test]
    fn test_operator_reset_recovers_failed_symbol() {
        let mut machine = PositionStateMachine::new();
        machine.fault(SYMBOL, 1).unwrap();
        machine.operator_reset(SYMBOL);
        assert_eq!(machine.state(SYMBOL), PositionState::Idle);
        assert!(!machine.is_flagged(SYMBOL));
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut machine = PositionStateMachine::new();
        machine.transition(&decision(DecisionCode::Entry)).unwrap();
        machine.confirm(SYMBOL, 1).unwrap();

        let restored = PositionStateMachine::from_states(machine.snapshot());
        assert_eq!(restored.state(SYMBOL), PositionState::Open);
    }
}
