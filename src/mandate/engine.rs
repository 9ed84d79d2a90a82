//! ⚖️ Arbitration Engine
//!
//! Resolves the validated proposal set for one (symbol, cycle) into exactly
//! one PolicyDecision. The check order is total and fixed:
//! 1. DENIED veto short-circuits everything
//! 2. EXIT supremacy: any EXIT proposal wins before all other partitions
//! 3. REDUCE, only while the position is Open
//! 4. ENTRY, gated by outstanding BLOCK proposals and a flat position
//! 5. HOLD acknowledgement
//! 6. Default-deny: no actionable proposals at all
//!
//! The function is pure: identical inputs always produce identical output.
//! No clock reads, no randomness, no hidden state. Ambiguity never raises;
//! it always resolves to a typed NoAction variant.

use crate::mandate::types::{
    DecisionCode, MandateType, PolicyDecision, RejectionReason, ValidProposal, VetoDecision,
    VetoSignal,
};
use crate::position::PositionState;

/// Deterministic tiebreak within one mandate partition: earliest observed
/// timestamp, then lexicographically smallest source policy id.
fn select_winner<'a>(partition: &[&'a ValidProposal]) -> Option<&'a ValidProposal> {
    partition.iter().copied().min_by(|a, b| {
        (a.observed_timestamp, a.source_policy_id.as_str())
            .cmp(&(b.observed_timestamp, b.source_policy_id.as_str()))
    })
}

/// Resolve one cycle's validated proposals into a single decision
pub fn arbitrate(
    symbol: &str,
    cycle_id: u64,
    proposals: &[ValidProposal],
    veto: Option<&VetoSignal>,
    current_state: PositionState,
) -> PolicyDecision {
    let considered: Vec<String> = proposals.iter().map(|p| p.proposal_id.clone()).collect();

    // 1. Absolute veto short-circuit; no proposal is inspected further.
    if let Some(signal) = veto {
        if signal.decision == VetoDecision::Denied {
            return PolicyDecision::no_action(symbol, cycle_id, RejectionReason::Vetoed, considered);
        }
    }

    // 2. Partition by mandate type.
    let partition = |mandate: MandateType| -> Vec<&ValidProposal> {
        proposals.iter().filter(|p| p.mandate == mandate).collect()
    };
    let exits = partition(MandateType::Exit);
    let reduces = partition(MandateType::Reduce);
    let entries = partition(MandateType::Entry);
    let holds = partition(MandateType::Hold);
    let blocks = partition(MandateType::Block);

    // 3. EXIT supremacy: evaluated strictly before every other partition.
    if let Some(winner) = select_winner(&exits) {
        return PolicyDecision::action(DecisionCode::Exit, winner.clone(), considered);
    }

    // 4. REDUCE only applies to an open position; otherwise fall through.
    if current_state == PositionState::Open {
        if let Some(winner) = select_winner(&reduces) {
            return PolicyDecision::action(DecisionCode::Reduce, winner.clone(), considered);
        }
    }

    // 5. ENTRY, gated by BLOCK and by an empty book for the symbol.
    if !entries.is_empty() {
        if !blocks.is_empty() {
            return PolicyDecision::no_action(symbol, cycle_id, RejectionReason::Blocked, considered);
        }
        if current_state != PositionState::Idle {
            return PolicyDecision::no_action(
                symbol,
                cycle_id,
                RejectionReason::Ambiguous,
                considered,
            );
        }
        if let Some(winner) = select_winner(&entries) {
            return PolicyDecision::action(DecisionCode::Entry, winner.clone(), considered);
        }
    }

    // 6. HOLD acknowledgement: informational, not state-mutating.
    if !holds.is_empty() {
        return PolicyDecision::hold_ack(symbol, cycle_id, considered);
    }

    // 7. Default-deny.
    PolicyDecision::no_action(symbol, cycle_id, RejectionReason::NoProposals, considered)
}
