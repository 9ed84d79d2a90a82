//! 📋 Mandate Bus Messages
//!
//! Core message types flowing through the arbitration gate:
//! - StrategyProposal: a policy source's request for one cycle
//! - VetoSignal: absolute override from the upstream judgment layer
//! - PolicyDecision: the single authorized outcome per (symbol, cycle)
//!
//! Proposals are immutable once created and consumed by exactly one
//! arbitration cycle. Decisions are produced exactly once per (symbol, cycle).

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Action type a proposal requests (closed set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MandateType {
    Exit,
    Reduce,
    Entry,
    Hold,
    Block,
}

impl MandateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MandateType::Exit => "exit",
            MandateType::Reduce => "reduce",
            MandateType::Entry => "entry",
            MandateType::Hold => "hold",
            MandateType::Block => "block",
        }
    }

    /// BLOCK can only veto other proposals, never win arbitration itself
    pub fn is_actionable(&self) -> bool {
        !matches!(self, MandateType::Block)
    }
}

/// A single policy source's request for one evaluation cycle
///
/// Immutable once created; owned by the issuing policy until consumed
/// by arbitration, then discarded. Never reused across cycles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyProposal {
    /// Unique proposal id (UUID v4)
    pub proposal_id: String,

    /// Symbol this proposal targets
    pub symbol: String,

    /// Requested action
    pub mandate: MandateType,

    /// Issuing policy source
    pub source_policy_id: String,

    /// Factual primitives that triggered this proposal
    pub triggering_primitives: BTreeSet<String>,

    /// Observation timestamp (unix millis)
    pub observed_timestamp: u64,

    /// Evaluation cycle this proposal belongs to
    pub cycle_id: u64,
}

impl StrategyProposal {
    pub fn new(
        symbol: impl Into<String>,
        mandate: MandateType,
        source_policy_id: impl Into<String>,
        triggering_primitives: BTreeSet<String>,
        observed_timestamp: u64,
        cycle_id: u64,
    ) -> Self {
        Self {
            proposal_id: Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            mandate,
            source_policy_id: source_policy_id.into(),
            triggering_primitives,
            observed_timestamp,
            cycle_id,
        }
    }
}

/// A proposal that passed structural validation and is eligible for arbitration
///
/// Only the validator can seal one of these; arbitration never sees a raw
/// proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidProposal(StrategyProposal);

impl ValidProposal {
    /// Sealed by the validator after all structural checks pass
    pub(crate) fn seal(proposal: StrategyProposal) -> Self {
        Self(proposal)
    }

    pub fn into_inner(self) -> StrategyProposal {
        self.0
    }
}

impl std::ops::Deref for ValidProposal {
    type Target = StrategyProposal;

    fn deref(&self) -> &StrategyProposal {
        &self.0
    }
}

/// Upstream judgment layer's verdict for one (symbol, cycle)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VetoDecision {
    Approved,
    Denied,
}

/// Authoritative, frozen override signal
///
/// A Denied veto overrides every proposal for that cycle; the engine never
/// inspects the reasoning behind it, only the decision field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VetoSignal {
    pub decision: VetoDecision,
    pub reason_code: String,
}

impl VetoSignal {
    pub fn denied(reason_code: impl Into<String>) -> Self {
        Self {
            decision: VetoDecision::Denied,
            reason_code: reason_code.into(),
        }
    }

    pub fn approved(reason_code: impl Into<String>) -> Self {
        Self {
            decision: VetoDecision::Approved,
            reason_code: reason_code.into(),
        }
    }
}

/// Outcome code of one arbitration cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionCode {
    Exit,
    Reduce,
    Entry,
    HoldAck,
    NoAction,
}

impl DecisionCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionCode::Exit => "EXIT",
            DecisionCode::Reduce => "REDUCE",
            DecisionCode::Entry => "ENTRY",
            DecisionCode::HoldAck => "HOLD_ACK",
            DecisionCode::NoAction => "NO_ACTION",
        }
    }
}

/// Why a cycle resolved to NoAction (set only on NoAction decisions)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionReason {
    NoProposals,
    Blocked,
    Vetoed,
    Ambiguous,
    CycleTimeout,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::NoProposals => "NO_PROPOSALS",
            RejectionReason::Blocked => "BLOCKED",
            RejectionReason::Vetoed => "VETOED",
            RejectionReason::Ambiguous => "AMBIGUOUS",
            RejectionReason::CycleTimeout => "CYCLE_TIMEOUT",
        }
    }
}

/// The single authorized decision for one (symbol, cycle)
///
/// Constructed only through the typed constructors below so that
/// rejection_reason can never accompany an actionable code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub symbol: String,
    pub cycle_id: u64,
    pub decision_code: DecisionCode,
    pub rejection_reason: Option<RejectionReason>,
    pub winning_proposal: Option<ValidProposal>,
    pub considered_proposals: Vec<String>,
}

impl PolicyDecision {
    /// An actionable decision (Exit / Reduce / Entry) with its winning proposal
    pub fn action(
        code: DecisionCode,
        winner: ValidProposal,
        considered_proposals: Vec<String>,
    ) -> Self {
        debug_assert!(matches!(
            code,
            DecisionCode::Exit | DecisionCode::Reduce | DecisionCode::Entry
        ));
        Self {
            symbol: winner.symbol.clone(),
            cycle_id: winner.cycle_id,
            decision_code: code,
            rejection_reason: None,
            winning_proposal: Some(winner),
            considered_proposals,
        }
    }

    /// HOLD acknowledgement: informational, not state-mutating
    pub fn hold_ack(
        symbol: impl Into<String>,
        cycle_id: u64,
        considered_proposals: Vec<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            cycle_id,
            decision_code: DecisionCode::HoldAck,
            rejection_reason: None,
            winning_proposal: None,
            considered_proposals,
        }
    }

    /// Default-deny outcome with a typed reason
    pub fn no_action(
        symbol: impl Into<String>,
        cycle_id: u64,
        reason: RejectionReason,
        considered_proposals: Vec<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            cycle_id,
            decision_code: DecisionCode::NoAction,
            rejection_reason: Some(reason),
            winning_proposal: None,
            considered_proposals,
        }
    }

    /// Short one-line rationale for audit records
    pub fn rationale(&self) -> String {
        match (&self.winning_proposal, &self.rejection_reason) {
            (Some(winner), _) => format!(
                "{} from policy {} (ts={})",
                self.decision_code.as_str(),
                winner.source_policy_id,
                winner.observed_timestamp
            ),
            (None, Some(reason)) => {
                format!("{}/{}", self.decision_code.as_str(), reason.as_str())
            }
            (None, None) => self.decision_code.as_str().to_string(),
        }
    }
}
