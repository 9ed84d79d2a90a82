//! 🔒 Canonical Position Transition Table
//!
//! Closed-world lifecycle table keyed by (from_state, action). Any pair
//! absent from the match below is illegal by construction: the lookup
//! returns None and the machine refuses to move.
//!
//! Lifecycle:
//! - Idle --enter--> Entering --confirm--> Open
//! - Open --reduce--> Reducing --confirm--> Open
//! - Open --exit--> Exiting --confirm--> Closed
//! - any state --fault--> Failed (terminal, zero outgoing transitions)

use serde::{Deserialize, Serialize};

/// Version of the canonical table; bumped whenever an arm changes
pub const TRANSITION_TABLE_VERSION: u32 = 1;

/// Position lifecycle state (closed set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionState {
    /// No position for this symbol (initial state)
    Idle,
    /// Entry authorized, awaiting execution confirmation
    Entering,
    /// Position confirmed and live
    Open,
    /// Partial reduction in flight
    Reducing,
    /// Full exit in flight
    Exiting,
    /// Position instance finished; a new one starts fresh at Idle
    Closed,
    /// Irrecoverable execution error; requires external reset
    Failed,
}

impl PositionState {
    pub const ALL: [PositionState; 7] = [
        PositionState::Idle,
        PositionState::Entering,
        PositionState::Open,
        PositionState::Reducing,
        PositionState::Exiting,
        PositionState::Closed,
        PositionState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PositionState::Idle => "IDLE",
            PositionState::Entering => "ENTERING",
            PositionState::Open => "OPEN",
            PositionState::Reducing => "REDUCING",
            PositionState::Exiting => "EXITING",
            PositionState::Closed => "CLOSED",
            PositionState::Failed => "FAILED",
        }
    }

    /// Failed has no outgoing transitions under any action
    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionState::Failed)
    }
}

/// Lifecycle action applied to a position state (closed set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleAction {
    Enter,
    Confirm,
    Reduce,
    Exit,
    Fault,
}

impl LifecycleAction {
    pub const ALL: [LifecycleAction; 5] = [
        LifecycleAction::Enter,
        LifecycleAction::Confirm,
        LifecycleAction::Reduce,
        LifecycleAction::Exit,
        LifecycleAction::Fault,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleAction::Enter => "enter",
            LifecycleAction::Confirm => "confirm",
            LifecycleAction::Reduce => "reduce",
            LifecycleAction::Exit => "exit",
            LifecycleAction::Fault => "fault",
        }
    }
}

/// Canonical table lookup: None means the pair is illegal
pub fn next_state(from: PositionState, action: LifecycleAction) -> Option<PositionState> {
    use LifecycleAction::*;
    use PositionState::*;

    match (from, action) {
        (Idle, Enter) => Some(Entering),
        (Entering, Confirm) => Some(Open),
        (Open, Reduce) => Some(Reducing),
        (Reducing, Confirm) => Some(Open),
        (Open, Exit) => Some(Exiting),
        (Exiting, Confirm) => Some(Closed),

        // Fault reaches Failed from every state except Failed itself.
        (Idle, Fault) => Some(Failed),
        (Entering, Fault) => Some(Failed),
        (Open, Fault) => Some(Failed),
        (Reducing, Fault) => Some(Failed),
        (Exiting, Fault) => Some(Failed),
        (Closed, Fault) => Some(Failed),

        // Closed-world: everything else is illegal.
        _ => None,
    }
}
