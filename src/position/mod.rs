pub mod machine;
pub mod store;
pub mod table;

// Re-export main types for convenience
pub use machine::{action_for_decision, InvalidTransition, PositionStateMachine, TransitionEvent};
pub use store::PositionStore;
pub use table::{next_state, LifecycleAction, PositionState, TRANSITION_TABLE_VERSION};
