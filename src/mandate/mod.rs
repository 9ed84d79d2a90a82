pub mod engine;
pub mod types;
pub mod validator;

// Re-export main types for convenience
pub use engine::arbitrate;
pub use types::{
    DecisionCode, MandateType, PolicyDecision, RejectionReason, StrategyProposal, ValidProposal,
    VetoDecision, VetoSignal,
};
pub use validator::{ProposalValidator, SymbolWatermark, ValidationError};
