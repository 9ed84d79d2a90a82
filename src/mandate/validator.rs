//! ✅ Proposal Validation
//!
//! Structural validation of incoming proposals before arbitration eligibility.
//! Enforces:
//! - Required fields present (symbol, policy id)
//! - Symbol is tracked in the configured universe
//! - Every triggering primitive resolves to a registered primitive
//! - observed_timestamp is monotonic with respect to the declared cycle_id
//!
//! Pure and side-effect-free: always returns a typed result, never panics.
//! Invalid proposals are dropped and logged by the caller; they do not abort
//! the arbitration cycle for other proposals.

use crate::mandate::types::{StrategyProposal, ValidProposal};
use crate::registry::Universe;
use std::sync::Arc;

/// Validation failure reasons
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    MissingField {
        field: &'static str,
    },
    UnknownSymbol {
        symbol: String,
    },
    UnknownPrimitive {
        primitive: String,
    },
    StaleCycle {
        cycle_id: u64,
        watermark_cycle: u64,
    },
    NonMonotonicTimestamp {
        cycle_id: u64,
        observed_timestamp: u64,
        watermark_timestamp: u64,
    },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::MissingField { field } => {
                write!(f, "Missing required field: {}", field)
            }
            ValidationError::UnknownSymbol { symbol } => {
                write!(f, "Unknown symbol: {}", symbol)
            }
            ValidationError::UnknownPrimitive { primitive } => {
                write!(f, "Unresolved primitive id: {}", primitive)
            }
            ValidationError::StaleCycle {
                cycle_id,
                watermark_cycle,
            } => {
                write!(
                    f,
                    "Stale cycle: {} (watermark already at {})",
                    cycle_id, watermark_cycle
                )
            }
            ValidationError::NonMonotonicTimestamp {
                cycle_id,
                observed_timestamp,
                watermark_timestamp,
            } => {
                write!(
                    f,
                    "Non-monotonic timestamp {} for cycle {} (watermark {})",
                    observed_timestamp, cycle_id, watermark_timestamp
                )
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Per-symbol monotonicity watermark
///
/// Owned and advanced by the cycle runner after each completed cycle, so
/// `validate` itself stays pure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SymbolWatermark {
    pub cycle_id: u64,
    pub observed_timestamp: u64,
}

impl SymbolWatermark {
    /// Advance to cover a completed cycle
    pub fn advance(&mut self, cycle_id: u64, observed_timestamp: u64) {
        if cycle_id >= self.cycle_id {
            self.cycle_id = cycle_id;
            self.observed_timestamp = self.observed_timestamp.max(observed_timestamp);
        }
    }
}

/// Structural proposal validator
pub struct ProposalValidator {
    universe: Arc<Universe>,
}

impl ProposalValidator {
    pub fn new(universe: Arc<Universe>) -> Self {
        Self { universe }
    }

    /// Validate a proposal against the universe and the symbol's watermark
    ///
    /// Checks run in a fixed order; the first failure is returned. A passing
    /// proposal is sealed as a ValidProposal and becomes eligible for
    /// arbitration.
    pub fn validate(
        &self,
        proposal: StrategyProposal,
        watermark: &SymbolWatermark,
    ) -> Result<ValidProposal, ValidationError> {
        if proposal.symbol.is_empty() {
            return Err(ValidationError::MissingField { field: "symbol" });
        }
        if proposal.source_policy_id.is_empty() {
            return Err(ValidationError::MissingField {
                field: "source_policy_id",
            });
        }

        if !self.universe.is_tracked(&proposal.symbol) {
            return Err(ValidationError::UnknownSymbol {
                symbol: proposal.symbol.clone(),
            });
        }

        for primitive in &proposal.triggering_primitives {
            if !self.universe.resolves_primitive(primitive) {
                return Err(ValidationError::UnknownPrimitive {
                    primitive: primitive.clone(),
                });
            }
        }

        // Monotonicity vs. the symbol's watermark: proposals for cycles the
        // runner already closed are stale, and a newer cycle may never carry
        // a timestamp earlier than the last accepted observation.
        if proposal.cycle_id < watermark.cycle_id {
            return Err(ValidationError::StaleCycle {
                cycle_id: proposal.cycle_id,
                watermark_cycle: watermark.cycle_id,
            });
        }
        if proposal.cycle_id > watermark.cycle_id
            && proposal.observed_timestamp < watermark.observed_timestamp
        {
            return Err(ValidationError::NonMonotonicTimestamp {
                cycle_id: proposal.cycle_id,
                observed_timestamp: proposal.observed_timestamp,
                watermark_timestamp: watermark.observed_timestamp,
            });
        }

        Ok(ValidProposal::seal(proposal))
    }
}
