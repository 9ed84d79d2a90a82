//! 🗂️ Source Registries & Tracked Universe
//!
//! The explicit context objects of the engine, built once in main and passed
//! by reference everywhere (no module-level mutable state):
//! - Universe: tracked symbols and registered factual primitives
//! - PolicyRegistry: closed set of proposal-emitting policy sources
//! - VetoSource: the upstream judgment layer, opaque beyond its decision
//!
//! Policy sources are polymorphic over arbitrary strategies; the arbitration
//! core knows neither their number nor their identity, only this trait.

use crate::mandate::types::{StrategyProposal, VetoSignal};
use log::info;
use std::collections::HashSet;

/// Tracked symbols and registered primitive ids
pub struct Universe {
    symbols: HashSet<String>,
    primitives: HashSet<String>,
}

impl Universe {
    pub fn new(symbols: Vec<String>, primitives: Vec<String>) -> Self {
        Self {
            symbols: symbols.into_iter().collect(),
            primitives: primitives.into_iter().collect(),
        }
    }

    pub fn is_tracked(&self, symbol: &str) -> bool {
        self.symbols.contains(symbol)
    }

    pub fn resolves_primitive(&self, primitive: &str) -> bool {
        self.primitives.contains(primitive)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.symbols.iter().map(|s| s.as_str())
    }

    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }
}

/// A strategy/policy module that may emit one proposal per evaluation
///
/// Implementations own their proposal until arbitration consumes it; the
/// engine never inspects strategy internals.
pub trait PolicySource: Send + Sync {
    fn policy_id(&self) -> &str;

    /// Evaluate at the given timestamp; None means nothing to propose
    fn evaluate(&self, symbol: &str, cycle_id: u64, timestamp: u64) -> Option<StrategyProposal>;
}

/// Upstream judgment layer supplying per-(symbol, cycle) veto verdicts
///
/// Treated as authoritative and frozen; only the decision field is read.
pub trait VetoSource: Send + Sync {
    fn veto(&self, symbol: &str, cycle_id: u64) -> Option<VetoSignal>;
}

/// Closed registry of policy sources, fixed at construction
pub struct PolicyRegistry {
    sources: Vec<Box<dyn PolicySource>>,
}

impl PolicyRegistry {
    pub fn new(sources: Vec<Box<dyn PolicySource>>) -> Self {
        let registry = Self { sources };
        info!("🗂️  Policy registry sealed with {} source(s)", registry.len());
        registry
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Gather proposals from every source for one (symbol, cycle)
    pub fn gather(&self, symbol: &str, cycle_id: u64, timestamp: u64) -> Vec<StrategyProposal> {
        self.sources
            .iter()
            .filter_map(|source| source.evaluate(symbol, cycle_id, timestamp))
            .collect()
    }
}
