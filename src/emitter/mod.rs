//! 📣 Decision Emitter
//!
//! Publishes decisions and transition events downstream. The audit record is
//! always written (and flushed) before the record is handed to the async
//! publisher, so the audit trail is never behind outward publication.
//! Transient audit failures retry with bounded backoff; exhaustion is fatal
//! for the affected symbol only.

pub mod audit;
pub mod publisher;

pub use audit::{AuditRecord, AuditWriter};
pub use publisher::{DecisionPublisher, OutboundRecord, PublisherConfig};

use crate::mandate::types::PolicyDecision;
use crate::position::TransitionEvent;
use dashmap::DashMap;
use log::{error, warn};
use std::sync::Arc;

/// Transient publish/audit failure taxonomy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmissionFailure {
    AuditWrite { symbol: String, detail: String },
    RetriesExhausted { symbol: String, attempts: u32 },
}

impl std::fmt::Display for EmissionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmissionFailure::AuditWrite { symbol, detail } => {
                write!(f, "Audit write failed for {}: {}", symbol, detail)
            }
            EmissionFailure::RetriesExhausted { symbol, attempts } => {
                write!(
                    f,
                    "Emission retries exhausted for {} after {} attempts",
                    symbol, attempts
                )
            }
        }
    }
}

impl std::error::Error for EmissionFailure {}

/// Per-symbol halt ledger
///
/// A halted symbol stops arbitrating until operator intervention; a fatal
/// condition on one symbol never takes down the whole engine.
pub struct HaltLedger {
    halted: DashMap<String, String>,
}

impl HaltLedger {
    pub fn new() -> Self {
        Self {
            halted: DashMap::new(),
        }
    }

    pub fn halt(&self, symbol: &str, reason: String) {
        error!("🛑 Halting {}: {}", symbol, reason);
        self.halted.insert(symbol.to_string(), reason);
    }

    pub fn is_halted(&self, symbol: &str) -> bool {
        self.halted.contains_key(symbol)
    }

    pub fn reason(&self, symbol: &str) -> Option<String> {
        self.halted.get(symbol).map(|r| r.clone())
    }

    /// Operator intervention: resume arbitration for a symbol
    pub fn clear(&self, symbol: &str) {
        if self.halted.remove(symbol).is_some() {
            warn!("🔧 Halt cleared for {}", symbol);
        }
    }

    pub fn halted_count(&self) -> usize {
        self.halted.len()
    }
}

impl Default for HaltLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Audit-then-publish emitter
pub struct DecisionEmitter {
    audit: AuditWriter,
    publisher: Arc<DecisionPublisher>,
    audit_retries: u32,
    audit_backoff_ms: u64,
}

impl DecisionEmitter {
    pub fn new(
        audit: AuditWriter,
        publisher: Arc<DecisionPublisher>,
        audit_retries: u32,
        audit_backoff_ms: u64,
    ) -> Self {
        Self {
            audit,
            publisher,
            audit_retries,
            audit_backoff_ms,
        }
    }

    /// Publish one cycle's outcome
    ///
    /// The audit append happens first and must succeed (with bounded retry)
    /// before the record is queued for delivery. An error here is fatal for
    /// the symbol; the caller halts it.
    pub async fn publish(
        &self,
        decision: PolicyDecision,
        transition: Option<TransitionEvent>,
    ) -> Result<(), EmissionFailure> {
        let record = AuditRecord::from_decision(&decision, transition.as_ref());

        let mut last_detail = String::new();
        let mut written = false;
        for attempt in 0..self.audit_retries {
            match self.audit.append(record.clone()) {
                Ok(_) => {
                    written = true;
                    break;
                }
                Err(e) => {
                    last_detail = e.to_string();
                    warn!(
                        "⚠️  Audit append failed for {} (attempt {}): {}",
                        decision.symbol,
                        attempt + 1,
                        last_detail
                    );
                    if attempt + 1 < self.audit_retries {
                        let delay_ms = publisher::backoff_delay_ms(self.audit_backoff_ms, attempt);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    }
                }
            }
        }

        if !written {
            return Err(EmissionFailure::AuditWrite {
                symbol: decision.symbol.clone(),
                detail: last_detail,
            });
        }

        self.publisher.enqueue(OutboundRecord {
            decision,
            transition,
        });
        Ok(())
    }
}
