//! 📻 Proposal Bus Receiver
//!
//! Listens for JSON bus messages from out-of-process collaborators:
//! - Proposal: a policy source's StrategyProposal for an upcoming cycle
//! - Veto: the upstream judgment layer's verdict for a (symbol, cycle)
//! - Confirm / Fault: execution layer reports driving lifecycle actions
//!
//! Proposals and vetoes land in a per-symbol inbox drained by the cycle
//! runner; confirm/fault events are forwarded on a channel so the runtime
//! can apply them under the same per-symbol exclusion as arbitration.

use crate::mandate::types::{StrategyProposal, VetoSignal};
use crate::registry::{Universe, VetoSource};
use anyhow::{Context, Result};
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Wire envelope for everything arriving on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BusMessage {
    Proposal {
        proposal: StrategyProposal,
    },
    Veto {
        symbol: String,
        cycle_id: u64,
        signal: VetoSignal,
    },
    Confirm {
        symbol: String,
        cycle_id: u64,
    },
    Fault {
        symbol: String,
        cycle_id: u64,
    },
}

/// Execution-layer report forwarded to the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionEvent {
    Confirm { symbol: String, cycle_id: u64 },
    Fault { symbol: String, cycle_id: u64 },
}

/// Staged proposals per symbol are capped; beyond this the oldest is dropped
const MAX_STAGED_PER_SYMBOL: usize = 256;

/// Per-symbol staging area for bus proposals and vetoes
///
/// Bounded on both axes: only tracked symbols get an entry, and each symbol
/// holds at most MAX_STAGED_PER_SYMBOL proposals (drop-oldest beyond that).
pub struct ProposalInbox {
    universe: Arc<Universe>,
    proposals: DashMap<String, VecDeque<StrategyProposal>>,
    vetoes: DashMap<String, (u64, VetoSignal)>,
    rejected: AtomicU64,
}

impl ProposalInbox {
    pub fn new(universe: Arc<Universe>) -> Self {
        Self {
            universe,
            proposals: DashMap::new(),
            vetoes: DashMap::new(),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn push_proposal(&self, proposal: StrategyProposal) {
        if !self.universe.is_tracked(&proposal.symbol) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                "🚮 Ignoring bus proposal for untracked symbol {}",
                proposal.symbol
            );
            return;
        }

        let mut entry = self.proposals.entry(proposal.symbol.clone()).or_default();
        while entry.len() >= MAX_STAGED_PER_SYMBOL {
            if let Some(dropped) = entry.pop_front() {
                warn!(
                    "🗑️  Inbox full for {}, dropped oldest staged proposal (cycle {})",
                    proposal.symbol, dropped.cycle_id
                );
            }
        }
        entry.push_back(proposal);
    }

    pub fn set_veto(&self, symbol: String, cycle_id: u64, signal: VetoSignal) {
        if !self.universe.is_tracked(&symbol) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!("🚮 Ignoring veto for untracked symbol {}", symbol);
            return;
        }
        self.vetoes.insert(symbol, (cycle_id, signal));
    }

    /// Take this cycle's proposals for a symbol
    ///
    /// Proposals tagged for a later cycle stay staged; earlier ones are
    /// returned too so the validator can reject and log them as stale.
    pub fn drain(&self, symbol: &str, cycle_id: u64) -> Vec<StrategyProposal> {
        let Some(mut entry) = self.proposals.get_mut(symbol) else {
            return Vec::new();
        };
        let staged = std::mem::take(entry.value_mut());
        let (current, future): (VecDeque<_>, VecDeque<_>) =
            staged.into_iter().partition(|p| p.cycle_id <= cycle_id);
        *entry.value_mut() = future;
        current.into()
    }

    /// Throw away everything staged for a symbol; returns the discard count
    ///
    /// Called while the symbol sits halted so its inbox cannot grow until
    /// operator intervention.
    pub fn discard(&self, symbol: &str) -> usize {
        let dropped = self
            .proposals
            .remove(symbol)
            .map(|(_, staged)| staged.len())
            .unwrap_or(0);
        self.vetoes.remove(symbol);
        dropped
    }

    pub fn staged_count(&self, symbol: &str) -> usize {
        self.proposals.get(symbol).map(|v| v.len()).unwrap_or(0)
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

impl VetoSource for ProposalInbox {
    /// The veto is consumed by the cycle it was issued for
    fn veto(&self, symbol: &str, cycle_id: u64) -> Option<VetoSignal> {
        let matches = self
            .vetoes
            .get(symbol)
            .map(|entry| entry.0 == cycle_id)
            .unwrap_or(false);
        if matches {
            self.vetoes.remove(symbol).map(|(_, (_, signal))| signal)
        } else {
            None
        }
    }
}

/// UDP receiver feeding the inbox and the execution event channel
pub struct ProposalBusReceiver {
    socket: Arc<UdpSocket>,
    inbox: Arc<ProposalInbox>,
    total_received: Arc<AtomicU64>,
    parse_errors: Arc<AtomicU64>,
}

impl ProposalBusReceiver {
    pub async fn new(bind_addr: SocketAddr, inbox: Arc<ProposalInbox>) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .context(format!("Failed to bind proposal bus receiver on {}", bind_addr))?;

        info!("📻 Proposal bus receiver bound to {}", bind_addr);

        Ok(Self {
            socket: Arc::new(socket),
            inbox,
            total_received: Arc::new(AtomicU64::new(0)),
            parse_errors: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Start the listen task; execution events come back on the channel
    pub fn start(&self) -> mpsc::Receiver<ExecutionEvent> {
        let (tx, rx) = mpsc::channel(1000);

        let socket = self.socket.clone();
        let inbox = self.inbox.clone();
        let total_received = self.total_received.clone();
        let parse_errors = self.parse_errors.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            info!("🎧 Listening for proposal bus messages...");

            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, addr)) => {
                        total_received.fetch_add(1, Ordering::Relaxed);
                        debug!("📨 Received {} bytes from {}", len, addr);

                        match serde_json::from_slice::<BusMessage>(&buf[..len]) {
                            Ok(BusMessage::Proposal { proposal }) => {
                                debug!(
                                    "📥 Proposal: {} {} from {} (cycle {})",
                                    proposal.symbol,
                                    proposal.mandate.as_str(),
                                    proposal.source_policy_id,
                                    proposal.cycle_id
                                );
                                inbox.push_proposal(proposal);
                            }
                            Ok(BusMessage::Veto {
                                symbol,
                                cycle_id,
                                signal,
                            }) => {
                                info!(
                                    "🚫 Veto for {} cycle {}: {:?} ({})",
                                    symbol, cycle_id, signal.decision, signal.reason_code
                                );
                                inbox.set_veto(symbol, cycle_id, signal);
                            }
                            Ok(BusMessage::Confirm { symbol, cycle_id }) => {
                                if tx
                                    .send(ExecutionEvent::Confirm { symbol, cycle_id })
                                    .await
                                    .is_err()
                                {
                                    warn!("⚠️  Execution event channel closed, stopping receiver");
                                    break;
                                }
                            }
                            Ok(BusMessage::Fault { symbol, cycle_id }) => {
                                if tx
                                    .send(ExecutionEvent::Fault { symbol, cycle_id })
                                    .await
                                    .is_err()
                                {
                                    warn!("⚠️  Execution event channel closed, stopping receiver");
                                    break;
                                }
                            }
                            Err(e) => {
                                parse_errors.fetch_add(1, Ordering::Relaxed);
                                warn!("⚠️  Unparseable bus message from {}: {}", addr, e);
                            }
                        }
                    }
                    Err(e) => {
                        warn!("⚠️  Bus receive error: {}", e);
                    }
                }
            }
        });

        rx
    }

    /// (received, parse_errors)
    pub fn stats(&self) -> (u64, u64) {
        (
            self.total_received.load(Ordering::Relaxed),
            self.parse_errors.load(Ordering::Relaxed),
        )
    }
}
