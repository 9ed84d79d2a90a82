//! 📡 Decision Publisher
//!
//! Sends PolicyDecision records to the downstream execution consumer over
//! UDP. Publication is asynchronous behind a bounded FIFO queue so a slow or
//! blocked consumer never stalls arbitration of the next cycle:
//! - Queue overflow drops the OLDEST undelivered record and logs it
//! - Sends retry with bounded exponential backoff
//! - Exhausting retries halts the affected symbol via the halt ledger
//!
//! A single consumer task drains the queue, so per-symbol emission order
//! always matches cycle_id order.

use crate::emitter::HaltLedger;
use crate::mandate::types::PolicyDecision;
use crate::position::TransitionEvent;
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::Notify;

/// Bounded exponential backoff delay for a retry attempt
///
/// The exponent is clamped and the multiply saturates so misconfigured
/// retry counts can never overflow.
pub(crate) fn backoff_delay_ms(base_ms: u64, attempt: u32) -> u64 {
    base_ms.saturating_mul(1u64 << attempt.min(16))
}

/// Wire record published for each cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundRecord {
    pub decision: PolicyDecision,
    pub transition: Option<TransitionEvent>,
}

/// Publisher tuning
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Downstream consumer address
    pub target_addr: SocketAddr,
    /// Maximum undelivered records held before dropping the oldest
    pub queue_bound: usize,
    /// Send attempts before a record is declared undeliverable
    pub max_retries: u32,
    /// Base backoff between attempts (doubles each retry)
    pub backoff_base_ms: u64,
}

/// Async UDP publisher with a bounded drop-oldest queue
pub struct DecisionPublisher {
    socket: Arc<UdpSocket>,
    config: PublisherConfig,
    queue: Mutex<VecDeque<OutboundRecord>>,
    notify: Notify,
    halts: Arc<HaltLedger>,
    sent_count: AtomicU64,
    error_count: AtomicU64,
    dropped_count: AtomicU64,
}

impl DecisionPublisher {
    /// Bind a local socket and target the downstream consumer
    pub async fn new(config: PublisherConfig, halts: Arc<HaltLedger>) -> Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0")
            .await
            .context("Failed to bind UDP socket for decision publisher")?;

        let local_addr = socket.local_addr()?;
        info!(
            "📡 Decision publisher bound to {} → target {}",
            local_addr, config.target_addr
        );

        Ok(Self {
            socket: Arc::new(socket),
            config,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            halts,
            sent_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            dropped_count: AtomicU64::new(0),
        })
    }

    /// Enqueue a record for delivery; never blocks the caller
    ///
    /// Beyond the bound the oldest undelivered record is dropped and logged;
    /// the queue is never unbounded.
    pub fn enqueue(&self, record: OutboundRecord) {
        {
            let mut queue = self.queue.lock().unwrap();
            while queue.len() >= self.config.queue_bound {
                if let Some(dropped) = queue.pop_front() {
                    self.dropped_count.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "🗑️  Publish queue full ({}), dropped oldest: {} cycle {}",
                        self.config.queue_bound,
                        dropped.decision.symbol,
                        dropped.decision.cycle_id
                    );
                }
            }
            queue.push_back(record);
        }
        self.notify.notify_one();
    }

    /// Drain the queue forever; run as a dedicated task
    pub async fn run(self: Arc<Self>) {
        loop {
            let record = {
                let mut queue = self.queue.lock().unwrap();
                queue.pop_front()
            };

            let Some(record) = record else {
                self.notify.notified().await;
                continue;
            };

            let symbol = record.decision.symbol.clone();
            let cycle_id = record.decision.cycle_id;

            if let Err(e) = self.send_with_retry(&record).await {
                error!(
                    "❌ Delivery failed for {} cycle {}: {}; halting symbol",
                    symbol, cycle_id, e
                );
                let failure = crate::emitter::EmissionFailure::RetriesExhausted {
                    symbol: symbol.clone(),
                    attempts: self.config.max_retries,
                };
                self.halts.halt(&symbol, failure.to_string());
            }
        }
    }

    /// Send one record, retrying with bounded exponential backoff
    async fn send_with_retry(&self, record: &OutboundRecord) -> Result<()> {
        let bytes =
            serde_json::to_vec(record).context("Failed to serialize outbound record")?;

        let mut last_error = None;
        for attempt in 0..self.config.max_retries {
            match self.socket.send_to(&bytes, self.config.target_addr).await {
                Ok(_) => {
                    self.sent_count.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "📤 Published {} cycle {} ({} bytes, attempt {})",
                        record.decision.symbol,
                        record.decision.cycle_id,
                        bytes.len(),
                        attempt + 1
                    );
                    return Ok(());
                }
                Err(e) => {
                    self.error_count.fetch_add(1, Ordering::Relaxed);
                    if attempt + 1 < self.config.max_retries {
                        let delay_ms = backoff_delay_ms(self.config.backoff_base_ms, attempt);
                        debug!(
                            "🔄 Retry {} for {} cycle {} in {}ms",
                            attempt + 1,
                            record.decision.symbol,
                            record.decision.cycle_id,
                            delay_ms
                        );
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .map(Into::into)
            .unwrap_or_else(|| anyhow::anyhow!("no send attempts made")))
    }

    /// Undelivered records currently queued
    pub fn backlog(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// (sent, errors, dropped)
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.sent_count.load(Ordering::Relaxed),
            self.error_count.load(Ordering::Relaxed),
            self.dropped_count.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mandate::types::RejectionReason;

    fn config() -> PublisherConfig {
        PublisherConfig {
            target_addr: "127.0.0.1:45110".parse().unwrap(),
            queue_bound: 3,
            max_retries: 3,
            backoff_base_ms: 10,
        }
    }

    fn record(symbol: &str, cycle_id: u64) -> OutboundRecord {
        OutboundRecord {
            decision: PolicyDecision::no_action(
                symbol,
                cycle_id,
                RejectionReason::NoProposals,
                vec![],
            ),
            transition: None,
        }
    }

    #[test]
    fn test_backoff_exponent_is_clamped() {
        assert_eq!(backoff_delay_ms(10, 0), 10);
        assert_eq!(backoff_delay_ms(10, 3), 80);
        // Large attempt counts clamp the shift instead of overflowing it.
        assert_eq!(backoff_delay_ms(10, 200), 10 * (1 << 16));
        assert_eq!(backoff_delay_ms(u64::MAX, 5), u64::MAX);
    }

    #[tokio::test]
    async fn test_publisher_creation() {
        let publisher = DecisionPublisher::new(config(), Arc::new(HaltLedger::new())).await;
        assert!(publisher.is_ok());
    }

    #[tokio::test]
    async fn test_stats_start_at_zero() {
        let publisher = DecisionPublisher::new(config(), Arc::new(HaltLedger::new()))
            .await
            .unwrap();
        assert_eq!(publisher.stats(), (0, 0, 0));
        assert_eq!(publisher.backlog(), 0);
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let publisher = DecisionPublisher::new(config(), Arc::new(HaltLedger::new()))
            .await
            .unwrap();

        for cycle in 1..=5 {
            publisher.enqueue(record("SOL-PERP", cycle));
        }

        // Bound is 3: cycles 1 and 2 were evicted, 3..=5 remain in order.
        assert_eq!(publisher.backlog(), 3);
        let (_, _, dropped) = publisher.stats();
        assert_eq!(dropped, 2);

        let queue = publisher.queue.lock().unwrap();
        let cycles: Vec<u64> = queue.iter().map(|r| r.decision.cycle_id).collect();
        assert_eq!(cycles, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_delivery_to_listening_socket() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap();

        let publisher = Arc::new(
            DecisionPublisher::new(
                PublisherConfig {
                    target_addr: target,
                    ..config()
                },
                Arc::new(HaltLedger::new()),
            )
            .await
            .unwrap(),
        );

        publisher.enqueue(record("SOL-PERP", 7));
        tokio::spawn(publisher.clone().run());

        let mut buf = vec![0u8; 64 * 1024];
        let len = tokio::time::timeout(
            tokio::time::Duration::from_secs(2),
            receiver.recv(&mut buf),
        )
        .await
        .expect("timed out waiting for publication")
        .unwrap();

        let received: OutboundRecord = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(received.decision.symbol, "SOL-PERP");
        assert_eq!(received.decision.cycle_id, 7);
    }
}
