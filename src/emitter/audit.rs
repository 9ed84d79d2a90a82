//! 📝 Append-Only Audit Trail
//!
//! Every arbitration cycle writes one record: cycle inputs, the decision,
//! the rationale, and any lifecycle transition. Records are appended and
//! flushed before outward publication so the trail is never behind what
//! downstream consumers have seen. Supports replay and post-hoc debugging.

use crate::mandate::types::PolicyDecision;
use crate::position::TransitionEvent;
use anyhow::{Context, Result};
use log::info;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// One audit trail record
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub record_id: u64,
    pub timestamp: u64,
    pub symbol: String,
    pub cycle_id: u64,
    pub decision_code: &'static str,
    pub rejection_reason: String,
    pub winning_policy: String,
    pub considered_proposals: String,
    pub transition: String,
    pub rationale: String,
}

impl AuditRecord {
    pub fn from_decision(
        decision: &PolicyDecision,
        transition: Option<&TransitionEvent>,
    ) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Self {
            record_id: 0, // assigned by the writer
            timestamp,
            symbol: decision.symbol.clone(),
            cycle_id: decision.cycle_id,
            decision_code: decision.decision_code.as_str(),
            rejection_reason: decision
                .rejection_reason
                .map(|r| r.as_str().to_string())
                .unwrap_or_default(),
            winning_policy: decision
                .winning_proposal
                .as_ref()
                .map(|p| p.source_policy_id.clone())
                .unwrap_or_default(),
            considered_proposals: decision.considered_proposals.join(";"),
            transition: transition
                .map(|t| {
                    format!(
                        "{}--{}-->{}",
                        t.from_state.as_str(),
                        t.action.as_str(),
                        t.to_state.as_str()
                    )
                })
                .unwrap_or_default(),
            rationale: decision.rationale(),
        }
    }

    /// Convert to CSV row
    pub fn to_csv_row(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{},{},{}",
            self.record_id,
            self.timestamp,
            self.symbol,
            self.cycle_id,
            self.decision_code,
            self.rejection_reason,
            self.winning_policy,
            self.considered_proposals,
            self.transition,
            self.rationale.replace(',', ";"),
            chrono::DateTime::from_timestamp(self.timestamp as i64, 0)
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default()
        )
    }

    /// CSV header
    pub fn csv_header() -> &'static str {
        "record_id,timestamp,symbol,cycle_id,decision_code,rejection_reason,winning_policy,considered_proposals,transition,rationale,datetime"
    }
}

/// Append-only audit writer
pub struct AuditWriter {
    log_file: Arc<Mutex<File>>,
    record_counter: Arc<Mutex<u64>>,
}

impl AuditWriter {
    /// Open the audit file, creating it with a CSV header if new
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file_exists = path.exists();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .context(format!("Failed to create audit dir {:?}", parent))?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .context(format!("Failed to open audit file: {:?}", path))?;

        if !file_exists {
            writeln!(file, "{}", AuditRecord::csv_header())
                .context("Failed to write audit header")?;
            file.flush()?;
            info!("📝 Created new audit trail: {:?}", path);
        } else {
            info!("📝 Opened existing audit trail: {:?}", path);
        }

        Ok(Self {
            log_file: Arc::new(Mutex::new(file)),
            record_counter: Arc::new(Mutex::new(1)),
        })
    }

    /// Append one record; assigns and returns the record id
    pub fn append(&self, mut record: AuditRecord) -> Result<u64> {
        let record_id = {
            let mut counter = self
                .record_counter
                .lock()
                .map_err(|_| anyhow::anyhow!("Audit counter lock poisoned"))?;
            let id = *counter;
            *counter += 1;
            id
        };
        record.record_id = record_id;

        {
            let mut file = self
                .log_file
                .lock()
                .map_err(|_| anyhow::anyhow!("Audit file lock poisoned"))?;
            writeln!(file, "{}", record.to_csv_row())
                .context("Failed to write audit record")?;
            file.flush().context("Failed to flush audit record")?;
        }

        Ok(record_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mandate::types::{
        DecisionCode, MandateType, PolicyDecision, RejectionReason, StrategyProposal,
        ValidProposal,
    };
    use std::collections::BTreeSet;
    use std::fs;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("mandate_audit_{}_{}.csv", name, std::process::id()))
    }

    fn sample_decision() -> PolicyDecision {
        let winner = ValidProposal::seal(StrategyProposal::new(
            "SOL-PERP",
            MandateType::Exit,
            "p1",
            BTreeSet::new(),
            100,
            5,
        ));
        let id = winner.proposal_id.clone();
        PolicyDecision::action(DecisionCode::Exit, winner, vec![id])
    }

    #[test]
    fn test_header_written_on_create() {
        let path = temp_path("header");
        let _ = fs::remove_file(&path);

        let writer = AuditWriter::new(&path).unwrap();
        drop(writer);

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("record_id,timestamp,symbol"));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_records_are_appended_with_increasing_ids() {
        let path = temp_path("append");
        let _ = fs::remove_file(&path);

        let writer = AuditWriter::new(&path).unwrap();
        let first = writer
            .append(AuditRecord::from_decision(&sample_decision(), None))
            .unwrap();
        let second = writer
            .append(AuditRecord::from_decision(&sample_decision(), None))
            .unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3); // header + 2 records
        assert!(lines[1].contains("EXIT"));
        assert!(lines[1].contains("p1"));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_no_action_record_carries_reason() {
        let decision = PolicyDecision::no_action(
            "SOL-PERP",
            9,
            RejectionReason::Vetoed,
            vec!["a".to_string(), "b".to_string()],
        );
        let record = AuditRecord::from_decision(&decision, None);
        assert_eq!(record.rejection_reason, "VETOED");
        assert_eq!(record.considered_proposals, "a;b");
        assert_eq!(record.winning_policy, "");
        assert!(record.to_csv_row().contains("NO_ACTION/VETOED"));
    }

    #[test]
    fn test_transition_column_format() {
        use crate::position::{LifecycleAction, PositionState};

        let event = TransitionEvent {
            symbol: "SOL-PERP".to_string(),
            cycle_id: 5,
            from_state: PositionState::Idle,
            to_state: PositionState::Entering,
            action: LifecycleAction::Enter,
        };
        let record = AuditRecord::from_decision(&sample_decision(), Some(&event));
        assert_eq!(record.transition, "IDLE--enter-->ENTERING");
    }
}
