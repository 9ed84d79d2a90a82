//! 💾 Position Snapshot Store
//!
//! Persists each symbol's lifecycle state so a restart resumes from the
//! correct point rather than re-entering Idle. One JSON snapshot file,
//! rewritten atomically (write temp, rename) after every applied transition.

use crate::position::table::{PositionState, TRANSITION_TABLE_VERSION};
use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    table_version: u32,
    states: HashMap<String, PositionState>,
}

/// File-backed store for per-symbol position states
pub struct PositionStore {
    path: PathBuf,
}

impl PositionStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Load persisted states; an absent file means a cold start
    ///
    /// A snapshot written against a different table version is refused:
    /// states recorded under other transition semantics cannot be trusted.
    pub fn load(&self) -> Result<HashMap<String, PositionState>> {
        if !self.path.exists() {
            info!("💾 No position snapshot at {:?}, cold start", self.path);
            return Ok(HashMap::new());
        }

        let raw = fs::read_to_string(&self.path)
            .context(format!("Failed to read position snapshot {:?}", self.path))?;
        let snapshot: Snapshot =
            serde_json::from_str(&raw).context("Failed to parse position snapshot")?;

        if snapshot.table_version != TRANSITION_TABLE_VERSION {
            anyhow::bail!(
                "Position snapshot table version {} does not match {}",
                snapshot.table_version,
                TRANSITION_TABLE_VERSION
            );
        }

        info!(
            "💾 Restored {} position state(s) from {:?}",
            snapshot.states.len(),
            self.path
        );
        Ok(snapshot.states)
    }

    /// Persist the full state map
    pub fn save(&self, states: &HashMap<String, PositionState>) -> Result<()> {
        let snapshot = Snapshot {
            table_version: TRANSITION_TABLE_VERSION,
            states: states.clone(),
        };
        let json = serde_json::to_string_pretty(&snapshot)
            .context("Failed to serialize position snapshot")?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create snapshot dir {:?}", parent))?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json).context(format!("Failed to write snapshot {:?}", tmp))?;
        fs::rename(&tmp, &self.path)
            .context(format!("Failed to move snapshot into place at {:?}", self.path))?;
        Ok(())
    }
}
