//! Configuration management for the arbitration service
//!
//! Loads configuration from environment variables (via .env file) and provides
//! validated, type-safe access to all service parameters.

use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Complete configuration for the mandate arbitration service
#[derive(Debug, Clone)]
pub struct Config {
    pub arbitration: ArbitrationConfig,
    pub network: NetworkConfig,
    pub emitter: EmitterConfig,
    pub persistence: PersistenceConfig,
    pub universe: UniverseConfig,
    pub logging: LoggingConfig,
}

/// Cycle timing configuration
#[derive(Debug, Clone)]
pub struct ArbitrationConfig {
    /// Evaluation interval between cycles (milliseconds)
    pub cycle_interval_ms: u64,
    /// Per-cycle evaluation budget (milliseconds)
    pub cycle_budget_ms: u64,
}

/// Bus addresses
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Address to receive proposals/vetoes/execution reports on
    pub proposal_bus_addr: SocketAddr,
    /// Address decisions are published to
    pub decision_bus_addr: SocketAddr,
}

/// Emitter tuning
#[derive(Debug, Clone)]
pub struct EmitterConfig {
    /// Maximum undelivered records before dropping the oldest
    pub publish_queue_bound: usize,
    /// Send attempts before a record is declared undeliverable
    pub publish_max_retries: u32,
    /// Base backoff between send attempts (milliseconds)
    pub publish_backoff_ms: u64,
    /// Audit append attempts before halting the symbol
    pub audit_max_retries: u32,
    /// Base backoff between audit attempts (milliseconds)
    pub audit_backoff_ms: u64,
}

/// Persisted artifact locations
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Append-only audit trail (CSV)
    pub audit_path: PathBuf,
    /// Position state snapshot (JSON)
    pub snapshot_path: PathBuf,
}

/// Tracked symbols and registered primitives
#[derive(Debug, Clone)]
pub struct UniverseConfig {
    pub symbols: Vec<String>,
    pub primitives: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Expects a .env file in the working directory or environment variables
    /// to be set. Returns an error if values are malformed.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv::dotenv();

        Ok(Config {
            arbitration: ArbitrationConfig {
                cycle_interval_ms: get_env_u64("CYCLE_INTERVAL_MS", 1000)?,
                cycle_budget_ms: get_env_u64("CYCLE_BUDGET_MS", 1000)?,
            },
            network: NetworkConfig {
                proposal_bus_addr: get_env_addr("PROPOSAL_BUS_ADDR", "127.0.0.1:46100")?,
                decision_bus_addr: get_env_addr("DECISION_BUS_ADDR", "127.0.0.1:46110")?,
            },
            emitter: EmitterConfig {
                publish_queue_bound: get_env_usize("PUBLISH_QUEUE_BOUND", 256)?,
                publish_max_retries: get_env_u32("PUBLISH_MAX_RETRIES", 5)?,
                publish_backoff_ms: get_env_u64("PUBLISH_BACKOFF_MS", 10)?,
                audit_max_retries: get_env_u32("AUDIT_MAX_RETRIES", 3)?,
                audit_backoff_ms: get_env_u64("AUDIT_BACKOFF_MS", 20)?,
            },
            persistence: PersistenceConfig {
                audit_path: PathBuf::from(get_env_string(
                    "AUDIT_PATH",
                    "./data/decision_audit.csv",
                )?),
                snapshot_path: PathBuf::from(get_env_string(
                    "SNAPSHOT_PATH",
                    "./data/position_states.json",
                )?),
            },
            universe: UniverseConfig {
                symbols: get_env_list("TRACKED_SYMBOLS", "")?,
                primitives: get_env_list("REGISTERED_PRIMITIVES", "")?,
            },
            logging: LoggingConfig {
                log_level: get_env_string("LOG_LEVEL", "info")?,
            },
        })
    }

    /// Validate configuration values are within acceptable ranges
    pub fn validate(&self) -> Result<()> {
        if self.arbitration.cycle_interval_ms == 0 {
            anyhow::bail!("CYCLE_INTERVAL_MS must be > 0");
        }
        if self.arbitration.cycle_budget_ms == 0 {
            anyhow::bail!("CYCLE_BUDGET_MS must be > 0");
        }
        if self.arbitration.cycle_budget_ms > self.arbitration.cycle_interval_ms {
            anyhow::bail!("CYCLE_BUDGET_MS cannot exceed CYCLE_INTERVAL_MS");
        }

        if self.emitter.publish_queue_bound == 0 {
            anyhow::bail!("PUBLISH_QUEUE_BOUND must be > 0");
        }
        if self.emitter.publish_max_retries == 0 || self.emitter.publish_max_retries > 32 {
            anyhow::bail!("PUBLISH_MAX_RETRIES must be in 1..=32");
        }
        if self.emitter.audit_max_retries == 0 || self.emitter.audit_max_retries > 32 {
            anyhow::bail!("AUDIT_MAX_RETRIES must be in 1..=32");
        }

        if self.network.proposal_bus_addr == self.network.decision_bus_addr {
            anyhow::bail!("PROPOSAL_BUS_ADDR and DECISION_BUS_ADDR must be different");
        }

        if self.universe.symbols.is_empty() {
            anyhow::bail!("TRACKED_SYMBOLS must name at least one symbol");
        }

        let levels = ["error", "warn", "info", "debug", "trace"];
        if !levels.contains(&self.logging.log_level.as_str()) {
            anyhow::bail!(
                "LOG_LEVEL must be one of error, warn, info, debug, trace (got '{}')",
                self.logging.log_level
            );
        }

        Ok(())
    }
}

// Environment variable helpers

fn get_env_string(key: &str, default: &str) -> Result<String> {
    Ok(env::var(key).unwrap_or_else(|_| default.to_string()))
}

fn get_env_u32(key: &str, default: u32) -> Result<u32> {
    match env::var(key) {
        Ok(val) => val
            .parse()
            .context(format!("{} must be a valid u32, got '{}'", key, val)),
        Err(_) => Ok(default),
    }
}

fn get_env_u64(key: &str, default: u64) -> Result<u64> {
    match env::var(key) {
        Ok(val) => val
            .parse()
            .context(format!("{} must be a valid u64, got '{}'", key, val)),
        Err(_) => Ok(default),
    }
}

fn get_env_usize(key: &str, default: usize) -> Result<usize> {
    match env::var(key) {
        Ok(val) => val
            .parse()
            .context(format!("{} must be a valid usize, got '{}'", key, val)),
        Err(_) => Ok(default),
    }
}

fn get_env_addr(key: &str, default: &str) -> Result<SocketAddr> {
    let raw = get_env_string(key, default)?;
    raw.parse()
        .context(format!("{} must be a valid socket address, got '{}'", key, raw))
}

/// Comma-separated list; empty entries are skipped
fn get_env_list(key: &str, default: &str) -> Result<Vec<String>> {
    let raw = get_env_string(key, default)?;
    Ok(raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            arbitration: ArbitrationConfig {
                cycle_interval_ms: 1000,
                cycle_budget_ms: 1000,
            },
            network: NetworkConfig {
                proposal_bus_addr: "127.0.0.1:46100".parse().unwrap(),
                decision_bus_addr: "127.0.0.1:46110".parse().unwrap(),
            },
            emitter: EmitterConfig {
                publish_queue_bound: 256,
                publish_max_retries: 5,
                publish_backoff_ms: 10,
                audit_max_retries: 3,
                audit_backoff_ms: 20,
            },
            persistence: PersistenceConfig {
                audit_path: PathBuf::from("/tmp/audit.csv"),
                snapshot_path: PathBuf::from("/tmp/states.json"),
            },
            universe: UniverseConfig {
                symbols: vec!["SOL-PERP".to_string()],
                primitives: vec![],
            },
            logging: LoggingConfig {
                log_level: "info".to_string(),
            },
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_budget_cannot_exceed_interval() {
        let mut config = base_config();
        config.arbitration.cycle_budget_ms = 2000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_universe_rejected() {
        let mut config = base_config();
        config.universe.symbols.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bus_addresses_must_differ() {
        let mut config = base_config();
        config.network.decision_bus_addr = config.network.proposal_bus_addr;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_counts_are_bounded_above() {
        let mut config = base_config();
        config.emitter.publish_max_retries = 64;
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.emitter.audit_max_retries = 64;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_log_level_rejected() {
        let mut config = base_config();
        config.logging.log_level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_list_parsing_skips_empty_entries() {
        let list = get_env_list("UNSET_TEST_KEY_XYZ", "a, b,,c").unwrap();
        assert_eq!(list, vec!["a", "b", "c"]);
    }
}
