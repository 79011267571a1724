//! Simulation configuration.
//!
//! Resolution order is defaults, then the TOML file, then environment and
//! CLI flags (applied in `main`). The `[cluster]` table is handed to every
//! node unchanged.

use std::path::Path;

use serde::{Deserialize, Serialize};
use skein_cluster::HashFunction;
use skein_core::{ClusterConfig, ConfigError, IsolationLevel};

#[derive(Debug, thiserror::Error)]
pub enum ServerConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(#[from] ConfigError),
}

/// The contended-counter workload run against the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct WorkloadConfig {
    /// Concurrent clients, each running its increments back to back.
    pub clients: usize,
    /// Increments each client must get committed.
    pub increments: u64,
    /// Number of counter keys; fewer counters means more conflicts.
    pub counters: usize,
    /// Attempts per increment before the client gives up on it.
    pub max_attempts: u32,
    /// Upper bound of the random pause between attempts.
    pub backoff_ms: u64,
    /// Add a node while the workload runs.
    pub join: bool,
    /// Crash a node while the workload runs, after the join.
    pub crash: bool,
    /// Delay between starting the clients and the first membership change.
    pub churn_after_ms: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            clients: 8,
            increments: 50,
            counters: 4,
            max_attempts: 500,
            backoff_ms: 5,
            join: true,
            crash: true,
            churn_after_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServerConfig {
    /// Nodes in the initial view.
    pub nodes: usize,
    /// How long to wait for the cluster to settle after a membership change.
    pub settle_timeout_ms: u64,
    pub cluster: ClusterConfig,
    pub workload: WorkloadConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            nodes: 4,
            settle_timeout_ms: 30_000,
            cluster: ClusterConfig::default(),
            workload: WorkloadConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ServerConfigError> {
        let display = path.display().to_string();
        let contents = std::fs::read_to_string(path).map_err(|source| ServerConfigError::Io {
            path: display.clone(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ServerConfigError::Parse {
            path: display,
            source,
        })
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn settle_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.settle_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cluster.validate()?;
        if self.nodes == 0 {
            return Err(invalid("nodes", "must be at least 1"));
        }
        if self.workload.clients == 0 {
            return Err(invalid("workload.clients", "must be at least 1"));
        }
        if self.workload.counters == 0 {
            return Err(invalid("workload.counters", "must be at least 1"));
        }
        if self.workload.max_attempts == 0 {
            return Err(invalid("workload.max-attempts", "must be at least 1"));
        }
        let survivors = self.nodes + usize::from(self.workload.join);
        if self.workload.crash && survivors < 2 {
            return Err(invalid(
                "workload.crash",
                "needs at least two nodes so one survives the crash",
            ));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

pub fn parse_hash_function(input: &str) -> Result<HashFunction, String> {
    input.parse()
}

pub fn parse_isolation(input: &str) -> Result<IsolationLevel, String> {
    input.parse()
}
