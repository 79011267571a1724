//! Runtime configuration shared by every node of a cluster.
//!
//! Durations are stored as milliseconds so the struct maps one-to-one onto
//! a TOML table.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use skein_cluster::{HashFunction, HashLayout, DEFAULT_SEGMENT_COUNT};

use crate::error::ConfigError;

/// Transaction isolation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationLevel {
    /// Every read goes to the current owner; nothing is validated at commit.
    ReadCommitted,
    /// Reads are cached for the transaction and written keys are validated
    /// against the versions read, when write-skew checking is enabled.
    #[default]
    RepeatableRead,
}

impl std::str::FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "read-committed" => Ok(Self::ReadCommitted),
            "repeatable-read" => Ok(Self::RepeatableRead),
            _ => Err(format!(
                "unknown isolation level '{s}'. valid options: read-committed, repeatable-read"
            )),
        }
    }
}

/// Cluster-wide settings. Every member must run with the same layout
/// fields (`num-segments`, `replication-factor`, `hash-function`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ClusterConfig {
    pub num_segments: u32,
    pub replication_factor: usize,
    pub hash_function: HashFunction,
    pub isolation: IsolationLevel,
    pub write_skew_check: bool,
    /// Wait for commit acknowledgements instead of sending them in the
    /// background.
    pub sync_commit_phase: bool,
    /// Times a failed commit message is re-sent in sync mode.
    pub commit_retries: u32,
    /// Prepared locks older than this are released by the reaper.
    pub lock_timeout_ms: u64,
    pub rpc_timeout_ms: u64,
    /// Upper bound on a whole segment pull from one source.
    pub transfer_timeout_ms: u64,
    pub transfer_batch_size: usize,
    pub reaper_interval_ms: u64,
    /// Capacity of each node's request channel.
    pub request_buffer: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            num_segments: DEFAULT_SEGMENT_COUNT,
            replication_factor: 2,
            hash_function: HashFunction::Murmur2,
            isolation: IsolationLevel::RepeatableRead,
            write_skew_check: true,
            sync_commit_phase: true,
            commit_retries: 3,
            lock_timeout_ms: 10_000,
            rpc_timeout_ms: 2_000,
            transfer_timeout_ms: 30_000,
            transfer_batch_size: 512,
            reaper_interval_ms: 500,
            request_buffer: 256,
        }
    }
}

impl ClusterConfig {
    /// Checks value ranges and builds the hash layout.
    pub fn validate(&self) -> Result<HashLayout, ConfigError> {
        let positive = [
            ("lock-timeout-ms", self.lock_timeout_ms),
            ("rpc-timeout-ms", self.rpc_timeout_ms),
            ("transfer-timeout-ms", self.transfer_timeout_ms),
            ("reaper-interval-ms", self.reaper_interval_ms),
            ("transfer-batch-size", self.transfer_batch_size as u64),
            ("request-buffer", self.request_buffer as u64),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
        }
        Ok(self.layout()?)
    }

    pub fn layout(&self) -> Result<HashLayout, skein_cluster::TopologyError> {
        HashLayout::new(self.num_segments, self.replication_factor, self.hash_function)
    }

    /// True when the primary must compare observed versions at prepare.
    pub fn validates_versions(&self) -> bool {
        self.isolation == IsolationLevel::RepeatableRead && self.write_skew_check
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }
}
