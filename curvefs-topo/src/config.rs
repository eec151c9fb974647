//! Tool configuration.
//!
//! Values come from built-in defaults, then `tools.conf`, then command-line
//! flags. `tools.conf` uses the curve `key=value` format:
//!
//! ```text
//! # mds addresses, comma separated
//! mdsAddr=10.0.0.1:6700,10.0.0.2:6700
//! rpcTimeoutMs=5000
//! rpcRetryTimes=3
//! rpcRetryIntervalMs=100
//! rpcConcurrentNum=4
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::topology::{Endpoint, ParseOptions};

pub const DEFAULT_MDS_ADDR: &str = "127.0.0.1:6700";
pub const DEFAULT_CONF_PATH: &str = "/etc/curvefs/tools.conf";
pub const DEFAULT_CLUSTER_MAP: &str = "topo_example.json";
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_RPC_RETRY_TIMES: u32 = 3;
pub const DEFAULT_RPC_RETRY_INTERVAL_MS: u64 = 100;
pub const DEFAULT_RPC_RETRY_MAX_INTERVAL_MS: u64 = 2000;
pub const DEFAULT_WORKERS: usize = 4;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown operation '{0}', expected one of: build_topology, check_topology, list_topology")]
    UnknownOperation(String),

    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("no mds address configured")]
    NoMdsAddress,

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Operation selected with `--op`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolOp {
    /// Reconcile the MDS topology with the cluster map.
    BuildTopology,
    /// Fetch and diff, print the plan, apply nothing.
    CheckTopology,
    /// Print the live topology as a cluster map.
    ListTopology,
}

impl ToolOp {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolOp::BuildTopology => "build_topology",
            ToolOp::CheckTopology => "check_topology",
            ToolOp::ListTopology => "list_topology",
        }
    }

    /// Whether the operation reads the cluster map at all.
    pub fn needs_cluster_map(self) -> bool {
        !matches!(self, ToolOp::ListTopology)
    }

    /// Building from an empty cluster map would delete every pool, so only
    /// the read-only check accepts one.
    pub fn parse_options(self) -> ParseOptions {
        ParseOptions {
            allow_empty: matches!(self, ToolOp::CheckTopology),
        }
    }
}

impl FromStr for ToolOp {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "build_topology" => Ok(ToolOp::BuildTopology),
            "check_topology" => Ok(ToolOp::CheckTopology),
            "list_topology" => Ok(ToolOp::ListTopology),
            other => Err(ConfigError::UnknownOperation(other.to_string())),
        }
    }
}

impl fmt::Display for ToolOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Backoff {
    Fixed,
    Exponential,
}

/// Retry budget for transient RPC failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub interval: Duration,
    pub max_interval: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_RPC_RETRY_TIMES,
            interval: Duration::from_millis(DEFAULT_RPC_RETRY_INTERVAL_MS),
            max_interval: Duration::from_millis(DEFAULT_RPC_RETRY_MAX_INTERVAL_MS),
            backoff: Backoff::Exponential,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.interval,
            Backoff::Exponential => {
                let factor = 1u32 << retry.saturating_sub(1).min(16);
                self.interval
                    .checked_mul(factor)
                    .unwrap_or(self.max_interval)
                    .min(self.max_interval)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdsConfig {
    pub addrs: Vec<String>,
    pub rpc_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for MdsConfig {
    fn default() -> Self {
        Self {
            addrs: vec![DEFAULT_MDS_ADDR.to_string()],
            rpc_timeout: Duration::from_millis(DEFAULT_RPC_TIMEOUT_MS),
            retry: RetryPolicy::default(),
        }
    }
}

impl MdsConfig {
    /// Parse a comma separated `ip:port` list.
    pub fn parse_addrs(value: &str) -> Result<Vec<String>> {
        let mut addrs = Vec::new();
        for addr in value.split(',').map(str::trim).filter(|a| !a.is_empty()) {
            let endpoint: Endpoint = addr.parse().map_err(|reason| ConfigError::InvalidValue {
                key: "mdsAddr".to_string(),
                value: addr.to_string(),
                reason,
            })?;
            addrs.push(endpoint.to_string());
        }
        if addrs.is_empty() {
            return Err(ConfigError::NoMdsAddress);
        }
        Ok(addrs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Pools applied concurrently.
    pub workers: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
        }
    }
}

/// Everything a tool invocation needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolConfig {
    pub mds: MdsConfig,
    pub executor: ExecutorConfig,
    pub cluster_map: PathBuf,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            mds: MdsConfig::default(),
            executor: ExecutorConfig::default(),
            cluster_map: PathBuf::from(DEFAULT_CLUSTER_MAP),
        }
    }
}

impl ToolConfig {
    /// Overlay the keys present in `tools.conf`.
    pub fn apply_conf(&mut self, conf: &ToolsConf) -> Result<()> {
        if let Some(addrs) = conf.get("mdsAddr") {
            self.mds.addrs = MdsConfig::parse_addrs(addrs)?;
        }
        if let Some(ms) = conf.parse_value::<u64>("rpcTimeoutMs")? {
            self.mds.rpc_timeout = Duration::from_millis(ms);
        }
        if let Some(times) = conf.parse_value::<u32>("rpcRetryTimes")? {
            self.mds.retry.max_retries = times;
        }
        if let Some(ms) = conf.parse_value::<u64>("rpcRetryIntervalMs")? {
            self.mds.retry.interval = Duration::from_millis(ms);
        }
        if let Some(workers) = conf.parse_value::<usize>("rpcConcurrentNum")? {
            self.executor.workers = workers.max(1);
        }
        Ok(())
    }
}

/// Parsed `tools.conf`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolsConf {
    entries: BTreeMap<String, String>,
}

impl ToolsConf {
    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
                key: format!("line {}", lineno + 1),
                value: line.to_string(),
                reason: "expected key=value".to_string(),
            })?;
            entries.insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(Self { entries })
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(&text)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    fn parse_value<T: FromStr>(&self, key: &str) -> Result<Option<T>>
    where
        T::Err: fmt::Display,
    {
        self.get(key)
            .map(|value| {
                value.parse::<T>().map_err(|e| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }
}
