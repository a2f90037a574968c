// src/config.rs

//! Loads and validates the daemon's on-disk configuration.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// A raw representation of the config file before defaults/validation are applied.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_node_name")]
    node_name: String,
    #[serde(default = "default_node_id")]
    node_id: u64,
    #[serde(default = "default_bind_addr")]
    bind_addr: String,
    #[serde(default)]
    peers: Vec<String>,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default = "default_dampen_ms")]
    default_dampen_ms: u64,
    #[serde(default = "default_failure_backoff")]
    #[serde(with = "humantime_serde")]
    failure_backoff: Duration,
    #[serde(default)]
    propagate_clear_failure_to_peers: bool,
    #[serde(default)]
    cdb: CdbConfig,
}

fn default_node_name() -> String {
    "localhost".to_string()
}
fn default_node_id() -> u64 {
    1
}
fn default_bind_addr() -> String {
    "127.0.0.1:9000".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_dampen_ms() -> u64 {
    0
}
fn default_failure_backoff() -> Duration {
    Duration::from_secs(2)
}

/// Configuration for talking to the (externally-supplied) configuration database.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CdbConfig {
    /// Opaque endpoint descriptor for the CDB client (e.g. a socket path or URL).
    /// The core treats this as an unstructured string handed to the `CdbClient`
    /// implementation at construction time.
    #[serde(default)]
    pub endpoint: String,
    /// Operation timeout; a CDB call that exceeds this is reported as a
    /// retryable failure (spec.md §5).
    #[serde(default = "default_cdb_timeout")]
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_cdb_timeout() -> Duration {
    Duration::from_secs(30)
}

/// The final, validated daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// This node's canonical, case-preserved name.
    pub node_name: String,
    /// This node's own numeric cluster id, normally supplied by the cluster
    /// membership layer (e.g. corosync's `nodeid`) rather than invented here
    /// (spec.md §1's election/membership collaborators are out of scope).
    pub node_id: u64,
    /// Local address the in-memory/TCP transport binds to.
    pub bind_addr: String,
    /// Known peer addresses for the transport harness.
    pub peers: Vec<String>,
    pub log_level: String,
    /// Default `dampen_ms` applied to attributes created without an explicit value.
    pub default_dampen_ms: u64,
    /// Period of the temporary failure-backoff retry timer (spec.md §4.2).
    pub failure_backoff: Duration,
    /// Gates propagation of `CLEAR_FAILURE` to peers (spec.md §9, Open Question 1).
    /// Disabled by default to match today's behavior.
    pub propagate_clear_failure_to_peers: bool,
    pub cdb: CdbConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            node_id: default_node_id(),
            bind_addr: default_bind_addr(),
            peers: Vec::new(),
            log_level: default_log_level(),
            default_dampen_ms: default_dampen_ms(),
            failure_backoff: default_failure_backoff(),
            propagate_clear_failure_to_peers: false,
            cdb: CdbConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new `Config` by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let raw: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;

        let config = Config {
            node_name: raw.node_name,
            node_id: raw.node_id,
            bind_addr: raw.bind_addr,
            peers: raw.peers,
            log_level: raw.log_level,
            default_dampen_ms: raw.default_dampen_ms,
            failure_backoff: raw.failure_backoff,
            propagate_clear_failure_to_peers: raw.propagate_clear_failure_to_peers,
            cdb: raw.cdb,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.node_name.trim().is_empty() {
            return Err(anyhow!("node_name cannot be empty"));
        }
        if self.bind_addr.trim().is_empty() {
            return Err(anyhow!("bind_addr cannot be empty"));
        }
        if self.node_id == 0 {
            return Err(anyhow!("node_id must be nonzero"));
        }
        if self.failure_backoff.is_zero() {
            return Err(anyhow!("failure_backoff must be greater than zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn loads_minimal_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"node_name = "n1""#).unwrap();
        let cfg = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.node_name, "n1");
        assert_eq!(cfg.default_dampen_ms, 0);
    }

    #[test]
    fn rejects_empty_node_name() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"node_name = """#).unwrap();
        assert!(Config::from_file(file.path().to_str().unwrap()).is_err());
    }
}
