//! Load config from file and environment.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use pal_core::sync::{MAX_SYNC_INTERVAL, MIN_SYNC_INTERVAL};
use pal_core::{ConflictStrategy, KeyChangePolicy};
use serde::Deserialize;

use crate::manager::NetworkConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Node configuration. File: ~/.config/palnode/config.toml or /etc/palnode/config.toml.
/// Env overrides: PALNODE_DISCOVERY_PORT, PALNODE_TCP_PORT, PALNODE_MAX_PEERS,
/// PALNODE_NETWORK_ID, PALNODE_PEER_ID, PALNODE_SYNC_INTERVAL_SECS, PALNODE_STRATEGY.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Discovery UDP port (default 8080).
    pub discovery_port: u16,
    /// Link TCP port (default 0, ephemeral).
    pub tcp_port: u16,
    pub max_peers: usize,
    pub network_id: String,
    /// Defaults to an ID derived from the node's public key.
    pub peer_id: Option<String>,
    pub discovery_interval_secs: u64,
    /// 0 disables eviction.
    pub peer_timeout_secs: u64,
    pub sync_interval_secs: u64,
    pub strategy: ConflictStrategy,
    pub priorities: HashMap<String, i32>,
    pub max_message_age_secs: u64,
    pub key_change_policy: KeyChangePolicy,
    pub secure_discovery: bool,
    pub capabilities: Vec<String>,
    /// Replaces the broadcast address when non-empty.
    pub announce_targets: Vec<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        let net = NetworkConfig::default();
        Self {
            discovery_port: net.discovery_port,
            tcp_port: net.tcp_port,
            max_peers: net.max_peers,
            network_id: net.network_id,
            peer_id: None,
            discovery_interval_secs: net.discovery_interval.as_secs(),
            peer_timeout_secs: net.peer_timeout.as_secs(),
            sync_interval_secs: pal_core::sync::DEFAULT_SYNC_INTERVAL.as_secs(),
            strategy: ConflictStrategy::default(),
            priorities: HashMap::new(),
            max_message_age_secs: net.max_message_age.as_secs(),
            key_change_policy: KeyChangePolicy::default(),
            secure_discovery: net.secure_discovery,
            capabilities: net.capabilities,
            announce_targets: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `PALNODE_*` overrides read through `var`.
    pub fn apply_env<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = var("PALNODE_DISCOVERY_PORT") {
            self.discovery_port = parse_env("PALNODE_DISCOVERY_PORT", &v)?;
        }
        if let Some(v) = var("PALNODE_TCP_PORT") {
            self.tcp_port = parse_env("PALNODE_TCP_PORT", &v)?;
        }
        if let Some(v) = var("PALNODE_MAX_PEERS") {
            self.max_peers = parse_env("PALNODE_MAX_PEERS", &v)?;
        }
        if let Some(v) = var("PALNODE_NETWORK_ID") {
            self.network_id = v;
        }
        if let Some(v) = var("PALNODE_PEER_ID") {
            self.peer_id = Some(v);
        }
        if let Some(v) = var("PALNODE_SYNC_INTERVAL_SECS") {
            self.sync_interval_secs = parse_env("PALNODE_SYNC_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = var("PALNODE_STRATEGY") {
            self.strategy = v
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("PALNODE_STRATEGY: {e}")))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_peers == 0 {
            return Err(ConfigError::Invalid("max_peers must be at least 1".into()));
        }
        if self.network_id.is_empty() {
            return Err(ConfigError::Invalid("network_id must not be empty".into()));
        }
        if self.peer_id.as_deref() == Some("") {
            return Err(ConfigError::Invalid("peer_id must not be empty".into()));
        }
        if self.discovery_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "discovery_interval_secs must be at least 1".into(),
            ));
        }
        if self.max_message_age_secs == 0 {
            return Err(ConfigError::Invalid(
                "max_message_age_secs must be at least 1".into(),
            ));
        }
        if !(MIN_SYNC_INTERVAL..=MAX_SYNC_INTERVAL).contains(&self.sync_interval()) {
            return Err(ConfigError::Invalid(format!(
                "sync_interval_secs {} outside 1..=600",
                self.sync_interval_secs
            )));
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            discovery_port: self.discovery_port,
            tcp_port: self.tcp_port,
            max_peers: self.max_peers,
            network_id: self.network_id.clone(),
            discovery_interval: Duration::from_secs(self.discovery_interval_secs),
            peer_timeout: Duration::from_secs(self.peer_timeout_secs),
            max_message_age: Duration::from_secs(self.max_message_age_secs),
            secure_discovery: self.secure_discovery,
            capabilities: self.capabilities.clone(),
            announce_targets: self.announce_targets.clone(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("{name}={value:?}: {e}")))
}

/// Load config: `explicit` path if given, else the first existing default path, else
/// defaults; then env overrides; then validation.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(path) => Config::from_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => Config::from_file(&path)?,
            None => Config::default(),
        },
    };
    c.apply_env(|k| std::env::var(k).ok())?;
    c.validate()?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/palnode/config.toml"));
    }
    out.push(PathBuf::from("/etc/palnode/config.toml"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(text: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(text.as_bytes()).unwrap();
        f
    }

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!(c.discovery_port, 8080);
        assert_eq!(c.max_peers, 8);
        assert_eq!(c.network_id, "dds-default");
        assert_eq!(c.discovery_interval_secs, 5);
        assert_eq!(c.sync_interval_secs, 30);
        assert_eq!(c.max_message_age_secs, 300);
        assert_eq!(c.strategy, ConflictStrategy::TimestampWins);
        c.validate().unwrap();
    }

    #[test]
    fn file_overrides_defaults() {
        let f = write_config(
            r#"
discovery_port = 9100
network_id = "n1"
strategy = "priority-wins"
key_change_policy = "reject"
announce_targets = ["127.0.0.1:9100", "127.0.0.1:9101"]

[priorities]
alice = 10
bob = -2
"#,
        );
        let c = load(Some(f.path())).unwrap();
        assert_eq!(c.discovery_port, 9100);
        assert_eq!(c.network_id, "n1");
        assert_eq!(c.max_peers, 8);
        assert_eq!(c.strategy, ConflictStrategy::PriorityWins);
        assert_eq!(c.key_change_policy, KeyChangePolicy::Reject);
        assert_eq!(c.priorities["bob"], -2);
        let net = c.network_config();
        assert_eq!(net.announce_targets().len(), 2);
    }

    #[test]
    fn unknown_fields_rejected() {
        let f = write_config("proxy_port = 3128\n");
        assert!(matches!(
            load(Some(f.path())),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn missing_explicit_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(load(Some(&missing)), Err(ConfigError::Io { .. })));
    }

    #[test]
    fn env_overrides_and_bad_values() {
        let env: HashMap<&str, &str> = [
            ("PALNODE_MAX_PEERS", "3"),
            ("PALNODE_NETWORK_ID", "n2"),
            ("PALNODE_STRATEGY", "last-write-wins"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        c.apply_env(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(c.max_peers, 3);
        assert_eq!(c.network_id, "n2");
        assert_eq!(c.strategy, ConflictStrategy::LastWriteWins);

        let mut c = Config::default();
        let err = c
            .apply_env(|k| (k == "PALNODE_DISCOVERY_PORT").then(|| "eighty".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("PALNODE_DISCOVERY_PORT"));
    }

    #[test]
    fn validation_catches_out_of_range_values() {
        let mut c = Config {
            sync_interval_secs: 601,
            ..Config::default()
        };
        assert!(c.validate().is_err());
        c.sync_interval_secs = 0;
        assert!(c.validate().is_err());
        c.sync_interval_secs = 600;
        c.validate().unwrap();
        c.max_peers = 0;
        assert!(c.validate().is_err());
    }
}
