//! Configuration for mycod.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MYCO_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/myco/config.toml
//!   3. ~/.config/myco/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MycoConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub gossip: GossipConfig,
    pub executor: ExecutorConfig,
    /// Static membership: every peer this node gossips with.
    pub peers: Vec<PeerConfig>,
    /// Services injected at startup, before the first tick.
    pub services: Vec<SeedService>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Numeric node id. Seeds the deterministic test identity and appears
    /// in every packet header.
    pub node_id: u16,
    /// Path to the X25519 private key. Auto-generated on first run.
    pub keypair_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP listen address.
    pub listen: String,
    /// Tick cadence in milliseconds.
    pub tick_ms: u64,
    /// Most datagrams handed to one tick.
    pub batch: usize,
    /// WAL buffer size in bytes.
    pub wal_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Peers a freshly accepted Deploy is forwarded to.
    pub fanout: u8,
    /// Control digest every N ticks.
    pub control_interval: u64,
    /// Random sample digest every N ticks.
    pub sample_interval: u64,
    /// Process packets that fail MAC verification (counted either way).
    pub allow_unverified: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Toolchain binary invoked per accepted record as
    /// `<command> <flake_uri> <exec_name>`. Empty = log only.
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Peer public key, hex.
    pub public_key: String,
    /// Peer socket address.
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedService {
    pub id: u64,
    pub name: String,
    pub flake_uri: String,
    pub exec_name: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for MycoConfig {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            network: NetworkConfig::default(),
            gossip: GossipConfig::default(),
            executor: ExecutorConfig::default(),
            peers: Vec::new(),
            services: Vec::new(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            keypair_path: config_dir().join("keypair"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7946".to_string(),
            tick_ms: 100,
            batch: 16,
            wal_bytes: 64 * 1024,
        }
    }
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            fanout: 4,
            control_interval: 10,
            sample_interval: 50,
            allow_unverified: false,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_or_tmp().join(".config"))
        .join("myco")
}

fn home_or_tmp() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl MycoConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            MycoConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MYCO_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Apply MYCO_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MYCO_IDENTITY__NODE_ID") {
            if let Ok(id) = v.parse() {
                self.identity.node_id = id;
            }
        }
        if let Ok(v) = std::env::var("MYCO_NETWORK__LISTEN") {
            self.network.listen = v;
        }
        if let Ok(v) = std::env::var("MYCO_NETWORK__TICK_MS") {
            if let Ok(ms) = v.parse() {
                self.network.tick_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("MYCO_GOSSIP__FANOUT") {
            if let Ok(f) = v.parse() {
                self.gossip.fanout = f;
            }
        }
        if let Ok(v) = std::env::var("MYCO_GOSSIP__ALLOW_UNVERIFIED") {
            self.gossip.allow_unverified = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("MYCO_EXECUTOR__COMMAND") {
            self.executor.command = v;
        }
    }
}
