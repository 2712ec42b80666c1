//! Configuration for a cluster node.
//!
//! Resolution order: environment variables -> config file -> defaults.
//!
//! Config file location:
//!   1. $LOCKSTEP_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/lockstep/config.toml
//!   3. ~/.config/lockstep/config.toml
//!
//! The owning application typically builds a ClusterConfig in code; the
//! file/env path exists for launcher tooling that passes settings through
//! the environment.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::topology::ClusterTopology;
use crate::wire::NodeId;

/// Pre-seeded knowledge about one repeater, obtained from an earlier
/// survey. A full set of these lets the emitter skip the greeting
/// handshake entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurveyedRepeater {
    pub node_id: NodeId,
    pub ip_address_bytes: [u8; 4],
    pub last_received_frame_index: u64,
    pub still_use_network_sync: bool,
}

/// Top-level configuration consumed by the sync core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// This node's identity. 0 is the emitter by convention.
    pub node_id: NodeId,

    /// Expected cluster membership. The repeater entries define how many
    /// registrations the emitter waits for.
    pub topology: ClusterTopology,

    pub network: NetworkConfig,
    pub timeouts: TimeoutConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Multicast group all cluster traffic is sent to.
    pub multicast_address: Ipv4Addr,
    pub port: u16,
    /// Local IPv4 address selecting the adapter to bind. Unspecified =
    /// let the OS pick.
    pub adapter_address: Ipv4Addr,
    /// Multicast TTL. 1 keeps traffic on the local segment.
    pub ttl: u32,
    /// Largest datagram the transport will emit, header included.
    pub max_message_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Window for the initial registration/greeting exchange.
    #[serde(with = "duration_millis")]
    pub handshake: Duration,
    /// Window for every steady-state wait.
    #[serde(with = "duration_millis")]
    pub communication: Duration,
    /// How often a repeater re-sends its registration while unanswered.
    #[serde(with = "duration_millis")]
    pub registration_resend_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Frames kept by the emitter for retransmission. Must be >= 2.
    pub retransmit_history: usize,
    /// Repeaters run one frame behind the emitter.
    pub repeaters_delayed: bool,
    /// Frame index of the first emitted frame.
    pub first_frame_index: u64,
    /// Pre-seeded survey answers enabling the greeting-skip fast path.
    /// Empty = run the normal registration handshake.
    pub surveyed_repeaters: Vec<SurveyedRepeater>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            topology: ClusterTopology::default(),
            network: NetworkConfig::default(),
            timeouts: TimeoutConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            multicast_address: Ipv4Addr::new(224, 0, 1, 66),
            port: 25690,
            adapter_address: Ipv4Addr::UNSPECIFIED,
            ttl: 1,
            max_message_size: 1400,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(30),
            communication: Duration::from_secs(5),
            registration_resend_interval: Duration::from_millis(250),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retransmit_history: 2,
            repeaters_delayed: false,
            first_frame_index: 0,
            surveyed_repeaters: Vec::new(),
        }
    }
}

// ── Serde helper ──────────────────────────────────────────────────────────────

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
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

impl ClusterConfig {
    /// Load config: env vars -> file -> defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            ClusterConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("LOCKSTEP_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Apply LOCKSTEP_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("LOCKSTEP_NODE_ID") {
            if let Ok(id) = v.parse() {
                self.node_id = id;
            }
        }
        if let Ok(v) = std::env::var("LOCKSTEP_NETWORK__MULTICAST_ADDRESS") {
            if let Ok(addr) = v.parse() {
                self.network.multicast_address = addr;
            }
        }
        if let Ok(v) = std::env::var("LOCKSTEP_NETWORK__PORT") {
            if let Ok(p) = v.parse() {
                self.network.port = p;
            }
        }
        if let Ok(v) = std::env::var("LOCKSTEP_NETWORK__ADAPTER_ADDRESS") {
            if let Ok(addr) = v.parse() {
                self.network.adapter_address = addr;
            }
        }
        if let Ok(v) = std::env::var("LOCKSTEP_SYNC__REPEATERS_DELAYED") {
            self.sync.repeaters_delayed = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("LOCKSTEP_SYNC__RETRANSMIT_HISTORY") {
            if let Ok(n) = v.parse() {
                self.sync.retransmit_history = n;
            }
        }
        if let Ok(v) = std::env::var("LOCKSTEP_TIMEOUTS__HANDSHAKE_MS") {
            if let Ok(ms) = v.parse() {
                self.timeouts.handshake = Duration::from_millis(ms);
            }
        }
        if let Ok(v) = std::env::var("LOCKSTEP_TIMEOUTS__COMMUNICATION_MS") {
            if let Ok(ms) = v.parse() {
                self.timeouts.communication = Duration::from_millis(ms);
            }
        }
    }
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            std::env::var("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp"))
                .join(".config")
        })
        .join("lockstep")
}
