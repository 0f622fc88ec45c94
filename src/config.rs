//! Node configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{NodeError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
    #[serde(default)]
    pub operations: OperationsConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

impl Config {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| NodeError::Internal(format!("invalid config {}: {}", path.display(), e)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Peer identifier advertised to the network
    #[serde(default = "default_peer_id")]
    pub peer_id: String,

    /// Data directory (database, operation cache, pending storage)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Advertised storage price in token units per kilobyte-epoch
    #[serde(default = "default_ask")]
    pub ask: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            peer_id: default_peer_id(),
            data_dir: default_data_dir(),
            ask: default_ask(),
        }
    }
}

/// Command executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsConfig {
    /// Number of workers executing commands concurrently
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Timer loop tick in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Interval for repeating commands without an explicit period
    #[serde(default = "default_repeat_interval_ms")]
    pub default_repeat_interval_ms: u64,

    /// Backoff for retryable failures without an explicit period
    #[serde(default = "default_retry_backoff_ms")]
    pub default_retry_backoff_ms: u64,

    /// How long finished commands are kept before the cleaner removes them
    #[serde(default = "default_command_retention_secs")]
    pub retention_secs: u64,

    /// Trace every command transition
    #[serde(default)]
    pub verbose_logging: bool,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            tick_ms: default_tick_ms(),
            default_repeat_interval_ms: default_repeat_interval_ms(),
            default_retry_backoff_ms: default_retry_backoff_ms(),
            retention_secs: default_command_retention_secs(),
            verbose_logging: false,
        }
    }
}

/// Operation lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationsConfig {
    /// Quorum used when the caller does not supply one
    #[serde(default = "default_min_replications")]
    pub minimum_number_of_node_replications: usize,

    /// Deadline for reaching quorum, in milliseconds
    #[serde(default = "default_operation_timeout_ms")]
    pub timeout_ms: u64,

    /// Terminal operations older than this are swept
    #[serde(default = "default_operation_retention_secs")]
    pub retention_secs: u64,

    /// Persist cached operation data to files next to the memory tier
    #[serde(default = "default_true")]
    pub file_cache: bool,

    /// Peers contacted per GET batch
    #[serde(default = "default_get_batch_size")]
    pub get_batch_size: usize,

    /// Upper bound on peers a GET may contact, closer peers included
    #[serde(default = "default_get_max_peers")]
    pub get_max_peers: usize,
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            minimum_number_of_node_replications: default_min_replications(),
            timeout_ms: default_operation_timeout_ms(),
            retention_secs: default_operation_retention_secs(),
            file_cache: true,
            get_batch_size: default_get_batch_size(),
            get_max_peers: default_get_max_peers(),
        }
    }
}

/// Protocol behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Hash function used for neighborhood distance when the caller omits one
    #[serde(default = "default_hash_function_id")]
    pub hash_function_id: u8,

    /// How long an update's pending state lives before it is promoted or dropped
    #[serde(default = "default_pending_state_ttl_ms")]
    pub pending_state_ttl_ms: u64,

    /// Request/response timeout for a single protocol message
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,

    /// Notify the publisher once an assertion was stored
    #[serde(default = "default_true")]
    pub send_finality_ack: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            hash_function_id: default_hash_function_id(),
            pending_state_ttl_ms: default_pending_state_ttl_ms(),
            message_timeout_ms: default_message_timeout_ms(),
            send_finality_ack: true,
        }
    }
}

/// Chain parameters used by the in-process chain view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Blockchain implementation names (e.g. "hardhat:31337")
    #[serde(default = "default_blockchains")]
    pub implementations: Vec<String>,

    /// Epoch reward-sharing parameter
    #[serde(default = "default_r0")]
    pub r0: u64,

    /// Neighborhood size
    #[serde(default = "default_r2")]
    pub r2: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            implementations: default_blockchains(),
            r0: default_r0(),
            r2: default_r2(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
        }
    }
}

// Defaults
fn default_peer_id() -> String { "local-peer".to_string() }
fn default_data_dir() -> PathBuf { PathBuf::from("/var/lib/dkg-node") }
fn default_ask() -> String { "0.1".to_string() }
fn default_parallelism() -> usize { 4 }
fn default_tick_ms() -> u64 { 1000 }
fn default_repeat_interval_ms() -> u64 { 5000 }
fn default_retry_backoff_ms() -> u64 { 1000 }
fn default_command_retention_secs() -> u64 { 4 * 24 * 60 * 60 }
fn default_min_replications() -> usize { 3 }
fn default_operation_timeout_ms() -> u64 { 60_000 }
fn default_operation_retention_secs() -> u64 { 24 * 60 * 60 }
fn default_true() -> bool { true }
fn default_get_batch_size() -> usize { 2 }
fn default_get_max_peers() -> usize { 20 }
fn default_hash_function_id() -> u8 { 1 }
fn default_pending_state_ttl_ms() -> u64 { 60 * 60 * 1000 }
fn default_message_timeout_ms() -> u64 { 15_000 }
fn default_blockchains() -> Vec<String> { vec!["hardhat:31337".to_string()] }
fn default_r0() -> u64 { 3 }
fn default_r2() -> usize { 20 }
fn default_http_port() -> u16 { 8900 }
