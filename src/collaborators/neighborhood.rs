//! Neighborhood resolution over a sharding table.
//!
//! Peers and keywords are hashed into one key space; the neighborhood of a
//! keyword is the `r2` peers with the smallest XOR distance to it.

use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::network::PeerId;
use crate::error::{NodeError, Result};

/// Hash function id for SHA-256, the only one supported.
pub const SHA256_HASH_FUNCTION_ID: u8 = 1;

/// Sharding table entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub peer_id: PeerId,
    /// Advertised ask, decimal token units
    pub ask: String,
    pub stake: u128,
    /// Last time the peer was seen, milliseconds
    pub last_seen: u64,
}

#[async_trait]
pub trait NeighborhoodResolver: Send + Sync {
    /// Peers responsible for `keyword`, closest first.
    async fn find_neighbourhood(
        &self,
        blockchain: &str,
        keyword: &str,
        r2: usize,
        hash_function_id: u8,
        filter_unreachable: bool,
    ) -> Result<Vec<PeerRecord>>;
}

pub(crate) fn distance_key(bytes: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(bytes);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

pub(crate) fn xor_distance(target: &[u8; 32], peer: &PeerId) -> [u8; 32] {
    let key = distance_key(peer.as_str().as_bytes());
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = target[i] ^ key[i];
    }
    out
}

/// In-memory sharding table shared by every blockchain.
#[derive(Default)]
pub struct ShardingTable {
    peers: RwLock<Vec<PeerRecord>>,
    /// Entries not seen since this timestamp are dropped when filtering
    reachable_since: RwLock<u64>,
}

impl ShardingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a peer.
    pub fn upsert(&self, record: PeerRecord) {
        if let Ok(mut peers) = self.peers.write() {
            peers.retain(|p| p.peer_id != record.peer_id);
            peers.push(record);
        }
    }

    pub fn remove(&self, peer_id: &PeerId) {
        if let Ok(mut peers) = self.peers.write() {
            peers.retain(|p| &p.peer_id != peer_id);
        }
    }

    pub fn set_reachable_since(&self, timestamp: u64) {
        if let Ok(mut since) = self.reachable_since.write() {
            *since = timestamp;
        }
    }

    pub fn len(&self) -> usize {
        self.peers.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl NeighborhoodResolver for ShardingTable {
    async fn find_neighbourhood(
        &self,
        _blockchain: &str,
        keyword: &str,
        r2: usize,
        hash_function_id: u8,
        filter_unreachable: bool,
    ) -> Result<Vec<PeerRecord>> {
        if hash_function_id != SHA256_HASH_FUNCTION_ID {
            return Err(NodeError::Validation(format!(
                "unsupported hash function id {}",
                hash_function_id
            )));
        }
        let since = self.reachable_since.read().map(|s| *s).unwrap_or(0);
        let mut peers: Vec<PeerRecord> = self
            .peers
            .read()
            .map_err(|_| NodeError::Internal("sharding table lock poisoned".to_string()))?
            .iter()
            .filter(|p| !filter_unreachable || p.last_seen >= since)
            .cloned()
            .collect();

        let target = distance_key(keyword.as_bytes());
        peers.sort_by_key(|p| xor_distance(&target, &p.peer_id));
        peers.truncate(r2);
        Ok(peers)
    }
}
