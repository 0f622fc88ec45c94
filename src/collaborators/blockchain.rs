//! Blockchain interface and an in-memory chain view.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::network::PeerId;
use crate::error::{NodeError, Result};

/// Service agreement terms as stored on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgreementData {
    #[serde(with = "amount")]
    pub token_amount: u128,
    pub epochs_number: u64,
    /// Epoch length in seconds
    pub epoch_length: u64,
    /// Agreement start, seconds since the Unix epoch
    pub start_time: u64,
    pub score_function_id: u8,
    pub proof_window_offset_percentage: u8,
}

impl AgreementData {
    /// End of the last epoch, in milliseconds.
    pub fn end_time_ms(&self) -> u64 {
        self.start_time
            .saturating_add(self.epochs_number.saturating_mul(self.epoch_length))
            .saturating_mul(1000)
    }
}

/// Token amounts travel as decimal strings so JSON never truncates them.
pub mod amount {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[async_trait]
pub trait Blockchain: Send + Sync {
    /// Configured implementation names, e.g. `hardhat:31337`.
    fn implementation_names(&self) -> Vec<String>;

    async fn get_latest_assertion_id(
        &self,
        blockchain: &str,
        contract: &str,
        token_id: u64,
    ) -> Result<Option<String>>;

    async fn get_unfinalized_assertion_id(
        &self,
        blockchain: &str,
        contract: &str,
        token_id: u64,
    ) -> Result<Option<String>>;

    /// Assertion size in bytes.
    async fn get_assertion_size(&self, blockchain: &str, assertion_id: &str) -> Result<u64>;

    async fn get_r0(&self, blockchain: &str) -> Result<u64>;

    async fn get_r2(&self, blockchain: &str) -> Result<usize>;

    async fn get_agreement_data(
        &self,
        blockchain: &str,
        agreement_id: &str,
    ) -> Result<Option<AgreementData>>;

    async fn get_identity_id(&self, blockchain: &str, peer_id: &PeerId) -> Result<u64>;

    /// Convert a decimal token amount to the chain's base unit (18 decimals).
    async fn convert_to_wei(&self, blockchain: &str, amount: &str) -> Result<u128>;
}

#[derive(Debug, Clone, Default)]
struct AssetState {
    latest: Option<String>,
    unfinalized: Option<String>,
}

/// Chain state kept in memory. Writes are test/setup helpers.
pub struct InMemoryChain {
    implementations: Vec<String>,
    r0: u64,
    r2: usize,
    assets: DashMap<(String, String, u64), AssetState>,
    sizes: DashMap<String, u64>,
    agreements: DashMap<String, AgreementData>,
    unavailable: AtomicBool,
}

impl InMemoryChain {
    pub fn new(implementations: Vec<String>, r0: u64, r2: usize) -> Self {
        Self {
            implementations,
            r0,
            r2,
            assets: DashMap::new(),
            sizes: DashMap::new(),
            agreements: DashMap::new(),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Record a minted or updated asset whose state is final.
    pub fn set_latest_assertion(
        &self,
        blockchain: &str,
        contract: &str,
        token_id: u64,
        assertion_id: &str,
        size: u64,
    ) {
        let key = (blockchain.to_string(), contract.to_lowercase(), token_id);
        self.assets.entry(key).or_default().latest = Some(assertion_id.to_string());
        self.sizes.insert(assertion_id.to_string(), size);
    }

    /// Record an update that has not been finalized yet.
    pub fn set_unfinalized_assertion(
        &self,
        blockchain: &str,
        contract: &str,
        token_id: u64,
        assertion_id: &str,
        size: u64,
    ) {
        let key = (blockchain.to_string(), contract.to_lowercase(), token_id);
        self.assets.entry(key).or_default().unfinalized = Some(assertion_id.to_string());
        self.sizes.insert(assertion_id.to_string(), size);
    }

    /// Promote the unfinalized assertion to latest.
    pub fn finalize(&self, blockchain: &str, contract: &str, token_id: u64) {
        let key = (blockchain.to_string(), contract.to_lowercase(), token_id);
        if let Some(mut state) = self.assets.get_mut(&key) {
            if let Some(pending) = state.unfinalized.take() {
                state.latest = Some(pending);
            }
        }
    }

    pub fn set_agreement(&self, agreement_id: &str, data: AgreementData) {
        self.agreements.insert(agreement_id.to_string(), data);
    }

    /// Make every read fail with a blockchain error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self, blockchain: &str) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(NodeError::Blockchain("rpc unavailable".to_string()));
        }
        if !self.implementations.iter().any(|b| b == blockchain) {
            return Err(NodeError::Validation(format!(
                "unsupported blockchain {}",
                blockchain
            )));
        }
        Ok(())
    }

    fn asset(&self, blockchain: &str, contract: &str, token_id: u64) -> Option<AssetState> {
        self.assets
            .get(&(blockchain.to_string(), contract.to_lowercase(), token_id))
            .map(|s| s.clone())
    }
}

#[async_trait]
impl Blockchain for InMemoryChain {
    fn implementation_names(&self) -> Vec<String> {
        self.implementations.clone()
    }

    async fn get_latest_assertion_id(
        &self,
        blockchain: &str,
        contract: &str,
        token_id: u64,
    ) -> Result<Option<String>> {
        self.check(blockchain)?;
        Ok(self
            .asset(blockchain, contract, token_id)
            .and_then(|s| s.latest))
    }

    async fn get_unfinalized_assertion_id(
        &self,
        blockchain: &str,
        contract: &str,
        token_id: u64,
    ) -> Result<Option<String>> {
        self.check(blockchain)?;
        Ok(self
            .asset(blockchain, contract, token_id)
            .and_then(|s| s.unfinalized))
    }

    async fn get_assertion_size(&self, blockchain: &str, assertion_id: &str) -> Result<u64> {
        self.check(blockchain)?;
        self.sizes
            .get(assertion_id)
            .map(|s| *s)
            .ok_or_else(|| NodeError::Validation(format!("unknown assertion {}", assertion_id)))
    }

    async fn get_r0(&self, blockchain: &str) -> Result<u64> {
        self.check(blockchain)?;
        Ok(self.r0)
    }

    async fn get_r2(&self, blockchain: &str) -> Result<usize> {
        self.check(blockchain)?;
        Ok(self.r2)
    }

    async fn get_agreement_data(
        &self,
        blockchain: &str,
        agreement_id: &str,
    ) -> Result<Option<AgreementData>> {
        self.check(blockchain)?;
        Ok(self.agreements.get(agreement_id).map(|a| a.clone()))
    }

    async fn get_identity_id(&self, blockchain: &str, peer_id: &PeerId) -> Result<u64> {
        self.check(blockchain)?;
        let digest = Sha256::digest(peer_id.as_str().as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        Ok(u64::from_be_bytes(bytes) >> 1)
    }

    async fn convert_to_wei(&self, _blockchain: &str, amount: &str) -> Result<u128> {
        parse_wei(amount)
    }
}

/// Parse a decimal amount with up to 18 fractional digits into wei.
pub fn parse_wei(amount: &str) -> Result<u128> {
    const DECIMALS: usize = 18;
    let invalid = || NodeError::Validation(format!("invalid token amount {}", amount));

    let amount = amount.trim();
    let (whole, fraction) = match amount.split_once('.') {
        Some((w, f)) => (w, f),
        None => (amount, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid());
    }
    if fraction.len() > DECIMALS
        || !whole.chars().all(|c| c.is_ascii_digit())
        || !fraction.chars().all(|c| c.is_ascii_digit())
    {
        return Err(invalid());
    }

    let whole: u128 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid())?
    };
    let padded = format!("{:0<width$}", fraction, width = DECIMALS);
    let fraction: u128 = padded.parse().map_err(|_| invalid())?;

    whole
        .checked_mul(10u128.pow(DECIMALS as u32))
        .and_then(|w| w.checked_add(fraction))
        .ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wei() {
        assert_eq!(parse_wei("1").unwrap(), 1_000_000_000_000_000_000);
        assert_eq!(parse_wei("0.1").unwrap(), 100_000_000_000_000_000);
        assert_eq!(parse_wei(".5").unwrap(), 500_000_000_000_000_000);
        assert_eq!(parse_wei("0.000000000000000001").unwrap(), 1);
        assert!(parse_wei("0.0000000000000000001").is_err());
        assert!(parse_wei("-1").is_err());
        assert!(parse_wei("").is_err());
        assert!(parse_wei("1e18").is_err());
    }

    #[test]
    fn test_agreement_amount_serializes_as_string() {
        let data = AgreementData {
            token_amount: u128::MAX,
            epochs_number: 5,
            epoch_length: 3600,
            start_time: 0,
            score_function_id: 1,
            proof_window_offset_percentage: 50,
        };
        let value = serde_json::to_value(&data).unwrap();
        assert_eq!(value["tokenAmount"], u128::MAX.to_string());
        let back: AgreementData = serde_json::from_value(value).unwrap();
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn test_finalize_promotes_pending_assertion() {
        let chain = InMemoryChain::new(vec!["hardhat:31337".into()], 3, 20);
        chain.set_latest_assertion("hardhat:31337", "0xABC", 1, "0x01", 10);
        chain.set_unfinalized_assertion("hardhat:31337", "0xabc", 1, "0x02", 12);

        chain.finalize("hardhat:31337", "0xabc", 1);
        let latest = chain
            .get_latest_assertion_id("hardhat:31337", "0xabc", 1)
            .await
            .unwrap();
        assert_eq!(latest.as_deref(), Some("0x02"));
        assert!(chain
            .get_unfinalized_assertion_id("hardhat:31337", "0xabc", 1)
            .await
            .unwrap()
            .is_none());
        assert!(chain.get_r0("other:1").await.is_err());
    }
}
