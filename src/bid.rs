//! Economic admission: is the local ask covered by the agreement's tokens?
//!
//! `fairBid = tokenAmount / r0 / epochsNumber / assertionSize * 1024` and a
//! bid is valid when `localAsk <= fairBid`. The comparison is done without
//! division: `localAsk * r0 * epochs * size <= tokenAmount * 1024`.

use std::sync::{Arc, RwLock};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::collaborators::{AgreementData, Blockchain};
use crate::error::{NodeError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BidValidation {
    pub valid_bid: bool,
    pub agreement_id: String,
    pub agreement_data: AgreementData,
}

/// Deterministic agreement id: sha256(contract ‖ tokenId ‖ keyword ‖ hashFunctionId).
pub fn agreement_id(contract: &str, token_id: u64, keyword: &str, hash_function_id: u8) -> String {
    let mut hasher = Sha256::new();
    let contract = contract.to_lowercase();
    match hex::decode(contract.trim_start_matches("0x")) {
        Ok(bytes) => hasher.update(&bytes),
        Err(_) => hasher.update(contract.as_bytes()),
    }
    let mut token = [0u8; 32];
    token[24..].copy_from_slice(&token_id.to_be_bytes());
    hasher.update(token);
    hasher.update(keyword.as_bytes());
    hasher.update([hash_function_id]);
    format!("0x{}", hex::encode(hasher.finalize()))
}

/// Exact bid check. Zero divisors are rejected as invalid input.
pub fn is_bid_acceptable(
    local_ask: u128,
    token_amount: u128,
    r0: u64,
    epochs_number: u64,
    assertion_size: u64,
) -> Result<bool> {
    if r0 == 0 || epochs_number == 0 || assertion_size == 0 {
        return Err(NodeError::Validation(
            "r0, epochs and assertion size must be positive".to_string(),
        ));
    }
    let cost = local_ask
        .checked_mul(r0 as u128)
        .and_then(|v| v.checked_mul(epochs_number as u128))
        .and_then(|v| v.checked_mul(assertion_size as u128));
    let budget = token_amount.checked_mul(1024);
    Ok(match (cost, budget) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(cost), Some(budget)) => cost <= budget,
    })
}

/// Integer fair bid, for logs and NACK payloads.
pub fn fair_bid(token_amount: u128, r0: u64, epochs_number: u64, assertion_size: u64) -> u128 {
    let divisor = (r0 as u128)
        .saturating_mul(epochs_number as u128)
        .saturating_mul(assertion_size as u128);
    if divisor == 0 {
        return 0;
    }
    token_amount.saturating_mul(1024) / divisor
}

pub struct BidValidator {
    blockchain: Arc<dyn Blockchain>,
    ask: RwLock<String>,
}

impl BidValidator {
    pub fn new(blockchain: Arc<dyn Blockchain>, ask: impl Into<String>) -> Self {
        Self {
            blockchain,
            ask: RwLock::new(ask.into()),
        }
    }

    /// Change the advertised ask. Takes effect on the next validation.
    pub fn set_ask(&self, ask: impl Into<String>) {
        if let Ok(mut current) = self.ask.write() {
            *current = ask.into();
        }
    }

    pub fn ask(&self) -> String {
        self.ask.read().map(|a| a.clone()).unwrap_or_default()
    }

    /// Fetch the agreement, assertion size, r0 and the local ask concurrently
    /// and decide whether the bid covers the ask.
    pub async fn validate_bid(
        &self,
        contract: &str,
        token_id: u64,
        keyword: &str,
        hash_function_id: u8,
        blockchain: &str,
        assertion_id: &str,
    ) -> Result<BidValidation> {
        let agreement_id = agreement_id(contract, token_id, keyword, hash_function_id);
        let ask = self.ask();

        let (agreement, size, r0, local_ask) = tokio::try_join!(
            self.blockchain.get_agreement_data(blockchain, &agreement_id),
            self.blockchain.get_assertion_size(blockchain, assertion_id),
            self.blockchain.get_r0(blockchain),
            self.blockchain.convert_to_wei(blockchain, &ask),
        )?;

        let agreement = match agreement {
            Some(a) if a.token_amount > 0 => a,
            _ => {
                return Err(NodeError::Validation(format!(
                    "Received invalid service agreement {}",
                    agreement_id
                )))
            }
        };

        let valid_bid = is_bid_acceptable(
            local_ask,
            agreement.token_amount,
            r0,
            agreement.epochs_number,
            size,
        )?;
        debug!(
            agreement_id = %agreement_id,
            valid_bid,
            local_ask = %local_ask,
            fair_bid = %fair_bid(agreement.token_amount, r0, agreement.epochs_number, size),
            "Bid validated"
        );

        Ok(BidValidation {
            valid_bid,
            agreement_id,
            agreement_data: agreement,
        })
    }
}
