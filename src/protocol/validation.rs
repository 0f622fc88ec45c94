//! Admission checks shared by the publish and update receivers.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::bid::BidValidation;
use crate::context::NodeContext;
use crate::error::{NodeError, Result};
use crate::operation::OperationId;
use crate::storage::{calculate_assertion_id, format_ual};

/// Cache field holding the parameters accepted at INIT.
pub const REMOTE_INIT_FIELD: &str = "remoteInit";

/// Asset coordinates every publish/update message carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetParams {
    pub blockchain: String,
    pub contract: String,
    pub token_id: u64,
    pub keyword: String,
    pub hash_function_id: u8,
    pub assertion_id: String,
}

impl AssetParams {
    pub fn ual(&self) -> String {
        format_ual(&self.blockchain, &self.contract, self.token_id)
    }
}

/// What INIT accepted, as cached under [`REMOTE_INIT_FIELD`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteInit {
    #[serde(flatten)]
    pub asset: AssetParams,
    pub agreement_id: String,
    /// Agreement end, milliseconds
    pub agreement_end: u64,
}

/// REQUEST payload: INIT parameters plus the assertion itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertionRequest {
    #[serde(flatten)]
    pub asset: AssetParams,
    pub assertion: Vec<String>,
}

/// Which chain state the assertion id is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssertionState {
    Latest,
    Unfinalized,
}

/// The local node must be part of the keyword's neighborhood.
pub async fn validate_neighbourhood(ctx: &NodeContext, asset: &AssetParams) -> Result<()> {
    let r2 = ctx.blockchain.get_r2(&asset.blockchain).await?;
    let neighbourhood = ctx
        .neighborhood
        .find_neighbourhood(
            &asset.blockchain,
            &asset.keyword,
            r2,
            asset.hash_function_id,
            true,
        )
        .await?;
    let me = ctx.peer_id();
    if neighbourhood.iter().any(|p| p.peer_id == me) {
        Ok(())
    } else {
        Err(NodeError::Validation("Invalid neighbourhood".to_string()))
    }
}

/// The assertion id must be the one the chain holds for the asset.
pub async fn validate_assertion_id(
    ctx: &NodeContext,
    asset: &AssetParams,
    state: AssertionState,
) -> Result<()> {
    let on_chain = match state {
        AssertionState::Latest => {
            ctx.blockchain
                .get_latest_assertion_id(&asset.blockchain, &asset.contract, asset.token_id)
                .await?
        }
        AssertionState::Unfinalized => {
            ctx.blockchain
                .get_unfinalized_assertion_id(&asset.blockchain, &asset.contract, asset.token_id)
                .await?
        }
    };
    match on_chain {
        Some(id) if id.eq_ignore_ascii_case(&asset.assertion_id) => Ok(()),
        Some(id) => Err(NodeError::Validation(format!(
            "Invalid assertion id for asset {}. Received value: {}, value on chain: {}",
            asset.ual(),
            asset.assertion_id,
            id
        ))),
        None => Err(NodeError::Validation(format!(
            "No assertion on chain for asset {}",
            asset.ual()
        ))),
    }
}

pub async fn validate_bid(ctx: &NodeContext, asset: &AssetParams) -> Result<BidValidation> {
    ctx.bids
        .validate_bid(
            &asset.contract,
            asset.token_id,
            &asset.keyword,
            asset.hash_function_id,
            &asset.blockchain,
            &asset.assertion_id,
        )
        .await
}

/// NACK payload for a bid below the local ask.
pub fn bid_rejection(bid: &BidValidation) -> Value {
    json!({
        "errorMessage": format!("Bid too low for agreement {}", bid.agreement_id),
        "validBid": false,
    })
}

/// Remember what INIT accepted. A second INIT with the same parameters is
/// a no-op; different parameters for the same operation are rejected.
pub fn cache_remote_init(ctx: &NodeContext, operation_id: OperationId, init: &RemoteInit) -> Result<()> {
    ctx.operations
        .cache_data(operation_id, json!({ REMOTE_INIT_FIELD: init }))?;
    Ok(())
}

/// Check a REQUEST against its INIT and against its own content.
pub fn validate_request(
    ctx: &NodeContext,
    operation_id: OperationId,
    request: &AssertionRequest,
) -> Result<RemoteInit> {
    let cached = ctx
        .operations
        .get_cached_field(operation_id, REMOTE_INIT_FIELD)?
        .ok_or_else(|| {
            NodeError::Validation(format!("No accepted INIT for operation {}", operation_id))
        })?;
    let init: RemoteInit = serde_json::from_value(cached)?;
    if init.asset != request.asset {
        return Err(NodeError::Validation(
            "Request parameters differ from the accepted INIT".to_string(),
        ));
    }
    if request.assertion.is_empty() {
        return Err(NodeError::Validation("Empty assertion".to_string()));
    }
    let computed = calculate_assertion_id(&request.assertion);
    if !computed.eq_ignore_ascii_case(&request.asset.assertion_id) {
        return Err(NodeError::Validation(format!(
            "Invalid assertion. Received id {}, calculated {}",
            request.asset.assertion_id, computed
        )));
    }
    debug!(operation_id = %operation_id, assertion_id = %computed, "Request matches INIT");
    Ok(init)
}
