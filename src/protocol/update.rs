//! `/update/1.0.0` receiver: admit an unfinalized state at INIT, hold it in
//! pending storage and co-sign it at REQUEST.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use super::validation::{
    bid_rejection, cache_remote_init, validate_assertion_id, validate_bid,
    validate_neighbourhood, validate_request, AssertionRequest, AssertionState, AssetParams,
    RemoteInit,
};
use super::{MessageType, ProtocolHandler, ProtocolMessage, ProtocolResponse};
use crate::collaborators::PeerId;
use crate::command::{Command, CommandName};
use crate::context::NodeContext;
use crate::error::{NodeError, Result};
use crate::operation::OperationId;
use crate::storage::PendingState;
use crate::time::now_millis;

pub struct UpdateReceiver {
    ctx: Arc<NodeContext>,
}

impl UpdateReceiver {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    async fn handle_init(&self, operation_id: OperationId, asset: AssetParams) -> Result<ProtocolResponse> {
        validate_neighbourhood(&self.ctx, &asset).await?;
        validate_assertion_id(&self.ctx, &asset, AssertionState::Unfinalized).await?;
        let bid = validate_bid(&self.ctx, &asset).await?;
        if !bid.valid_bid {
            info!(operation_id = %operation_id, agreement_id = %bid.agreement_id, "Rejecting update, bid too low");
            return Ok(ProtocolResponse::nack(bid_rejection(&bid)));
        }
        let init = RemoteInit {
            agreement_end: bid.agreement_data.end_time_ms(),
            agreement_id: bid.agreement_id,
            asset,
        };
        cache_remote_init(&self.ctx, operation_id, &init)?;
        Ok(ProtocolResponse::ack(json!({})))
    }

    async fn handle_request(&self, operation_id: OperationId, request: AssertionRequest) -> Result<ProtocolResponse> {
        validate_request(&self.ctx, operation_id, &request)?;
        let asset = &request.asset;
        let ual = asset.ual();

        let fresh = self.ctx.pending.cache(PendingState {
            ual: ual.clone(),
            assertion_id: asset.assertion_id.clone(),
            nquads: request.assertion.clone(),
            operation_id,
            keyword: asset.keyword.clone(),
            created_at: now_millis(),
        })?;
        if fresh {
            self.ctx.scheduler.schedule(
                Command::for_operation(
                    CommandName::DeletePendingState,
                    operation_id,
                    json!({ "asset": asset }),
                    vec![],
                )
                .with_delay(self.ctx.config.protocol.pending_state_ttl_ms),
            )?;
        }

        let signature = self
            .ctx
            .signer
            .sign_message(&asset.blockchain, asset.assertion_id.as_bytes())?;
        debug!(operation_id = %operation_id, ual = %ual, fresh, "Pending state stored");
        Ok(ProtocolResponse::ack(json!({ "signature": signature })))
    }
}

#[async_trait]
impl ProtocolHandler for UpdateReceiver {
    async fn prepare_message(&self, _remote: &PeerId, message: &ProtocolMessage) -> Result<ProtocolResponse> {
        let operation_id = message.header.operation_id;
        match message.header.message_type {
            MessageType::ProtocolInit => {
                let asset: AssetParams = serde_json::from_value(message.data.clone())?;
                self.handle_init(operation_id, asset).await
            }
            MessageType::ProtocolRequest => {
                let request: AssertionRequest = serde_json::from_value(message.data.clone())?;
                self.handle_request(operation_id, request).await
            }
            other => Err(NodeError::Validation(format!("Unexpected message type {}", other))),
        }
    }
}
