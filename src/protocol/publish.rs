//! `/store/1.0.0` receiver: admit a replica at INIT, store it at REQUEST.

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
use crate::collaborators::{AssetMetadata, PeerId, Repository};
use crate::command::{Command, CommandName};
use crate::context::NodeContext;
use crate::error::{NodeError, Result};
use crate::operation::{OperationId, OperationKind, OperationStatus};
use crate::time::now_millis;

pub struct PublishReceiver {
    ctx: Arc<NodeContext>,
}

impl PublishReceiver {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    async fn handle_init(&self, operation_id: OperationId, asset: AssetParams) -> Result<ProtocolResponse> {
        validate_neighbourhood(&self.ctx, &asset).await?;
        validate_assertion_id(&self.ctx, &asset, AssertionState::Latest).await?;
        let bid = validate_bid(&self.ctx, &asset).await?;
        if !bid.valid_bid {
            info!(operation_id = %operation_id, agreement_id = %bid.agreement_id, "Rejecting publish, bid too low");
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

    async fn handle_request(
        &self,
        remote: &PeerId,
        operation_id: OperationId,
        request: AssertionRequest,
    ) -> Result<ProtocolResponse> {
        let init = validate_request(&self.ctx, operation_id, &request)?;
        let asset = &request.asset;
        let ual = asset.ual();
        let metadata = AssetMetadata {
            ual: ual.clone(),
            blockchain: asset.blockchain.clone(),
            contract: asset.contract.to_lowercase(),
            token_id: asset.token_id,
            keyword: asset.keyword.clone(),
            assertion_id: asset.assertion_id.clone(),
        };
        let outcome = self
            .ctx
            .assets
            .local_store_asset(Repository::PublicCurrent, &request.assertion, &metadata)
            .await?;

        if outcome.asset_was_new {
            self.schedule_epoch_check(operation_id, &init)?;
        }
        if self.ctx.config.protocol.send_finality_ack {
            self.schedule_finality(operation_id, remote, &ual)?;
        }
        debug!(operation_id = %operation_id, ual = %ual, written = outcome.assertion_written, "Replica stored");
        Ok(ProtocolResponse::ack(json!({})))
    }

    fn schedule_epoch_check(&self, operation_id: OperationId, init: &RemoteInit) -> Result<()> {
        let mut command = Command::for_operation(
            CommandName::EpochCheck,
            operation_id,
            json!({
                "asset": init.asset,
                "agreementId": init.agreement_id,
            }),
            vec![],
        )
        .with_delay(self.ctx.config.commands.default_repeat_interval_ms);
        if init.agreement_end > now_millis() {
            command = command.with_deadline(init.agreement_end);
        }
        self.ctx.scheduler.schedule(command)?;
        Ok(())
    }

    /// Tell the publisher this node holds the asset, as a FINALITY operation.
    fn schedule_finality(&self, publish_operation_id: OperationId, publisher: &PeerId, ual: &str) -> Result<()> {
        let kind = OperationKind::Finality;
        let finality_id = self
            .ctx
            .operations
            .generate_operation_id(kind, OperationStatus::start(kind))?;
        self.ctx.scheduler.schedule(Command::for_operation(
            CommandName::FinalitySend,
            finality_id,
            json!({
                "ual": ual,
                "publishOperationId": publish_operation_id.to_string(),
                "remotePeerId": publisher,
            }),
            vec![],
        ))?;
        Ok(())
    }
}

#[async_trait]
impl ProtocolHandler for PublishReceiver {
    async fn prepare_message(&self, remote: &PeerId, message: &ProtocolMessage) -> Result<ProtocolResponse> {
        let operation_id = message.header.operation_id;
        match message.header.message_type {
            MessageType::ProtocolInit => {
                let asset: AssetParams = serde_json::from_value(message.data.clone())?;
                self.handle_init(operation_id, asset).await
            }
            MessageType::ProtocolRequest => {
                let request: AssertionRequest = serde_json::from_value(message.data.clone())?;
                self.handle_request(remote, operation_id, request).await
            }
            other => Err(NodeError::Validation(format!("Unexpected message type {}", other))),
        }
    }
}
