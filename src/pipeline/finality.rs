//! Replica holder → publisher notification that an asset was stored.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::collaborators::PeerId;
use crate::command::{Command, CommandHandler, CommandName, CommandOutcome};
use crate::context::NodeContext;
use crate::error::{ErrorType, NodeError, Result};
use crate::operation::{OperationId, OperationKind, OperationStatus, Phase};
use crate::protocol::{Protocol, ProtocolMessage};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FinalityPayload {
    operation_id: OperationId,
    ual: String,
    publish_operation_id: OperationId,
    remote_peer_id: PeerId,
}

pub struct FinalitySend {
    ctx: Arc<NodeContext>,
}

impl FinalitySend {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl CommandHandler for FinalitySend {
    fn name(&self) -> CommandName {
        CommandName::FinalitySend
    }

    async fn execute(&self, command: &Command) -> Result<CommandOutcome> {
        let payload: FinalityPayload = command.payload()?;
        let kind = OperationKind::Finality;
        let operation_id = payload.operation_id;
        self.ctx
            .operations
            .update_status(operation_id, None, OperationStatus::phase(kind, Phase::InitStart))?;

        let response = self
            .ctx
            .network
            .send_message(
                Protocol::Finality.id(),
                &payload.remote_peer_id,
                ProtocolMessage::request(
                    operation_id,
                    json!({
                        "ual": payload.ual,
                        "publishOperationId": payload.publish_operation_id,
                    }),
                ),
                self.ctx.message_timeout(),
            )
            .await?;
        if !response.is_ack() {
            return Err(NodeError::Validation(format!(
                "Finality rejected by {}: {}",
                payload.remote_peer_id,
                response.error_message()
            )));
        }

        self.ctx
            .operations
            .update_status(operation_id, None, OperationStatus::phase(kind, Phase::InitEnd))?;
        self.ctx.operations.complete_with_result(
            operation_id,
            json!({
                "ual": payload.ual,
                "publishOperationId": payload.publish_operation_id,
                "remotePeerId": payload.remote_peer_id,
            }),
        )?;
        info!(operation_id = %operation_id, ual = %payload.ual, publisher = %payload.remote_peer_id, "Finality sent");
        Ok(CommandOutcome::Halt)
    }

    fn error_type(&self) -> ErrorType {
        ErrorType::FinalityError
    }
}
