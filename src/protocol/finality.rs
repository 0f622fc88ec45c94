//! `/finality/1.0.0` receiver: a replica holder confirms it stored a
//! published asset. Recorded once per (operation, UAL, peer).

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::{ProtocolHandler, ProtocolMessage, ProtocolResponse};
use crate::collaborators::PeerId;
use crate::context::NodeContext;
use crate::error::Result;
use crate::operation::OperationId;
use crate::storage::parse_ual;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalityRequest {
    pub ual: String,
    pub publish_operation_id: OperationId,
}

pub struct FinalityReceiver {
    ctx: Arc<NodeContext>,
}

impl FinalityReceiver {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ProtocolHandler for FinalityReceiver {
    async fn prepare_message(&self, remote: &PeerId, message: &ProtocolMessage) -> Result<ProtocolResponse> {
        let request: FinalityRequest = serde_json::from_value(message.data.clone())?;
        parse_ual(&request.ual)?;
        let recorded = self
            .ctx
            .finality
            .record(request.publish_operation_id, &request.ual, remote)?;
        if recorded {
            info!(
                publish_operation_id = %request.publish_operation_id,
                ual = %request.ual,
                remote = %remote,
                "Finality acknowledged"
            );
        }
        Ok(ProtocolResponse::ack(json!({ "recorded": recorded })))
    }
}
