//! `/ask/1.0.0` receiver: does this node hold the given assets?

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{ProtocolHandler, ProtocolMessage, ProtocolResponse};
use crate::collaborators::{PeerId, Repository};
use crate::context::NodeContext;
use crate::error::{NodeError, Result};
use crate::storage::parse_ual;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AskRequest {
    pub ual: Vec<String>,
}

pub struct AskReceiver {
    ctx: Arc<NodeContext>,
}

impl AskReceiver {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    async fn exists(&self, ual: &str) -> Result<bool> {
        parse_ual(ual)?;
        let store = self.ctx.assets.triple_store();
        match store.asset_metadata(Repository::PublicCurrent, ual).await? {
            Some(metadata) => {
                store
                    .assertion_exists(Repository::PublicCurrent, &metadata.assertion_id)
                    .await
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl ProtocolHandler for AskReceiver {
    async fn prepare_message(&self, _remote: &PeerId, message: &ProtocolMessage) -> Result<ProtocolResponse> {
        let request: AskRequest = serde_json::from_value(message.data.clone())?;
        if request.ual.is_empty() {
            return Err(NodeError::Validation("No UALs to check".to_string()));
        }
        let mut found = Vec::with_capacity(request.ual.len());
        for ual in &request.ual {
            found.push(self.exists(ual).await?);
        }
        Ok(ProtocolResponse::ack(json!({ "knowledgeAssetsExist": found })))
    }
}
