//! `/get/1.0.0` receiver: serve an assertion from pending, current or history.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{ProtocolHandler, ProtocolMessage, ProtocolResponse};
use crate::collaborators::neighborhood::{distance_key, xor_distance};
use crate::collaborators::{PeerId, Repository};
use crate::context::NodeContext;
use crate::error::Result;

/// Which version of an asset a GET asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GetState {
    /// Newest known state, pending updates included
    #[default]
    Latest,
    /// Only state the chain has finalized
    Finalized,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetRequest {
    pub ual: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assertion_id: Option<String>,
    #[serde(default)]
    pub state: GetState,
    /// Key used to find closer peers when the assertion is missing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
}

/// Look the assertion up locally. Returns `(assertion id, n-quads)`.
pub async fn find_local_assertion(
    ctx: &NodeContext,
    request: &GetRequest,
) -> Result<Option<(String, Vec<String>)>> {
    if request.state != GetState::Finalized {
        let pending = match &request.assertion_id {
            Some(id) => ctx.pending.get(&request.ual, id),
            None => ctx.pending.latest(&request.ual),
        };
        if let Some(state) = pending.filter(|s| !s.nquads.is_empty()) {
            return Ok(Some((state.assertion_id, state.nquads)));
        }
    }

    let store = ctx.assets.triple_store();
    for repo in [Repository::PublicCurrent, Repository::PublicHistory] {
        let assertion_id = match &request.assertion_id {
            Some(id) => Some(id.clone()),
            None => store
                .asset_metadata(repo, &request.ual)
                .await?
                .map(|m| m.assertion_id),
        };
        let Some(assertion_id) = assertion_id else {
            continue;
        };
        if let Some(nquads) = store.get_assertion(repo, &assertion_id).await? {
            if !nquads.is_empty() {
                return Ok(Some((assertion_id, nquads)));
            }
        }
    }
    Ok(None)
}

pub struct GetReceiver {
    ctx: Arc<NodeContext>,
}

impl GetReceiver {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    /// Known peers strictly closer to `key` than this node, excluding the asker.
    async fn closer_nodes(&self, key: &str, asker: &PeerId) -> Result<Vec<PeerId>> {
        let me = self.ctx.peer_id();
        let target = distance_key(key.as_bytes());
        let own = xor_distance(&target, &me);
        let limit = self.ctx.config.operations.get_max_peers;
        Ok(self
            .ctx
            .network
            .find_nodes_local(key)
            .await?
            .into_iter()
            .filter(|p| p != &me && p != asker && xor_distance(&target, p) < own)
            .take(limit)
            .collect())
    }
}

#[async_trait]
impl ProtocolHandler for GetReceiver {
    async fn prepare_message(&self, remote: &PeerId, message: &ProtocolMessage) -> Result<ProtocolResponse> {
        let request: GetRequest = serde_json::from_value(message.data.clone())?;
        if let Some((assertion_id, nquads)) = find_local_assertion(&self.ctx, &request).await? {
            debug!(operation_id = %message.header.operation_id, ual = %request.ual, "Serving assertion");
            return Ok(ProtocolResponse::ack(json!({
                "nquads": nquads,
                "assertionId": assertion_id,
            })));
        }

        let key = request.keyword.clone().unwrap_or_else(|| request.ual.clone());
        let nodes = self.closer_nodes(&key, remote).await?;
        Ok(ProtocolResponse::nack(json!({
            "errorMessage": format!("Unable to find assertion for {}", request.ual),
            "nodes": nodes,
        })))
    }
}
