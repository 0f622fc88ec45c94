//! ASK: how many neighborhood peers hold every requested asset?

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Value};
use tracing::info;

use super::{set_phase, OperationData};
use crate::command::{Command, CommandHandler, CommandName, CommandOutcome};
use crate::context::NodeContext;
use crate::error::{ErrorType, Result};
use crate::operation::Phase;
use crate::protocol::{Protocol, ProtocolMessage};
use crate::quorum::{PeerResponse, QuorumDecision};

pub struct AskFetchFromNodes {
    ctx: Arc<NodeContext>,
}

impl AskFetchFromNodes {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }
}

/// A peer counts only when it holds every asset asked about.
fn holds_all(data: &Value, expected: usize) -> bool {
    data.get("knowledgeAssetsExist")
        .and_then(Value::as_array)
        .map(|found| found.len() == expected && found.iter().all(|f| f.as_bool() == Some(true)))
        .unwrap_or(false)
}

#[async_trait]
impl CommandHandler for AskFetchFromNodes {
    fn name(&self) -> CommandName {
        CommandName::AskFetchFromNodes
    }

    async fn execute(&self, command: &Command) -> Result<CommandOutcome> {
        let data = OperationData::from_command(command)?;
        let operation_id = data.operation_id;
        set_phase(&self.ctx, &data, Phase::FetchStart)?;

        let min_acks = data.minimum_number_of_node_replications.unwrap_or(1);
        self.ctx.quorum.open(operation_id, data.nodes.clone(), min_acks)?;

        let message = json!({ "ual": data.ual });
        let timeout = self.ctx.message_timeout();
        let mut replies: FuturesUnordered<_> = data
            .nodes
            .iter()
            .cloned()
            .map(|peer| {
                let network = self.ctx.network.clone();
                let message = ProtocolMessage::request(operation_id, message.clone());
                async move {
                    let reply = network
                        .send_message(Protocol::Ask.id(), &peer, message, timeout)
                        .await;
                    (peer, reply)
                }
            })
            .collect();

        let mut decision = None;
        while let Some((peer, reply)) = replies.next().await {
            let response = match reply {
                Ok(r) if r.is_ack() && holds_all(&r.message_data, data.ual.len()) => PeerResponse::Ack,
                Ok(r) if r.is_ack() => PeerResponse::Nack("assets missing".to_string()),
                Ok(r) => PeerResponse::Nack(r.error_message()),
                Err(e) => PeerResponse::Nack(e.to_string()),
            };
            if let Some(d) = self.ctx.quorum.record(operation_id, &peer, response) {
                decision = Some(d);
                break;
            }
        }
        let decision = decision.or_else(|| self.ctx.quorum.exhaust(operation_id));
        self.ctx.quorum.close(operation_id);
        set_phase(&self.ctx, &data, Phase::FetchEnd)?;

        match decision {
            Some(QuorumDecision::Completed { acks }) => {
                info!(operation_id = %operation_id, acks, "Ask reached minimum replications");
                self.ctx.operations.complete_with_result(
                    operation_id,
                    json!({
                        "completedNodes": acks,
                        "allNodesReplicatedData": true,
                    }),
                )?;
            }
            other => {
                let reasons = other
                    .and_then(|d| d.failure_message())
                    .unwrap_or_default();
                self.ctx.operations.mark_failed(
                    operation_id,
                    &format!("Fewer than {} nodes hold the assets: {}", min_acks, reasons),
                    ErrorType::AskNetworkError,
                )?;
            }
        }
        Ok(CommandOutcome::Halt)
    }

    fn error_type(&self) -> ErrorType {
        ErrorType::AskNetworkError
    }
}
