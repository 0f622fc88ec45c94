//! GET: answer from local storage when possible, otherwise ask the
//! neighborhood in batches, following closer peers reported in NACKs.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{set_phase, OperationData};
use crate::collaborators::PeerId;
use crate::command::{Command, CommandHandler, CommandName, CommandOutcome};
use crate::context::NodeContext;
use crate::error::{ErrorType, Result};
use crate::operation::Phase;
use crate::protocol::get::{find_local_assertion, GetRequest};
use crate::protocol::{Protocol, ProtocolMessage};
use crate::quorum::{PeerResponse, QuorumDecision};
use crate::storage::calculate_assertion_id;

fn get_request(data: &OperationData) -> Result<GetRequest> {
    Ok(GetRequest {
        ual: data.first_ual()?.to_string(),
        assertion_id: data.assertion_id.clone(),
        state: data.state,
        keyword: data.keyword.clone(),
    })
}

fn result_payload(assertion_id: &str, nquads: &[String]) -> Value {
    json!({ "assertionId": assertion_id, "assertion": nquads })
}

pub struct GetLocal {
    ctx: Arc<NodeContext>,
}

impl GetLocal {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl CommandHandler for GetLocal {
    fn name(&self) -> CommandName {
        CommandName::GetLocal
    }

    async fn execute(&self, command: &Command) -> Result<CommandOutcome> {
        let data = OperationData::from_command(command)?;
        set_phase(&self.ctx, &data, Phase::LocalStart)?;
        let found = find_local_assertion(&self.ctx, &get_request(&data)?).await?;
        set_phase(&self.ctx, &data, Phase::LocalEnd)?;

        match found {
            Some((assertion_id, nquads)) => {
                debug!(operation_id = %data.operation_id, "Assertion found locally");
                self.ctx
                    .operations
                    .complete_with_result(data.operation_id, result_payload(&assertion_id, &nquads))?;
                Ok(CommandOutcome::Halt)
            }
            None => Ok(CommandOutcome::Continue(None)),
        }
    }

    fn error_type(&self) -> ErrorType {
        ErrorType::GetLocalError
    }
}

pub struct GetFetchFromNodes {
    ctx: Arc<NodeContext>,
}

impl GetFetchFromNodes {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    /// Interpret a peer's reply. An ACK whose n-quads do not hash to the
    /// claimed id is treated as a NACK.
    pub(crate) fn judge(
        reply: Result<crate::protocol::ProtocolResponse>,
        expected: Option<&str>,
    ) -> (PeerResponse, Option<(String, Vec<String>)>, Vec<PeerId>) {
        let response = match reply {
            Ok(r) => r,
            Err(e) => return (PeerResponse::Nack(e.to_string()), None, Vec::new()),
        };
        if !response.is_ack() {
            let closer: Vec<PeerId> = response
                .message_data
                .get("nodes")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            return (PeerResponse::Nack(response.error_message()), None, closer);
        }
        let nquads: Vec<String> = response
            .message_data
            .get("nquads")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let claimed = response
            .message_data
            .get("assertionId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let calculated = calculate_assertion_id(&nquads);
        let matches_expected = expected.map(|e| e.eq_ignore_ascii_case(&claimed)).unwrap_or(true);
        if nquads.is_empty() || !calculated.eq_ignore_ascii_case(&claimed) || !matches_expected {
            return (
                PeerResponse::Nack(format!("invalid assertion received, calculated {}", calculated)),
                None,
                Vec::new(),
            );
        }
        (PeerResponse::Ack, Some((claimed, nquads)), Vec::new())
    }
}

#[async_trait]
impl CommandHandler for GetFetchFromNodes {
    fn name(&self) -> CommandName {
        CommandName::GetFetchFromNodes
    }

    async fn execute(&self, command: &Command) -> Result<CommandOutcome> {
        let data = OperationData::from_command(command)?;
        let operation_id = data.operation_id;
        set_phase(&self.ctx, &data, Phase::FetchStart)?;

        let me = self.ctx.peer_id();
        let config = &self.ctx.config.operations;
        let mut candidates: VecDeque<PeerId> = data.nodes.iter().filter(|p| **p != me).cloned().collect();
        let mut seen: HashSet<PeerId> = candidates.iter().cloned().collect();
        seen.insert(me.clone());
        if candidates.is_empty() {
            self.ctx.operations.mark_failed(
                operation_id,
                &format!("Unable to get assertion {}: no peers to ask", data.first_ual()?),
                ErrorType::GetNetworkError,
            )?;
            return Ok(CommandOutcome::Halt);
        }
        self.ctx.quorum.open(operation_id, candidates.iter().cloned(), 1)?;

        let message = serde_json::to_value(get_request(&data)?)?;
        let timeout = self.ctx.message_timeout();
        let mut asked = 0usize;
        let mut decision = None;
        let mut found = None;

        while decision.is_none() && !candidates.is_empty() && asked < config.get_max_peers {
            let batch: Vec<PeerId> = (0..config.get_batch_size.max(1))
                .filter_map(|_| candidates.pop_front())
                .take(config.get_max_peers - asked)
                .collect();
            asked += batch.len();

            let mut replies: FuturesUnordered<_> = batch
                .into_iter()
                .map(|peer| {
                    let network = self.ctx.network.clone();
                    let message = ProtocolMessage::request(operation_id, message.clone());
                    async move {
                        let reply = network
                            .send_message(Protocol::Get.id(), &peer, message, timeout)
                            .await;
                        (peer, reply)
                    }
                })
                .collect();

            while let Some((peer, reply)) = replies.next().await {
                let (response, assertion, closer) = Self::judge(reply, data.assertion_id.as_deref());
                let fresh: Vec<PeerId> = closer
                    .into_iter()
                    .filter(|p| seen.insert(p.clone()))
                    .collect();
                if !fresh.is_empty() {
                    debug!(operation_id = %operation_id, peer = %peer, closer = fresh.len(), "Following closer peers");
                    self.ctx.quorum.extend_neighborhood(operation_id, fresh.iter().cloned());
                    candidates.extend(fresh);
                }
                if let Some(d) = self.ctx.quorum.record(operation_id, &peer, response) {
                    decision = Some(d);
                    found = assertion;
                    break;
                }
            }
        }

        let decision = decision.or_else(|| self.ctx.quorum.exhaust(operation_id));
        self.ctx.quorum.close(operation_id);
        set_phase(&self.ctx, &data, Phase::FetchEnd)?;

        match (decision, found) {
            (Some(QuorumDecision::Completed { .. }), Some((assertion_id, nquads))) => {
                info!(operation_id = %operation_id, assertion_id = %assertion_id, "Assertion fetched from network");
                self.ctx
                    .operations
                    .complete_with_result(operation_id, result_payload(&assertion_id, &nquads))?;
            }
            (decision, _) => {
                let reasons = decision
                    .and_then(|d| d.failure_message())
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| "no peers to ask".to_string());
                self.ctx.operations.mark_failed(
                    operation_id,
                    &format!("Unable to get assertion {}: {}", data.first_ual()?, reasons),
                    ErrorType::GetNetworkError,
                )?;
            }
        }
        Ok(CommandOutcome::Halt)
    }

    fn error_type(&self) -> ErrorType {
        ErrorType::GetNetworkError
    }
}
