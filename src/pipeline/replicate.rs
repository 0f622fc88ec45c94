//! Replication to the neighborhood, shared by publish and update.
//!
//! Every peer gets INIT and, once it ACKs, REQUEST with the assertion. Peer
//! exchanges run concurrently; the quorum tracker decides the operation as
//! soon as enough replies are in. Exchanges still running at that point keep
//! going in the background so every willing peer receives its replica.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{cached_assertion, set_phase, OperationData};
use crate::collaborators::{Ed25519Signer, PeerId, Signature};
use crate::command::{Command, CommandHandler, CommandName, CommandOutcome};
use crate::context::NodeContext;
use crate::error::{ErrorType, Result};
use crate::operation::{OperationId, OperationKind, Phase};
use crate::protocol::validation::{AssertionRequest, AssetParams};
use crate::protocol::{Protocol, ProtocolMessage};
use crate::quorum::{PeerResponse, QuorumDecision};

/// One peer's reply plus the data of its final ACK.
type Exchange = (PeerId, PeerResponse, Value);

pub struct Replicate {
    ctx: Arc<NodeContext>,
    kind: OperationKind,
}

impl Replicate {
    pub fn new(ctx: Arc<NodeContext>, kind: OperationKind) -> Self {
        Self { ctx, kind }
    }

    fn protocol(&self) -> Protocol {
        match self.kind {
            OperationKind::Update => Protocol::Update,
            _ => Protocol::Store,
        }
    }

    /// Accept a co-signature only if it really signs the assertion id.
    fn check_signature(ack: &Value, assertion_id: &str) -> std::result::Result<Signature, String> {
        let signature: Signature = ack
            .get("signature")
            .cloned()
            .ok_or_else(|| "ACK without signature".to_string())
            .and_then(|v| serde_json::from_value(v).map_err(|e| e.to_string()))?;
        match Ed25519Signer::verify(&signature, assertion_id.as_bytes()) {
            Ok(true) => Ok(signature),
            Ok(false) => Err("invalid signature".to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    fn finish(
        &self,
        data: &OperationData,
        decision: QuorumDecision,
        signatures: Vec<Signature>,
    ) -> Result<()> {
        let operation_id = data.operation_id;
        match decision {
            QuorumDecision::Completed { acks } => {
                set_phase(&self.ctx, data, Phase::ReplicateEnd)?;
                let result = match self.kind {
                    OperationKind::Update => Some(json!({ "signatures": signatures })),
                    _ => None,
                };
                self.ctx.operations.complete(operation_id, result, true)?;
                info!(operation_id = %operation_id, acks, "Replication reached quorum");
            }
            QuorumDecision::Failed { reasons } => {
                let message = format!(
                    "Unable to replicate to enough nodes: {}",
                    reasons.join("; ")
                );
                self.ctx
                    .operations
                    .mark_failed(operation_id, &message, self.error_type())?;
            }
        }
        Ok(())
    }
}

/// INIT then REQUEST with one peer. Transport errors count as NACKs.
async fn exchange(
    ctx: Arc<NodeContext>,
    protocol: Protocol,
    peer: PeerId,
    operation_id: OperationId,
    init: Value,
    request: Value,
    timeout: Duration,
) -> Exchange {
    let init = ctx
        .network
        .send_message(protocol.id(), &peer, ProtocolMessage::init(operation_id, init), timeout)
        .await;
    match init {
        Ok(response) if response.is_ack() => {}
        Ok(response) => {
            let reason = response.error_message();
            return (peer, PeerResponse::Nack(reason), response.message_data);
        }
        Err(e) => return (peer, PeerResponse::Nack(e.to_string()), Value::Null),
    }

    match ctx
        .network
        .send_message(
            protocol.id(),
            &peer,
            ProtocolMessage::request(operation_id, request),
            timeout,
        )
        .await
    {
        Ok(response) if response.is_ack() => (peer, PeerResponse::Ack, response.message_data),
        Ok(response) => {
            let reason = response.error_message();
            (peer, PeerResponse::Nack(reason), response.message_data)
        }
        Err(e) => (peer, PeerResponse::Nack(e.to_string()), Value::Null),
    }
}

#[async_trait]
impl CommandHandler for Replicate {
    fn name(&self) -> CommandName {
        match self.kind {
            OperationKind::Update => CommandName::UpdateReplicate,
            _ => CommandName::PublishReplicate,
        }
    }

    async fn execute(&self, command: &Command) -> Result<CommandOutcome> {
        let data = OperationData::from_command(command)?;
        let operation_id = data.operation_id;
        set_phase(&self.ctx, &data, Phase::ReplicateStart)?;

        let min_acks = data
            .minimum_number_of_node_replications
            .unwrap_or(self.ctx.config.operations.minimum_number_of_node_replications);
        self.ctx.quorum.open(operation_id, data.nodes.clone(), min_acks)?;
        self.ctx.scheduler.schedule(
            Command::for_operation(
                CommandName::QuorumDeadline,
                operation_id,
                json!({ "kind": data.kind }),
                vec![],
            )
            .with_delay(self.ctx.config.operations.timeout_ms),
        )?;

        let asset = AssetParams {
            blockchain: data.blockchain()?.to_string(),
            contract: data.contract()?.to_string(),
            token_id: data.token_id()?,
            keyword: data.keyword()?.to_string(),
            hash_function_id: data.hash_function_id,
            assertion_id: data.assertion_id()?.to_string(),
        };
        let request = AssertionRequest {
            asset: asset.clone(),
            assertion: cached_assertion(&self.ctx, operation_id)?,
        };
        let init = serde_json::to_value(&asset)?;
        let request = serde_json::to_value(&request)?;
        let timeout = self.ctx.message_timeout();
        let protocol = self.protocol();

        let mut exchanges: FuturesUnordered<BoxFuture<'static, Exchange>> = data
            .nodes
            .iter()
            .map(|peer| {
                exchange(
                    self.ctx.clone(),
                    protocol,
                    peer.clone(),
                    operation_id,
                    init.clone(),
                    request.clone(),
                    timeout,
                )
                .boxed()
            })
            .collect();

        let mut signatures = Vec::new();
        let mut decision = None;
        while let Some((peer, mut response, ack)) = exchanges.next().await {
            if self.kind == OperationKind::Update && response == PeerResponse::Ack {
                match Self::check_signature(&ack, &asset.assertion_id) {
                    Ok(signature) => signatures.push(signature),
                    Err(reason) => response = PeerResponse::Nack(reason),
                }
            }
            debug!(operation_id = %operation_id, peer = %peer, response = ?response, "Replication response");
            if let Some(d) = self.ctx.quorum.record(operation_id, &peer, response) {
                decision = Some(d);
                break;
            }
        }
        if !exchanges.is_empty() {
            tokio::spawn(async move { while exchanges.next().await.is_some() {} });
        }

        let decision = match decision.or_else(|| self.ctx.quorum.exhaust(operation_id)) {
            Some(d) => d,
            None => {
                warn!(operation_id = %operation_id, "Replication ended without a quorum decision");
                return Ok(CommandOutcome::Halt);
            }
        };
        self.ctx.quorum.close(operation_id);
        self.finish(&data, decision, signatures)?;
        Ok(CommandOutcome::Halt)
    }

    fn error_type(&self) -> ErrorType {
        match self.kind {
            OperationKind::Update => ErrorType::UpdateReplicateError,
            _ => ErrorType::PublishReplicateError,
        }
    }
}
