//! Housekeeping commands: replication deadlines, agreement epochs, pending
//! update expiry and retention sweeps.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::get::GetFetchFromNodes;
use crate::collaborators::{AssetMetadata, Repository};
use crate::command::{Command, CommandHandler, CommandName, CommandOutcome, Recovery};
use crate::context::NodeContext;
use crate::error::{ErrorType, NodeError, Result};
use crate::operation::OperationId;
use crate::protocol::get::{GetRequest, GetState};
use crate::protocol::validation::AssetParams;
use crate::protocol::{Protocol, ProtocolMessage};
use crate::quorum::PeerResponse;
use crate::time::now_millis;

/// Fails a replication that did not reach its quorum in time.
pub struct QuorumDeadline {
    ctx: Arc<NodeContext>,
}

impl QuorumDeadline {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl CommandHandler for QuorumDeadline {
    fn name(&self) -> CommandName {
        CommandName::QuorumDeadline
    }

    async fn execute(&self, command: &Command) -> Result<CommandOutcome> {
        let operation_id = command.require_operation_id()?;
        let decision = self.ctx.quorum.expire(operation_id);
        self.ctx.quorum.close(operation_id);

        if self.ctx.operations.is_terminal(operation_id)? {
            return Ok(CommandOutcome::Halt);
        }
        let message = decision
            .and_then(|d| d.failure_message())
            .unwrap_or_else(|| "deadline passed before replication finished".to_string());
        warn!(operation_id = %operation_id, "Replication deadline passed");
        self.ctx.operations.mark_failed(
            operation_id,
            &format!("Unable to replicate to enough nodes: {}", message),
            ErrorType::QuorumTimeoutError,
        )?;
        Ok(CommandOutcome::Halt)
    }

    fn error_type(&self) -> ErrorType {
        ErrorType::QuorumTimeoutError
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EpochCheckPayload {
    asset: AssetParams,
    agreement_id: String,
}

/// Runs once per repeat interval for an accepted replica while its service
/// agreement lasts.
pub struct EpochCheck {
    ctx: Arc<NodeContext>,
}

impl EpochCheck {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    /// Fetch the finalized assertion from the asset's neighbourhood, one peer
    /// at a time, and store the first copy that hashes to the agreed id.
    async fn restore(&self, asset: &AssetParams) -> Result<bool> {
        let ual = asset.ual();
        let me = self.ctx.peer_id();
        let r2 = self.ctx.blockchain.get_r2(&asset.blockchain).await?;
        let peers = self
            .ctx
            .neighborhood
            .find_neighbourhood(&asset.blockchain, &asset.keyword, r2, asset.hash_function_id, true)
            .await?;
        let request = serde_json::to_value(GetRequest {
            ual: ual.clone(),
            assertion_id: Some(asset.assertion_id.clone()),
            state: GetState::Finalized,
            keyword: Some(asset.keyword.clone()),
        })?;
        let timeout = self.ctx.message_timeout();

        for peer in peers.into_iter().map(|p| p.peer_id).filter(|p| *p != me) {
            let message = ProtocolMessage::request(OperationId::new(), request.clone());
            let reply = self
                .ctx
                .network
                .send_message(Protocol::Get.id(), &peer, message, timeout)
                .await;
            let (response, assertion, _) = GetFetchFromNodes::judge(reply, Some(asset.assertion_id.as_str()));
            let Some((assertion_id, nquads)) = assertion else {
                if let PeerResponse::Nack(reason) = response {
                    debug!(ual = %ual, peer = %peer, reason = %reason, "Peer could not serve asset");
                }
                continue;
            };
            let metadata = AssetMetadata {
                ual: ual.clone(),
                blockchain: asset.blockchain.clone(),
                contract: asset.contract.to_lowercase(),
                token_id: asset.token_id,
                keyword: asset.keyword.clone(),
                assertion_id,
            };
            self.ctx
                .assets
                .local_store_asset(Repository::PublicCurrent, &nquads, &metadata)
                .await?;
            return Ok(true);
        }
        Ok(false)
    }
}

#[async_trait]
impl CommandHandler for EpochCheck {
    fn name(&self) -> CommandName {
        CommandName::EpochCheck
    }

    async fn execute(&self, command: &Command) -> Result<CommandOutcome> {
        let payload: EpochCheckPayload = command.payload()?;
        let asset = &payload.asset;
        let agreement = self
            .ctx
            .blockchain
            .get_agreement_data(&asset.blockchain, &payload.agreement_id)
            .await?;
        let Some(agreement) = agreement else {
            info!(agreement_id = %payload.agreement_id, "Agreement gone, stopping epoch checks");
            return Ok(CommandOutcome::Halt);
        };
        if agreement.end_time_ms() <= now_millis() {
            info!(agreement_id = %payload.agreement_id, "Agreement ended, stopping epoch checks");
            return Ok(CommandOutcome::Halt);
        }

        let ual = asset.ual();
        let held = self
            .ctx
            .assets
            .triple_store()
            .asset_metadata(Repository::PublicCurrent, &ual)
            .await?
            .is_some();
        if held {
            debug!(ual = %ual, agreement_id = %payload.agreement_id, "Epoch check passed");
        } else {
            warn!(ual = %ual, agreement_id = %payload.agreement_id, "Asset under agreement is missing locally");
            if self.restore(asset).await? {
                info!(ual = %ual, agreement_id = %payload.agreement_id, "Asset restored from the neighbourhood");
            } else {
                warn!(ual = %ual, agreement_id = %payload.agreement_id, "No neighbour could serve the missing asset");
            }
        }
        Ok(CommandOutcome::Repeat)
    }

    /// The operation id belongs to the publisher.
    async fn recover(&self, _command: &Command, _error: &NodeError) -> Recovery {
        Recovery::Keep
    }

    fn error_type(&self) -> ErrorType {
        ErrorType::EpochCheckError
    }
}

#[derive(Debug, Deserialize)]
struct PendingPayload {
    asset: AssetParams,
}

/// Drops a pending update once its time to live is over. If the chain
/// finalized that state meanwhile it is promoted to current storage first.
pub struct DeletePendingState {
    ctx: Arc<NodeContext>,
}

impl DeletePendingState {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl CommandHandler for DeletePendingState {
    fn name(&self) -> CommandName {
        CommandName::DeletePendingState
    }

    async fn execute(&self, command: &Command) -> Result<CommandOutcome> {
        let PendingPayload { asset } = command.payload()?;
        let ual = asset.ual();
        let Some(state) = self.ctx.pending.get(&ual, &asset.assertion_id) else {
            return Ok(CommandOutcome::Halt);
        };

        let latest = self
            .ctx
            .blockchain
            .get_latest_assertion_id(&asset.blockchain, &asset.contract, asset.token_id)
            .await?;
        let finalized = latest
            .map(|id| id.eq_ignore_ascii_case(&asset.assertion_id))
            .unwrap_or(false);
        if finalized {
            let metadata = AssetMetadata {
                ual: ual.clone(),
                blockchain: asset.blockchain.clone(),
                contract: asset.contract.to_lowercase(),
                token_id: asset.token_id,
                keyword: state.keyword.clone(),
                assertion_id: state.assertion_id.clone(),
            };
            self.ctx
                .assets
                .local_store_asset(Repository::PublicCurrent, &state.nquads, &metadata)
                .await?;
            info!(ual = %ual, assertion_id = %state.assertion_id, "Finalized update promoted");
        }
        self.ctx.pending.remove(&ual, &asset.assertion_id)?;
        debug!(ual = %ual, assertion_id = %asset.assertion_id, finalized, "Pending state removed");
        Ok(CommandOutcome::Halt)
    }

    /// The operation id belongs to the updater.
    async fn recover(&self, _command: &Command, _error: &NodeError) -> Recovery {
        Recovery::Keep
    }

    fn error_type(&self) -> ErrorType {
        ErrorType::UpdateDeletePendingStateError
    }
}

/// Removes terminal operations past their retention window.
pub struct OperationIdCleaner {
    ctx: Arc<NodeContext>,
}

impl OperationIdCleaner {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl CommandHandler for OperationIdCleaner {
    fn name(&self) -> CommandName {
        CommandName::OperationIdCleaner
    }

    async fn execute(&self, _command: &Command) -> Result<CommandOutcome> {
        let retention_ms = self.ctx.config.operations.retention_secs.saturating_mul(1000);
        self.ctx.operations.sweep(retention_ms)?;
        Ok(CommandOutcome::Repeat)
    }
}

/// Removes finished command rows past their retention window.
pub struct CommandsCleaner {
    ctx: Arc<NodeContext>,
}

impl CommandsCleaner {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl CommandHandler for CommandsCleaner {
    fn name(&self) -> CommandName {
        CommandName::CommandsCleaner
    }

    async fn execute(&self, _command: &Command) -> Result<CommandOutcome> {
        let retention_ms = self.ctx.config.commands.retention_secs.saturating_mul(1000);
        let removed = self
            .ctx
            .scheduler
            .store()
            .sweep(now_millis().saturating_sub(retention_ms))?;
        if removed > 0 {
            info!(count = removed, "Swept finished commands");
        }
        Ok(CommandOutcome::Repeat)
    }
}
