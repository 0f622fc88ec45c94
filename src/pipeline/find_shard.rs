//! Resolve the neighborhood an operation talks to.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{set_phase, OperationData};
use crate::command::{Command, CommandHandler, CommandName, CommandOutcome};
use crate::context::NodeContext;
use crate::error::{ErrorType, Result};
use crate::operation::{OperationKind, Phase};
use crate::storage::default_keyword;

pub struct FindShard {
    ctx: Arc<NodeContext>,
}

impl FindShard {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    /// Keyword of an asset known only by UAL: derived from the chain's
    /// latest assertion, or the UAL itself when the chain has none.
    async fn resolve_keyword(&self, data: &OperationData) -> Result<String> {
        if let Some(keyword) = &data.keyword {
            return Ok(keyword.clone());
        }
        let (blockchain, contract, token_id) = (data.blockchain()?, data.contract()?, data.token_id()?);
        let latest = self
            .ctx
            .blockchain
            .get_latest_assertion_id(blockchain, contract, token_id)
            .await?;
        Ok(match latest {
            Some(assertion_id) => default_keyword(contract, &assertion_id),
            None => data.first_ual()?.to_string(),
        })
    }

    fn failure_type(kind: OperationKind) -> ErrorType {
        match kind {
            OperationKind::Publish => ErrorType::PublishFindNodesError,
            _ => ErrorType::FindShardError,
        }
    }
}

#[async_trait]
impl CommandHandler for FindShard {
    fn name(&self) -> CommandName {
        CommandName::FindShard
    }

    async fn execute(&self, command: &Command) -> Result<CommandOutcome> {
        let mut data = OperationData::from_command(command)?;
        set_phase(&self.ctx, &data, Phase::FindNodesStart)?;

        let keyword = self.resolve_keyword(&data).await?;
        let blockchain = data.blockchain()?.to_string();
        let r2 = self.ctx.blockchain.get_r2(&blockchain).await?;
        let neighbourhood = self
            .ctx
            .neighborhood
            .find_neighbourhood(&blockchain, &keyword, r2, data.hash_function_id, true)
            .await?;

        let min_acks = data
            .minimum_number_of_node_replications
            .unwrap_or(self.ctx.config.operations.minimum_number_of_node_replications);
        if neighbourhood.len() < min_acks {
            let message = format!(
                "Unable to find enough nodes for operation {}. Minimum number of nodes required: {}, found: {}",
                data.operation_id,
                min_acks,
                neighbourhood.len()
            );
            warn!(operation_id = %data.operation_id, keyword = %keyword, "{}", message);
            self.ctx
                .operations
                .mark_failed(data.operation_id, &message, Self::failure_type(data.kind))?;
            return Ok(CommandOutcome::Halt);
        }

        debug!(operation_id = %data.operation_id, keyword = %keyword, nodes = neighbourhood.len(), min_acks, "Shard resolved");
        data.keyword = Some(keyword);
        data.nodes = neighbourhood.into_iter().map(|p| p.peer_id).collect();
        data.minimum_number_of_node_replications = Some(min_acks);
        set_phase(&self.ctx, &data, Phase::FindNodesEnd)?;
        Ok(CommandOutcome::Continue(Some(data.to_value()?)))
    }

    fn error_type(&self) -> ErrorType {
        ErrorType::FindShardError
    }
}
