//! LOCAL_STORE: write an asset into this node's own store.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{cached_assertion, set_phase, OperationData};
use crate::collaborators::{AssetMetadata, Repository};
use crate::command::{Command, CommandHandler, CommandName, CommandOutcome};
use crate::context::NodeContext;
use crate::error::{ErrorType, NodeError, Result};
use crate::operation::Phase;
use crate::storage::{calculate_assertion_id, format_ual};

pub struct LocalStore {
    ctx: Arc<NodeContext>,
}

impl LocalStore {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl CommandHandler for LocalStore {
    fn name(&self) -> CommandName {
        CommandName::LocalStore
    }

    async fn execute(&self, command: &Command) -> Result<CommandOutcome> {
        let data = OperationData::from_command(command)?;
        set_phase(&self.ctx, &data, Phase::LocalStart)?;

        let assertion = cached_assertion(&self.ctx, data.operation_id)?;
        let assertion_id = data.assertion_id()?;
        if !calculate_assertion_id(&assertion).eq_ignore_ascii_case(assertion_id) {
            return Err(NodeError::Validation(format!(
                "Cached assertion does not hash to {}",
                assertion_id
            )));
        }
        let (blockchain, contract, token_id) = (data.blockchain()?, data.contract()?, data.token_id()?);
        let ual = format_ual(blockchain, contract, token_id);
        let metadata = AssetMetadata {
            ual: ual.clone(),
            blockchain: blockchain.to_string(),
            contract: contract.to_string(),
            token_id,
            keyword: data.keyword()?.to_string(),
            assertion_id: assertion_id.to_string(),
        };
        let outcome = self
            .ctx
            .assets
            .local_store_asset(Repository::PublicCurrent, &assertion, &metadata)
            .await?;

        set_phase(&self.ctx, &data, Phase::LocalEnd)?;
        self.ctx.operations.complete_with_result(
            data.operation_id,
            json!({
                "ual": ual,
                "assertionId": assertion_id,
                "assetWasNew": outcome.asset_was_new,
            }),
        )?;
        Ok(CommandOutcome::Halt)
    }

    fn error_type(&self) -> ErrorType {
        ErrorType::LocalStoreError
    }
}
