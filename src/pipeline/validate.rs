//! First step of publish and update: the cached assertion must hash to the
//! id the chain holds for the asset.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{cached_assertion, set_phase, OperationData};
use crate::command::{Command, CommandHandler, CommandName, CommandOutcome};
use crate::context::NodeContext;
use crate::error::{ErrorType, NodeError, Result};
use crate::operation::{OperationKind, Phase};
use crate::storage::calculate_assertion_id;

pub struct ValidateAssertion {
    ctx: Arc<NodeContext>,
    kind: OperationKind,
}

impl ValidateAssertion {
    pub fn new(ctx: Arc<NodeContext>, kind: OperationKind) -> Self {
        Self { ctx, kind }
    }
}

#[async_trait]
impl CommandHandler for ValidateAssertion {
    fn name(&self) -> CommandName {
        match self.kind {
            OperationKind::Update => CommandName::UpdateValidateAssertion,
            _ => CommandName::PublishValidateAssertion,
        }
    }

    async fn execute(&self, command: &Command) -> Result<CommandOutcome> {
        let data = OperationData::from_command(command)?;
        set_phase(&self.ctx, &data, Phase::ValidateAssertionStart)?;

        let assertion = cached_assertion(&self.ctx, data.operation_id)?;
        let calculated = calculate_assertion_id(&assertion);
        let expected = data.assertion_id()?;
        if !calculated.eq_ignore_ascii_case(expected) {
            return Err(NodeError::Validation(format!(
                "Invalid assertion id. Received value: {}, calculated: {}",
                expected, calculated
            )));
        }

        let (blockchain, contract, token_id) = (data.blockchain()?, data.contract()?, data.token_id()?);
        let on_chain = match self.kind {
            OperationKind::Update => {
                self.ctx
                    .blockchain
                    .get_unfinalized_assertion_id(blockchain, contract, token_id)
                    .await?
            }
            _ => {
                self.ctx
                    .blockchain
                    .get_latest_assertion_id(blockchain, contract, token_id)
                    .await?
            }
        };
        match on_chain {
            Some(id) if id.eq_ignore_ascii_case(&calculated) => {}
            other => {
                return Err(NodeError::Validation(format!(
                    "Assertion {} does not match chain state {:?}",
                    calculated, other
                )))
            }
        }

        info!(operation_id = %data.operation_id, assertion_id = %calculated, "Assertion validated");
        set_phase(&self.ctx, &data, Phase::ValidateAssertionEnd)?;
        Ok(CommandOutcome::Continue(None))
    }

    fn error_type(&self) -> ErrorType {
        match self.kind {
            OperationKind::Update => ErrorType::UpdateValidateAssertionError,
            _ => ErrorType::PublishValidateAssertionError,
        }
    }
}
