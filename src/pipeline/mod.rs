//! Initiator-side command chains.
//!
//! A client call creates an operation, caches its payload and schedules the
//! first command of the chain for its kind:
//!
//! | kind        | chain                                                   |
//! |-------------|---------------------------------------------------------|
//! | publish     | publish_validate_assertion → find_shard → publish_replicate |
//! | update      | update_validate_assertion → find_shard → update_replicate |
//! | get         | get_local → find_shard → get_fetch_from_nodes           |
//! | ask         | find_shard → ask_fetch_from_nodes                       |
//! | local store | local_store                                             |
//!
//! Finality notifications and the maintenance commands are scheduled by the
//! receiver side and the executor itself.

pub mod ask;
pub mod find_shard;
pub mod finality;
pub mod get;
pub mod local_store;
pub mod maintenance;
pub mod replicate;
pub mod validate;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::collaborators::neighborhood::SHA256_HASH_FUNCTION_ID;
use crate::collaborators::PeerId;
use crate::command::{Command, CommandName, HandlerRegistry};
use crate::context::NodeContext;
use crate::error::{NodeError, Result};
use crate::operation::{OperationId, OperationKind, OperationStatus, Phase};
use crate::protocol::get::GetState;
use crate::storage::{calculate_assertion_id, default_keyword, format_ual, parse_ual};

/// Cache field holding the assertion a client handed in.
pub const ASSERTION_FIELD: &str = "assertion";

/// Payload carried along an operation's command chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationData {
    pub operation_id: OperationId,
    pub kind: OperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blockchain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
    #[serde(default = "default_hash_function_id")]
    pub hash_function_id: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assertion_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ual: Vec<String>,
    #[serde(default)]
    pub state: GetState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_number_of_node_replications: Option<usize>,
    /// Filled in by `find_shard`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<PeerId>,
}

fn default_hash_function_id() -> u8 {
    SHA256_HASH_FUNCTION_ID
}

impl OperationData {
    pub fn new(operation_id: OperationId, kind: OperationKind) -> Self {
        Self {
            operation_id,
            kind,
            blockchain: None,
            contract: None,
            token_id: None,
            keyword: None,
            hash_function_id: SHA256_HASH_FUNCTION_ID,
            assertion_id: None,
            ual: Vec::new(),
            state: GetState::default(),
            minimum_number_of_node_replications: None,
            nodes: Vec::new(),
        }
    }

    pub fn from_command(command: &Command) -> Result<Self> {
        command.payload()
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn blockchain(&self) -> Result<&str> {
        self.blockchain.as_deref().ok_or_else(|| missing("blockchain"))
    }

    pub fn contract(&self) -> Result<&str> {
        self.contract.as_deref().ok_or_else(|| missing("contract"))
    }

    pub fn token_id(&self) -> Result<u64> {
        self.token_id.ok_or_else(|| missing("tokenId"))
    }

    pub fn keyword(&self) -> Result<&str> {
        self.keyword.as_deref().ok_or_else(|| missing("keyword"))
    }

    pub fn assertion_id(&self) -> Result<&str> {
        self.assertion_id.as_deref().ok_or_else(|| missing("assertionId"))
    }

    /// The single UAL this operation is about.
    pub fn first_ual(&self) -> Result<&str> {
        self.ual.first().map(String::as_str).ok_or_else(|| missing("ual"))
    }
}

fn missing(field: &str) -> NodeError {
    NodeError::Validation(format!("operation data has no {}", field))
}

/// Move the operation to `<KIND>_<phase>`.
pub(crate) fn set_phase(ctx: &NodeContext, data: &OperationData, phase: Phase) -> Result<()> {
    ctx.operations.update_status(
        data.operation_id,
        data.blockchain.as_deref(),
        OperationStatus::phase(data.kind, phase),
    )?;
    Ok(())
}

/// Assertion cached for the operation at start.
pub(crate) fn cached_assertion(ctx: &NodeContext, operation_id: OperationId) -> Result<Vec<String>> {
    let value = ctx
        .operations
        .get_cached_field(operation_id, ASSERTION_FIELD)?
        .ok_or_else(|| {
            NodeError::Validation(format!("no cached assertion for operation {}", operation_id))
        })?;
    Ok(serde_json::from_value(value)?)
}

/// Client request to publish, update or locally store an asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRequest {
    pub assertion: Vec<String>,
    pub blockchain: String,
    pub contract: String,
    pub token_id: u64,
    #[serde(default)]
    pub keyword: Option<String>,
    #[serde(default)]
    pub hash_function_id: Option<u8>,
    #[serde(default)]
    pub minimum_number_of_node_replications: Option<usize>,
}

/// Client request to fetch one asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRequest {
    pub ual: String,
    #[serde(default)]
    pub state: GetState,
    #[serde(default)]
    pub assertion_id: Option<String>,
}

/// Client request to check which peers hold a set of assets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AskRequest {
    pub ual: Vec<String>,
    #[serde(default)]
    pub minimum_number_of_node_replications: Option<usize>,
}

fn asset_operation(
    ctx: &NodeContext,
    kind: OperationKind,
    request: AssetRequest,
) -> Result<(OperationId, OperationData)> {
    if request.assertion.is_empty() {
        return Err(NodeError::Validation("assertion must not be empty".to_string()));
    }
    if !ctx
        .blockchain
        .implementation_names()
        .iter()
        .any(|b| b == &request.blockchain)
    {
        return Err(NodeError::Validation(format!(
            "unsupported blockchain {}",
            request.blockchain
        )));
    }
    if request.minimum_number_of_node_replications == Some(0) {
        return Err(NodeError::Validation(
            "minimumNumberOfNodeReplications must be positive".to_string(),
        ));
    }

    let assertion_id = calculate_assertion_id(&request.assertion);
    let operation_id = begin_operation(ctx, kind)?;
    ctx.operations
        .cache_data(operation_id, json!({ ASSERTION_FIELD: request.assertion }))?;

    let mut data = OperationData::new(operation_id, kind);
    data.keyword = Some(
        request
            .keyword
            .unwrap_or_else(|| default_keyword(&request.contract, &assertion_id)),
    );
    data.ual = vec![format_ual(&request.blockchain, &request.contract, request.token_id)];
    data.blockchain = Some(request.blockchain);
    data.contract = Some(request.contract.to_lowercase());
    data.token_id = Some(request.token_id);
    data.hash_function_id = request.hash_function_id.unwrap_or(ctx.config.protocol.hash_function_id);
    data.assertion_id = Some(assertion_id);
    data.minimum_number_of_node_replications = request.minimum_number_of_node_replications;
    Ok((operation_id, data))
}

fn begin_operation(ctx: &NodeContext, kind: OperationKind) -> Result<OperationId> {
    let operation_id = ctx
        .operations
        .generate_operation_id(kind, OperationStatus::start(kind))?;
    ctx.operations
        .update_status(operation_id, None, OperationStatus::phase(kind, Phase::InitStart))?;
    Ok(operation_id)
}

/// Close the init phase and hand the operation to the executor.
///
/// INIT_END is recorded before the first command is queued so a fast worker
/// cannot push the status past it.
fn schedule_chain(
    ctx: &NodeContext,
    data: &OperationData,
    first: CommandName,
    rest: Vec<CommandName>,
) -> Result<()> {
    ctx.operations.update_status(
        data.operation_id,
        None,
        OperationStatus::phase(data.kind, Phase::InitEnd),
    )?;
    ctx.scheduler.schedule(Command::for_operation(
        first,
        data.operation_id,
        data.to_value()?,
        rest,
    ))?;
    Ok(())
}

pub fn start_publish(ctx: &NodeContext, request: AssetRequest) -> Result<OperationId> {
    let (operation_id, data) = asset_operation(ctx, OperationKind::Publish, request)?;
    schedule_chain(
        ctx,
        &data,
        CommandName::PublishValidateAssertion,
        vec![CommandName::FindShard, CommandName::PublishReplicate],
    )?;
    Ok(operation_id)
}

pub fn start_update(ctx: &NodeContext, request: AssetRequest) -> Result<OperationId> {
    let (operation_id, data) = asset_operation(ctx, OperationKind::Update, request)?;
    schedule_chain(
        ctx,
        &data,
        CommandName::UpdateValidateAssertion,
        vec![CommandName::FindShard, CommandName::UpdateReplicate],
    )?;
    Ok(operation_id)
}

pub fn start_local_store(ctx: &NodeContext, request: AssetRequest) -> Result<OperationId> {
    let (operation_id, data) = asset_operation(ctx, OperationKind::LocalStore, request)?;
    schedule_chain(ctx, &data, CommandName::LocalStore, vec![])?;
    Ok(operation_id)
}

pub fn start_get(ctx: &NodeContext, request: FetchRequest) -> Result<OperationId> {
    let ual = parse_ual(&request.ual)?;
    let kind = OperationKind::Get;
    let operation_id = begin_operation(ctx, kind)?;

    let mut data = OperationData::new(operation_id, kind);
    data.ual = vec![request.ual];
    data.blockchain = Some(ual.blockchain);
    data.contract = Some(ual.contract);
    data.token_id = Some(ual.token_id);
    data.state = request.state;
    data.assertion_id = request.assertion_id;
    data.hash_function_id = ctx.config.protocol.hash_function_id;
    data.minimum_number_of_node_replications = Some(1);
    schedule_chain(
        ctx,
        &data,
        CommandName::GetLocal,
        vec![CommandName::FindShard, CommandName::GetFetchFromNodes],
    )?;
    Ok(operation_id)
}

pub fn start_ask(ctx: &NodeContext, request: AskRequest) -> Result<OperationId> {
    let first = request
        .ual
        .first()
        .ok_or_else(|| NodeError::Validation("ual must not be empty".to_string()))?;
    let parsed = parse_ual(first)?;
    for ual in &request.ual[1..] {
        parse_ual(ual)?;
    }
    let kind = OperationKind::Ask;
    let operation_id = begin_operation(ctx, kind)?;

    let mut data = OperationData::new(operation_id, kind);
    data.blockchain = Some(parsed.blockchain);
    data.contract = Some(parsed.contract);
    data.token_id = Some(parsed.token_id);
    data.ual = request.ual;
    data.hash_function_id = ctx.config.protocol.hash_function_id;
    data.minimum_number_of_node_replications = Some(request.minimum_number_of_node_replications.unwrap_or(1));
    schedule_chain(ctx, &data, CommandName::FindShard, vec![CommandName::AskFetchFromNodes])?;
    Ok(operation_id)
}

/// Handlers for every command name.
pub fn build_registry(ctx: &Arc<NodeContext>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(validate::ValidateAssertion::new(ctx.clone(), OperationKind::Publish)));
    registry.register(Arc::new(validate::ValidateAssertion::new(ctx.clone(), OperationKind::Update)));
    registry.register(Arc::new(find_shard::FindShard::new(ctx.clone())));
    registry.register(Arc::new(replicate::Replicate::new(ctx.clone(), OperationKind::Publish)));
    registry.register(Arc::new(replicate::Replicate::new(ctx.clone(), OperationKind::Update)));
    registry.register(Arc::new(get::GetLocal::new(ctx.clone())));
    registry.register(Arc::new(get::GetFetchFromNodes::new(ctx.clone())));
    registry.register(Arc::new(ask::AskFetchFromNodes::new(ctx.clone())));
    registry.register(Arc::new(finality::FinalitySend::new(ctx.clone())));
    registry.register(Arc::new(local_store::LocalStore::new(ctx.clone())));
    registry.register(Arc::new(maintenance::QuorumDeadline::new(ctx.clone())));
    registry.register(Arc::new(maintenance::EpochCheck::new(ctx.clone())));
    registry.register(Arc::new(maintenance::DeletePendingState::new(ctx.clone())));
    registry.register(Arc::new(maintenance::OperationIdCleaner::new(ctx.clone())));
    registry.register(Arc::new(maintenance::CommandsCleaner::new(ctx.clone())));
    registry
}
