//! Durable command pipeline
//!
//! A command is one scheduled step of an operation. Commands are persisted
//! before they are queued, executed by a fixed worker pool and chained through
//! their `sequence` of follow-up names.

pub mod executor;
pub mod handler;
pub mod scheduler;
pub mod store;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{NodeError, Result};
use crate::operation::OperationId;
use crate::time::now_millis;

pub use executor::{CommandExecutor, ExecutorHandle};
pub use handler::{CommandHandler, HandlerRegistry, Recovery};
pub use scheduler::{CommandInbox, CommandScheduler};
pub use store::CommandStore;

/// Longest delay a command may be scheduled with (10 days).
pub const MAX_COMMAND_DELAY_MS: u64 = 10 * 24 * 60 * 60 * 1000;

/// Every command the node knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandName {
    PublishValidateAssertion,
    UpdateValidateAssertion,
    FindShard,
    PublishReplicate,
    UpdateReplicate,
    GetLocal,
    GetFetchFromNodes,
    AskFetchFromNodes,
    FinalitySend,
    LocalStore,
    QuorumDeadline,
    EpochCheck,
    DeletePendingState,
    OperationIdCleaner,
    CommandsCleaner,
}

/// Per-name defaults applied when a command is created.
#[derive(Debug, Clone, Copy)]
pub struct CommandDefaults {
    pub delay_ms: u64,
    pub retries: u32,
    pub period_ms: Option<u64>,
    pub transactional: bool,
}

impl CommandName {
    pub const ALL: [CommandName; 15] = [
        CommandName::PublishValidateAssertion,
        CommandName::UpdateValidateAssertion,
        CommandName::FindShard,
        CommandName::PublishReplicate,
        CommandName::UpdateReplicate,
        CommandName::GetLocal,
        CommandName::GetFetchFromNodes,
        CommandName::AskFetchFromNodes,
        CommandName::FinalitySend,
        CommandName::LocalStore,
        CommandName::QuorumDeadline,
        CommandName::EpochCheck,
        CommandName::DeletePendingState,
        CommandName::OperationIdCleaner,
        CommandName::CommandsCleaner,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandName::PublishValidateAssertion => "publish_validate_assertion",
            CommandName::UpdateValidateAssertion => "update_validate_assertion",
            CommandName::FindShard => "find_shard",
            CommandName::PublishReplicate => "publish_replicate",
            CommandName::UpdateReplicate => "update_replicate",
            CommandName::GetLocal => "get_local",
            CommandName::GetFetchFromNodes => "get_fetch_from_nodes",
            CommandName::AskFetchFromNodes => "ask_fetch_from_nodes",
            CommandName::FinalitySend => "finality_send",
            CommandName::LocalStore => "local_store",
            CommandName::QuorumDeadline => "quorum_deadline",
            CommandName::EpochCheck => "epoch_check",
            CommandName::DeletePendingState => "delete_pending_state",
            CommandName::OperationIdCleaner => "operation_id_cleaner",
            CommandName::CommandsCleaner => "commands_cleaner",
        }
    }

    pub fn defaults(&self) -> CommandDefaults {
        let base = CommandDefaults {
            delay_ms: 0,
            retries: 0,
            period_ms: None,
            transactional: false,
        };
        match self {
            CommandName::FindShard => CommandDefaults {
                retries: 2,
                period_ms: Some(1000),
                ..base
            },
            CommandName::FinalitySend => CommandDefaults {
                retries: 3,
                period_ms: Some(2000),
                ..base
            },
            CommandName::LocalStore => CommandDefaults {
                retries: 1,
                transactional: true,
                ..base
            },
            CommandName::EpochCheck => CommandDefaults {
                retries: 3,
                ..base
            },
            CommandName::DeletePendingState => CommandDefaults {
                retries: 2,
                period_ms: Some(5000),
                transactional: true,
                ..base
            },
            CommandName::OperationIdCleaner | CommandName::CommandsCleaner => CommandDefaults {
                period_ms: Some(60 * 60 * 1000),
                ..base
            },
            _ => base,
        }
    }

    /// Recreated at every start and repeated forever.
    pub fn is_permanent(&self) -> bool {
        matches!(self, CommandName::OperationIdCleaner | CommandName::CommandsCleaner)
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandName {
    type Err = NodeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        CommandName::ALL
            .iter()
            .find(|n| n.as_str() == s)
            .copied()
            .ok_or_else(|| NodeError::UnknownCommand(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommandStatus {
    Pending,
    Started,
    Repeating,
    Completed,
    Failed,
    Expired,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "PENDING",
            CommandStatus::Started => "STARTED",
            CommandStatus::Repeating => "REPEATING",
            CommandStatus::Completed => "COMPLETED",
            CommandStatus::Failed => "FAILED",
            CommandStatus::Expired => "EXPIRED",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(
            self,
            CommandStatus::Completed | CommandStatus::Failed | CommandStatus::Expired
        )
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandStatus {
    type Err = NodeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(CommandStatus::Pending),
            "STARTED" => Ok(CommandStatus::Started),
            "REPEATING" => Ok(CommandStatus::Repeating),
            "COMPLETED" => Ok(CommandStatus::Completed),
            "FAILED" => Ok(CommandStatus::Failed),
            "EXPIRED" => Ok(CommandStatus::Expired),
            other => Err(NodeError::Internal(format!("unknown command status {}", other))),
        }
    }
}

/// What a handler asks the executor to do next.
#[derive(Debug)]
pub enum CommandOutcome {
    /// Schedule the next name in the sequence, optionally with replacement data
    Continue(Option<Value>),
    /// End the chain here
    Halt,
    /// End the chain and schedule these commands instead
    Branch(Vec<Command>),
    /// Run this command again after its period
    Repeat,
    /// Run this command again while retries remain
    Retry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: Option<i64>,
    pub name: CommandName,
    pub data: Value,
    pub sequence: Vec<CommandName>,
    pub delay_ms: u64,
    pub period_ms: Option<u64>,
    pub retries: u32,
    pub deadline_at: Option<u64>,
    pub transactional: bool,
    pub status: CommandStatus,
    pub message: Option<String>,
    pub parent_id: Option<i64>,
    pub ready_at: u64,
    pub started_at: Option<u64>,
    pub created_at: u64,
}

impl Command {
    pub fn new(name: CommandName, data: Value) -> Self {
        let defaults = name.defaults();
        let now = now_millis();
        Self {
            id: None,
            name,
            data,
            sequence: Vec::new(),
            delay_ms: defaults.delay_ms,
            period_ms: defaults.period_ms,
            retries: defaults.retries,
            deadline_at: None,
            transactional: defaults.transactional,
            status: CommandStatus::Pending,
            message: None,
            parent_id: None,
            ready_at: now + defaults.delay_ms,
            started_at: None,
            created_at: now,
        }
    }

    /// First command of an operation's chain.
    pub fn for_operation(
        name: CommandName,
        operation_id: OperationId,
        mut data: Value,
        sequence: Vec<CommandName>,
    ) -> Self {
        if let Some(obj) = data.as_object_mut() {
            obj.insert("operationId".to_string(), json!(operation_id.to_string()));
        } else {
            data = json!({ "operationId": operation_id.to_string() });
        }
        Self::new(name, data).with_sequence(sequence)
    }

    pub fn with_sequence(mut self, sequence: Vec<CommandName>) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms.min(MAX_COMMAND_DELAY_MS);
        self.ready_at = self.created_at + self.delay_ms;
        self
    }

    pub fn with_period(mut self, period_ms: u64) -> Self {
        self.period_ms = Some(period_ms);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_deadline(mut self, deadline_at: u64) -> Self {
        self.deadline_at = Some(deadline_at);
        self
    }

    pub fn transactional(mut self, transactional: bool) -> Self {
        self.transactional = transactional;
        self
    }

    /// The operation this command belongs to, if any.
    pub fn operation_id(&self) -> Option<OperationId> {
        self.data
            .get("operationId")
            .and_then(Value::as_str)
            .and_then(|s| OperationId::parse(s).ok())
    }

    /// Operation id, required.
    pub fn require_operation_id(&self) -> Result<OperationId> {
        self.operation_id().ok_or_else(|| {
            NodeError::Validation(format!("command {} carries no operation id", self.name))
        })
    }

    /// Typed view of the payload.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Build the next command of the chain. `operationId` always carries over
    /// from this command, whatever the replacement data says.
    pub fn continuation(&self, replacement: Option<Value>) -> Option<Command> {
        let (head, tail) = self.sequence.split_first()?;
        let mut data = replacement.unwrap_or_else(|| self.data.clone());
        if let (Some(original), Some(obj)) = (self.data.get("operationId"), data.as_object_mut()) {
            obj.insert("operationId".to_string(), original.clone());
        }
        let mut next = Command::new(*head, data).with_sequence(tail.to_vec());
        next.parent_id = self.id;
        Some(next)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.deadline_at.map(|d| d <= now).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_continuation_keeps_operation_id() {
        let op = OperationId::new();
        let mut cmd = Command::for_operation(
            CommandName::PublishValidateAssertion,
            op,
            json!({"keyword": "k"}),
            vec![CommandName::FindShard, CommandName::PublishReplicate],
        );
        cmd.id = Some(7);

        let next = cmd
            .continuation(Some(json!({"operationId": "tampered", "extra": true})))
            .unwrap();
        assert_eq!(next.name, CommandName::FindShard);
        assert_eq!(next.sequence, vec![CommandName::PublishReplicate]);
        assert_eq!(next.operation_id(), Some(op));
        assert_eq!(next.data["extra"], true);
        assert_eq!(next.parent_id, Some(7));
        // defaults come from the new name
        assert_eq!(next.retries, CommandName::FindShard.defaults().retries);
    }

    #[test]
    fn test_end_of_sequence() {
        let cmd = Command::new(CommandName::GetLocal, json!({}));
        assert!(cmd.continuation(None).is_none());
    }

    #[test]
    fn test_delay_is_capped() {
        let cmd = Command::new(CommandName::EpochCheck, json!({})).with_delay(u64::MAX / 2);
        assert_eq!(cmd.delay_ms, MAX_COMMAND_DELAY_MS);
    }

    #[test]
    fn test_names_round_trip_through_strings() {
        for name in CommandName::ALL {
            assert_eq!(name.as_str().parse::<CommandName>().unwrap(), name);
        }
        assert!(matches!(
            "mint_tokens".parse::<CommandName>(),
            Err(NodeError::UnknownCommand(_))
        ));
    }
}
