//! Command handler trait and the name-keyed registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::{Command, CommandName, CommandOutcome};
use crate::error::{ErrorType, NodeError, Result};

/// What happens to the associated operation once a command fails for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Mark the operation FAILED with the command's error
    FailOperation,
    /// Leave the operation as it is
    Keep,
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn name(&self) -> CommandName;

    async fn execute(&self, command: &Command) -> Result<CommandOutcome>;

    /// Called after a fatal error or exhausted retries.
    async fn recover(&self, _command: &Command, _error: &NodeError) -> Recovery {
        Recovery::FailOperation
    }

    /// Called when the deadline passed before the command ran. Returned
    /// commands are scheduled.
    async fn expired(&self, _command: &Command) -> Result<Vec<Command>> {
        Ok(Vec::new())
    }

    /// Tag recorded on the operation when this command fails it.
    fn error_type(&self) -> ErrorType {
        ErrorType::CommandExecutorError
    }
}

/// Handlers keyed by command name.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<CommandName, Arc<dyn CommandHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(handler.name(), handler);
    }

    pub fn get(&self, name: CommandName) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(&name).cloned()
    }

    pub fn contains(&self, name: CommandName) -> bool {
        self.handlers.contains_key(&name)
    }

    /// Every command name must have a handler.
    pub fn verify(&self) -> Result<()> {
        let missing: Vec<&str> = CommandName::ALL
            .iter()
            .filter(|n| !self.handlers.contains_key(n))
            .map(|n| n.as_str())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(NodeError::UnknownCommand(format!(
                "no handler registered for {}",
                missing.join(", ")
            )))
        }
    }
}
