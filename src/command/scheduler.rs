//! Scheduling handle shared by everything that starts commands.
//!
//! `schedule` persists first, then hands the command to the executor's timer
//! loop through an unbounded channel. Commands scheduled before the executor
//! starts wait in the channel.

use tokio::sync::mpsc;
use tracing::debug;

use super::{Command, CommandStore};
use crate::error::{NodeError, Result};

/// Receiving end consumed by the executor's timer loop.
pub struct CommandInbox {
    pub(crate) rx: mpsc::UnboundedReceiver<Command>,
}

#[derive(Clone)]
pub struct CommandScheduler {
    store: CommandStore,
    tx: mpsc::UnboundedSender<Command>,
}

impl CommandScheduler {
    pub fn new(store: CommandStore) -> (Self, CommandInbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { store, tx }, CommandInbox { rx })
    }

    pub fn store(&self) -> &CommandStore {
        &self.store
    }

    /// Persist and enqueue a command. Returns its id.
    pub fn schedule(&self, mut command: Command) -> Result<i64> {
        let id = self.store.insert(&mut command)?;
        debug!(command_id = id, command = %command.name, delay_ms = command.delay_ms, "Command scheduled");
        self.enqueue(command)?;
        Ok(id)
    }

    /// Hand an already persisted command to the timer loop.
    pub(crate) fn enqueue(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| NodeError::Internal("command executor is not running".to_string()))
    }
}
