//! Command executor
//!
//! A timer loop releases commands when they are due and feeds a fixed pool of
//! workers. Each worker runs one command to completion before taking the
//! next, then records the outcome: continue the chain, repeat, retry, fail or
//! expire.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    Command, CommandHandler, CommandInbox, CommandName, CommandOutcome, CommandScheduler,
    CommandStatus, CommandStore, HandlerRegistry, Recovery,
};
use crate::config::CommandsConfig;
use crate::error::{NodeError, Result};
use crate::operation::OperationService;
use crate::time::now_millis;

pub struct CommandExecutor {
    store: CommandStore,
    scheduler: CommandScheduler,
    handlers: HandlerRegistry,
    operations: Arc<OperationService>,
    config: CommandsConfig,
}

/// Running executor. Dropping the handle also stops the loops.
pub struct ExecutorHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ExecutorHandle {
    /// Stop the timer loop and the workers. In-flight commands finish first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!("Command executor stopped");
    }
}

/// Command waiting in the timer heap.
struct Scheduled {
    ready_at: u64,
    seq: u64,
    command: Command,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.ready_at, self.seq).cmp(&(other.ready_at, other.seq))
    }
}

impl CommandExecutor {
    pub fn new(
        scheduler: CommandScheduler,
        handlers: HandlerRegistry,
        operations: Arc<OperationService>,
        config: CommandsConfig,
    ) -> Self {
        Self {
            store: scheduler.store().clone(),
            scheduler,
            handlers,
            operations,
            config,
        }
    }

    /// Replay unfinished commands, recreate permanent ones and start the
    /// timer loop plus `parallelism` workers.
    pub fn start(self, inbox: CommandInbox) -> Result<ExecutorHandle> {
        let executor = Arc::new(self);
        executor.recreate_permanent()?;
        let replayed = executor.replay()?;
        executor.schedule_permanent()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let parallelism = executor.config.parallelism.max(1);
        let (work_tx, work_rx) = mpsc::channel::<Command>(parallelism);
        let work_rx = Arc::new(Mutex::new(work_rx));

        let mut tasks = Vec::with_capacity(parallelism + 1);
        tasks.push(tokio::spawn(executor.clone().run_timer(
            inbox,
            work_tx,
            shutdown_rx.clone(),
        )));
        for index in 0..parallelism {
            tasks.push(tokio::spawn(executor.clone().run_worker(
                index,
                work_rx.clone(),
                shutdown_rx.clone(),
            )));
        }

        info!(parallelism, replayed, "Command executor started");
        Ok(ExecutorHandle {
            shutdown: shutdown_tx,
            tasks,
        })
    }

    fn recreate_permanent(&self) -> Result<()> {
        for name in CommandName::ALL.iter().filter(|n| n.is_permanent()) {
            self.store.delete_by_name(*name)?;
        }
        Ok(())
    }

    fn schedule_permanent(&self) -> Result<()> {
        for name in CommandName::ALL.iter().filter(|n| n.is_permanent()) {
            if !self.handlers.contains(*name) {
                warn!(command = %name, "No handler for permanent command, not scheduled");
                continue;
            }
            self.scheduler.schedule(Command::new(*name, json!({})))?;
        }
        Ok(())
    }

    /// Re-enqueue everything a previous run left unfinished.
    fn replay(&self) -> Result<usize> {
        let unfinished = self.store.find_by_status(&[
            CommandStatus::Pending,
            CommandStatus::Started,
            CommandStatus::Repeating,
        ])?;
        let count = unfinished.len();
        for command in unfinished {
            debug!(command_id = ?command.id, command = %command.name, status = %command.status, "Replaying command");
            self.scheduler.enqueue(command)?;
        }
        Ok(count)
    }

    async fn run_timer(
        self: Arc<Self>,
        mut inbox: CommandInbox,
        work_tx: mpsc::Sender<Command>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let tick = Duration::from_millis(self.config.tick_ms.max(1));
        let mut heap: BinaryHeap<Reverse<Scheduled>> = BinaryHeap::new();
        let mut queued: HashSet<i64> = HashSet::new();
        let mut seq: u64 = 0;
        let mut inbox_open = true;

        loop {
            let now = now_millis();
            while heap
                .peek()
                .map(|Reverse(next)| next.ready_at <= now)
                .unwrap_or(false)
            {
                let Some(Reverse(next)) = heap.pop() else {
                    break;
                };
                if let Some(id) = next.command.id {
                    queued.remove(&id);
                }
                if work_tx.send(next.command).await.is_err() {
                    return;
                }
            }

            let wait = heap
                .peek()
                .map(|Reverse(next)| Duration::from_millis(next.ready_at.saturating_sub(now)))
                .unwrap_or(tick)
                .min(tick);

            tokio::select! {
                _ = shutdown.changed() => break,
                received = inbox.rx.recv(), if inbox_open => match received {
                    Some(command) => {
                        // duplicate dispatch of a queued row is dropped here
                        if let Some(id) = command.id {
                            if !queued.insert(id) {
                                continue;
                            }
                        }
                        seq += 1;
                        heap.push(Reverse(Scheduled {
                            ready_at: command.ready_at,
                            seq,
                            command,
                        }));
                    }
                    None => inbox_open = false,
                },
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn run_worker(
        self: Arc<Self>,
        index: usize,
        work_rx: Arc<Mutex<mpsc::Receiver<Command>>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!(worker = index, "Command worker started");
        loop {
            let next = {
                let mut rx = work_rx.lock().await;
                tokio::select! {
                    _ = shutdown.changed() => None,
                    command = rx.recv() => command,
                }
            };
            let Some(command) = next else {
                break;
            };
            let name = command.name;
            let id = command.id;
            if let Err(e) = self.run(command).await {
                error!(command_id = ?id, command = %name, error = %e, "Command bookkeeping failed");
            }
        }
    }

    async fn run(&self, mut command: Command) -> Result<()> {
        let Some(id) = command.id else {
            warn!(command = %command.name, "Dropping command without id");
            return Ok(());
        };

        // at-least-once delivery: a row finished or removed meanwhile is skipped
        match self.store.get(id)? {
            Some(stored) if !stored.status.is_final() => {}
            _ => return Ok(()),
        }

        let Some(handler) = self.handlers.get(command.name) else {
            let message = format!("no handler registered for {}", command.name);
            self.store.set_status(id, CommandStatus::Failed, Some(&message))?;
            error!(command_id = id, command = %command.name, "{}", message);
            return Ok(());
        };

        let now = now_millis();
        if command.is_expired(now) {
            return self.expire(handler.as_ref(), &command).await;
        }

        if !command.transactional {
            self.store.mark_started(id, now)?;
        }
        command.started_at = Some(now);
        self.trace(&command, "Executing command");

        match self.invoke(handler.clone(), command.clone()).await {
            Ok(CommandOutcome::Continue(data)) => {
                let mut children: Vec<Command> = command.continuation(data).into_iter().collect();
                self.store
                    .finish_with_children(id, CommandStatus::Completed, None, &mut children)?;
                self.trace(&command, "Command completed");
                for child in children {
                    self.scheduler.enqueue(child)?;
                }
            }
            Ok(CommandOutcome::Halt) => {
                self.store
                    .finish_with_children(id, CommandStatus::Completed, None, &mut [])?;
                self.trace(&command, "Command chain halted");
            }
            Ok(CommandOutcome::Branch(mut commands)) => {
                self.store
                    .finish_with_children(id, CommandStatus::Completed, None, &mut commands)?;
                self.trace(&command, "Command branched");
                for child in commands {
                    self.scheduler.enqueue(child)?;
                }
            }
            Ok(CommandOutcome::Repeat) => {
                let period = command
                    .period_ms
                    .unwrap_or(self.config.default_repeat_interval_ms);
                command.status = CommandStatus::Repeating;
                command.ready_at = now_millis() + period;
                self.store
                    .reschedule(id, command.status, command.ready_at, command.retries, None)?;
                self.trace(&command, "Command repeating");
                self.scheduler.enqueue(command)?;
            }
            Ok(CommandOutcome::Retry) => {
                if command.retries > 0 {
                    self.retry(command, "retry requested").await?;
                } else {
                    let err = NodeError::Internal(format!(
                        "command {} exhausted its retries",
                        command.name
                    ));
                    self.fail(handler.as_ref(), &command, err).await?;
                }
            }
            Err(err) => {
                if err.is_retryable() && command.retries > 0 {
                    let message = err.to_string();
                    self.retry(command, &message).await?;
                } else {
                    self.fail(handler.as_ref(), &command, err).await?;
                }
            }
        }
        Ok(())
    }

    /// Run the handler on its own task so a panic stays contained.
    async fn invoke(
        &self,
        handler: Arc<dyn CommandHandler>,
        command: Command,
    ) -> Result<CommandOutcome> {
        let task = tokio::spawn(async move { handler.execute(&command).await });
        match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                let payload = e.into_panic();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(NodeError::Internal(format!("command handler panicked: {}", message)))
            }
            Err(e) => Err(NodeError::Internal(format!("command handler aborted: {}", e))),
        }
    }

    async fn retry(&self, mut command: Command, reason: &str) -> Result<()> {
        let Some(id) = command.id else {
            return Ok(());
        };
        let backoff = command
            .period_ms
            .unwrap_or(self.config.default_retry_backoff_ms);
        command.retries -= 1;
        command.status = CommandStatus::Pending;
        command.ready_at = now_millis() + backoff;
        self.store.reschedule(
            id,
            command.status,
            command.ready_at,
            command.retries,
            Some(reason),
        )?;
        warn!(
            command_id = id,
            command = %command.name,
            retries_left = command.retries,
            backoff_ms = backoff,
            "Command will be retried: {}",
            reason
        );
        self.scheduler.enqueue(command)
    }

    async fn fail(
        &self,
        handler: &dyn CommandHandler,
        command: &Command,
        err: NodeError,
    ) -> Result<()> {
        let message = err.to_string();
        if let Some(id) = command.id {
            self.store.set_status(id, CommandStatus::Failed, Some(&message))?;
        }
        error!(command_id = ?command.id, command = %command.name, error = %message, "Command failed");

        if handler.recover(command, &err).await == Recovery::FailOperation {
            if let Some(operation_id) = command.operation_id() {
                match self
                    .operations
                    .mark_failed(operation_id, &message, handler.error_type())
                {
                    Ok(_) | Err(NodeError::OperationNotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    async fn expire(&self, handler: &dyn CommandHandler, command: &Command) -> Result<()> {
        if let Some(id) = command.id {
            self.store
                .set_status(id, CommandStatus::Expired, Some("deadline passed"))?;
        }
        info!(command_id = ?command.id, command = %command.name, "Command expired");
        for follow_up in handler.expired(command).await? {
            self.scheduler.schedule(follow_up)?;
        }
        Ok(())
    }

    fn trace(&self, command: &Command, message: &str) {
        if self.config.verbose_logging {
            info!(command_id = ?command.id, command = %command.name, operation_id = ?command.operation_id(), "{}", message);
        } else {
            debug!(command_id = ?command.id, command = %command.name, "{}", message);
        }
    }
}
