//! Per-worker command queues.
//!
//! Commands are process-local and not persisted: each worker has a
//! priority-ordered pending queue plus a bounded history ring of terminal
//! commands. Every command carries its own expiry so the queues cannot
//! grow unboundedly from unacknowledged dispatches.

use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::command::{
    CommandPriority, CommandStatus, CommandType, WorkerCommand,
};
use crate::services::event_bus::{EventBus, FleetEvent};

/// Terminal commands kept per worker for auditability.
const HISTORY_LIMIT: usize = 100;

#[derive(Default)]
struct WorkerQueue {
    /// Pending commands in dispatch order (highest priority first,
    /// FIFO within a priority).
    pending: VecDeque<Uuid>,
    /// Terminal commands, newest first.
    history: VecDeque<WorkerCommand>,
}

/// Command dispatch service.
pub struct CommandService {
    inner: Mutex<CommandState>,
    events: Arc<EventBus>,
}

#[derive(Default)]
struct CommandState {
    /// Every non-terminal command, addressable by id regardless of
    /// queue position.
    commands: HashMap<Uuid, WorkerCommand>,
    queues: HashMap<Uuid, WorkerQueue>,
}

/// Parameters for dispatching a command.
#[derive(Debug, Clone)]
pub struct SendCommandRequest {
    pub worker_id: Uuid,
    pub command_type: CommandType,
    pub parameters: HashMap<String, serde_json::Value>,
    pub priority: CommandPriority,
    pub requested_by: Option<String>,
    /// Overrides the priority-derived expiry when set.
    pub timeout_override: Option<Duration>,
}

impl CommandService {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            inner: Mutex::new(CommandState::default()),
            events,
        }
    }

    /// Enqueue a command for a worker. Returns immediately with the
    /// command; terminal outcome is discoverable by polling status.
    pub async fn send(&self, req: SendCommandRequest) -> WorkerCommand {
        let now = Utc::now();
        let timeout = req
            .timeout_override
            .unwrap_or_else(|| req.priority.default_timeout());
        let command = WorkerCommand {
            id: Uuid::new_v4(),
            worker_id: req.worker_id,
            command_type: req.command_type,
            parameters: req.parameters,
            priority: req.priority,
            status: CommandStatus::Pending,
            requested_by: req.requested_by,
            created_at: now,
            expires_at: now + chrono::Duration::from_std(timeout).unwrap_or_default(),
            retry_count: 0,
            max_retries: 3,
            result: None,
            error_message: None,
        };

        let mut state = self.inner.lock().await;
        state.enqueue(command.clone());
        drop(state);

        tracing::debug!(
            command_id = %command.id,
            worker_id = %command.worker_id,
            command_type = ?command.command_type,
            priority = ?command.priority,
            "Command queued"
        );
        self.events.publish(FleetEvent::now(
            "command.queued",
            Some(command.worker_id),
            None,
            Some(command.id.to_string()),
        ));
        command
    }

    /// Look up a command by id (pending, in-flight, or in history).
    pub async fn get(&self, command_id: Uuid) -> Option<WorkerCommand> {
        let state = self.inner.lock().await;
        state.commands.get(&command_id).cloned().or_else(|| {
            state
                .queues
                .values()
                .flat_map(|q| q.history.iter())
                .find(|c| c.id == command_id)
                .cloned()
        })
    }

    /// Pending commands for a worker in dispatch order.
    pub async fn pending_for(&self, worker_id: Uuid) -> Vec<WorkerCommand> {
        let state = self.inner.lock().await;
        state
            .queues
            .get(&worker_id)
            .map(|q| {
                q.pending
                    .iter()
                    .filter_map(|id| state.commands.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// History ring for a worker, newest first.
    pub async fn history_for(&self, worker_id: Uuid) -> Vec<WorkerCommand> {
        let state = self.inner.lock().await;
        state
            .queues
            .get(&worker_id)
            .map(|q| q.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Pop the next dispatchable command for a worker and mark it `sent`.
    pub async fn next_to_send(&self, worker_id: Uuid) -> Option<WorkerCommand> {
        let mut state = self.inner.lock().await;
        let queue = state.queues.get_mut(&worker_id)?;
        let id = queue.pending.pop_front()?;
        let command = state.commands.get_mut(&id)?;
        command.status = CommandStatus::Sent;
        Some(command.clone())
    }

    /// Acknowledge receipt: removes the command from the pending queue but
    /// keeps it addressable until terminal.
    pub async fn acknowledge(&self, command_id: Uuid, worker_id: Uuid) -> Result<WorkerCommand> {
        let mut state = self.inner.lock().await;
        let command = state
            .commands
            .get_mut(&command_id)
            .filter(|c| c.worker_id == worker_id)
            .ok_or_else(|| AppError::NotFound(format!("Command {command_id} not found")))?;

        if command.status.is_terminal() {
            return Err(AppError::Conflict(format!(
                "Command {command_id} already {}",
                serde_json::to_string(&command.status).unwrap_or_default()
            )));
        }
        command.status = CommandStatus::Acknowledged;
        let snapshot = command.clone();
        if let Some(queue) = state.queues.get_mut(&worker_id) {
            queue.pending.retain(|id| *id != command_id);
        }
        Ok(snapshot)
    }

    /// Finalize a command and move it into the history ring.
    pub async fn complete(
        &self,
        command_id: Uuid,
        worker_id: Uuid,
        result: Option<serde_json::Value>,
        error_message: Option<String>,
    ) -> Result<WorkerCommand> {
        let mut state = self.inner.lock().await;
        let command = state
            .commands
            .get(&command_id)
            .filter(|c| c.worker_id == worker_id)
            .ok_or_else(|| AppError::NotFound(format!("Command {command_id} not found")))?;

        if command.status.is_terminal() {
            return Err(AppError::Conflict(format!(
                "Command {command_id} already finalized"
            )));
        }
        // An expired command never completes.
        if command.is_expired(Utc::now()) {
            state.finalize(command_id, CommandStatus::Expired, None, None);
            return Err(AppError::Conflict(format!(
                "Command {command_id} expired before completion"
            )));
        }

        let status = if error_message.is_some() {
            CommandStatus::Failed
        } else {
            CommandStatus::Completed
        };
        let finalized = state
            .finalize(command_id, status, result, error_message)
            .ok_or_else(|| AppError::NotFound(format!("Command {command_id} not found")))?;

        self.events.publish(FleetEvent::now(
            "command.finished",
            Some(worker_id),
            None,
            Some(format!("{command_id}:{}", finalized.status_str())),
        ));
        Ok(finalized)
    }

    /// Cancel a command that has not yet been acknowledged. The worker is
    /// not notified; a late ACK for it will be dropped as unknown.
    pub async fn cancel(&self, command_id: Uuid) -> Result<WorkerCommand> {
        let mut state = self.inner.lock().await;
        let command = state
            .commands
            .get(&command_id)
            .ok_or_else(|| AppError::NotFound(format!("Command {command_id} not found")))?;

        if !matches!(command.status, CommandStatus::Pending | CommandStatus::Sent) {
            return Err(AppError::Conflict(format!(
                "Command {command_id} cannot be cancelled in its current state"
            )));
        }
        state
            .finalize(command_id, CommandStatus::Cancelled, None, None)
            .ok_or_else(|| AppError::NotFound(format!("Command {command_id} not found")))
    }

    /// Deliberately re-enqueue a command at the front of its queue.
    /// Available only while the retry budget holds and the command has
    /// not aged out.
    pub async fn retry(&self, command_id: Uuid) -> Result<WorkerCommand> {
        let now = Utc::now();
        let mut state = self.inner.lock().await;
        let command = state
            .commands
            .get_mut(&command_id)
            .ok_or_else(|| AppError::NotFound(format!("Command {command_id} not found")))?;

        if !command.can_retry(now) {
            return Err(AppError::Conflict(format!(
                "Command {command_id} has exhausted its retry budget or expired"
            )));
        }
        command.retry_count += 1;
        command.status = CommandStatus::Pending;
        let snapshot = command.clone();
        let queue = state.queues.entry(snapshot.worker_id).or_default();
        queue.pending.retain(|id| *id != command_id);
        queue.pending.push_front(command_id);
        Ok(snapshot)
    }

    /// Expire every command past its deadline, archiving it to history.
    /// Returns the number of commands expired.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut state = self.inner.lock().await;
        let expired: Vec<Uuid> = state
            .commands
            .values()
            .filter(|c| !c.status.is_terminal() && c.is_expired(now))
            .map(|c| c.id)
            .collect();

        for id in &expired {
            if let Some(c) = state.finalize(*id, CommandStatus::Expired, None, None) {
                tracing::warn!(
                    command_id = %c.id,
                    worker_id = %c.worker_id,
                    command_type = ?c.command_type,
                    "Command expired before completion"
                );
            }
        }
        expired.len()
    }

    /// Drop all queue state for a worker (registry eviction).
    pub async fn forget_worker(&self, worker_id: Uuid) {
        let mut state = self.inner.lock().await;
        if let Some(queue) = state.queues.remove(&worker_id) {
            for id in queue.pending {
                state.commands.remove(&id);
            }
        }
        state.commands.retain(|_, c| c.worker_id != worker_id);
    }
}

impl CommandState {
    fn enqueue(&mut self, command: WorkerCommand) {
        let queue = self.queues.entry(command.worker_id).or_default();

        // Insert before the first lower-priority entry; ties keep
        // arrival order.
        let position = queue
            .pending
            .iter()
            .position(|id| {
                self.commands
                    .get(id)
                    .map(|c| c.priority < command.priority)
                    .unwrap_or(true)
            })
            .unwrap_or(queue.pending.len());
        queue.pending.insert(position, command.id);
        self.commands.insert(command.id, command);
    }

    fn finalize(
        &mut self,
        command_id: Uuid,
        status: CommandStatus,
        result: Option<serde_json::Value>,
        error_message: Option<String>,
    ) -> Option<WorkerCommand> {
        let mut command = self.commands.remove(&command_id)?;
        command.status = status;
        command.result = result;
        command.error_message = error_message;

        let queue = self.queues.entry(command.worker_id).or_default();
        queue.pending.retain(|id| *id != command_id);
        queue.history.push_front(command.clone());
        queue.history.truncate(HISTORY_LIMIT);
        Some(command)
    }
}

impl WorkerCommand {
    fn status_str(&self) -> &'static str {
        match self.status {
            CommandStatus::Pending => "pending",
            CommandStatus::Sent => "sent",
            CommandStatus::Acknowledged => "acknowledged",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
            CommandStatus::Expired => "expired",
            CommandStatus::Cancelled => "cancelled",
        }
    }
}
