//! Command queue: bounded FIFO of pending register writes
//!
//! Producers get a `CommandHandle` that resolves exactly once, when the poll
//! scheduler has consumed the `DeviceCommand` and called `resolve`. The queue
//! itself never blocks a producer: a full queue is reported immediately.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

use crate::codec::Value;
use crate::error::SubmitError;

/// Final result of a submitted command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum CommandOutcome {
    /// Written and acknowledged by the device
    Applied,
    /// Caller error; resubmitting the same command will fail again
    Rejected(String),
    /// Transient failure; the command may be resubmitted
    Failed(String),
    /// The caller stopped waiting; the write may still happen
    TimedOut,
}

impl fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandOutcome::Applied => write!(f, "applied"),
            CommandOutcome::Rejected(reason) => write!(f, "rejected: {reason}"),
            CommandOutcome::Failed(reason) => write!(f, "failed: {reason}"),
            CommandOutcome::TimedOut => write!(f, "timed out"),
        }
    }
}

/// A pending write of `value` to the register named `register`
#[derive(Debug)]
pub struct DeviceCommand {
    pub id: Uuid,
    pub register: String,
    pub value: Value,
    pub submitted_at: DateTime<Utc>,
    responder: oneshot::Sender<CommandOutcome>,
}

impl DeviceCommand {
    pub fn new(register: impl Into<String>, value: Value) -> (Self, CommandHandle) {
        let (responder, receiver) = oneshot::channel();
        let id = Uuid::new_v4();
        let command = Self {
            id,
            register: register.into(),
            value,
            submitted_at: Utc::now(),
            responder,
        };
        (command, CommandHandle { id, receiver })
    }

    /// Deliver the outcome; consuming `self` makes this happen at most once
    pub fn resolve(self, outcome: CommandOutcome) {
        debug!("Command {} ({}) {outcome}", self.id, self.register);
        // The caller may have given up waiting
        let _ = self.responder.send(outcome);
    }
}

/// Caller side of a submitted command
#[derive(Debug)]
pub struct CommandHandle {
    id: Uuid,
    receiver: oneshot::Receiver<CommandOutcome>,
}

impl CommandHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the outcome without a deadline
    pub async fn outcome(self) -> CommandOutcome {
        self.receiver
            .await
            .unwrap_or_else(|_| CommandOutcome::Failed("engine stopped".to_string()))
    }

    /// Wait at most `timeout`; giving up does not cancel the write
    pub async fn wait(self, timeout: Duration) -> CommandOutcome {
        tokio::time::timeout(timeout, self.outcome())
            .await
            .unwrap_or(CommandOutcome::TimedOut)
    }
}

/// Producer side, cheap to clone
#[derive(Debug, Clone)]
pub struct CommandQueue {
    sender: mpsc::Sender<DeviceCommand>,
    capacity: usize,
}

/// Consumer side, owned by the poll scheduler
#[derive(Debug)]
pub struct CommandReceiver {
    receiver: mpsc::Receiver<DeviceCommand>,
}

impl CommandQueue {
    /// `capacity` must be non-zero
    pub fn bounded(capacity: usize) -> (Self, CommandReceiver) {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender, capacity }, CommandReceiver { receiver })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Commands waiting to be drained
    pub fn pending(&self) -> usize {
        self.capacity - self.sender.capacity()
    }

    /// Enqueue a write and return the handle to await its outcome
    pub fn submit(
        &self,
        register: impl Into<String>,
        value: Value,
    ) -> Result<CommandHandle, SubmitError> {
        let (command, handle) = DeviceCommand::new(register, value);
        self.sender.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SubmitError::QueueFull {
                capacity: self.capacity,
            },
            mpsc::error::TrySendError::Closed(_) => SubmitError::EngineStopped,
        })?;
        Ok(handle)
    }
}

impl CommandReceiver {
    /// Take up to `max` queued commands in submission order without waiting
    pub fn drain(&mut self, max: usize) -> Vec<DeviceCommand> {
        let mut batch = Vec::new();
        while batch.len() < max {
            match self.receiver.try_recv() {
                Ok(command) => batch.push(command),
                Err(_) => break,
            }
        }
        batch
    }

    /// Refuse further submissions; queued commands can still be drained
    pub fn close(&mut self) {
        self.receiver.close();
    }
}
