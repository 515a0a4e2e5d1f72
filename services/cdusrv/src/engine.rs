//! Engine wiring and the public handle
//!
//! `build` connects a register map and a transport to a fresh command queue
//! and state store and returns the `PollScheduler` that owns them, together
//! with a `CduHandle` for everyone else. `spawn` does the same and runs the
//! scheduler on the tokio runtime.

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codec::{ByteOrder, Codec, Value};
use crate::command::{CommandHandle, CommandOutcome, CommandQueue};
use crate::error::SubmitError;
use crate::register_map::RegisterMap;
use crate::scheduler::{PollScheduler, SchedulerConfig};
use crate::store::{state_store, DeviceStatus, StateReader};
use crate::transport::Transport;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub byte_order: ByteOrder,
    pub queue_capacity: usize,
    /// Default wait in `submit_command`
    pub submit_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            byte_order: ByteOrder::Abcd,
            queue_capacity: 64,
            submit_timeout: Duration::from_millis(3000),
        }
    }
}

/// Cloneable front door to a running engine
///
/// Reads never wait on the poll loop; writes are queued and resolved by it.
#[derive(Debug, Clone)]
pub struct CduHandle {
    map: Arc<RegisterMap>,
    commands: CommandQueue,
    reader: StateReader,
    submit_timeout: Duration,
}

impl CduHandle {
    /// Latest consistent (snapshot, health) pair
    pub fn get_status(&self) -> Arc<DeviceStatus> {
        self.reader.current()
    }

    /// Publications from now on; slow consumers only see the latest
    pub fn stream_status(&self) -> impl Stream<Item = Arc<DeviceStatus>> + Send + 'static {
        self.reader.subscribe()
    }

    pub fn registers(&self) -> &RegisterMap {
        &self.map
    }

    /// Queue a write without waiting for it
    pub fn enqueue(&self, register: &str, value: Value) -> Result<CommandHandle, SubmitError> {
        self.commands.submit(register, value)
    }

    /// Write `value` to `register` and wait for the outcome
    ///
    /// Unknown names are rejected here without reaching the queue. Waiting
    /// is bounded by the configured submit timeout.
    pub async fn submit_command(&self, register: &str, value: Value) -> CommandOutcome {
        self.submit_command_with_timeout(register, value, self.submit_timeout)
            .await
    }

    pub async fn submit_command_with_timeout(
        &self,
        register: &str,
        value: Value,
        timeout: Duration,
    ) -> CommandOutcome {
        if let Err(e) = self.map.resolve(register) {
            return CommandOutcome::Rejected(e.to_string());
        }
        match self.enqueue(register, value) {
            Ok(handle) => {
                debug!("Command {} queued: {register} = {value}", handle.id());
                handle.wait(timeout).await
            },
            Err(e) => CommandOutcome::Failed(e.to_string()),
        }
    }
}

/// Wire up an engine without starting it
pub fn build(
    map: Arc<RegisterMap>,
    transport: Arc<dyn Transport>,
    config: EngineConfig,
) -> (CduHandle, PollScheduler) {
    let (commands, receiver) = CommandQueue::bounded(config.queue_capacity);
    let (publisher, reader) = state_store(DeviceStatus::initial(
        config.scheduler.failure_threshold,
    ));
    let scheduler = PollScheduler::new(
        Arc::clone(&map),
        Codec::new(config.byte_order),
        transport,
        receiver,
        publisher,
        config.scheduler,
    );
    let handle = CduHandle {
        map,
        commands,
        reader,
        submit_timeout: config.submit_timeout,
    };
    (handle, scheduler)
}

/// Start the poll loop; it runs until `shutdown` is cancelled
pub fn spawn(
    map: Arc<RegisterMap>,
    transport: Arc<dyn Transport>,
    config: EngineConfig,
    shutdown: CancellationToken,
) -> (CduHandle, JoinHandle<()>) {
    let (handle, scheduler) = build(map, transport, config);
    let task = tokio::spawn(scheduler.run(shutdown));
    (handle, task)
}
