//! Poll scheduler: the cyclic read/write state machine
//!
//! Each cycle goes `Idle -> Polling -> (Success | Fault) -> Idle`:
//!
//! 1. drain up to `max_commands_per_cycle` queued commands and write them;
//! 2. read every due range in canonical order, staging decoded values;
//! 3. publish the staged values only if every range was read;
//! 4. sleep until the next tick of a fixed grid, skipping ticks that were
//!    missed entirely.
//!
//! A read failure anywhere in step 2 discards the whole staging area, so a
//! published snapshot never mixes values from different cycles.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::Codec;
use crate::command::{CommandOutcome, CommandReceiver, DeviceCommand};
use crate::error::{CodecError, RegisterError, TransportError};
use crate::register_map::{ReadRange, RegisterKind, RegisterMap};
use crate::store::{DeviceStatus, LinkHealth, StatePublisher, TelemetryField, TelemetrySnapshot};
use crate::transport::Transport;

/// Scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollState {
    Idle,
    Polling,
    Success,
    Fault,
}

/// What to do with a value decoded outside its valid range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangePolicy {
    /// Publish it with `out_of_range` set
    #[default]
    Flag,
    /// Keep the last-known-good value instead
    Withhold,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub failure_threshold: u32,
    pub max_commands_per_cycle: usize,
    pub range_policy: RangePolicy,
    /// Exception codes that reject a command instead of failing it
    pub permanent_exception_codes: Vec<u8>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            failure_threshold: 5,
            max_commands_per_cycle: 8,
            range_policy: RangePolicy::Flag,
            permanent_exception_codes: vec![0x01, 0x02, 0x03],
        }
    }
}

/// Outcome of one read pass, folded into the snapshot and link health
#[derive(Debug)]
pub enum CycleResult {
    /// Every due range was read; decoded fields keyed by register name
    Success(BTreeMap<String, TelemetryField>),
    /// The read of the range starting at `start` failed
    Fault { start: u16, error: TransportError },
}

/// Next tick on the grid `prev + k * period` strictly after `now`
///
/// When the cycle finished early this is simply `prev + period`. After an
/// overrun the missed ticks are skipped instead of being run back to back.
pub fn next_deadline(prev: Instant, period: Duration, now: Instant) -> Instant {
    let next = prev + period;
    if next > now || period.is_zero() {
        return next.max(now);
    }
    let behind = now.duration_since(prev).as_nanos();
    let periods = behind / period.as_nanos() + 1;
    let offset = u64::try_from(period.as_nanos() * periods).unwrap_or(u64::MAX);
    prev + Duration::from_nanos(offset)
}

/// Sole owner of the transport, sole consumer of the command queue and sole
/// writer of the state store
pub struct PollScheduler {
    map: Arc<RegisterMap>,
    codec: Codec,
    transport: Arc<dyn Transport>,
    commands: CommandReceiver,
    publisher: StatePublisher,
    config: SchedulerConfig,
    state: PollState,
    cycle: u64,
    snapshot: Arc<TelemetrySnapshot>,
    health: LinkHealth,
    last_cycle_start: Option<DateTime<Utc>>,
    /// Registers written this cycle, read regardless of cadence
    readback: HashSet<usize>,
    /// Registers whose last decode was out of range
    out_of_range: HashSet<usize>,
}

impl PollScheduler {
    pub fn new(
        map: Arc<RegisterMap>,
        codec: Codec,
        transport: Arc<dyn Transport>,
        commands: CommandReceiver,
        publisher: StatePublisher,
        config: SchedulerConfig,
    ) -> Self {
        let current = publisher.current();
        Self {
            map,
            codec,
            transport,
            commands,
            publisher,
            state: PollState::Idle,
            cycle: 0,
            snapshot: Arc::clone(&current.snapshot),
            health: LinkHealth::new(config.failure_threshold),
            config,
            last_cycle_start: None,
            readback: HashSet::new(),
            out_of_range: HashSet::new(),
        }
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    /// Cycles completed so far
    pub fn cycles(&self) -> u64 {
        self.cycle
    }

    pub fn health(&self) -> &LinkHealth {
        &self.health
    }

    /// Run cycles on a fixed grid until `shutdown` is cancelled
    ///
    /// A cycle in progress always completes. Commands still queued at
    /// shutdown resolve as failed.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            "Poll loop started: {} registers, interval {:?}, link {}",
            self.map.len(),
            self.config.interval,
            self.transport.describe()
        );

        let mut tick = Instant::now();
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            self.run_cycle().await;

            let now = Instant::now();
            let next = next_deadline(tick, self.config.interval, now);
            if next > tick + self.config.interval {
                debug!(
                    "Cycle {} overran by {:?}, skipping to next tick",
                    self.cycle,
                    now.duration_since(tick + self.config.interval)
                );
            }
            tick = next;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep_until(tick) => {},
            }
        }

        self.commands.close();
        for command in self.commands.drain(usize::MAX) {
            command.resolve(CommandOutcome::Failed("poll engine stopped".to_string()));
        }
        info!("Poll loop stopped after {} cycles", self.cycle);
    }

    /// Run one complete cycle and return how it ended
    pub async fn run_cycle(&mut self) -> PollState {
        self.state = PollState::Polling;
        let started = self.cycle_start();

        self.drain_commands().await;

        let ranges = self.due_ranges();
        let outcome = match self.read_pass(&ranges, started).await {
            CycleResult::Success(staged) => {
                self.apply(staged);
                self.readback.clear();
                if self.health.consecutive_failures > 0 {
                    info!(
                        "Link recovered after {} failed cycles",
                        self.health.consecutive_failures
                    );
                }
                self.health.record_success(started);
                PollState::Success
            },
            CycleResult::Fault { start, error } => {
                self.health.record_failure(error.to_string());
                let failures = self.health.consecutive_failures;
                if failures == self.health.failure_threshold {
                    warn!(
                        "Link stale after {failures} consecutive failed cycles, last error: {error}"
                    );
                } else if failures < self.health.failure_threshold {
                    warn!("Poll cycle {} failed at address {start}: {error}", self.cycle);
                } else {
                    debug!("Poll cycle {} failed at address {start}: {error}", self.cycle);
                }
                PollState::Fault
            },
        };

        self.state = outcome;
        self.publisher.publish(DeviceStatus {
            snapshot: Arc::clone(&self.snapshot),
            health: self.health.clone(),
        });
        self.cycle += 1;
        self.state = PollState::Idle;
        outcome
    }

    /// Wall-clock start of this cycle, never earlier than the previous one
    fn cycle_start(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let started = match self.last_cycle_start {
            Some(prev) if prev > now => prev,
            _ => now,
        };
        self.last_cycle_start = Some(started);
        started
    }

    fn due_ranges(&self) -> Vec<ReadRange> {
        let cycle = self.cycle;
        let readback = &self.readback;
        self.map
            .read_ranges_for(|index, desc| desc.is_due(cycle) || readback.contains(&index))
    }

    async fn drain_commands(&mut self) {
        let batch = self.commands.drain(self.config.max_commands_per_cycle);
        for command in batch {
            let outcome = self.execute(&command).await;
            if outcome == CommandOutcome::Applied {
                if let Some(index) = self.map.index_of(&command.register) {
                    self.readback.insert(index);
                }
            }
            command.resolve(outcome);
        }
    }

    /// Encode and write one command; never touches the transport for caller errors
    async fn execute(&self, command: &DeviceCommand) -> CommandOutcome {
        let desc = match self.map.resolve(&command.register) {
            Ok(desc) => desc,
            Err(e) => return CommandOutcome::Rejected(e.to_string()),
        };
        let words = match self.codec.encode(desc, &command.value) {
            Ok(words) => words,
            Err(e) => return CommandOutcome::Rejected(e.to_string()),
        };

        let result = match (desc.kind, words.as_slice()) {
            (RegisterKind::Coil, [word]) => self.transport.write_coil(desc.address, *word != 0).await,
            (RegisterKind::Holding, [word]) => self.transport.write_register(desc.address, *word).await,
            (RegisterKind::Holding, words) => self.transport.write_registers(desc.address, words).await,
            (RegisterKind::Coil, _) => {
                return CommandOutcome::Rejected(
                    RegisterError::InvalidDefinition {
                        name: desc.name.clone(),
                        reason: "coil value must encode to one word".to_string(),
                    }
                    .to_string(),
                )
            },
        };

        match result {
            Ok(()) => {
                info!(
                    "Command {} applied: {} = {} {}",
                    command.id, desc.name, command.value, desc.unit
                );
                CommandOutcome::Applied
            },
            Err(e) => {
                let permanent = e
                    .exception_code()
                    .is_some_and(|code| self.config.permanent_exception_codes.contains(&code));
                warn!("Command {} to {} failed: {e}", command.id, desc.name);
                if permanent {
                    CommandOutcome::Rejected(e.to_string())
                } else {
                    CommandOutcome::Failed(e.to_string())
                }
            },
        }
    }

    async fn read_range(&self, range: &ReadRange) -> Result<Vec<u16>, TransportError> {
        let words = match range.kind {
            RegisterKind::Holding => self.transport.read_registers(range.start, range.count).await?,
            RegisterKind::Coil => self
                .transport
                .read_coils(range.start, range.count)
                .await?
                .into_iter()
                .map(u16::from)
                .collect(),
        };
        if words.len() != usize::from(range.count) {
            return Err(TransportError::Protocol(format!(
                "read of {} at {} returned {} values",
                range.count,
                range.start,
                words.len()
            )));
        }
        Ok(words)
    }

    async fn read_pass(&mut self, ranges: &[ReadRange], started: DateTime<Utc>) -> CycleResult {
        let mut staged = BTreeMap::new();
        let mut violations = HashSet::new();
        let mut read = HashSet::new();
        let registers = self.map.all_registers();

        for range in ranges {
            let words = match self.read_range(range).await {
                Ok(words) => words,
                Err(error) => {
                    return CycleResult::Fault {
                        start: range.start,
                        error,
                    }
                },
            };
            debug!(
                "Read {:?} {}+{} ({} registers)",
                range.kind,
                range.start,
                range.count,
                range.members.len()
            );

            for &index in &range.members {
                read.insert(index);
                let desc = &registers[index];
                let offset = usize::from(desc.address - range.start);
                let raw = &words[offset..offset + usize::from(desc.words())];
                let field = |value, out_of_range| TelemetryField {
                    value,
                    unit: desc.unit.clone(),
                    refreshed_at: started,
                    out_of_range,
                };

                match self.codec.decode(desc, raw) {
                    Ok(value) => {
                        staged.insert(desc.name.clone(), field(value, false));
                    },
                    Err(CodecError::DecodeRangeViolation { value, min, max, .. }) => {
                        if self.out_of_range.contains(&index) {
                            debug!("{} still out of range: {value}", desc.name);
                        } else {
                            warn!("{} decoded {value} outside [{min}, {max}]", desc.name);
                        }
                        violations.insert(index);
                        if self.config.range_policy == RangePolicy::Flag {
                            staged.insert(desc.name.clone(), field(value, true));
                        }
                    },
                    Err(e) => warn!("Failed to decode {}: {e}", desc.name),
                }
            }
        }

        // Registers skipped this cycle keep their last verdict
        self.out_of_range.retain(|index| !read.contains(index));
        self.out_of_range.extend(violations);
        CycleResult::Success(staged)
    }

    /// Fold staged values into a fresh snapshot
    fn apply(&mut self, staged: BTreeMap<String, TelemetryField>) {
        if staged.is_empty() {
            return;
        }
        let mut snapshot = (*self.snapshot).clone();
        snapshot.cycle = self.cycle;
        snapshot.fields.extend(staged);
        self.snapshot = Arc::new(snapshot);
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::codec::Value;
    use crate::command::CommandQueue;
    use crate::store::{state_store, StateReader};
    use crate::transport::mock::{MockCall, MockTransport};
    use tracing_test::traced_test;

    const MAP: &str = "name,address,kind,width,type,scale,unit,access,min,max,poll_every,description
supply_temp,100,holding,1,signed,0.1,°C,read_only,-40,150,1,
return_temp,101,holding,1,signed,0.1,°C,read_only,-40,150,1,
alarm_bits,200,holding,1,bitfield,,,read_only,,,5,
pump_duty,300,holding,1,unsigned,0.01,%,read_write,0,100,1,
pump_run,10,coil,1,bool,,,read_write,,,1,
";

    struct Fixture {
        scheduler: PollScheduler,
        mock: Arc<MockTransport>,
        queue: CommandQueue,
        reader: StateReader,
    }

    fn fixture(config: SchedulerConfig) -> Fixture {
        fixture_with_map(MAP, config)
    }

    fn fixture_with_map(csv: &str, config: SchedulerConfig) -> Fixture {
        let map = Arc::new(RegisterMap::from_csv_reader(csv.as_bytes(), 64).unwrap());
        let mock = Arc::new(MockTransport::new());
        mock.set_registers(100, &[215, 180]);
        mock.set_register(200, 0x0004);
        mock.set_register(300, 5000);
        let (queue, receiver) = CommandQueue::bounded(8);
        let (publisher, reader) = state_store(DeviceStatus::initial(config.failure_threshold));
        let scheduler = PollScheduler::new(
            map,
            Codec::default(),
            mock.clone(),
            receiver,
            publisher,
            config,
        );
        Fixture {
            scheduler,
            mock,
            queue,
            reader,
        }
    }

    #[test]
    fn test_next_deadline_keeps_grid() {
        let t0 = Instant::now();
        let period = Duration::from_millis(1000);
        // Finished early: next tick
        assert_eq!(next_deadline(t0, period, t0 + Duration::from_millis(300)), t0 + period);
        // Overran 2.5 periods: skip to the 3rd tick
        assert_eq!(
            next_deadline(t0, period, t0 + Duration::from_millis(2500)),
            t0 + Duration::from_millis(3000)
        );
        // Exactly on a tick: the following one
        assert_eq!(
            next_deadline(t0, period, t0 + Duration::from_millis(1000)),
            t0 + Duration::from_millis(2000)
        );
    }

    #[tokio::test]
    async fn test_successful_cycle_publishes_all_fields() {
        let mut f = fixture(SchedulerConfig::default());
        assert_eq!(f.scheduler.run_cycle().await, PollState::Success);
        assert_eq!(f.scheduler.state(), PollState::Idle);

        let status = f.reader.current();
        assert_eq!(status.snapshot.number("supply_temp"), Some(21.5));
        assert_eq!(status.snapshot.number("return_temp"), Some(18.0));
        assert_eq!(status.snapshot.value("alarm_bits"), Some(Value::Bits(4)));
        assert_eq!(status.snapshot.value("pump_run"), Some(Value::Bool(false)));
        assert_eq!(status.health.consecutive_failures, 0);
        assert!(status.health.last_success.is_some());

        // 100-101 coalesced, 200, 300 and the coil range
        assert_eq!(f.mock.call_count(), 4);
    }

    #[tokio::test]
    async fn test_poll_every_skips_slow_registers() {
        let mut f = fixture(SchedulerConfig::default());
        f.scheduler.run_cycle().await;
        f.mock.clear_calls();
        f.scheduler.run_cycle().await;
        assert!(!f
            .mock
            .calls()
            .contains(&MockCall::ReadRegisters { start: 200, count: 1 }));
    }

    #[tokio::test]
    async fn test_range_violation_flag_and_withhold() {
        let mut f = fixture(SchedulerConfig::default());
        f.mock.set_register(100, 2000); // 200.0 °C
        f.scheduler.run_cycle().await;
        let field = f.reader.current().snapshot.get("supply_temp").cloned().unwrap();
        assert!(field.out_of_range);
        assert_eq!(field.value, Value::Number(200.0));

        let mut f = fixture(SchedulerConfig {
            range_policy: RangePolicy::Withhold,
            ..SchedulerConfig::default()
        });
        f.scheduler.run_cycle().await;
        f.mock.set_register(100, 2000);
        f.scheduler.run_cycle().await;
        let field = f.reader.current().snapshot.get("supply_temp").cloned().unwrap();
        assert!(!field.out_of_range);
        assert_eq!(field.value, Value::Number(21.5), "last-known-good retained");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_slow_register_out_of_range_warned_once() {
        const SLOW: &str = "name,address,kind,width,type,scale,unit,access,min,max,poll_every,description
coolant_level,400,holding,1,unsigned,0.1,%,read_only,0,100,2,
";
        let warnings = |expected: usize| {
            logs_assert(move |lines: &[&str]| {
                match lines.iter().filter(|l| l.contains("coolant_level decoded")).count() {
                    n if n == expected => Ok(()),
                    n => Err(format!("expected {expected} range warnings, got {n}")),
                }
            });
        };

        let mut f = fixture_with_map(SLOW, SchedulerConfig::default());
        f.mock.set_register(400, 1500); // 150.0 %
        // Read on cycles 0, 2 and 4, skipped in between
        for _ in 0..5 {
            assert_eq!(f.scheduler.run_cycle().await, PollState::Success);
        }
        warnings(1);
        assert!(logs_contain("coolant_level still out of range"));

        // Back in range clears the verdict, so a new excursion warns again
        f.mock.set_register(400, 500);
        f.scheduler.run_cycle().await;
        f.scheduler.run_cycle().await;
        assert_eq!(f.reader.current().snapshot.number("coolant_level"), Some(50.0));
        f.mock.set_register(400, 1500);
        f.scheduler.run_cycle().await;
        f.scheduler.run_cycle().await;
        warnings(2);
    }

    #[tokio::test]
    async fn test_command_written_before_reads_and_read_back() {
        let mut f = fixture(SchedulerConfig::default());
        let handle = f.queue.submit("pump_duty", Value::Number(75.0)).unwrap();
        f.scheduler.run_cycle().await;

        assert_eq!(handle.outcome().await, CommandOutcome::Applied);
        let calls = f.mock.calls();
        assert_eq!(calls[0], MockCall::WriteRegister { address: 300, value: 7500 });
        assert!(calls[1..].iter().all(|c| !c.is_write()));
        assert_eq!(f.reader.current().snapshot.number("pump_duty"), Some(75.0));
    }

    #[tokio::test]
    async fn test_coil_command_uses_write_coil() {
        let mut f = fixture(SchedulerConfig::default());
        let handle = f.queue.submit("pump_run", Value::Bool(true)).unwrap();
        f.scheduler.run_cycle().await;
        assert_eq!(handle.outcome().await, CommandOutcome::Applied);
        assert_eq!(f.mock.calls()[0], MockCall::WriteCoil { address: 10, on: true });
        assert_eq!(f.reader.current().snapshot.value("pump_run"), Some(Value::Bool(true)));
    }

    #[tokio::test]
    async fn test_command_rejections_skip_transport() {
        let mut f = fixture(SchedulerConfig::default());
        let unknown = f.queue.submit("no_such_register", Value::Number(1.0)).unwrap();
        let read_only = f.queue.submit("supply_temp", Value::Number(1.0)).unwrap();
        let too_big = f.queue.submit("pump_duty", Value::Number(150.0)).unwrap();
        f.scheduler.run_cycle().await;

        assert!(matches!(unknown.outcome().await, CommandOutcome::Rejected(_)));
        assert!(matches!(read_only.outcome().await, CommandOutcome::Rejected(_)));
        assert!(matches!(too_big.outcome().await, CommandOutcome::Rejected(_)));
        assert!(f.mock.calls().iter().all(|c| !c.is_write()));
    }

    #[tokio::test]
    async fn test_write_failures_are_classified() {
        let mut f = fixture(SchedulerConfig::default());
        f.mock.fail_writes_at(
            300,
            TransportError::Exception {
                function: 0x06,
                code: 0x03,
            },
        );
        let rejected = f.queue.submit("pump_duty", Value::Number(10.0)).unwrap();
        f.scheduler.run_cycle().await;
        assert!(matches!(rejected.outcome().await, CommandOutcome::Rejected(_)));

        f.mock.fail_writes_at(
            300,
            TransportError::Exception {
                function: 0x06,
                code: 0x06,
            },
        );
        let busy = f.queue.submit("pump_duty", Value::Number(10.0)).unwrap();
        f.scheduler.run_cycle().await;
        assert!(matches!(busy.outcome().await, CommandOutcome::Failed(_)));

        f.mock.fail_writes_at(300, TransportError::Timeout("slow".into()));
        let timeout = f.queue.submit("pump_duty", Value::Number(10.0)).unwrap();
        f.scheduler.run_cycle().await;
        assert!(matches!(timeout.outcome().await, CommandOutcome::Failed(_)));

        // Write failures alone do not fault the read pass
        assert_eq!(f.reader.current().health.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_commands_per_cycle_bounded() {
        let mut f = fixture(SchedulerConfig {
            max_commands_per_cycle: 2,
            ..SchedulerConfig::default()
        });
        let handles: Vec<_> = (0..3)
            .map(|i| f.queue.submit("pump_duty", Value::Number(f64::from(i))).unwrap())
            .collect();
        f.scheduler.run_cycle().await;
        let writes = f.mock.calls().iter().filter(|c| c.is_write()).count();
        assert_eq!(writes, 2);

        f.scheduler.run_cycle().await;
        for handle in handles {
            assert_eq!(handle.outcome().await, CommandOutcome::Applied);
        }
    }

    #[tokio::test]
    async fn test_cycle_timestamps_monotonic() {
        let mut f = fixture(SchedulerConfig::default());
        f.scheduler.run_cycle().await;
        let first = f.reader.current().snapshot.get("supply_temp").unwrap().refreshed_at;
        f.scheduler.run_cycle().await;
        let second = f.reader.current().snapshot.get("supply_temp").unwrap().refreshed_at;
        assert!(second >= first);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_stale_transition_warned_once() {
        let mut f = fixture(SchedulerConfig {
            failure_threshold: 2,
            ..SchedulerConfig::default()
        });
        f.mock.fail_every_call(TransportError::Timeout("no response".into()));
        for _ in 0..4 {
            assert_eq!(f.scheduler.run_cycle().await, PollState::Fault);
        }
        assert!(f.scheduler.health().is_stale());
        assert!(logs_contain("Link stale after 2 consecutive failed cycles"));

        f.mock.clear_failures();
        f.scheduler.run_cycle().await;
        assert!(logs_contain("Link recovered after 4 failed cycles"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel_and_fails_queued_commands() {
        let f = fixture(SchedulerConfig::default());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(f.scheduler.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(f.reader.current().snapshot.cycle >= 3);

        shutdown.cancel();
        task.await.unwrap();
        assert!(f.queue.submit("pump_duty", Value::Number(1.0)).is_err());
    }
}
