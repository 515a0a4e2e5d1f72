//! Simulated CDU for tests and dry runs
//!
//! Holds a holding-register and coil image, records every call, and fails
//! on demand: on every call, on reads starting at a given address, on writes
//! to a given address, or once for the next call.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{Transport, TransportResult};
use crate::error::TransportError;

/// One recorded exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    ReadRegisters { start: u16, count: u16 },
    ReadCoils { start: u16, count: u16 },
    WriteRegister { address: u16, value: u16 },
    WriteRegisters { start: u16, values: Vec<u16> },
    WriteCoil { address: u16, on: bool },
}

impl MockCall {
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            MockCall::WriteRegister { .. } | MockCall::WriteRegisters { .. } | MockCall::WriteCoil { .. }
        )
    }
}

#[derive(Debug, Default)]
struct MockState {
    holding: HashMap<u16, u16>,
    coils: HashMap<u16, bool>,
    calls: Vec<MockCall>,
    fail_always: Option<TransportError>,
    fail_next: VecDeque<TransportError>,
    fail_reads_at: HashMap<u16, TransportError>,
    fail_writes_at: HashMap<u16, TransportError>,
    latency: Duration,
}

#[derive(Debug, Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_register(&self, address: u16, value: u16) {
        self.state().holding.insert(address, value);
    }

    pub fn set_registers(&self, start: u16, values: &[u16]) {
        let mut state = self.state();
        for (offset, value) in values.iter().enumerate() {
            state.holding.insert(start.wrapping_add(offset as u16), *value);
        }
    }

    pub fn set_coil(&self, address: u16, on: bool) {
        self.state().coils.insert(address, on);
    }

    pub fn register(&self, address: u16) -> Option<u16> {
        self.state().holding.get(&address).copied()
    }

    pub fn coil(&self, address: u16) -> Option<bool> {
        self.state().coils.get(&address).copied()
    }

    /// Every call fails until `clear_failures`
    pub fn fail_every_call(&self, error: TransportError) {
        self.state().fail_always = Some(error);
    }

    /// The next call fails once
    pub fn fail_next_call(&self, error: TransportError) {
        self.state().fail_next.push_back(error);
    }

    /// Reads starting at `start` fail until `clear_failures`
    pub fn fail_reads_at(&self, start: u16, error: TransportError) {
        self.state().fail_reads_at.insert(start, error);
    }

    /// Writes to `address` fail until `clear_failures`
    pub fn fail_writes_at(&self, address: u16, error: TransportError) {
        self.state().fail_writes_at.insert(address, error);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.fail_always = None;
        state.fail_next.clear();
        state.fail_reads_at.clear();
        state.fail_writes_at.clear();
    }

    /// Delay applied to every exchange
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state().calls.len()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Record the call and decide whether it fails
    async fn begin(&self, call: MockCall) -> TransportResult<()> {
        let (latency, failure) = {
            let mut state = self.state();
            let failure = state
                .fail_next
                .pop_front()
                .or_else(|| state.fail_always.clone())
                .or_else(|| match &call {
                    MockCall::ReadRegisters { start, .. } | MockCall::ReadCoils { start, .. } => {
                        state.fail_reads_at.get(start).cloned()
                    },
                    MockCall::WriteRegister { address, .. } | MockCall::WriteCoil { address, .. } => {
                        state.fail_writes_at.get(address).cloned()
                    },
                    MockCall::WriteRegisters { start, .. } => state.fail_writes_at.get(start).cloned(),
                });
            debug!("Mock exchange {call:?} -> {failure:?}");
            state.calls.push(call);
            (state.latency, failure)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn describe(&self) -> String {
        "mock".to_string()
    }

    async fn read_registers(&self, start: u16, count: u16) -> TransportResult<Vec<u16>> {
        self.begin(MockCall::ReadRegisters { start, count }).await?;
        let state = self.state();
        Ok((0..count)
            .map(|offset| {
                state
                    .holding
                    .get(&start.wrapping_add(offset))
                    .copied()
                    .unwrap_or(0)
            })
            .collect())
    }

    async fn read_coils(&self, start: u16, count: u16) -> TransportResult<Vec<bool>> {
        self.begin(MockCall::ReadCoils { start, count }).await?;
        let state = self.state();
        Ok((0..count)
            .map(|offset| state.coils.get(&start.wrapping_add(offset)).copied().unwrap_or(false))
            .collect())
    }

    async fn write_register(&self, address: u16, value: u16) -> TransportResult<()> {
        self.begin(MockCall::WriteRegister { address, value }).await?;
        self.set_register(address, value);
        Ok(())
    }

    async fn write_registers(&self, start: u16, values: &[u16]) -> TransportResult<()> {
        self.begin(MockCall::WriteRegisters {
            start,
            values: values.to_vec(),
        })
        .await?;
        self.set_registers(start, values);
        Ok(())
    }

    async fn write_coil(&self, address: u16, on: bool) -> TransportResult<()> {
        self.begin(MockCall::WriteCoil { address, on }).await?;
        self.set_coil(address, on);
        Ok(())
    }
}
