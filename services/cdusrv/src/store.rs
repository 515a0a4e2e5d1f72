//! State store: the published view of the device
//!
//! The poll scheduler is the only writer. Every publication is a complete,
//! immutable `DeviceStatus` behind an `Arc`, so readers never observe a
//! half-applied update and never hold a lock while they work with it.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::codec::Value;

/// One decoded register in the snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryField {
    pub value: Value,
    pub unit: String,
    /// Start time of the cycle that read this value
    pub refreshed_at: DateTime<Utc>,
    /// Decoded outside the register's valid range
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub out_of_range: bool,
}

/// Last-known-good telemetry, keyed by register name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    /// Poll cycle that last refreshed any field
    pub cycle: u64,
    pub fields: BTreeMap<String, TelemetryField>,
}

impl TelemetrySnapshot {
    pub fn get(&self, name: &str) -> Option<&TelemetryField> {
        self.fields.get(name)
    }

    pub fn value(&self, name: &str) -> Option<Value> {
        self.fields.get(name).map(|f| f.value)
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.value(name).and_then(|v| v.as_f64())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Summary of link freshness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    /// No successful cycle yet
    Connecting,
    /// Last cycle succeeded
    Online,
    /// Failing, below the stale threshold
    Degraded,
    /// Failed at least `failure_threshold` cycles in a row; data is unreliable
    Stale,
}

/// Communication health, updated once per poll cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkHealth {
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub failure_threshold: u32,
}

impl LinkHealth {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            consecutive_failures: 0,
            last_success: None,
            last_error: None,
            failure_threshold: failure_threshold.max(1),
        }
    }

    pub fn status(&self) -> LinkStatus {
        if self.consecutive_failures >= self.failure_threshold {
            LinkStatus::Stale
        } else if self.last_success.is_none() {
            LinkStatus::Connecting
        } else if self.consecutive_failures > 0 {
            LinkStatus::Degraded
        } else {
            LinkStatus::Online
        }
    }

    pub fn is_stale(&self) -> bool {
        self.status() == LinkStatus::Stale
    }

    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.consecutive_failures = 0;
        self.last_success = Some(at);
    }

    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = Some(error.into());
    }
}

/// A consistent (snapshot, health) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub snapshot: Arc<TelemetrySnapshot>,
    pub health: LinkHealth,
}

impl DeviceStatus {
    pub fn initial(failure_threshold: u32) -> Self {
        Self {
            snapshot: Arc::new(TelemetrySnapshot::default()),
            health: LinkHealth::new(failure_threshold),
        }
    }
}

/// Write side, held by the poll scheduler
#[derive(Debug)]
pub struct StatePublisher {
    sender: watch::Sender<Arc<DeviceStatus>>,
}

/// Read side; clone freely
#[derive(Debug, Clone)]
pub struct StateReader {
    receiver: watch::Receiver<Arc<DeviceStatus>>,
}

/// Create a store seeded with `initial`
pub fn state_store(initial: DeviceStatus) -> (StatePublisher, StateReader) {
    let (sender, receiver) = watch::channel(Arc::new(initial));
    (StatePublisher { sender }, StateReader { receiver })
}

impl StatePublisher {
    /// Replace the published status; returns false (and wakes nobody) when
    /// `status` equals what is already published
    pub fn publish(&self, status: DeviceStatus) -> bool {
        self.sender.send_if_modified(|current| {
            if **current == status {
                false
            } else {
                *current = Arc::new(status);
                true
            }
        })
    }

    pub fn current(&self) -> Arc<DeviceStatus> {
        Arc::clone(&self.sender.borrow())
    }

    pub fn reader(&self) -> StateReader {
        StateReader {
            receiver: self.sender.subscribe(),
        }
    }
}

impl StateReader {
    /// Latest published status; never waits on the scheduler
    pub fn current(&self) -> Arc<DeviceStatus> {
        Arc::clone(&self.receiver.borrow())
    }

    /// Stream of publications made after this call
    ///
    /// A slow consumer skips intermediate publications and only sees the
    /// latest one. The stream ends when the publisher is dropped.
    pub fn subscribe(&self) -> impl Stream<Item = Arc<DeviceStatus>> + Send + 'static {
        let mut receiver = self.receiver.clone();
        drop(receiver.borrow_and_update());
        futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.changed().await.ok()?;
            let status = Arc::clone(&receiver.borrow_and_update());
            Some((status, receiver))
        })
    }
}
