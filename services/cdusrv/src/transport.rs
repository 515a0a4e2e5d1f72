//! Transport layer
//!
//! A `Transport` performs exactly one Modbus request/response exchange per
//! call and never retries; retry policy belongs to the poll scheduler. The
//! physical link is serialized inside each implementation, so a transport can
//! be shared freely behind an `Arc`.

pub mod failover;
pub mod link;
pub mod mock;
pub mod serial;
pub mod tcp;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::LinkConfig;
use crate::error::TransportError;

pub use failover::FailoverTransport;
pub use link::{Connector, ModbusLink};
pub use mock::MockTransport;
pub use serial::{RtuEndpoint, SerialConnector};
pub use tcp::{TcpConnector, TcpEndpoint};

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// One Modbus exchange per call
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Short human-readable link description for logs
    fn describe(&self) -> String;

    /// FC03
    async fn read_registers(&self, start: u16, count: u16) -> TransportResult<Vec<u16>>;

    /// FC01
    async fn read_coils(&self, start: u16, count: u16) -> TransportResult<Vec<bool>>;

    /// FC06
    async fn write_register(&self, address: u16, value: u16) -> TransportResult<()>;

    /// FC16
    async fn write_registers(&self, start: u16, values: &[u16]) -> TransportResult<()>;

    /// FC05
    async fn write_coil(&self, address: u16, on: bool) -> TransportResult<()>;
}

/// Where a link goes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Endpoint {
    Tcp(TcpEndpoint),
    Rtu(RtuEndpoint),
}

impl Endpoint {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Endpoint::Tcp(tcp) => tcp.validate(),
            Endpoint::Rtu(rtu) => rtu.validate(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(tcp) => write!(f, "tcp://{}:{}", tcp.host, tcp.port),
            Endpoint::Rtu(rtu) => write!(f, "rtu://{}@{}", rtu.port, rtu.baud_rate),
        }
    }
}

/// Exchange and connect deadlines shared by every link
#[derive(Debug, Clone, Copy)]
pub struct LinkTimings {
    pub exchange_timeout: Duration,
    pub connect_timeout: Duration,
}

fn build_link(endpoint: &Endpoint, slave_id: u8, timings: LinkTimings) -> Arc<dyn Transport> {
    match endpoint {
        Endpoint::Tcp(tcp) => Arc::new(ModbusLink::new(
            TcpConnector::new(tcp.clone()),
            slave_id,
            timings,
        )),
        Endpoint::Rtu(rtu) => Arc::new(ModbusLink::new(
            SerialConnector::new(rtu.clone()),
            slave_id,
            timings,
        )),
    }
}

/// Build the transport described by the link configuration
///
/// With a fallback endpoint the links are wrapped in a `FailoverTransport`.
/// Nothing is opened here; links connect on their first exchange.
pub fn build_transport(config: &LinkConfig) -> Arc<dyn Transport> {
    let timings = LinkTimings {
        exchange_timeout: Duration::from_millis(config.timeout_ms),
        connect_timeout: Duration::from_millis(config.connect_timeout_ms),
    };
    let primary = build_link(&config.primary, config.slave_id, timings);
    match &config.fallback {
        None => primary,
        Some(fallback) => Arc::new(FailoverTransport::new(
            vec![primary, build_link(fallback, config.slave_id, timings)],
            Duration::from_secs(config.primary_retry_secs),
        )),
    }
}
