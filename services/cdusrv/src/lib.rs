//! cdusrv - Modbus polling and control engine for a 120kW CDU
//!
//! The service keeps a consistent, timestamped view of the unit's
//! temperatures, pressures, flow, pump and fan state, and accepts typed
//! setpoint writes that are applied between read passes.
//!
//! ```text
//!   CduHandle ──submit──▶ CommandQueue ──drain──▶ PollScheduler ──▶ Transport ──▶ CDU
//!       ▲                                             │
//!       └────────────── StateReader ◀── publish ──────┘
//! ```
//!
//! Module map:
//! - `register_map`: register table loaded from CSV, read coalescing
//! - `codec`: raw words to typed values and back
//! - `protocols::modbus`: PDU building, MBAP and RTU framing
//! - `transport`: TCP and RTU links, failover, test mock
//! - `command`: bounded write queue with per-command outcomes
//! - `store`: published snapshot and link health
//! - `scheduler`: the poll cycle
//! - `engine`: wiring and the public handle
//! - `config`: layered service configuration

pub mod codec;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod protocols;
pub mod register_map;
pub mod scheduler;
pub mod store;
pub mod transport;

pub use codec::{ByteOrder, Codec, Value};
pub use command::{CommandHandle, CommandOutcome};
pub use config::CduConfig;
pub use engine::{CduHandle, EngineConfig};
pub use error::{CduError, Result};
pub use register_map::{RegisterDescriptor, RegisterMap};
pub use scheduler::{PollScheduler, RangePolicy, SchedulerConfig};
pub use store::{DeviceStatus, LinkHealth, LinkStatus, TelemetrySnapshot};
pub use transport::{build_transport, Transport};
