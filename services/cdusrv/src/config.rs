//! Service configuration
//!
//! Layered with figment, lowest priority first:
//! built-in defaults, the config file (format chosen by extension), then
//! `CDUSRV_`-prefixed environment variables with `__` as the section
//! separator, e.g. `CDUSRV_POLLING__INTERVAL_MS=500`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::ByteOrder;
use crate::engine::EngineConfig;
use crate::error::{CduError, Result};
use crate::protocols::modbus::constants::MODBUS_MAX_READ_REGISTERS;
use crate::register_map::RegisterMap;
use crate::scheduler::{RangePolicy, SchedulerConfig};
use crate::transport::{Endpoint, TcpEndpoint};

pub const ENV_PREFIX: &str = "CDUSRV_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSection {
    pub name: String,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            name: "cdusrv".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    /// Rolling log files go here; console only when unset
    pub dir: Option<PathBuf>,
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            json: false,
        }
    }
}

/// Physical link(s) to the CDU controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub primary: Endpoint,
    pub fallback: Option<Endpoint>,
    pub slave_id: u8,
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// How often a fallback link tries the primary again
    pub primary_retry_secs: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            primary: Endpoint::Tcp(TcpEndpoint::default()),
            fallback: None,
            slave_id: 1,
            timeout_ms: 300,
            connect_timeout_ms: 2000,
            primary_retry_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSection {
    pub interval_ms: u64,
    pub failure_threshold: u32,
    pub max_commands_per_cycle: usize,
    pub max_read_width: u16,
    pub range_violation: RangePolicy,
    pub permanent_exception_codes: Vec<u8>,
}

impl Default for PollingSection {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            failure_threshold: 5,
            max_commands_per_cycle: 8,
            max_read_width: 64,
            range_violation: RangePolicy::Flag,
            permanent_exception_codes: vec![0x01, 0x02, 0x03],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsSection {
    pub queue_capacity: usize,
    pub submit_timeout_ms: u64,
}

impl Default for CommandsSection {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            submit_timeout_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistersSection {
    /// CSV register table; relative paths resolve against the config file
    pub source: PathBuf,
    pub byte_order: ByteOrder,
}

impl Default for RegistersSection {
    fn default() -> Self {
        Self {
            source: PathBuf::from("cdu120kw_registers.csv"),
            byte_order: ByteOrder::Abcd,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CduConfig {
    pub service: ServiceSection,
    pub logging: LoggingSection,
    pub link: LinkConfig,
    pub polling: PollingSection,
    pub commands: CommandsSection,
    pub registers: RegistersSection,
}

impl CduConfig {
    /// Load defaults, then `path`, then the environment
    ///
    /// A relative register source is rewritten against the directory that
    /// holds `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CduError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }

        let figment = Figment::from(Serialized::defaults(CduConfig::default()));
        let figment = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
            Some("toml") => figment.merge(Toml::file(path)),
            Some("json") => figment.merge(Json::file(path)),
            _ => {
                return Err(CduError::Config(format!(
                    "unsupported config format: {}",
                    path.display()
                )))
            },
        };

        let mut config: CduConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        if config.registers.source.is_relative() {
            if let Some(dir) = path.parent() {
                config.registers.source = dir.join(&config.registers.source);
            }
        }

        config.validate()?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(CduError::Config(msg));

        if self.service.name.trim().is_empty() {
            return invalid("service.name cannot be empty".into());
        }
        if common::logging::parse_level(&self.logging.level).is_none() {
            return invalid(format!("logging.level '{}' is not a level", self.logging.level));
        }

        if let Err(e) = self.link.primary.validate() {
            return invalid(format!("link.primary: {e}"));
        }
        if let Some(fallback) = &self.link.fallback {
            if let Err(e) = fallback.validate() {
                return invalid(format!("link.fallback: {e}"));
            }
        }
        // 0 is accepted only by TCP gateways
        let has_rtu = matches!(self.link.primary, Endpoint::Rtu(_))
            || matches!(self.link.fallback, Some(Endpoint::Rtu(_)));
        if self.link.slave_id > 247 || (self.link.slave_id == 0 && has_rtu) {
            return invalid(format!("link.slave_id {} out of range", self.link.slave_id));
        }
        if self.link.timeout_ms == 0 || self.link.connect_timeout_ms == 0 {
            return invalid("link timeouts must be positive".into());
        }

        if self.polling.interval_ms == 0 {
            return invalid("polling.interval_ms must be positive".into());
        }
        if self.polling.failure_threshold == 0 {
            return invalid("polling.failure_threshold must be positive".into());
        }
        if self.polling.max_commands_per_cycle == 0 {
            return invalid("polling.max_commands_per_cycle must be positive".into());
        }
        if !(2..=MODBUS_MAX_READ_REGISTERS).contains(&self.polling.max_read_width) {
            return invalid(format!(
                "polling.max_read_width must be 2..={MODBUS_MAX_READ_REGISTERS}, got {}",
                self.polling.max_read_width
            ));
        }

        if self.commands.queue_capacity == 0 {
            return invalid("commands.queue_capacity must be positive".into());
        }
        if self.commands.submit_timeout_ms == 0 {
            return invalid("commands.submit_timeout_ms must be positive".into());
        }

        if self.registers.source.as_os_str().is_empty() {
            return invalid("registers.source cannot be empty".into());
        }
        Ok(())
    }

    pub fn load_register_map(&self) -> Result<RegisterMap> {
        RegisterMap::from_csv_path(&self.registers.source, self.polling.max_read_width)
    }

    pub fn log_config(&self) -> common::LogConfig {
        common::LogConfig {
            service_name: self.service.name.clone(),
            log_dir: self.logging.dir.clone(),
            level: common::logging::parse_level(&self.logging.level)
                .unwrap_or(tracing::Level::INFO),
            enable_json: self.logging.json,
            ..common::LogConfig::default()
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            scheduler: SchedulerConfig {
                interval: Duration::from_millis(self.polling.interval_ms),
                failure_threshold: self.polling.failure_threshold,
                max_commands_per_cycle: self.polling.max_commands_per_cycle,
                range_policy: self.polling.range_violation,
                permanent_exception_codes: self.polling.permanent_exception_codes.clone(),
            },
            byte_order: self.registers.byte_order,
            queue_capacity: self.commands.queue_capacity,
            submit_timeout: Duration::from_millis(self.commands.submit_timeout_ms),
        }
    }
}
