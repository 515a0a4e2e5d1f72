//! Modbus RTU connector over a serial port

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_serial::SerialPortBuilderExt;

use super::link::{BoxedStream, Connector};
use crate::protocols::modbus::frame::rtu_frame_gap;
use crate::protocols::modbus::Framing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// Serial line settings; the CDU ships at 115200 8N1
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RtuEndpoint {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
}

impl Default for RtuEndpoint {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
        }
    }
}

impl RtuEndpoint {
    pub fn validate(&self) -> Result<(), String> {
        if self.port.trim().is_empty() {
            return Err("Serial port path cannot be empty".to_string());
        }
        if self.baud_rate == 0 {
            return Err("Baud rate must be greater than zero".to_string());
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(format!("Data bits must be 5-8, got {}", self.data_bits));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(format!("Stop bits must be 1 or 2, got {}", self.stop_bits));
        }
        Ok(())
    }

    fn tokio_data_bits(&self) -> tokio_serial::DataBits {
        match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        }
    }

    fn tokio_parity(&self) -> tokio_serial::Parity {
        match self.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        }
    }

    fn tokio_stop_bits(&self) -> tokio_serial::StopBits {
        match self.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        }
    }
}

/// Opens the serial port on demand
#[derive(Debug, Clone)]
pub struct SerialConnector {
    endpoint: RtuEndpoint,
}

impl SerialConnector {
    pub fn new(endpoint: RtuEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl Connector for SerialConnector {
    fn describe(&self) -> String {
        format!("rtu://{}@{}", self.endpoint.port, self.endpoint.baud_rate)
    }

    fn framing(&self) -> Framing {
        Framing::Rtu
    }

    fn frame_gap(&self) -> Duration {
        rtu_frame_gap(self.endpoint.baud_rate)
    }

    async fn connect(&self) -> io::Result<BoxedStream> {
        let port = tokio_serial::new(&self.endpoint.port, self.endpoint.baud_rate)
            .data_bits(self.endpoint.tokio_data_bits())
            .parity(self.endpoint.tokio_parity())
            .stop_bits(self.endpoint.tokio_stop_bits())
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(io::Error::from)?;
        Ok(Box::new(port))
    }
}
