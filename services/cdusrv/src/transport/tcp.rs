//! Modbus TCP connector

use std::io;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::debug;

use super::link::{BoxedStream, Connector};
use crate::protocols::modbus::Framing;

/// TCP endpoint of the device (or of a serial gateway)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpEndpoint {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    502
}

impl Default for TcpEndpoint {
    fn default() -> Self {
        Self {
            host: "192.168.1.150".to_string(),
            port: 5000,
        }
    }
}

impl TcpEndpoint {
    pub fn validate(&self) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err("TCP host cannot be empty".to_string());
        }
        if self.port == 0 {
            return Err("TCP port cannot be zero".to_string());
        }
        Ok(())
    }
}

/// Opens TCP sessions with Nagle disabled
#[derive(Debug, Clone)]
pub struct TcpConnector {
    endpoint: TcpEndpoint,
}

impl TcpConnector {
    pub fn new(endpoint: TcpEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    fn describe(&self) -> String {
        format!("tcp://{}:{}", self.endpoint.host, self.endpoint.port)
    }

    fn framing(&self) -> Framing {
        Framing::Tcp
    }

    async fn connect(&self) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect((self.endpoint.host.as_str(), self.endpoint.port)).await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on {}: {e}", self.describe());
        }
        Ok(Box::new(stream))
    }
}
