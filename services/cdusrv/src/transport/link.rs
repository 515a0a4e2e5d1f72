//! Framed Modbus link over any byte stream
//!
//! `ModbusLink` owns at most one open session. The session is opened lazily on
//! the first exchange and dropped after a timeout, I/O failure or framing
//! error so the next exchange starts from a clean connection. A mutex around
//! the session keeps exactly one request in flight.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::hex::format_hex_pretty;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info};

use super::{LinkTimings, Transport, TransportResult};
use crate::error::TransportError;
use crate::protocols::modbus::constants::MBAP_HEADER_LEN;
use crate::protocols::modbus::frame::{
    build_rtu_frame, build_tcp_frame, parse_rtu_frame, rtu_response_length, MbapHeader,
};
use crate::protocols::modbus::pdu::{self, ModbusPdu};
use crate::protocols::modbus::Framing;

/// Byte stream carrying Modbus frames
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens the physical link
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    fn describe(&self) -> String;

    fn framing(&self) -> Framing;

    /// Silence required before each request (RTU inter-frame gap)
    fn frame_gap(&self) -> Duration {
        Duration::ZERO
    }

    async fn connect(&self) -> io::Result<BoxedStream>;
}

/// Modbus master bound to one slave on one link
pub struct ModbusLink<C> {
    connector: C,
    unit_id: u8,
    timings: LinkTimings,
    session: Mutex<Option<BoxedStream>>,
    transaction_id: AtomicU16,
}

impl<C: Connector> fmt::Debug for ModbusLink<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModbusLink")
            .field("connector", &self.connector)
            .field("unit_id", &self.unit_id)
            .field("timings", &self.timings)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> ModbusLink<C> {
    pub fn new(connector: C, unit_id: u8, timings: LinkTimings) -> Self {
        Self {
            connector,
            unit_id,
            timings,
            session: Mutex::new(None),
            transaction_id: AtomicU16::new(0),
        }
    }

    /// Whether a session is currently open
    pub async fn is_connected(&self) -> bool {
        self.session.lock().await.is_some()
    }

    async fn open(&self) -> TransportResult<BoxedStream> {
        let target = self.connector.describe();
        match timeout(self.timings.connect_timeout, self.connector.connect()).await {
            Ok(Ok(stream)) => {
                info!("Modbus link connected: {target}");
                Ok(stream)
            },
            Ok(Err(e)) => Err(TransportError::LinkDown(format!("{target}: {e}"))),
            Err(_) => Err(TransportError::LinkDown(format!(
                "{target}: connect timed out after {:?}",
                self.timings.connect_timeout
            ))),
        }
    }

    /// Send one request PDU and return the response PDU
    async fn exchange(&self, request: &ModbusPdu) -> TransportResult<Vec<u8>> {
        let mut session = self.session.lock().await;
        if session.is_none() {
            *session = Some(self.open().await?);
        }
        let Some(stream) = session.as_mut() else {
            return Err(TransportError::LinkDown(format!(
                "{}: no session",
                self.connector.describe()
            )));
        };

        let outcome = timeout(self.timings.exchange_timeout, self.transact(stream, request)).await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(format!(
                "{}: no response within {:?}",
                self.connector.describe(),
                self.timings.exchange_timeout
            ))),
        };

        // A device exception is a clean exchange; anything else leaves the
        // stream in an unknown state.
        if let Err(e) = &result {
            if !matches!(e, TransportError::Exception { .. }) {
                debug!("Dropping Modbus session {}: {e}", self.connector.describe());
                *session = None;
            }
        }
        result
    }

    async fn transact(&self, stream: &mut BoxedStream, request: &ModbusPdu) -> TransportResult<Vec<u8>> {
        match self.connector.framing() {
            Framing::Tcp => self.transact_tcp(stream, request).await,
            Framing::Rtu => self.transact_rtu(stream, request).await,
        }
    }

    async fn transact_tcp(&self, stream: &mut BoxedStream, request: &ModbusPdu) -> TransportResult<Vec<u8>> {
        let tid = self.transaction_id.fetch_add(1, Ordering::Relaxed);
        let frame = build_tcp_frame(tid, self.unit_id, request.as_slice());
        self.send(stream, &frame).await?;

        let mut header = [0u8; MBAP_HEADER_LEN];
        stream.read_exact(&mut header).await.map_err(|e| self.io_error(e))?;
        let mbap = MbapHeader::parse(&header)?;
        let mut pdu = vec![0u8; mbap.pdu_len()];
        stream.read_exact(&mut pdu).await.map_err(|e| self.io_error(e))?;
        debug!(
            "RX {}: {} {}",
            self.connector.describe(),
            format_hex_pretty(&header),
            format_hex_pretty(&pdu)
        );

        if mbap.transaction_id != tid {
            return Err(TransportError::Protocol(format!(
                "transaction id mismatch: sent {tid}, got {}",
                mbap.transaction_id
            )));
        }
        if mbap.unit_id != self.unit_id {
            return Err(TransportError::Protocol(format!(
                "response from unit {}, expected {}",
                mbap.unit_id, self.unit_id
            )));
        }
        Ok(pdu)
    }

    async fn transact_rtu(&self, stream: &mut BoxedStream, request: &ModbusPdu) -> TransportResult<Vec<u8>> {
        let gap = self.connector.frame_gap();
        if !gap.is_zero() {
            tokio::time::sleep(gap).await;
        }
        let frame = build_rtu_frame(self.unit_id, request.as_slice());
        self.send(stream, &frame).await?;

        let mut buffer = vec![0u8; 2];
        stream.read_exact(&mut buffer).await.map_err(|e| self.io_error(e))?;
        let total = loop {
            if let Some(total) = rtu_response_length(&buffer)? {
                break total;
            }
            let mut byte = [0u8; 1];
            stream.read_exact(&mut byte).await.map_err(|e| self.io_error(e))?;
            buffer.push(byte[0]);
        };
        if total > buffer.len() {
            let already = buffer.len();
            buffer.resize(total, 0);
            stream
                .read_exact(&mut buffer[already..])
                .await
                .map_err(|e| self.io_error(e))?;
        }
        debug!("RX {}: {}", self.connector.describe(), format_hex_pretty(&buffer));

        Ok(parse_rtu_frame(self.unit_id, &buffer)?.to_vec())
    }

    async fn send(&self, stream: &mut BoxedStream, frame: &[u8]) -> TransportResult<()> {
        debug!("TX {}: {}", self.connector.describe(), format_hex_pretty(frame));
        stream.write_all(frame).await.map_err(|e| self.io_error(e))?;
        stream.flush().await.map_err(|e| self.io_error(e))
    }

    fn io_error(&self, e: io::Error) -> TransportError {
        TransportError::ConnectionLost(format!("{}: {e}", self.connector.describe()))
    }
}

#[async_trait]
impl<C: Connector> Transport for ModbusLink<C> {
    fn describe(&self) -> String {
        format!("{} (unit {})", self.connector.describe(), self.unit_id)
    }

    async fn read_registers(&self, start: u16, count: u16) -> TransportResult<Vec<u16>> {
        let request = pdu::read_holding_registers_request(start, count)?;
        let response = self.exchange(&request).await?;
        pdu::parse_read_registers_response(&response, count)
    }

    async fn read_coils(&self, start: u16, count: u16) -> TransportResult<Vec<bool>> {
        let request = pdu::read_coils_request(start, count)?;
        let response = self.exchange(&request).await?;
        pdu::parse_read_coils_response(&response, count)
    }

    async fn write_register(&self, address: u16, value: u16) -> TransportResult<()> {
        let request = pdu::write_single_register_request(address, value)?;
        let response = self.exchange(&request).await?;
        pdu::check_write_response(&request, &response)
    }

    async fn write_registers(&self, start: u16, values: &[u16]) -> TransportResult<()> {
        let request = pdu::write_multiple_registers_request(start, values)?;
        let response = self.exchange(&request).await?;
        pdu::check_write_response(&request, &response)
    }

    async fn write_coil(&self, address: u16, on: bool) -> TransportResult<()> {
        let request = pdu::write_single_coil_request(address, on)?;
        let response = self.exchange(&request).await?;
        pdu::check_write_response(&request, &response)
    }
}
