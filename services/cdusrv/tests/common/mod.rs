//! Shared fixtures for cdusrv integration tests
//!
//! `FakeSlave` is a minimal Modbus slave that serves FC01/03/05/06/16 over an
//! in-memory duplex pipe, speaking either MBAP or RTU framing. It doubles as
//! the `Connector` handed to `ModbusLink`, so each connect spawns a fresh
//! server task on a new pipe.

#![allow(dead_code)]
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use cdusrv::protocols::modbus::frame::{build_rtu_frame, build_tcp_frame};
use cdusrv::protocols::modbus::Framing;
use cdusrv::register_map::RegisterMap;
use cdusrv::transport::link::{BoxedStream, Connector};
use cdusrv::transport::{LinkTimings, ModbusLink};

pub const UNIT_ID: u8 = 1;

/// How the slave answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveMode {
    Normal,
    /// Answer every request with this exception code
    Exception(u8),
    /// Read requests, never answer
    Silent,
    /// Answer RTU requests with a damaged CRC
    CorruptCrc,
    /// Refuse connections
    Refuse,
    /// Read a request, then close the connection
    HangUp,
}

#[derive(Debug, Default)]
struct SlaveImage {
    holding: HashMap<u16, u16>,
    coils: HashMap<u16, bool>,
}

#[derive(Debug, Clone)]
pub struct FakeSlave {
    framing: Framing,
    image: Arc<Mutex<SlaveImage>>,
    mode: Arc<Mutex<SlaveMode>>,
    connects: Arc<AtomicUsize>,
}

impl FakeSlave {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            image: Arc::default(),
            mode: Arc::new(Mutex::new(SlaveMode::Normal)),
            connects: Arc::default(),
        }
    }

    pub fn set_register(&self, address: u16, value: u16) {
        self.image.lock().unwrap().holding.insert(address, value);
    }

    pub fn register(&self, address: u16) -> Option<u16> {
        self.image.lock().unwrap().holding.get(&address).copied()
    }

    pub fn set_coil(&self, address: u16, on: bool) {
        self.image.lock().unwrap().coils.insert(address, on);
    }

    pub fn coil(&self, address: u16) -> Option<bool> {
        self.image.lock().unwrap().coils.get(&address).copied()
    }

    pub fn set_mode(&self, mode: SlaveMode) {
        *self.mode.lock().unwrap() = mode;
    }

    fn mode(&self) -> SlaveMode {
        *self.mode.lock().unwrap()
    }

    /// Successful connections so far
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Build the response PDU for a request PDU
    fn respond(&self, request: &[u8]) -> Vec<u8> {
        let function = request[0];
        if let SlaveMode::Exception(code) = self.mode() {
            return vec![function | 0x80, code];
        }
        let word = |i: usize| u16::from_be_bytes([request[i], request[i + 1]]);
        let mut image = self.image.lock().unwrap();
        match function {
            0x03 => {
                let (start, count) = (word(1), word(3));
                let mut response = vec![0x03, (count * 2) as u8];
                for offset in 0..count {
                    let value = image.holding.get(&(start + offset)).copied().unwrap_or(0);
                    response.extend_from_slice(&value.to_be_bytes());
                }
                response
            },
            0x01 => {
                let (start, count) = (word(1), word(3));
                let mut bytes = vec![0u8; usize::from(count).div_ceil(8)];
                for offset in 0..count {
                    if image.coils.get(&(start + offset)).copied().unwrap_or(false) {
                        bytes[usize::from(offset / 8)] |= 1 << (offset % 8);
                    }
                }
                let mut response = vec![0x01, bytes.len() as u8];
                response.extend(bytes);
                response
            },
            0x05 => {
                image.coils.insert(word(1), word(3) == 0xFF00);
                request.to_vec()
            },
            0x06 => {
                image.holding.insert(word(1), word(3));
                request.to_vec()
            },
            0x10 => {
                let (start, count) = (word(1), word(3));
                for offset in 0..count {
                    let value = word(6 + usize::from(offset) * 2);
                    image.holding.insert(start + offset, value);
                }
                request[..5].to_vec()
            },
            other => vec![other | 0x80, 0x01],
        }
    }

    async fn serve(self, mut stream: DuplexStream) {
        loop {
            let served = match self.framing {
                Framing::Tcp => self.serve_tcp(&mut stream).await,
                Framing::Rtu => self.serve_rtu(&mut stream).await,
            };
            if served.is_err() {
                return;
            }
        }
    }

    async fn serve_tcp(&self, stream: &mut DuplexStream) -> io::Result<()> {
        let mut header = [0u8; 7];
        stream.read_exact(&mut header).await?;
        let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
        let mut pdu = vec![0u8; length - 1];
        stream.read_exact(&mut pdu).await?;
        match self.mode() {
            SlaveMode::Silent => return Ok(()),
            SlaveMode::HangUp => return Err(io::ErrorKind::ConnectionAborted.into()),
            _ => {},
        }
        let tid = u16::from_be_bytes([header[0], header[1]]);
        let response = self.respond(&pdu);
        stream.write_all(&build_tcp_frame(tid, header[6], &response)).await
    }

    async fn serve_rtu(&self, stream: &mut DuplexStream) -> io::Result<()> {
        let mut frame = vec![0u8; 7];
        stream.read_exact(&mut frame).await?;
        let remaining = if frame[1] == 0x10 {
            usize::from(frame[6]) + 2
        } else {
            1
        };
        let start = frame.len();
        frame.resize(start + remaining, 0);
        stream.read_exact(&mut frame[start..]).await?;
        match self.mode() {
            SlaveMode::Silent => return Ok(()),
            SlaveMode::HangUp => return Err(io::ErrorKind::ConnectionAborted.into()),
            _ => {},
        }
        let pdu = &frame[1..frame.len() - 2];
        let mut response = build_rtu_frame(frame[0], &self.respond(pdu)).to_vec();
        if self.mode() == SlaveMode::CorruptCrc {
            if let Some(last) = response.last_mut() {
                *last ^= 0xFF;
            }
        }
        stream.write_all(&response).await
    }
}

#[async_trait]
impl Connector for FakeSlave {
    fn describe(&self) -> String {
        format!("fake-{:?}", self.framing)
    }

    fn framing(&self) -> Framing {
        self.framing
    }

    async fn connect(&self) -> io::Result<BoxedStream> {
        if self.mode() == SlaveMode::Refuse {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(1024);
        tokio::spawn(self.clone().serve(server));
        Ok(Box::new(client))
    }
}

pub fn timings() -> LinkTimings {
    LinkTimings {
        exchange_timeout: Duration::from_millis(300),
        connect_timeout: Duration::from_millis(500),
    }
}

/// A link and a handle on the slave behind it
pub fn link(framing: Framing) -> (ModbusLink<FakeSlave>, FakeSlave) {
    let slave = FakeSlave::new(framing);
    (ModbusLink::new(slave.clone(), UNIT_ID, timings()), slave)
}

pub const TEST_MAP: &str = "name,address,kind,width,type,scale,unit,access,min,max,poll_every,description
supply_temp,100,holding,1,signed,0.1,°C,read_only,-40,500,1,Supply temperature
return_temp,101,holding,1,signed,0.1,°C,read_only,-40,500,1,Return temperature
inlet_pressure,200,holding,1,unsigned,0.001,mA,read_only,0,25,1,Inlet pressure loop current
flow_total,250,holding,2,unsigned,,L,read_only,,,1,Totalised flow
pump1_duty,300,holding,1,unsigned,0.01,%,read_write,0,100,1,Pump 1 duty
fan_setpoint,310,holding,2,signed,0.1,rpm,read_write,-100000,100000,1,Fan speed setpoint
pump_pwm_amplitude,320,holding,1,unsigned,0.001,V,read_write,0,10,10,Pump PWM amplitude
pump1_run,784,coil,1,bool,,,read_write,,,1,Pump 1 on/off
";

pub fn test_map() -> RegisterMap {
    RegisterMap::from_csv_reader(TEST_MAP.as_bytes(), 64).unwrap()
}
