//! Ordered failover across several links
//!
//! The CDU is reachable over Modbus TCP and, as a backup, over its RS485 port.
//! An exchange that could not be sent because the active link is down is
//! repeated on the next link within the same call. A request that went out
//! and then timed out or lost its connection may have reached the device, so
//! it is never repeated: the error is returned and the next call starts on
//! the next link. While a fallback is active the primary is tried again every
//! `primary_retry` so the service returns to it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{Transport, TransportResult};
use crate::error::TransportError;

#[derive(Debug)]
struct FailoverState {
    active: usize,
    last_primary_attempt: Instant,
}

#[derive(Debug)]
pub struct FailoverTransport {
    links: Vec<Arc<dyn Transport>>,
    primary_retry: Duration,
    state: Mutex<FailoverState>,
}

impl FailoverTransport {
    /// `links[0]` is the primary
    pub fn new(links: Vec<Arc<dyn Transport>>, primary_retry: Duration) -> Self {
        Self {
            links,
            primary_retry,
            state: Mutex::new(FailoverState {
                active: 0,
                last_primary_attempt: Instant::now(),
            }),
        }
    }

    /// Index of the link that served the last exchange
    pub async fn active_link(&self) -> usize {
        self.state.lock().await.active
    }

    async fn attempt_order(&self) -> Vec<usize> {
        let state = self.state.lock().await;
        let active = state.active.min(self.links.len().saturating_sub(1));
        let mut order = Vec::with_capacity(self.links.len());
        if active != 0 && state.last_primary_attempt.elapsed() >= self.primary_retry {
            order.push(0);
        }
        order.push(active);
        let rest: Vec<usize> = (0..self.links.len()).filter(|i| !order.contains(i)).collect();
        order.extend(rest);
        order
    }

    async fn record_attempt(&self, index: usize, succeeded: bool) {
        let mut state = self.state.lock().await;
        if index == 0 {
            state.last_primary_attempt = Instant::now();
        }
        if succeeded && state.active != index {
            info!(
                "Modbus link switched: {} -> {}",
                self.links[state.active].describe(),
                self.links[index].describe()
            );
            state.active = index;
        }
    }

    /// The request left on `index` but got no usable answer
    async fn record_unanswered(&self, index: usize) {
        let mut state = self.state.lock().await;
        if index == 0 {
            state.last_primary_attempt = Instant::now();
        }
        if state.active == index && self.links.len() > 1 {
            let next = (index + 1) % self.links.len();
            info!(
                "Modbus link switched: {} -> {}",
                self.links[index].describe(),
                self.links[next].describe()
            );
            state.active = next;
        }
    }

    async fn call<T, F, Fut>(&self, op: F) -> TransportResult<T>
    where
        F: Fn(Arc<dyn Transport>) -> Fut,
        Fut: Future<Output = TransportResult<T>>,
    {
        let mut last_error = None;
        for index in self.attempt_order().await {
            let link = Arc::clone(&self.links[index]);
            match op(link).await {
                Ok(value) => {
                    self.record_attempt(index, true).await;
                    return Ok(value);
                },
                Err(e) if e.is_unsent() => {
                    debug!("Link {} down: {e}", self.links[index].describe());
                    self.record_attempt(index, false).await;
                    last_error = Some(e);
                },
                // Possibly delivered; repeating it elsewhere could apply a write twice
                Err(e) if e.is_link_failure() => {
                    debug!("Link {} failed after send: {e}", self.links[index].describe());
                    self.record_unanswered(index).await;
                    return Err(e);
                },
                // The device answered; another link would not change that
                Err(e) => {
                    self.record_attempt(index, true).await;
                    return Err(e);
                },
            }
        }
        Err(last_error.unwrap_or_else(|| TransportError::LinkDown("no links configured".to_string())))
    }
}

#[async_trait]
impl Transport for FailoverTransport {
    fn describe(&self) -> String {
        let links: Vec<String> = self.links.iter().map(|l| l.describe()).collect();
        format!("failover[{}]", links.join(", "))
    }

    async fn read_registers(&self, start: u16, count: u16) -> TransportResult<Vec<u16>> {
        self.call(|link| async move { link.read_registers(start, count).await })
            .await
    }

    async fn read_coils(&self, start: u16, count: u16) -> TransportResult<Vec<bool>> {
        self.call(|link| async move { link.read_coils(start, count).await })
            .await
    }

    async fn write_register(&self, address: u16, value: u16) -> TransportResult<()> {
        self.call(|link| async move { link.write_register(address, value).await })
            .await
    }

    async fn write_registers(&self, start: u16, values: &[u16]) -> TransportResult<()> {
        self.call(|link| async move { link.write_registers(start, values).await })
            .await
    }

    async fn write_coil(&self, address: u16, on: bool) -> TransportResult<()> {
        self.call(|link| async move { link.write_coil(address, on).await })
            .await
    }
}
