//! Mutex Wrapper: a fair FIFO mutual-exclusion lock around a Bus Client.
//!
//! RTU is half-duplex with inter-character framing; two overlapping
//! requests corrupt the frame. TCP's client library also assumes
//! exclusive use. One lock per Bus Client is correct for both.
//! `tokio::sync::Mutex` already queues waiters FIFO, so this is a thin
//! pass-through rather than a hand-rolled queue.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;

use crate::error::BusError;
use crate::transport::connection::BusClient;

/// Wraps a Bus Client in a FIFO lock. Every Modbus operation acquires
/// the lock before delegating and releases it on both success and
/// failure. `close` bypasses the lock entirely so a stuck in-flight read
/// cannot block shutdown.
pub struct MutexBusClient {
    inner: Mutex<Box<dyn BusClient>>,
    closed: AtomicBool,
}

impl MutexBusClient {
    pub fn new(client: Box<dyn BusClient>) -> Self {
        Self { inner: Mutex::new(client), closed: AtomicBool::new(false) }
    }

    /// Run one Modbus operation against the guarded client under the
    /// lock. `program` sets the slave id and timeout before dispatching
    /// the actual call, so the slave address is bound to the request
    /// rather than the connection.
    pub async fn with_slave<T>(
        &self,
        slave_id: u8,
        timeout: Duration,
        op: impl for<'a> FnOnce(&'a mut Box<dyn BusClient>) -> Pin<Box<dyn Future<Output = Result<T, BusError>> + Send + 'a>>,
    ) -> Result<T, BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        let mut guard = self.inner.lock().await;
        guard.set_slave(slave_id);
        guard.set_timeout(timeout);
        op(&mut guard).await
    }

    /// Bypasses the lock entirely: a hung in-flight read must never
    /// make shutdown block. The `closed` flag is set first so every
    /// subsequent (and any still-queued) `with_slave` call fails fast
    /// instead of queuing behind a connection that's going away. Only
    /// an uncontended client is actually closed here; a contended one
    /// (an operation genuinely in flight) is left for its own future to
    /// observe the failure or time out on — the point of bypassing is
    /// that this call returns immediately either way.
    pub async fn close(&self) -> Result<(), BusError> {
        self.closed.store(true, Ordering::Release);
        match self.inner.try_lock() {
            Ok(mut guard) => guard.close().await,
            Err(_) => Ok(()),
        }
    }
}
