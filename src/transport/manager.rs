//! Transport Manager: a pool of live Bus Clients keyed by `BusKey`, so
//! every caller asking for the same physical bus shares one Mutex
//! Wrapper instead of racing to open redundant connections.
//!
//! Grounded in `comsrv/core/transport/factory.rs::TransportFactory`,
//! which keys a `DashMap` of live transports by connection string.
//! `DashMap` alone only makes the *map* safe to share; two callers can
//! still both miss the same key and both dial. Wrapping each slot in a
//! `tokio::sync::OnceCell` closes that race: the first caller to insert
//! the cell wins the dial, and every other caller for that key awaits
//! the same `OnceCell` instead of starting a second connection.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::error::BusError;
use crate::transport::bus_key::BusKey;
use crate::transport::connection::{BusClient, RtuBusClient, TcpBusClient};
use crate::transport::mutex_wrapper::MutexBusClient;
use crate::transport::slave_handle::SlaveHandle;

/// Abstracts "dial this bus" so tests can substitute a stub client
/// without opening real serial ports or sockets.
#[async_trait]
pub trait BusOpener: Send + Sync {
    async fn open(&self, key: &BusKey, max_retries: u32) -> Result<Box<dyn BusClient>, BusError>;
}

/// Production opener: dials a real RTU serial port or TCP socket.
pub struct DefaultBusOpener;

#[async_trait]
impl BusOpener for DefaultBusOpener {
    async fn open(&self, key: &BusKey, max_retries: u32) -> Result<Box<dyn BusClient>, BusError> {
        match key {
            BusKey::Rtu { port, baud_rate, parity, data_bits, stop_bits } => {
                let params = crate::transport::bus_key::SerialParams {
                    baud_rate: *baud_rate,
                    parity: *parity,
                    data_bits: *data_bits,
                    stop_bits: *stop_bits,
                };
                let client = RtuBusClient::connect(port, params, max_retries).await?;
                Ok(Box::new(client))
            }
            BusKey::Tcp { host, port } => {
                let client = TcpBusClient::connect(host, *port, max_retries).await?;
                Ok(Box::new(client))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TransportStats {
    pub total_buses: usize,
    pub rtu_buses: usize,
    pub tcp_buses: usize,
}

type PoolSlot = Arc<OnceCell<Arc<MutexBusClient>>>;

/// Owns the pool of live Bus Clients. Cheap to clone-share via `Arc`;
/// typically constructed once per process and handed out by reference.
pub struct TransportManager {
    pool: DashMap<BusKey, PoolSlot>,
    opener: Arc<dyn BusOpener>,
    max_retries: u32,
}

impl TransportManager {
    pub fn new(max_retries: u32) -> Self {
        Self::with_opener(Arc::new(DefaultBusOpener), max_retries)
    }

    pub fn with_opener(opener: Arc<dyn BusOpener>, max_retries: u32) -> Self {
        Self { pool: DashMap::new(), opener, max_retries }
    }

    /// Returns a `SlaveHandle` bound to `slave_id` over the bus
    /// identified by `key`, opening it on first use. Concurrent callers
    /// racing on the same never-before-seen key converge on one dial:
    /// `DashMap::entry` inserts a placeholder `OnceCell` under its shard
    /// lock, then every caller — including the one that inserted it —
    /// awaits `get_or_try_init` outside that lock, so only one of them
    /// ever drives the open to completion.
    pub async fn get_transport(
        &self,
        key: BusKey,
        slave_id: u8,
        timeout: std::time::Duration,
    ) -> Result<SlaveHandle, BusError> {
        let slot = self.pool.entry(key.clone()).or_insert_with(|| Arc::new(OnceCell::new())).clone();

        let opener = self.opener.clone();
        let max_retries = self.max_retries;
        let key_for_open = key.clone();
        let bus = slot
            .get_or_try_init(|| async move {
                let raw = opener.open(&key_for_open, max_retries).await?;
                info!(?key_for_open, "opened new bus transport");
                Ok::<_, BusError>(Arc::new(MutexBusClient::new(raw)))
            })
            .await?
            .clone();

        Ok(SlaveHandle::new(bus, slave_id, timeout))
    }

    pub fn get_stats(&self) -> TransportStats {
        let mut stats = TransportStats::default();
        for entry in self.pool.iter() {
            if entry.get().is_some() {
                stats.total_buses += 1;
                match entry.key() {
                    BusKey::Rtu { .. } => stats.rtu_buses += 1,
                    BusKey::Tcp { .. } => stats.tcp_buses += 1,
                }
            }
        }
        stats
    }

    /// Closes every bus currently pooled and empties the pool. Per-bus
    /// close failures are logged, not propagated, so one stuck client
    /// cannot stop the rest from being retired.
    pub async fn close_all(&self) {
        for entry in self.pool.iter() {
            if let Some(bus) = entry.get() {
                if let Err(err) = bus.close().await {
                    warn!(key = ?entry.key(), error = %err, "error closing bus transport");
                }
            }
        }
        self.pool.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::bus_key::{Parity, SerialParams};
    use crate::transport::test_support::StubBusClient;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct StubOpener {
        opens: AtomicUsize,
        fail_keys: Vec<BusKey>,
    }

    impl StubOpener {
        fn new() -> Self {
            Self { opens: AtomicUsize::new(0), fail_keys: Vec::new() }
        }

        fn failing(fail_keys: Vec<BusKey>) -> Self {
            Self { opens: AtomicUsize::new(0), fail_keys }
        }
    }

    #[async_trait]
    impl BusOpener for StubOpener {
        async fn open(&self, key: &BusKey, _max_retries: u32) -> Result<Box<dyn BusClient>, BusError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.fail_keys.contains(key) {
                return Err(BusError::Connect("stub refused".into()));
            }
            Ok(Box::new(StubBusClient::new()))
        }
    }

    fn rtu_key(port: &str, baud: u32) -> BusKey {
        BusKey::rtu(port, SerialParams { baud_rate: baud, parity: Parity::None, data_bits: 8, stop_bits: 1 })
    }

    #[tokio::test]
    async fn same_key_shares_one_bus_client() {
        let opener = Arc::new(StubOpener::new());
        let manager = TransportManager::with_opener(opener.clone(), 1);

        let key = rtu_key("/dev/ttyUSB0", 9600);
        let h1 = manager.get_transport(key.clone(), 1, Duration::from_millis(100)).await.unwrap();
        let h2 = manager.get_transport(key, 2, Duration::from_millis(100)).await.unwrap();

        assert_eq!(opener.opens.load(Ordering::SeqCst), 1);
        assert_eq!(manager.get_stats().total_buses, 1);
        assert_eq!(h1.slave_id(), 1);
        assert_eq!(h2.slave_id(), 2);
    }

    #[tokio::test]
    async fn different_baud_rates_yield_two_clients() {
        let opener = Arc::new(StubOpener::new());
        let manager = TransportManager::with_opener(opener.clone(), 1);

        manager.get_transport(rtu_key("/dev/ttyUSB0", 9600), 1, Duration::from_millis(100)).await.unwrap();
        manager.get_transport(rtu_key("/dev/ttyUSB0", 19200), 1, Duration::from_millis(100)).await.unwrap();

        assert_eq!(opener.opens.load(Ordering::SeqCst), 2);
        let stats = manager.get_stats();
        assert_eq!(stats.total_buses, 2);
        assert_eq!(stats.rtu_buses, 2);
        assert_eq!(stats.tcp_buses, 0);
    }

    #[tokio::test]
    async fn concurrent_first_requests_for_the_same_key_open_once() {
        let opener = Arc::new(StubOpener::new());
        let manager = Arc::new(TransportManager::with_opener(opener.clone(), 1));

        let key = rtu_key("/dev/ttyUSB1", 9600);
        let m1 = manager.clone();
        let k1 = key.clone();
        let m2 = manager.clone();
        let k2 = key.clone();

        let (a, b) = tokio::join!(
            async move { m1.get_transport(k1, 1, Duration::from_millis(100)).await },
            async move { m2.get_transport(k2, 2, Duration::from_millis(100)).await },
        );
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(opener.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_open_does_not_poison_the_slot_for_a_distinct_key() {
        let bad_key = rtu_key("/dev/ttyUSB2", 9600);
        let opener = Arc::new(StubOpener::failing(vec![bad_key.clone()]));
        let manager = TransportManager::with_opener(opener, 1);

        assert!(manager.get_transport(bad_key, 1, Duration::from_millis(100)).await.is_err());
        let good_key = rtu_key("/dev/ttyUSB3", 9600);
        assert!(manager.get_transport(good_key, 1, Duration::from_millis(100)).await.is_ok());
        assert_eq!(manager.get_stats().total_buses, 1);
    }

    #[tokio::test]
    async fn mixed_rtu_and_tcp_keys_count_separately() {
        let opener = Arc::new(StubOpener::new());
        let manager = TransportManager::with_opener(opener, 1);

        manager.get_transport(rtu_key("/dev/ttyUSB0", 9600), 1, Duration::from_millis(100)).await.unwrap();
        manager.get_transport(rtu_key("/dev/ttyUSB0", 9600), 2, Duration::from_millis(100)).await.unwrap();
        manager
            .get_transport(BusKey::tcp("192.168.1.100", 502), 1, Duration::from_millis(100))
            .await
            .unwrap();

        let stats = manager.get_stats();
        assert_eq!(stats.total_buses, 2);
        assert_eq!(stats.rtu_buses, 1);
        assert_eq!(stats.tcp_buses, 1);
    }

    #[tokio::test]
    async fn close_all_empties_the_pool() {
        let opener = Arc::new(StubOpener::new());
        let manager = TransportManager::with_opener(opener, 1);
        manager.get_transport(rtu_key("/dev/ttyUSB0", 9600), 1, Duration::from_millis(100)).await.unwrap();
        assert_eq!(manager.get_stats().total_buses, 1);

        manager.close_all().await;
        assert_eq!(manager.get_stats().total_buses, 0);
    }

    struct SingleClientOpener {
        close_count: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait]
    impl BusOpener for SingleClientOpener {
        async fn open(&self, _key: &BusKey, _max_retries: u32) -> Result<Box<dyn BusClient>, BusError> {
            let mut stub = StubBusClient::new();
            stub.close_count = self.close_count.clone();
            Ok(Box::new(stub))
        }
    }

    #[tokio::test]
    async fn close_all_closes_a_bus_shared_by_two_handles_exactly_once() {
        let close_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let opener = Arc::new(SingleClientOpener { close_count: close_count.clone() });
        let manager = TransportManager::with_opener(opener, 1);

        let key = rtu_key("/dev/ttyUSB0", 9600);
        manager.get_transport(key.clone(), 1, Duration::from_millis(100)).await.unwrap();
        manager.get_transport(key, 2, Duration::from_millis(100)).await.unwrap();
        assert_eq!(manager.get_stats().total_buses, 1);

        manager.close_all().await;
        assert_eq!(close_count.load(Ordering::SeqCst), 1);
    }
}
