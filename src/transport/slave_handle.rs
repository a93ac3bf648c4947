//! Slave Handle: a logical view bound to one slave address and timeout
//! over a shared Bus Client. Every operation acquires the bus lock,
//! programs the slave id and timeout on the underlying client, issues
//! the operation, and releases the lock.
//!
//! The handle owns no I/O resource of its own — it borrows a reference-
//! counted alias to the pooled Bus Client, valid for as long as the
//! Transport Manager that created it lives.

use std::sync::Arc;
use std::time::Duration;

use crate::error::BusError;
use crate::transport::mutex_wrapper::MutexBusClient;

#[derive(Clone)]
pub struct SlaveHandle {
    bus: Arc<MutexBusClient>,
    slave_id: u8,
    timeout: Duration,
}

impl SlaveHandle {
    pub fn new(bus: Arc<MutexBusClient>, slave_id: u8, timeout: Duration) -> Self {
        Self { bus, slave_id, timeout }
    }

    pub fn slave_id(&self) -> u8 {
        self.slave_id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn read_holding_registers(&self, addr: u16, count: u16) -> Result<Vec<u8>, BusError> {
        self.bus
            .with_slave(self.slave_id, self.timeout, move |c| Box::pin(c.read_holding_registers(addr, count)))
            .await
    }

    pub async fn read_input_registers(&self, addr: u16, count: u16) -> Result<Vec<u8>, BusError> {
        self.bus
            .with_slave(self.slave_id, self.timeout, move |c| Box::pin(c.read_input_registers(addr, count)))
            .await
    }

    pub async fn read_coils(&self, addr: u16, count: u16) -> Result<Vec<u8>, BusError> {
        self.bus
            .with_slave(self.slave_id, self.timeout, move |c| Box::pin(c.read_coils(addr, count)))
            .await
    }

    pub async fn read_discrete_inputs(&self, addr: u16, count: u16) -> Result<Vec<u8>, BusError> {
        self.bus
            .with_slave(self.slave_id, self.timeout, move |c| Box::pin(c.read_discrete_inputs(addr, count)))
            .await
    }

    pub async fn write_single_register(&self, addr: u16, value: u16) -> Result<(), BusError> {
        self.bus
            .with_slave(self.slave_id, self.timeout, move |c| Box::pin(c.write_single_register(addr, value)))
            .await
    }

    pub async fn write_single_coil(&self, addr: u16, value: bool) -> Result<(), BusError> {
        self.bus
            .with_slave(self.slave_id, self.timeout, move |c| Box::pin(c.write_single_coil(addr, value)))
            .await
    }

    pub async fn write_multiple_registers(&self, addr: u16, values: &[u16]) -> Result<(), BusError> {
        let values = values.to_vec();
        self.bus
            .with_slave(self.slave_id, self.timeout, move |c| Box::pin(async move {
                c.write_multiple_registers(addr, &values).await
            }))
            .await
    }

    pub async fn write_multiple_coils(&self, addr: u16, values: &[bool]) -> Result<(), BusError> {
        let values = values.to_vec();
        self.bus
            .with_slave(self.slave_id, self.timeout, move |c| Box::pin(async move {
                c.write_multiple_coils(addr, &values).await
            }))
            .await
    }

    pub async fn read_device_identification(&self, object_id: u8) -> Result<Option<String>, BusError> {
        self.bus
            .with_slave(self.slave_id, self.timeout, move |c| Box::pin(c.read_device_identification(object_id)))
            .await
    }
}
