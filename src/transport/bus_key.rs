//! Serial parameters, slave addressing, and the canonical Bus Key that
//! identifies one physical bus for pooling purposes.
//!
//! Grounded in `comsrv/core/transport/serial.rs::SerialTransportConfig`
//! and `voltage-protocols/modbus/connection.rs::connect_rtu`'s parameter
//! set, reshaped into a value type that can key a map.

use serde::{Deserialize, Serialize};

/// Parity setting for an RTU serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Parity {
    None,
    Even,
    Odd,
}

/// A canonicalized set of RTU serial parameters. Field order is fixed so
/// two equal parameter sets always compare and hash identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SerialParams {
    pub baud_rate: u32,
    pub parity: Parity,
    pub data_bits: u8,
    pub stop_bits: u8,
}

/// The standard baud rates, data bits, and stop bits a `thorough` sweep
/// considers.
pub const STANDARD_BAUD_RATES: &[u32] = &[2400, 4800, 9600, 14400, 19200, 38400, 57600, 115200];
pub const STANDARD_PARITIES: &[Parity] = &[Parity::None, Parity::Even, Parity::Odd];
pub const STANDARD_DATA_BITS: &[u8] = &[7, 8];
pub const STANDARD_STOP_BITS: &[u8] = &[1, 2];

/// An 8-bit Modbus slave (unit) address. 0 is broadcast, 1-247 unicast,
/// 248-255 reserved and never generated by the discovery scanner.
pub type SlaveAddress = u8;

/// Minimum and maximum unicast slave address the generator will ever
/// produce by default.
pub const MIN_UNICAST_ADDRESS: SlaveAddress = 1;
pub const MAX_UNICAST_ADDRESS: SlaveAddress = 247;

/// Canonical identity of one physical bus. The slave id is deliberately
/// not part of the key: two logical devices on the same wire share one
/// Bus Client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BusKey {
    Rtu {
        port: String,
        baud_rate: u32,
        parity: Parity,
        data_bits: u8,
        stop_bits: u8,
    },
    Tcp {
        host: String,
        port: u16,
    },
}

impl BusKey {
    pub fn rtu(port: impl Into<String>, params: SerialParams) -> Self {
        BusKey::Rtu {
            port: port.into(),
            baud_rate: params.baud_rate,
            parity: params.parity,
            data_bits: params.data_bits,
            stop_bits: params.stop_bits,
        }
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        BusKey::Tcp { host: host.into(), port }
    }

    pub fn is_rtu(&self) -> bool {
        matches!(self, BusKey::Rtu { .. })
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, BusKey::Tcp { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtu_keys_with_same_fields_are_equal() {
        let params = SerialParams { baud_rate: 9600, parity: Parity::None, data_bits: 8, stop_bits: 1 };
        let a = BusKey::rtu("/dev/ttyUSB0", params);
        let b = BusKey::rtu("/dev/ttyUSB0", params);
        assert_eq!(a, b);
    }

    #[test]
    fn rtu_keys_with_different_baud_are_distinct() {
        let a = BusKey::rtu("/dev/ttyUSB0", SerialParams { baud_rate: 9600, parity: Parity::None, data_bits: 8, stop_bits: 1 });
        let b = BusKey::rtu("/dev/ttyUSB0", SerialParams { baud_rate: 19200, parity: Parity::None, data_bits: 8, stop_bits: 1 });
        assert_ne!(a, b);
    }

    #[test]
    fn tcp_and_rtu_keys_are_distinct_types() {
        let a = BusKey::tcp("192.168.1.100", 502);
        assert!(a.is_tcp());
        assert!(!a.is_rtu());
    }
}
