//! A Modbus RTU/TCP bus-multiplexing transport and RTU discovery
//! toolkit.
//!
//! Three subsystems compose the core:
//!
//! - [`transport`]: a pooled, per-bus-key set of Bus Clients, each
//!   guarded by a FIFO lock and exposed to callers as lightweight,
//!   per-slave handles.
//! - [`discovery`]: a four-level device identification cascade, a
//!   lazy serial-parameter/slave-address enumerator, and the scanner
//!   that drives both across an RTU port.
//! - [`codec`]: pure Modbus Application PDU and scaled-numeric-field
//!   encode/decode functions, no I/O.
//!
//! Driver-level data-point schemas, MQTT bridging, and CLI plumbing are
//! layered above this crate and are not its concern.

pub mod codec;
pub mod config;
pub mod discovery;
pub mod error;
pub mod transport;

pub use codec::{
    build_coil_request, build_read_request, build_write_register_request, parse_coil_read_response,
    parse_register_read_response, CoilArg, FunctionCode,
};
pub use config::RuntimeConfig;
pub use discovery::{
    AbsentReason, DeviceIdentifier, DiscoveredDevice, DiscoveryScanner, IdentificationResult, ParameterCombination,
    ParameterGenerator, ParameterGeneratorConfig, ParameterGroup, ScanCallbacks, ScanOptions, ScanProgressEvent,
    Strategy, SupportedConfig, TestAttemptStatus,
};
pub use error::{BusError, CodecError, IdentifyError, ScanError};
pub use transport::{
    BusClient, BusKey, BusOpener, DefaultBusOpener, MutexBusClient, Parity, SerialParams, SlaveAddress, SlaveHandle,
    TransportManager, TransportStats,
};
