//! Discovery: the four-level identification cascade, the lazy
//! parameter-space enumerator, and the scanner that drives both across
//! an RTU serial port.

pub mod identifier;
pub mod param_generator;
pub mod scanner;

pub use identifier::{AbsentReason, DeviceIdentifier, IdentificationResult};
pub use param_generator::{ParameterCombination, ParameterGenerator, ParameterGeneratorConfig, ParameterGroup, Strategy, SupportedConfig};
pub use scanner::{DiscoveredDevice, DiscoveryScanner, ScanCallbacks, ScanOptions, ScanProgressEvent, TestAttemptStatus};
