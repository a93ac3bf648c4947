//! Error taxonomy for the bus transport, codec, and discovery layers.
//!
//! Each error kind is typed and carries the constraint or observed value
//! that was violated, per the propagation policy: the codec never
//! swallows, the bus client retries transient RTU faults then propagates,
//! and the transport manager's `close_all` is the one place errors are
//! deliberately swallowed (after logging) so a single bad port cannot
//! strand the rest of the pool.

use thiserror::Error;

/// Errors raised by the pure PDU/scaled-value codec. No I/O, no retries.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("buffer too small for {width}-bit read at offset {offset}: need {needed} bytes, have {available} of {len}")]
    InsufficientBuffer {
        width: u8,
        offset: usize,
        needed: usize,
        available: usize,
        len: usize,
    },

    #[error("value {value} is not finite")]
    NotFinite { value: f64 },

    #[error("scale {scale} must be finite and strictly positive")]
    InvalidScale { scale: f64 },

    #[error("scaled value {scaled} out of range [{min}, {max}]")]
    OutOfRange { scaled: f64, min: f64, max: f64 },

    #[error("modbus exception: function 0x{fc:02X}, code {code}")]
    ExceptionResponse { fc: u8, code: u8 },

    #[error("unit id mismatch: expected {expected}, got {actual}")]
    UnitIdMismatch { expected: u8, actual: u8 },

    #[error("malformed PDU: {0}")]
    Malformed(String),

    #[error("function code 0x{fc:02X} is not supported for {operation}")]
    UnsupportedFunctionCode { operation: &'static str, fc: u8 },
}

/// Errors raised by a Bus Client (connect, per-request I/O, RTU framing).
#[derive(Error, Debug)]
pub enum BusError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("CRC check failed")]
    Crc,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bus client closed")]
    Closed,
}

impl BusError {
    pub fn is_connect(&self) -> bool {
        matches!(self, BusError::Connect(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BusError::Timeout(_))
    }

    pub fn is_crc(&self) -> bool {
        matches!(self, BusError::Crc)
    }

    pub fn is_exception(&self) -> bool {
        matches!(self, BusError::Codec(CodecError::ExceptionResponse { .. }))
    }
}

/// Errors raised while running the four-level identification cascade.
#[derive(Error, Debug)]
pub enum IdentifyError {
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Errors raised by the Discovery Scanner's orchestration loop itself
/// (as opposed to per-probe errors, which are classified, not propagated).
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("progress callback aborted the scan: {0}")]
    Aborted(String),
}

pub type CodecResult<T> = std::result::Result<T, CodecError>;
pub type BusResult<T> = std::result::Result<T, BusError>;
pub type ScanResult<T> = std::result::Result<T, ScanError>;
