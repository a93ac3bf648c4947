//! Modbus Application PDU codec.
//!
//! Pure functions: build/parse PDUs for FC01/02/03/04/05/06/10, no I/O, no
//! allocation beyond the returned buffers. Grounded in the PDU handling of
//! `comsrv`'s `core::protocols::modbus::pdu` module, generalized to the
//! bus-level byte-buffer contract this toolkit needs (callers get raw
//! register/coil bytes back, not a driver-level typed value).

pub mod scaled;

use crate::error::CodecError;

/// Function codes the bus-level codec understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleCoils = 0x0F,
    WriteMultipleRegisters = 0x10,
}

impl From<FunctionCode> for u8 {
    fn from(fc: FunctionCode) -> u8 {
        fc as u8
    }
}

impl FunctionCode {
    pub fn is_read(self) -> bool {
        matches!(
            self,
            FunctionCode::ReadCoils
                | FunctionCode::ReadDiscreteInputs
                | FunctionCode::ReadHoldingRegisters
                | FunctionCode::ReadInputRegisters
        )
    }
}

/// Build a read request: FC01/02/03/04. Six bytes, big-endian:
/// `unit_id | fc | addr_hi | addr_lo | count_hi | count_lo`.
pub fn build_read_request(unit_id: u8, fc: FunctionCode, addr: u16, count: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(6);
    buf.push(unit_id);
    buf.push(fc.into());
    buf.extend_from_slice(&addr.to_be_bytes());
    buf.extend_from_slice(&count.to_be_bytes());
    buf
}

/// Build a write-register request. FC06 writes `values[0]` in 6 bytes;
/// FC10 emits the multi-register form with a byte count and payload.
pub fn build_write_register_request(
    unit_id: u8,
    fc: FunctionCode,
    addr: u16,
    values: &[u16],
) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    buf.push(unit_id);
    buf.push(fc.into());
    buf.extend_from_slice(&addr.to_be_bytes());
    match fc {
        FunctionCode::WriteSingleRegister => {
            let v = values.first().copied().unwrap_or(0);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        FunctionCode::WriteMultipleRegisters => {
            let count = values.len() as u16;
            buf.extend_from_slice(&count.to_be_bytes());
            let byte_count = (values.len() * 2) as u8;
            buf.push(byte_count);
            for v in values {
                buf.extend_from_slice(&v.to_be_bytes());
            }
        }
        other => {
            return Err(CodecError::UnsupportedFunctionCode {
                operation: "build_write_register_request",
                fc: other.into(),
            })
        }
    }
    Ok(buf)
}

/// Build a coil request. FC01/02 read; FC05 writes `0xFF00` for true,
/// `0x0000` for false.
pub fn build_coil_request(
    unit_id: u8,
    fc: FunctionCode,
    addr: u16,
    value_or_count: CoilArg,
) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::with_capacity(6);
    buf.push(unit_id);
    buf.push(fc.into());
    buf.extend_from_slice(&addr.to_be_bytes());
    match (fc, value_or_count) {
        (FunctionCode::WriteSingleCoil, CoilArg::Value(v)) => {
            let raw: u16 = if v { 0xFF00 } else { 0x0000 };
            buf.extend_from_slice(&raw.to_be_bytes());
        }
        (FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs, CoilArg::Count(n)) => {
            buf.extend_from_slice(&n.to_be_bytes());
        }
        (other_fc, _arg) => {
            return Err(CodecError::UnsupportedFunctionCode {
                operation: "build_coil_request",
                fc: other_fc.into(),
            })
        }
    }
    Ok(buf)
}

/// Disambiguates the trailing two bytes of a coil request: a boolean
/// value for FC05, or a read count for FC01/FC02.
#[derive(Debug, Clone, Copy)]
pub enum CoilArg {
    Value(bool),
    Count(u16),
}

/// Parse a register-read response (FC03/FC04). Validates the unit id,
/// detects exception frames, validates byte_count parity and bounds, and
/// returns the big-endian 16-bit registers.
pub fn parse_register_read_response(
    bytes: &[u8],
    expected_unit_id: u8,
    expected_fc: FunctionCode,
) -> Result<Vec<u16>, CodecError> {
    let data = check_response_header(bytes, expected_unit_id, expected_fc)?;

    if data.is_empty() {
        return Err(CodecError::Malformed("register response missing byte count".into()));
    }
    let byte_count = data[0] as usize;
    if byte_count % 2 != 0 || byte_count > 250 {
        return Err(CodecError::Malformed(format!(
            "register response byte_count {byte_count} must be even and <= 250"
        )));
    }
    if byte_count + 3 != bytes.len() {
        return Err(CodecError::Malformed(format!(
            "register response byte_count {byte_count} + 3 != frame length {}",
            bytes.len()
        )));
    }

    let payload = &data[1..];
    Ok(payload
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect())
}

/// Parse a coil-read response (FC01/FC02). Returns the first bit of the
/// data byte.
pub fn parse_coil_read_response(
    bytes: &[u8],
    expected_unit_id: u8,
    expected_fc: FunctionCode,
) -> Result<bool, CodecError> {
    let data = check_response_header(bytes, expected_unit_id, expected_fc)?;
    if data.len() < 2 {
        return Err(CodecError::Malformed("coil response missing data byte".into()));
    }
    let byte_count = data[0] as usize;
    if byte_count == 0 {
        return Err(CodecError::Malformed("coil response byte_count is zero".into()));
    }
    Ok(data[1] & 0x01 != 0)
}

/// Shared header validation: length >= 3, unit id match, exception
/// detection. Returns the slice starting at the byte_count byte (unit
/// id and function code both stripped) on success.
fn check_response_header<'a>(
    bytes: &'a [u8],
    expected_unit_id: u8,
    expected_fc: FunctionCode,
) -> Result<&'a [u8], CodecError> {
    if bytes.len() < 3 {
        return Err(CodecError::Malformed(format!(
            "response too short: {} bytes, need at least 3",
            bytes.len()
        )));
    }
    let actual_unit_id = bytes[0];
    if actual_unit_id != expected_unit_id {
        return Err(CodecError::UnitIdMismatch {
            expected: expected_unit_id,
            actual: actual_unit_id,
        });
    }

    let fc_raw = bytes[1];
    if fc_raw & 0x80 != 0 {
        let code = *bytes.get(2).ok_or_else(|| {
            CodecError::Malformed("exception response missing exception code".to_string())
        })?;
        return Err(CodecError::ExceptionResponse { fc: fc_raw & 0x7F, code });
    }

    let expected_raw: u8 = expected_fc.into();
    if fc_raw != expected_raw {
        return Err(CodecError::Malformed(format!(
            "function code mismatch: expected 0x{expected_raw:02X}, got 0x{fc_raw:02X}"
        )));
    }

    Ok(&bytes[2..])
}
