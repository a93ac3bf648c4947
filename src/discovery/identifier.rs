//! Device Identifier: the four-level probe cascade (FC43 → FC04@1 →
//! FC04@0 → FC03@0) that turns a Slave Handle into a presence/identity
//! verdict.
//!
//! Grounded in the retry-with-classification shape already used for
//! Bus Client requests, rebuilt as an explicit state machine rather
//! than nested exception handling: each step classifies into success /
//! exception / transient (continue) / fatal (stop), never a chain of
//! try/catch.

use std::time::Instant;

use crate::error::BusError;
use crate::transport::slave_handle::SlaveHandle;

/// Why a device was classified absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbsentReason {
    Timeout,
    CrcError,
    ConnectError,
    Other,
}

/// Outcome of running the identification cascade against one slave
/// address. `model` (FC43 object id 7) is part of the data model but
/// never populated by the default probe.
#[derive(Debug, Clone, PartialEq)]
pub enum IdentificationResult {
    Present {
        response_time_ms: u64,
        supports_fc43: Option<bool>,
        supports_fc03: Option<bool>,
        vendor: Option<String>,
        product_code: Option<String>,
        model: Option<String>,
        revision: Option<String>,
        exception_code: Option<u8>,
    },
    Absent {
        response_time_ms: u64,
        reason: AbsentReason,
    },
}

impl IdentificationResult {
    pub fn is_present(&self) -> bool {
        matches!(self, IdentificationResult::Present { .. })
    }

    pub fn response_time_ms(&self) -> u64 {
        match self {
            IdentificationResult::Present { response_time_ms, .. }
            | IdentificationResult::Absent { response_time_ms, .. } => *response_time_ms,
        }
    }
}

/// FC43 object ids the default probe harvests. 7 (ModelName) is defined
/// by Modbus but deliberately not requested here.
const OBJECT_VENDOR: u8 = 0;
const OBJECT_PRODUCT_CODE: u8 = 1;
const OBJECT_REVISION: u8 = 2;

fn priority(err: &BusError) -> u8 {
    if err.is_connect() {
        3
    } else if err.is_timeout() {
        2
    } else if err.is_crc() {
        1
    } else {
        0
    }
}

/// Highest-precedence reason among every transient error observed
/// during the cascade: `ConnectError > Timeout > CRC > Other`.
/// Exceptions never reach this — they're classified as Present.
fn classify(errors: &[BusError]) -> AbsentReason {
    let worst = errors.iter().max_by_key(|e| priority(e));
    match worst {
        Some(e) if e.is_connect() => AbsentReason::ConnectError,
        Some(e) if e.is_timeout() => AbsentReason::Timeout,
        Some(e) if e.is_crc() => AbsentReason::CrcError,
        _ => AbsentReason::Other,
    }
}

fn exception_code(err: &BusError) -> Option<u8> {
    match err {
        BusError::Codec(crate::error::CodecError::ExceptionResponse { code, .. }) => Some(*code),
        _ => None,
    }
}

pub struct DeviceIdentifier;

impl DeviceIdentifier {
    /// Runs the cascade against `handle`. The handle's timeout was fixed
    /// when it was created and stays constant for every step of the
    /// cascade.
    pub async fn identify(handle: &SlaveHandle) -> IdentificationResult {
        let started = Instant::now();
        let mut errors: Vec<BusError> = Vec::new();
        let mut exception_code: Option<u8> = None;

        // Step 1: FC43, object 0 (VendorName).
        match handle.read_device_identification(OBJECT_VENDOR).await {
            Ok(vendor) => {
                let product_code = handle.read_device_identification(OBJECT_PRODUCT_CODE).await.ok().flatten();
                let revision = handle.read_device_identification(OBJECT_REVISION).await.ok().flatten();
                return present(
                    started,
                    Some(true),
                    None,
                    vendor,
                    product_code,
                    revision,
                    None,
                );
            }
            Err(e) if e.is_exception() => {
                exception_code = self::exception_code(&e);
            }
            Err(e) => errors.push(e),
        }
        let fc43_exception_code = exception_code;

        // Step 2: FC04 at register 1.
        match handle.read_input_registers(1, 1).await {
            Ok(_) => {
                return present(started, Some(false), None, None, None, None, fc43_exception_code);
            }
            Err(e) if e.is_exception() => {
                // Some devices expose input registers starting at 0;
                // fall through to step 3 instead of terminating here.
            }
            Err(e) => {
                errors.push(e);
                return absent(started, classify(&errors));
            }
        }

        // Step 3: FC04 at register 0.
        match handle.read_input_registers(0, 1).await {
            Ok(_) => {
                return present(started, Some(false), None, None, None, None, fc43_exception_code);
            }
            Err(e) if e.is_exception() => {
                exception_code = self::exception_code(&e).or(fc43_exception_code);
                // An exception here means input registers exist as a
                // concept but register 0 isn't mapped — fall through to
                // FC03 rather than terminating, since a device exposing
                // only holding registers would otherwise be unreachable
                // by any step of this cascade.
            }
            Err(e) => {
                errors.push(e);
                return absent(started, classify(&errors));
            }
        }

        // Step 4: FC03 at register 0.
        match handle.read_holding_registers(0, 1).await {
            Ok(_) => present(started, Some(false), Some(true), None, None, None, fc43_exception_code),
            Err(e) if e.is_exception() => {
                let code = self::exception_code(&e).or(exception_code);
                present(started, Some(false), Some(false), None, None, None, code)
            }
            Err(e) => {
                errors.push(e);
                absent(started, classify(&errors))
            }
        }
    }
}

fn response_time_ms(started: Instant) -> u64 {
    (started.elapsed().as_millis() as u64).max(1)
}

#[allow(clippy::too_many_arguments)]
fn present(
    started: Instant,
    supports_fc43: Option<bool>,
    supports_fc03: Option<bool>,
    vendor: Option<String>,
    product_code: Option<String>,
    revision: Option<String>,
    exception_code: Option<u8>,
) -> IdentificationResult {
    IdentificationResult::Present {
        response_time_ms: response_time_ms(started),
        supports_fc43,
        supports_fc03,
        vendor,
        product_code,
        model: None,
        revision,
        exception_code,
    }
}

fn absent(started: Instant, reason: AbsentReason) -> IdentificationResult {
    IdentificationResult::Absent { response_time_ms: response_time_ms(started), reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mutex_wrapper::MutexBusClient;
    use crate::transport::test_support::{Scripted, StubBusClient};
    use std::sync::Arc;
    use std::time::Duration;

    fn handle(stub: StubBusClient) -> SlaveHandle {
        let bus = Arc::new(MutexBusClient::new(Box::new(stub)));
        SlaveHandle::new(bus, 1, Duration::from_millis(50))
    }

    #[tokio::test]
    async fn fc43_full_identification_harvests_every_field() {
        let stub = StubBusClient::new()
            .with_response(StubBusClient::FC_DEVICE_ID, 0, Scripted::Identification(Some("Acme".into())))
            .with_response(StubBusClient::FC_DEVICE_ID, 1, Scripted::Identification(Some("AC-100".into())))
            .with_response(StubBusClient::FC_DEVICE_ID, 2, Scripted::Identification(Some("v1.2.3".into())));
        let result = DeviceIdentifier::identify(&handle(stub)).await;
        assert_eq!(
            result,
            IdentificationResult::Present {
                response_time_ms: result.response_time_ms(),
                supports_fc43: Some(true),
                supports_fc03: None,
                vendor: Some("Acme".into()),
                product_code: Some("AC-100".into()),
                model: None,
                revision: Some("v1.2.3".into()),
                exception_code: None,
            }
        );
    }

    #[tokio::test]
    async fn fc43_unavailable_fc03_succeeds() {
        let stub = StubBusClient::new()
            .with_response(StubBusClient::FC_DEVICE_ID, 0, Scripted::Exception(1))
            .with_response(StubBusClient::FC_READ_INPUT, 1, Scripted::Exception(1))
            .with_response(StubBusClient::FC_READ_INPUT, 0, Scripted::Exception(1))
            .with_response(StubBusClient::FC_READ_HOLDING, 0, Scripted::Registers(vec![123]));
        let result = DeviceIdentifier::identify(&handle(stub)).await;
        match result {
            IdentificationResult::Present { supports_fc03, response_time_ms, .. } => {
                assert_eq!(supports_fc03, Some(true));
                assert!(response_time_ms > 0);
            }
            other => panic!("expected Present, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fc43_unavailable_fc03_exception() {
        let stub = StubBusClient::new()
            .with_response(StubBusClient::FC_DEVICE_ID, 0, Scripted::Exception(1))
            .with_response(StubBusClient::FC_READ_INPUT, 1, Scripted::Exception(1))
            .with_response(StubBusClient::FC_READ_INPUT, 0, Scripted::Exception(1))
            .with_response(StubBusClient::FC_READ_HOLDING, 0, Scripted::Exception(2));
        let result = DeviceIdentifier::identify(&handle(stub)).await;
        assert_eq!(
            result,
            IdentificationResult::Present {
                response_time_ms: result.response_time_ms(),
                supports_fc43: Some(false),
                supports_fc03: Some(false),
                vendor: None,
                product_code: None,
                model: None,
                revision: None,
                exception_code: Some(2),
            }
        );
    }

    #[tokio::test]
    async fn fc04_register_one_exception_falls_to_register_zero() {
        let stub = StubBusClient::new()
            .with_response(StubBusClient::FC_DEVICE_ID, 0, Scripted::Exception(1))
            .with_response(StubBusClient::FC_READ_INPUT, 1, Scripted::Exception(1))
            .with_response(StubBusClient::FC_READ_INPUT, 0, Scripted::Registers(vec![42]));
        let result = DeviceIdentifier::identify(&handle(stub)).await;
        assert!(result.is_present());
    }

    #[tokio::test]
    async fn all_function_codes_time_out_is_absent_with_timeout() {
        let stub = StubBusClient::new();
        let result = DeviceIdentifier::identify(&handle(stub)).await;
        assert_eq!(result, IdentificationResult::Absent { response_time_ms: result.response_time_ms(), reason: AbsentReason::Timeout });
    }

    #[tokio::test]
    async fn crc_error_is_absent_with_crc_reason() {
        let stub = StubBusClient::new()
            .with_response(StubBusClient::FC_DEVICE_ID, 0, Scripted::Crc)
            .with_response(StubBusClient::FC_READ_INPUT, 1, Scripted::Crc);
        let result = DeviceIdentifier::identify(&handle(stub)).await;
        assert_eq!(result, IdentificationResult::Absent { response_time_ms: result.response_time_ms(), reason: AbsentReason::CrcError });
    }
}
