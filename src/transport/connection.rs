//! Bus Client: a connection to one physical Modbus bus (RTU serial or
//! TCP socket). One outstanding request at a time; callers share access
//! through the Mutex Wrapper, never the client directly.
//!
//! Grounded in `voltage-protocols/modbus/connection.rs::ModbusConnection`
//! (send/receive framing for TCP MBAP vs. RTU CRC) and
//! `comsrv/core/protocols/modbus/rtu.rs::execute` (bounded retry with a
//! per-attempt logger callback).

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use crc::{Crc, CRC_16_MODBUS};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, warn};

use crate::codec::{
    build_coil_request, build_read_request, build_write_register_request, parse_coil_read_response,
    parse_register_read_response, CoilArg, FunctionCode,
};
use crate::error::BusError;
use crate::transport::bus_key::{Parity, SerialParams};

const CRC16_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Raw transport capability every Bus Client realizes. Every read returns
/// the raw big-endian register/coil bytes; callers interpret them.
#[async_trait]
pub trait BusClient: Send + Sync {
    async fn read_holding_registers(&mut self, addr: u16, count: u16) -> Result<Vec<u8>, BusError>;
    async fn read_input_registers(&mut self, addr: u16, count: u16) -> Result<Vec<u8>, BusError>;
    async fn read_coils(&mut self, addr: u16, count: u16) -> Result<Vec<u8>, BusError>;
    async fn read_discrete_inputs(&mut self, addr: u16, count: u16) -> Result<Vec<u8>, BusError>;

    async fn write_single_register(&mut self, addr: u16, value: u16) -> Result<(), BusError>;
    async fn write_single_coil(&mut self, addr: u16, value: bool) -> Result<(), BusError>;
    async fn write_multiple_registers(&mut self, addr: u16, values: &[u16]) -> Result<(), BusError>;
    async fn write_multiple_coils(&mut self, addr: u16, values: &[bool]) -> Result<(), BusError>;

    /// FC43 Read Device Identification, object id `object_id`. Returns
    /// the raw string value if the device supports it. `Ok(None)` means
    /// the device answered but omitted that object; exceptions and
    /// transport failures are returned as `Err`.
    async fn read_device_identification(&mut self, object_id: u8) -> Result<Option<String>, BusError>;

    fn set_slave(&mut self, id: u8);
    fn set_timeout(&mut self, timeout: Duration);
    async fn close(&mut self) -> Result<(), BusError>;
}

/// Bounded retry wrapper shared by both transports: attempts an
/// operation up to `max_retries` times, invoking `logger` on every
/// failing attempt, propagating the last error once attempts are
/// exhausted. Discovery code constructs clients with `max_retries = 1`
/// so the cascade drives all
/// retry/timeout decisions itself and latency stays predictable;
/// `max_retries` remains a Bus Client parameter for callers who want the
/// historical 3-attempt behavior.
///
/// `op` takes the connection (`target`) as an explicit parameter rather
/// than capturing it, the same shape as `MutexBusClient::with_slave`:
/// an `FnMut` closure body cannot return a future that borrows a value
/// the closure captured by unique reference, since that borrow would
/// have to outlive the closure call itself. Threading `target` through
/// as a parameter lets each retry attempt reborrow it fresh.
async fn with_retries<'a, S, F, T>(
    target: &'a mut S,
    max_retries: u32,
    logger: Option<&(dyn Fn(u32, &BusError) + Send + Sync)>,
    mut op: F,
) -> Result<T, BusError>
where
    F: for<'b> FnMut(&'b mut S) -> Pin<Box<dyn Future<Output = Result<T, BusError>> + Send + 'b>>,
{
    let attempts = max_retries.max(1);
    let mut last_err = None;
    for attempt in 0..attempts {
        match op(&mut *target).await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if let Some(log) = logger {
                    log(attempt, &e);
                }
                last_err = Some(e);
            }
        }
    }
    Err(last_err.expect("attempts >= 1 guarantees at least one iteration"))
}

fn rtu_frame(adu_without_crc: &[u8]) -> Vec<u8> {
    let crc = CRC16_MODBUS.checksum(adu_without_crc);
    let mut frame = adu_without_crc.to_vec();
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

fn check_rtu_crc(frame: &[u8]) -> Result<&[u8], BusError> {
    if frame.len() < 4 {
        return Err(BusError::Crc);
    }
    let (adu, crc_bytes) = frame.split_at(frame.len() - 2);
    let expected = CRC16_MODBUS.checksum(adu);
    let actual = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    if expected != actual {
        return Err(BusError::Crc);
    }
    Ok(adu)
}

/// One RTU serial connection, half-duplex. At most one outstanding
/// request; concurrent callers must go through the Mutex Wrapper.
pub struct RtuBusClient {
    port: SerialStream,
    slave_id: u8,
    timeout: Duration,
    max_retries: u32,
    logger: Option<Box<dyn Fn(u32, &BusError) + Send + Sync>>,
    closed: bool,
}

impl RtuBusClient {
    pub async fn connect(port_path: &str, params: SerialParams, max_retries: u32) -> Result<Self, BusError> {
        let parity = match params.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        };
        let data_bits = match params.data_bits {
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let stop_bits = match params.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };

        let port = tokio_serial::new(port_path, params.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .open_native_async()
            .map_err(|e| BusError::Connect(format!("{port_path}: {e}")))?;

        debug!(port = port_path, baud = params.baud_rate, "RTU bus client connected");

        Ok(Self {
            port,
            slave_id: 0,
            timeout: Duration::from_millis(1000),
            max_retries: max_retries.max(1),
            logger: None,
            closed: false,
        })
    }

    pub fn set_logger(&mut self, logger: impl Fn(u32, &BusError) + Send + Sync + 'static) {
        self.logger = Some(Box::new(logger));
    }

    async fn transact(&mut self, adu_without_crc: Vec<u8>) -> Result<Vec<u8>, BusError> {
        if self.closed {
            return Err(BusError::Closed);
        }
        let frame = rtu_frame(&adu_without_crc);
        let timeout_dur = self.timeout;
        let max_retries = self.max_retries;
        let logger = self.logger.as_deref();

        with_retries(&mut self.port, max_retries, logger, move |port| {
            let frame = frame.clone();
            Box::pin(async move {
                port.write_all(&frame).await.map_err(BusError::Io)?;
                port.flush().await.map_err(BusError::Io)?;

                let mut buf = vec![0u8; 256];
                let n = timeout(timeout_dur, port.read(&mut buf))
                    .await
                    .map_err(|_| BusError::Timeout(timeout_dur))?
                    .map_err(BusError::Io)?;

                if n == 0 {
                    return Err(BusError::Timeout(timeout_dur));
                }
                let adu = check_rtu_crc(&buf[..n])?;
                Ok(adu.to_vec())
            })
        })
        .await
    }
}

#[async_trait]
impl BusClient for RtuBusClient {
    async fn read_holding_registers(&mut self, addr: u16, count: u16) -> Result<Vec<u8>, BusError> {
        let req = build_read_request(self.slave_id, FunctionCode::ReadHoldingRegisters, addr, count);
        let resp = self.transact(req).await?;
        let regs = parse_register_read_response(&resp, self.slave_id, FunctionCode::ReadHoldingRegisters)?;
        Ok(regs.iter().flat_map(|r| r.to_be_bytes()).collect())
    }

    async fn read_input_registers(&mut self, addr: u16, count: u16) -> Result<Vec<u8>, BusError> {
        let req = build_read_request(self.slave_id, FunctionCode::ReadInputRegisters, addr, count);
        let resp = self.transact(req).await?;
        let regs = parse_register_read_response(&resp, self.slave_id, FunctionCode::ReadInputRegisters)?;
        Ok(regs.iter().flat_map(|r| r.to_be_bytes()).collect())
    }

    async fn read_coils(&mut self, addr: u16, count: u16) -> Result<Vec<u8>, BusError> {
        let req = build_coil_request(self.slave_id, FunctionCode::ReadCoils, addr, CoilArg::Count(count))?;
        let resp = self.transact(req).await?;
        let bit = parse_coil_read_response(&resp, self.slave_id, FunctionCode::ReadCoils)?;
        Ok(vec![bit as u8])
    }

    async fn read_discrete_inputs(&mut self, addr: u16, count: u16) -> Result<Vec<u8>, BusError> {
        let req = build_coil_request(self.slave_id, FunctionCode::ReadDiscreteInputs, addr, CoilArg::Count(count))?;
        let resp = self.transact(req).await?;
        let bit = parse_coil_read_response(&resp, self.slave_id, FunctionCode::ReadDiscreteInputs)?;
        Ok(vec![bit as u8])
    }

    async fn write_single_register(&mut self, addr: u16, value: u16) -> Result<(), BusError> {
        let req = build_write_register_request(self.slave_id, FunctionCode::WriteSingleRegister, addr, &[value])?;
        self.transact(req).await?;
        Ok(())
    }

    async fn write_single_coil(&mut self, addr: u16, value: bool) -> Result<(), BusError> {
        let req = build_coil_request(self.slave_id, FunctionCode::WriteSingleCoil, addr, CoilArg::Value(value))?;
        self.transact(req).await?;
        Ok(())
    }

    async fn write_multiple_registers(&mut self, addr: u16, values: &[u16]) -> Result<(), BusError> {
        let req = build_write_register_request(self.slave_id, FunctionCode::WriteMultipleRegisters, addr, values)?;
        self.transact(req).await?;
        Ok(())
    }

    async fn write_multiple_coils(&mut self, addr: u16, values: &[bool]) -> Result<(), BusError> {
        let mut req = vec![self.slave_id, FunctionCode::WriteMultipleCoils.into()];
        req.extend_from_slice(&addr.to_be_bytes());
        req.extend_from_slice(&(values.len() as u16).to_be_bytes());
        let byte_count = ((values.len() + 7) / 8) as u8;
        req.push(byte_count);
        let mut packed = vec![0u8; byte_count as usize];
        for (i, &v) in values.iter().enumerate() {
            if v {
                packed[i / 8] |= 1 << (i % 8);
            }
        }
        req.extend_from_slice(&packed);
        self.transact(req).await?;
        Ok(())
    }

    async fn read_device_identification(&mut self, object_id: u8) -> Result<Option<String>, BusError> {
        // FC43 (0x2B), MEI type 0x0E, read device id code 0x04 (individual access), object id.
        let req = vec![self.slave_id, 0x2B, 0x0E, 0x04, object_id];
        let resp = self.transact(req).await?;
        parse_fc43_individual_object(&resp)
    }

    fn set_slave(&mut self, id: u8) {
        self.slave_id = id;
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn close(&mut self) -> Result<(), BusError> {
        self.closed = true;
        Ok(())
    }
}

/// One Modbus TCP connection. The MBAP header carries framing; the
/// codec's unit-id-prefixed buffer has its first byte split off into the
/// header and the remainder sent as the PDU.
pub struct TcpBusClient {
    stream: TcpStream,
    slave_id: u8,
    timeout: Duration,
    max_retries: u32,
    next_transaction_id: u16,
    logger: Option<Box<dyn Fn(u32, &BusError) + Send + Sync>>,
    closed: bool,
}

impl TcpBusClient {
    pub async fn connect(host: &str, port: u16, max_retries: u32) -> Result<Self, BusError> {
        let addr = format!("{host}:{port}");
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| BusError::Connect(format!("{addr}: {e}")))?;
        stream.set_nodelay(true).ok();
        debug!(addr, "TCP bus client connected");
        Ok(Self {
            stream,
            slave_id: 0,
            timeout: Duration::from_millis(1000),
            max_retries: max_retries.max(1),
            next_transaction_id: 1,
            logger: None,
            closed: false,
        })
    }

    fn next_txn(&mut self) -> u16 {
        let id = self.next_transaction_id;
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
        id
    }

    async fn transact(&mut self, adu_with_unit_id: Vec<u8>) -> Result<Vec<u8>, BusError> {
        if self.closed {
            return Err(BusError::Closed);
        }
        let unit_id = adu_with_unit_id[0];
        let pdu = &adu_with_unit_id[1..];
        let timeout_dur = self.timeout;
        let max_retries = self.max_retries;
        let logger = self.logger.as_deref();
        let txn_id = self.next_txn();

        let mut frame = Vec::with_capacity(7 + pdu.len());
        frame.extend_from_slice(&txn_id.to_be_bytes());
        frame.extend_from_slice(&0u16.to_be_bytes());
        frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
        frame.push(unit_id);
        frame.extend_from_slice(pdu);

        with_retries(&mut self.stream, max_retries, logger, move |stream| {
            let frame = frame.clone();
            Box::pin(async move {
                stream.write_all(&frame).await.map_err(BusError::Io)?;

                let mut header = [0u8; 7];
                timeout(timeout_dur, stream.read_exact(&mut header))
                    .await
                    .map_err(|_| BusError::Timeout(timeout_dur))?
                    .map_err(BusError::Io)?;
                let length = u16::from_be_bytes([header[4], header[5]]) as usize;
                let response_unit_id = header[6];
                let pdu_len = length.saturating_sub(1);
                let mut pdu_buf = vec![0u8; pdu_len];
                timeout(timeout_dur, stream.read_exact(&mut pdu_buf))
                    .await
                    .map_err(|_| BusError::Timeout(timeout_dur))?
                    .map_err(BusError::Io)?;

                let mut adu = Vec::with_capacity(pdu_buf.len() + 1);
                adu.push(response_unit_id);
                adu.extend_from_slice(&pdu_buf);
                Ok(adu)
            })
        })
        .await
    }
}

#[async_trait]
impl BusClient for TcpBusClient {
    async fn read_holding_registers(&mut self, addr: u16, count: u16) -> Result<Vec<u8>, BusError> {
        let req = build_read_request(self.slave_id, FunctionCode::ReadHoldingRegisters, addr, count);
        let resp = self.transact(req).await?;
        let regs = parse_register_read_response(&resp, self.slave_id, FunctionCode::ReadHoldingRegisters)?;
        Ok(regs.iter().flat_map(|r| r.to_be_bytes()).collect())
    }

    async fn read_input_registers(&mut self, addr: u16, count: u16) -> Result<Vec<u8>, BusError> {
        let req = build_read_request(self.slave_id, FunctionCode::ReadInputRegisters, addr, count);
        let resp = self.transact(req).await?;
        let regs = parse_register_read_response(&resp, self.slave_id, FunctionCode::ReadInputRegisters)?;
        Ok(regs.iter().flat_map(|r| r.to_be_bytes()).collect())
    }

    async fn read_coils(&mut self, addr: u16, count: u16) -> Result<Vec<u8>, BusError> {
        let req = build_coil_request(self.slave_id, FunctionCode::ReadCoils, addr, CoilArg::Count(count))?;
        let resp = self.transact(req).await?;
        let bit = parse_coil_read_response(&resp, self.slave_id, FunctionCode::ReadCoils)?;
        Ok(vec![bit as u8])
    }

    async fn read_discrete_inputs(&mut self, addr: u16, count: u16) -> Result<Vec<u8>, BusError> {
        let req = build_coil_request(self.slave_id, FunctionCode::ReadDiscreteInputs, addr, CoilArg::Count(count))?;
        let resp = self.transact(req).await?;
        let bit = parse_coil_read_response(&resp, self.slave_id, FunctionCode::ReadDiscreteInputs)?;
        Ok(vec![bit as u8])
    }

    async fn write_single_register(&mut self, addr: u16, value: u16) -> Result<(), BusError> {
        let req = build_write_register_request(self.slave_id, FunctionCode::WriteSingleRegister, addr, &[value])?;
        self.transact(req).await?;
        Ok(())
    }

    async fn write_single_coil(&mut self, addr: u16, value: bool) -> Result<(), BusError> {
        let req = build_coil_request(self.slave_id, FunctionCode::WriteSingleCoil, addr, CoilArg::Value(value))?;
        self.transact(req).await?;
        Ok(())
    }

    async fn write_multiple_registers(&mut self, addr: u16, values: &[u16]) -> Result<(), BusError> {
        let req = build_write_register_request(self.slave_id, FunctionCode::WriteMultipleRegisters, addr, values)?;
        self.transact(req).await?;
        Ok(())
    }

    async fn write_multiple_coils(&mut self, addr: u16, values: &[bool]) -> Result<(), BusError> {
        let mut req = vec![self.slave_id, FunctionCode::WriteMultipleCoils.into()];
        req.extend_from_slice(&addr.to_be_bytes());
        req.extend_from_slice(&(values.len() as u16).to_be_bytes());
        let byte_count = ((values.len() + 7) / 8) as u8;
        req.push(byte_count);
        let mut packed = vec![0u8; byte_count as usize];
        for (i, &v) in values.iter().enumerate() {
            if v {
                packed[i / 8] |= 1 << (i % 8);
            }
        }
        req.extend_from_slice(&packed);
        self.transact(req).await?;
        Ok(())
    }

    async fn read_device_identification(&mut self, object_id: u8) -> Result<Option<String>, BusError> {
        let req = vec![self.slave_id, 0x2B, 0x0E, 0x04, object_id];
        let resp = self.transact(req).await?;
        parse_fc43_individual_object(&resp)
    }

    fn set_slave(&mut self, id: u8) {
        self.slave_id = id;
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn close(&mut self) -> Result<(), BusError> {
        self.closed = true;
        Ok(())
    }
}

/// Parse an FC43 "individual access" response for a single requested
/// object id: `unit_id | 0x2B | 0x0E | read_code | conformity | more |
/// next_id | number_of_objects | object_id | object_len | object_value...`.
/// An empty data object (`object_len == 0`) is treated as present-and-
/// supported, matching how a populated-but-empty identification
/// string is treated elsewhere in the cascade.
fn parse_fc43_individual_object(resp: &[u8]) -> Result<Option<String>, BusError> {
    if resp.len() < 2 {
        return Err(BusError::Codec(crate::error::CodecError::Malformed(
            "FC43 response too short".into(),
        )));
    }
    let fc = resp[1];
    if fc & 0x80 != 0 {
        let code = *resp.get(2).unwrap_or(&0);
        return Err(BusError::Codec(crate::error::CodecError::ExceptionResponse {
            fc: fc & 0x7F,
            code,
        }));
    }
    if resp.len() < 10 {
        return Ok(None);
    }
    let object_len = resp[9] as usize;
    if object_len == 0 || resp.len() < 10 + object_len {
        return Ok(None);
    }
    let value = String::from_utf8_lossy(&resp[10..10 + object_len]).to_string();
    Ok(Some(value))
}
