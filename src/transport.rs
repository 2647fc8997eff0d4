//! # Transport Layer
//!
//! Transport implementations for Modbus communication over TCP, serial RTU
//! and UDP, behind one [`ModbusTransport`] trait.
//!
//! The application PDU is identical everywhere (see
//! [`ModbusRequest::encode_pdu_body`]); a transport only adds its framing:
//!
//! - **TCP** ([`TcpTransport`]): MBAP header (transaction id, protocol id,
//!   length prefix) over a stream socket, with reconnect-on-demand.
//! - **RTU** ([`RtuTransport`]): unit id + PDU + CRC-16 over a serial port,
//!   with the 3.5-character inter-frame gap derived from the baud rate.
//! - **UDP** ([`UdpTransport`]): MBAP framing, one datagram per
//!   transaction on a connected socket.
//!
//! Every request/response cycle is bounded by the transport's configured
//! timeout; an exceeded deadline surfaces as [`ModbusError::Timeout`] and
//! marks a stream transport broken so the next call reconnects.
//!
//! ```rust,no_run
//! use fieldgate_modbus::transport::{ModbusTransport, TcpTransport};
//! use fieldgate_modbus::protocol::{FunctionCode, ModbusRequest};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut transport = TcpTransport::connect(
//!     "127.0.0.1:502".parse()?,
//!     Duration::from_secs(5),
//! ).await?;
//!
//! let request = ModbusRequest::new_read(1, FunctionCode::ReadHoldingRegisters, 0, 10);
//! let response = transport.request(&request).await?;
//! println!("words: {:?}", response.parse_words()?);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use crc::{Crc, CRC_16_MODBUS};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::debug;

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{FunctionCode, ModbusRequest, ModbusResponse};
use crate::{MAX_RTU_FRAME_SIZE, MAX_TCP_FRAME_SIZE, MBAP_HEADER_SIZE};

/// CRC calculator for RTU frames.
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

fn hex_dump(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Emit a wire-level packet trace when enabled.
fn trace_packet(direction: &str, protocol: &str, unit_id: u8, data: &[u8]) {
    debug!(
        "[MODBUS-{}] {} unit:{} {}",
        protocol,
        direction,
        unit_id,
        hex_dump(data)
    );
}

/// Counters describing a transport's communication history.
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Common interface over the physical transports.
///
/// A transport executes one complete request/response cycle per
/// [`ModbusTransport::request`] call: frame encoding, transmission,
/// response reception and frame decoding. Implementations are `Send + Sync`
/// so one transport can sit behind a shared link lock.
#[async_trait]
pub trait ModbusTransport: Send + Sync {
    /// Execute one request/response transaction.
    async fn request(&mut self, request: &ModbusRequest) -> ModbusResult<ModbusResponse>;

    /// Whether the transport currently believes it is connected. This is a
    /// local check only; it does not probe the remote device.
    fn is_connected(&self) -> bool;

    /// Close the transport and release its handle.
    async fn close(&mut self) -> ModbusResult<()>;

    /// Communication statistics accumulated since creation.
    fn get_stats(&self) -> TransportStats;
}

/// Build an MBAP frame (TCP/UDP) for a request.
fn encode_mbap_frame(transaction_id: u16, request: &ModbusRequest) -> Vec<u8> {
    let body = request.encode_pdu_body();
    // length counts unit id + function code + body
    let length = (2 + body.len()) as u16;

    let mut frame = Vec::with_capacity(MBAP_HEADER_SIZE + length as usize);
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes()); // protocol id, always 0
    frame.extend_from_slice(&length.to_be_bytes());
    frame.push(request.unit_id);
    frame.push(request.function.to_u8());
    frame.extend_from_slice(&body);
    frame
}

/// Decode an MBAP frame (TCP/UDP) into a response.
fn decode_mbap_frame(frame: &[u8]) -> ModbusResult<ModbusResponse> {
    if frame.len() < MBAP_HEADER_SIZE + 2 {
        return Err(ModbusError::frame("Frame too short"));
    }

    let length = u16::from_be_bytes([frame[4], frame[5]]) as usize;
    let unit_id = frame[6];
    if frame.len() < MBAP_HEADER_SIZE + length {
        return Err(ModbusError::frame("Incomplete frame"));
    }

    let function_code = frame[7];
    if function_code & 0x80 != 0 {
        if length < 3 {
            return Err(ModbusError::frame("Invalid exception response"));
        }
        let function = FunctionCode::from_u8(function_code & 0x7F)?;
        return Ok(ModbusResponse::new_exception(unit_id, function, frame[8]));
    }

    let function = FunctionCode::from_u8(function_code)?;
    let data = frame[MBAP_HEADER_SIZE + 2..MBAP_HEADER_SIZE + length].to_vec();
    Ok(ModbusResponse::new_success(unit_id, function, data))
}

/// Modbus TCP transport.
///
/// Holds at most one stream; a failed transaction drops the stream so the
/// next request reconnects transparently.
pub struct TcpTransport {
    stream: Option<TcpStream>,
    address: SocketAddr,
    timeout: Duration,
    transaction_id: u16,
    stats: TransportStats,
    packet_logging: bool,
}

impl TcpTransport {
    /// Connect to a Modbus TCP endpoint, bounded by `timeout`.
    pub async fn connect(address: SocketAddr, timeout: Duration) -> ModbusResult<Self> {
        let stream = Self::open_stream(address, timeout).await?;

        Ok(Self {
            stream: Some(stream),
            address,
            timeout,
            transaction_id: 0,
            stats: TransportStats::default(),
            packet_logging: false,
        })
    }

    /// The remote endpoint address.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Enable or disable wire-level packet traces.
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    async fn open_stream(address: SocketAddr, deadline: Duration) -> ModbusResult<TcpStream> {
        match timeout(deadline, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(ModbusError::connection(format!(
                "Failed to connect to {}: {}",
                address, e
            ))),
            Err(_) => Err(ModbusError::timeout(
                format!("connect to {}", address),
                deadline.as_millis() as u64,
            )),
        }
    }

    async fn reconnect(&mut self) -> ModbusResult<()> {
        self.stream = None;
        self.stream = Some(Self::open_stream(self.address, self.timeout).await?);
        Ok(())
    }

    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        if self.transaction_id == 0 {
            self.transaction_id = 1;
        }
        self.transaction_id
    }

    fn broken(&mut self, operation: &str) -> ModbusError {
        self.stats.timeouts += 1;
        self.stats.errors += 1;
        self.stream = None;
        ModbusError::timeout(operation, self.timeout.as_millis() as u64)
    }
}

#[async_trait]
impl ModbusTransport for TcpTransport {
    async fn request(&mut self, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
        request.validate()?;

        if self.stream.is_none() {
            self.reconnect().await?;
        }

        let frame = encode_mbap_frame(self.next_transaction_id(), request);
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;

        if self.packet_logging {
            trace_packet("send", "TCP", request.unit_id, &frame);
        }

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ModbusError::connection("TCP stream not connected"))?;

        match timeout(self.timeout, stream.write_all(&frame)).await {
            Ok(Ok(())) => {}
            _ => return Err(self.broken("send request")),
        }

        // MBAP header plus the function code byte
        let mut header = [0u8; MBAP_HEADER_SIZE + 2];
        match timeout(self.timeout, stream.read_exact(&mut header)).await {
            Ok(Ok(_)) => {}
            _ => return Err(self.broken("read response header")),
        }

        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        if length + MBAP_HEADER_SIZE > MAX_TCP_FRAME_SIZE {
            self.stats.errors += 1;
            return Err(ModbusError::frame("Response frame too large"));
        }

        // unit id and function code were read with the header
        let remaining = length.saturating_sub(2);
        let mut frame = vec![0u8; header.len() + remaining];
        frame[..header.len()].copy_from_slice(&header);
        if remaining > 0 {
            match timeout(self.timeout, stream.read_exact(&mut frame[header.len()..])).await {
                Ok(Ok(_)) => {}
                _ => return Err(self.broken("read response data")),
            }
        }

        self.stats.responses_received += 1;
        self.stats.bytes_received += frame.len() as u64;

        if self.packet_logging {
            trace_packet("receive", "TCP", request.unit_id, &frame);
        }

        let response = decode_mbap_frame(&frame)?;
        if let Some(error) = response.exception_error() {
            self.stats.errors += 1;
            return Err(error);
        }
        Ok(response)
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn close(&mut self) -> ModbusResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

/// Serial line parameters for RTU transports.
#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub data_bits: tokio_serial::DataBits,
    pub stop_bits: tokio_serial::StopBits,
    pub parity: tokio_serial::Parity,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            data_bits: tokio_serial::DataBits::Eight,
            stop_bits: tokio_serial::StopBits::One,
            parity: tokio_serial::Parity::None,
        }
    }
}

/// Modbus RTU transport over a serial port.
pub struct RtuTransport {
    port: Option<tokio_serial::SerialStream>,
    port_name: String,
    baud_rate: u32,
    settings: SerialSettings,
    timeout: Duration,
    /// Minimum quiet time between frames (3.5 character times).
    frame_gap: Duration,
    stats: TransportStats,
    packet_logging: bool,
}

impl RtuTransport {
    /// Open a serial port with default line settings and a one second
    /// timeout.
    pub fn open(port: &str, baud_rate: u32) -> ModbusResult<Self> {
        Self::open_with_settings(
            port,
            baud_rate,
            SerialSettings::default(),
            Duration::from_millis(1000),
        )
    }

    /// Open a serial port with explicit line settings.
    pub fn open_with_settings(
        port: &str,
        baud_rate: u32,
        settings: SerialSettings,
        timeout: Duration,
    ) -> ModbusResult<Self> {
        // 11 bit times per character on the wire, 3.5 characters of quiet
        let char_time_us = (11_000_000 / baud_rate.max(1)) as u64;
        let frame_gap = Duration::from_micros(char_time_us * 35 / 10);

        let mut transport = Self {
            port: None,
            port_name: port.to_string(),
            baud_rate,
            settings,
            timeout,
            frame_gap,
            stats: TransportStats::default(),
            packet_logging: false,
        };
        transport.open_port()?;
        Ok(transport)
    }

    /// Enable or disable wire-level packet traces.
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    fn open_port(&mut self) -> ModbusResult<()> {
        let builder = tokio_serial::new(&self.port_name, self.baud_rate)
            .data_bits(self.settings.data_bits)
            .stop_bits(self.settings.stop_bits)
            .parity(self.settings.parity)
            .timeout(self.timeout);

        let port = tokio_serial::SerialStream::open(&builder).map_err(|e| {
            ModbusError::connection(format!(
                "Failed to open serial port {}: {}",
                self.port_name, e
            ))
        })?;
        self.port = Some(port);
        Ok(())
    }

    fn encode_frame(request: &ModbusRequest) -> Vec<u8> {
        let body = request.encode_pdu_body();
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.push(request.unit_id);
        frame.push(request.function.to_u8());
        frame.extend_from_slice(&body);

        let crc = CRC_MODBUS.checksum(&frame);
        frame.extend_from_slice(&crc.to_le_bytes()); // CRC travels little-endian
        frame
    }

    fn decode_frame(frame: &[u8]) -> ModbusResult<ModbusResponse> {
        if frame.len() < 4 {
            return Err(ModbusError::frame("RTU frame too short"));
        }

        let data_len = frame.len() - 2;
        let received_crc = u16::from_le_bytes([frame[data_len], frame[data_len + 1]]);
        let calculated_crc = CRC_MODBUS.checksum(&frame[..data_len]);
        if received_crc != calculated_crc {
            return Err(ModbusError::crc_mismatch(calculated_crc, received_crc));
        }

        let unit_id = frame[0];
        let function_code = frame[1];
        if function_code & 0x80 != 0 {
            if frame.len() < 5 {
                return Err(ModbusError::frame("Invalid exception response"));
            }
            let function = FunctionCode::from_u8(function_code & 0x7F)?;
            return Ok(ModbusResponse::new_exception(unit_id, function, frame[2]));
        }

        let function = FunctionCode::from_u8(function_code)?;
        let data = if frame.len() > 4 {
            frame[2..data_len].to_vec()
        } else {
            Vec::new()
        };
        Ok(ModbusResponse::new_success(unit_id, function, data))
    }

    /// Read one frame, terminated by a frame-gap of silence.
    async fn read_frame(&mut self) -> ModbusResult<Vec<u8>> {
        let frame_gap = self.frame_gap;
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| ModbusError::connection("Serial port not connected"))?;

        let mut frame = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match timeout(frame_gap, port.read_exact(&mut byte)).await {
                Ok(Ok(_)) => {
                    frame.push(byte[0]);
                    if frame.len() > MAX_RTU_FRAME_SIZE {
                        return Err(ModbusError::frame("RTU frame too large"));
                    }
                }
                Ok(Err(e)) => {
                    return Err(ModbusError::io(format!("Serial read error: {}", e)));
                }
                Err(_) => {
                    // silence marks end of frame once data has arrived
                    if !frame.is_empty() {
                        break;
                    }
                }
            }
        }
        Ok(frame)
    }
}

#[async_trait]
impl ModbusTransport for RtuTransport {
    async fn request(&mut self, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
        request.validate()?;

        if self.port.is_none() {
            self.open_port()?;
        }

        // honour the inter-frame gap before transmitting
        tokio::time::sleep(self.frame_gap).await;

        let frame = Self::encode_frame(request);
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;

        if self.packet_logging {
            trace_packet("send", "RTU", request.unit_id, &frame);
        }

        let op_timeout = self.timeout;
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| ModbusError::connection("Serial port not connected"))?;

        match timeout(op_timeout, port.write_all(&frame)).await {
            Ok(Ok(())) => {
                let _ = timeout(op_timeout, port.flush()).await;
            }
            Ok(Err(e)) => {
                self.stats.errors += 1;
                return Err(ModbusError::io(format!("Failed to send RTU frame: {}", e)));
            }
            Err(_) => {
                self.stats.timeouts += 1;
                self.stats.errors += 1;
                return Err(ModbusError::timeout(
                    "send request",
                    op_timeout.as_millis() as u64,
                ));
            }
        }

        let response_frame = match timeout(op_timeout, self.read_frame()).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                self.stats.errors += 1;
                return Err(e);
            }
            Err(_) => {
                self.stats.timeouts += 1;
                self.stats.errors += 1;
                return Err(ModbusError::timeout(
                    "read response",
                    op_timeout.as_millis() as u64,
                ));
            }
        };

        self.stats.responses_received += 1;
        self.stats.bytes_received += response_frame.len() as u64;

        if self.packet_logging {
            trace_packet("receive", "RTU", request.unit_id, &response_frame);
        }

        let response = Self::decode_frame(&response_frame)?;

        if response.unit_id != request.unit_id {
            self.stats.errors += 1;
            return Err(ModbusError::protocol(format!(
                "Response unit id mismatch: expected {}, got {}",
                request.unit_id, response.unit_id
            )));
        }

        if let Some(error) = response.exception_error() {
            self.stats.errors += 1;
            return Err(error);
        }
        Ok(response)
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    async fn close(&mut self) -> ModbusResult<()> {
        // dropping the stream releases the port handle
        self.port.take();
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

/// Modbus UDP transport.
///
/// Uses MBAP framing like TCP but exchanges one datagram per transaction
/// over a connected socket, so there is no stream to break: a timeout
/// simply surfaces to the retry policy.
pub struct UdpTransport {
    socket: Option<UdpSocket>,
    address: SocketAddr,
    timeout: Duration,
    transaction_id: u16,
    stats: TransportStats,
    packet_logging: bool,
}

impl UdpTransport {
    /// Bind an ephemeral local socket connected to the remote endpoint.
    pub async fn connect(address: SocketAddr, timeout: Duration) -> ModbusResult<Self> {
        let bind_addr: SocketAddr = if address.is_ipv4() {
            "0.0.0.0:0".parse().map_err(|e| {
                ModbusError::internal(format!("Invalid bind address: {}", e))
            })?
        } else {
            "[::]:0".parse().map_err(|e| {
                ModbusError::internal(format!("Invalid bind address: {}", e))
            })?
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| ModbusError::connection(format!("Failed to bind UDP socket: {}", e)))?;
        socket.connect(address).await.map_err(|e| {
            ModbusError::connection(format!("Failed to connect UDP socket to {}: {}", address, e))
        })?;

        Ok(Self {
            socket: Some(socket),
            address,
            timeout,
            transaction_id: 0,
            stats: TransportStats::default(),
            packet_logging: false,
        })
    }

    /// The remote endpoint address.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Enable or disable wire-level packet traces.
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        if self.transaction_id == 0 {
            self.transaction_id = 1;
        }
        self.transaction_id
    }
}

#[async_trait]
impl ModbusTransport for UdpTransport {
    async fn request(&mut self, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
        request.validate()?;

        let transaction_id = self.next_transaction_id();
        let frame = encode_mbap_frame(transaction_id, request);
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;

        if self.packet_logging {
            trace_packet("send", "UDP", request.unit_id, &frame);
        }

        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| ModbusError::connection("UDP socket closed"))?;

        match timeout(self.timeout, socket.send(&frame)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                self.stats.errors += 1;
                return Err(ModbusError::io(format!("UDP send error: {}", e)));
            }
            Err(_) => {
                self.stats.timeouts += 1;
                self.stats.errors += 1;
                return Err(ModbusError::timeout(
                    "send request",
                    self.timeout.as_millis() as u64,
                ));
            }
        }

        let mut buffer = [0u8; MAX_TCP_FRAME_SIZE];
        loop {
            let received = match timeout(self.timeout, socket.recv(&mut buffer)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    self.stats.errors += 1;
                    return Err(ModbusError::io(format!("UDP receive error: {}", e)));
                }
                Err(_) => {
                    self.stats.timeouts += 1;
                    self.stats.errors += 1;
                    return Err(ModbusError::timeout(
                        "read response",
                        self.timeout.as_millis() as u64,
                    ));
                }
            };

            let datagram = &buffer[..received];
            if datagram.len() >= 2 {
                let tid = u16::from_be_bytes([datagram[0], datagram[1]]);
                if tid != transaction_id {
                    // stale datagram from an earlier timed-out transaction
                    continue;
                }
            }

            self.stats.responses_received += 1;
            self.stats.bytes_received += received as u64;

            if self.packet_logging {
                trace_packet("receive", "UDP", request.unit_id, datagram);
            }

            let response = decode_mbap_frame(datagram)?;
            if let Some(error) = response.exception_error() {
                self.stats.errors += 1;
                return Err(error);
            }
            return Ok(response);
        }
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.socket.take();
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}
