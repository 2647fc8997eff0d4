//! # Fieldgate Modbus
//!
//! An industrial field-bus (Modbus) communication stack: typed register
//! codec, address-range coalescing, client connections over TCP, serial
//! RTU and UDP transports with per-link locking, caching and retry, and
//! the reciprocal server engine answering requests against an in-memory
//! register table.
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Client | Server |
//! |------|----------|--------|--------|
//! | 0x01 | Read Coils | yes | yes |
//! | 0x02 | Read Discrete Inputs | yes | yes |
//! | 0x03 | Read Holding Registers | yes | yes |
//! | 0x04 | Read Input Registers | yes | yes |
//! | 0x05 | Write Single Coil | yes | yes |
//! | 0x06 | Write Single Register | yes | yes |
//! | 0x0F | Write Multiple Coils | yes | yes |
//! | 0x10 | Write Multiple Registers | yes | yes |
//!
//! ## Client Example
//!
//! ```rust,no_run
//! use fieldgate_modbus::codec::DataType;
//! use fieldgate_modbus::connection::{shared_link, FieldDevice, ModbusConnection};
//! use fieldgate_modbus::field::FieldDescriptor;
//! use fieldgate_modbus::protocol::FunctionCode;
//! use fieldgate_modbus::transport::TcpTransport;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport =
//!         TcpTransport::connect("127.0.0.1:502".parse()?, Duration::from_secs(5)).await?;
//!     let link = shared_link(transport);
//!
//!     let connection = ModbusConnection::new(link, 1);
//!     let device = FieldDevice::new(connection, Duration::from_secs(5));
//!
//!     let fields = vec![
//!         FieldDescriptor::new("watts", 30, DataType::UInt32, FunctionCode::ReadInputRegisters),
//!         FieldDescriptor::new("frequency", 38, DataType::Float32, FunctionCode::ReadInputRegisters)
//!             .with_decimal_scale(1),
//!     ];
//!     let values = device.read_fields(&fields).await?;
//!     println!("watts = {}", values["watts"]);
//!     Ok(())
//! }
//! ```
//!
//! ## Server Example
//!
//! ```rust,no_run
//! use fieldgate_modbus::server::{ModbusTcpServer, ModbusTcpServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ModbusTcpServerConfig {
//!         bind_address: "127.0.0.1:502".parse()?,
//!         ..Default::default()
//!     };
//!     let mut server = ModbusTcpServer::with_config(config);
//!     server.start().await?;
//!
//!     // seed some data for masters to read
//!     let bank = server.table().bank(1).expect("unit 1");
//!     bank.set_input(30, 0x0101)?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod field;
pub mod logging;
pub mod protocol;
pub mod range;
pub mod register_bank;
pub mod server;
pub mod store;
pub mod transport;

pub use cache::{CachedTcpTransport, ConnState};
pub use codec::{DataType, Value, WordOrder};
pub use connection::{shared_link, FieldDevice, ModbusConnection, RetryPolicy, SharedLink};
pub use error::{ModbusError, ModbusResult};
pub use field::FieldDescriptor;
pub use logging::{CallbackLogger, LogCallback, LogLevel, LoggingMode};
pub use protocol::{
    BlockType, ExceptionCode, FunctionCode, ModbusRequest, ModbusResponse, UnitId, Word,
};
pub use range::{coalesce, AddressRange, RangeSet, ReadChunk};
pub use register_bank::{ModbusRegisterBank, RegisterBankStats};
pub use server::{
    GatePredicate, MeasurementMapping, ModbusTcpServer, ModbusTcpServerConfig, ServerRegisterTable,
    ServerStats,
};
pub use store::{BitArray, RegisterSet, Sample, SampleStore};
pub use transport::{
    ModbusTransport, RtuTransport, SerialSettings, TcpTransport, TransportStats, UdpTransport,
};

/// Default timeout for transactions, in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Maximum bits per read/write request (coils, discretes).
pub const MAX_BITS_PER_REQUEST: u16 = 2000;

/// Maximum register words per read/write request.
pub const MAX_WORDS_PER_REQUEST: u16 = 125;

/// Maximum Modbus TCP frame size (MBAP header plus PDU).
pub const MAX_TCP_FRAME_SIZE: usize = 260;

/// Maximum Modbus RTU frame size.
pub const MAX_RTU_FRAME_SIZE: usize = 256;

/// MBAP header size (transaction id, protocol id, length).
pub const MBAP_HEADER_SIZE: usize = 6;

/// Modbus TCP default port.
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
