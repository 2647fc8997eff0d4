//! # Error Handling
//!
//! Error types covering the full lifecycle of a field-bus exchange: transport
//! I/O, protocol framing, register codec conversions and configuration
//! loading.
//!
//! ## Error Categories
//!
//! ### Transport errors
//! - **I/O errors**: socket or serial-port failures
//! - **Connection errors**: connect/reconnect problems
//! - **Timeout errors**: operations that exceeded their deadline
//!
//! Transport errors are the only class the retry machinery will re-attempt;
//! see [`ModbusError::is_recoverable`].
//!
//! ### Protocol errors
//! - **Frame errors**: malformed MBAP headers, truncated PDUs
//! - **CRC mismatches**: corrupted RTU frames
//! - **Exception responses**: standard Modbus exception codes from a device
//! - **Invalid function codes**: codes outside the supported set
//!
//! Protocol errors indicate a contract violation by the peer and are never
//! retried.
//!
//! ### Codec errors
//! - **Decode**: register words do not match the declared data type
//! - **Encode**: a value does not fit its declared width or word length
//!
//! ### Configuration errors
//! Reported at load time with human-readable messages; an offending record
//! is skipped rather than failing the whole configuration document.
//!
//! ## Retry classification
//!
//! ```rust
//! use fieldgate_modbus::ModbusError;
//!
//! let timeout = ModbusError::timeout("read holding registers", 5000);
//! assert!(timeout.is_recoverable());
//!
//! let exception = ModbusError::exception(0x03, 0x02);
//! assert!(!exception.is_recoverable());
//! ```

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Error type covering transport, protocol, codec and configuration
/// failures.
///
/// Constructor helpers (`ModbusError::io(..)`, `ModbusError::frame(..)`, ...)
/// are preferred over building variants directly so call sites stay terse.
#[derive(Error, Debug, Clone)]
pub enum ModbusError {
    /// Low-level I/O failure on a socket or serial handle.
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection establishment or maintenance failure.
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// An operation exceeded its configured deadline.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Generic protocol contract violation that has no more specific variant.
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// A function code outside the supported set was encountered.
    #[error("Invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// An address/quantity combination outside the addressable range.
    #[error("Invalid address: start={start}, count={count}")]
    InvalidAddress { start: u16, count: u16 },

    /// A request or response carried data that fails validation.
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// RTU checksum validation failure.
    #[error("CRC validation failed: expected={expected:04X}, actual={actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// A device answered with a Modbus exception response.
    ///
    /// `function` is the original request function code; `code` is the
    /// exception code from the response PDU.
    #[error("Modbus exception: function=0x{function:02X}, code=0x{code:02X} ({message})")]
    Exception {
        function: u8,
        code: u8,
        message: String,
    },

    /// Frame-level parse failure (truncated or structurally invalid frame).
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Register words could not be interpreted as the declared data type.
    #[error("Decode error: {message}")]
    Decode { message: String },

    /// A value could not be rendered into the declared register layout.
    #[error("Encode error: {message}")]
    Encode { message: String },

    /// Invalid configuration record or parameter.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal invariant violation; should not occur in normal operation.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ModbusError {
    /// Create a new I/O error.
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create a new connection error.
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a new timeout error for the named operation.
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a new protocol error.
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create an invalid function code error.
    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    /// Create an invalid address range error.
    pub fn invalid_address(start: u16, count: u16) -> Self {
        Self::InvalidAddress { start, count }
    }

    /// Create an invalid data error.
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    /// Create a CRC mismatch error.
    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::CrcMismatch { expected, actual }
    }

    /// Create a Modbus exception error, mapping standard exception codes to
    /// their specification names.
    pub fn exception(function: u8, code: u8) -> Self {
        let message = match code {
            0x01 => "Illegal Function",
            0x02 => "Illegal Data Address",
            0x03 => "Illegal Data Value",
            0x04 => "Server Device Failure",
            0x05 => "Acknowledge",
            0x06 => "Server Device Busy",
            0x08 => "Memory Parity Error",
            0x0A => "Gateway Path Unavailable",
            0x0B => "Gateway Target Device Failed to Respond",
            _ => "Unknown Exception",
        }
        .to_string();

        Self::Exception {
            function,
            code,
            message,
        }
    }

    /// Create a frame error.
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame {
            message: message.into(),
        }
    }

    /// Create a decode error.
    pub fn decode<S: Into<String>>(message: S) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Create an encode error.
    pub fn encode<S: Into<String>>(message: S) -> Self {
        Self::Encode {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether a retry of the failed operation could plausibly succeed.
    ///
    /// Transient transport failures qualify; protocol, codec and
    /// configuration errors do not. Exception responses qualify only for the
    /// `Acknowledge` and `Server Device Busy` codes, which signal a device
    /// that is alive but not yet ready.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } => true,
            Self::Connection { .. } => true,
            Self::Timeout { .. } => true,
            Self::Exception { code, .. } => matches!(code, 0x05 | 0x06),
            _ => false,
        }
    }

    /// Whether the error originated in the transport layer.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Connection { .. } | Self::Timeout { .. }
        )
    }

    /// Whether the error is a protocol-level violation.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. }
                | Self::InvalidFunction { .. }
                | Self::Exception { .. }
                | Self::Frame { .. }
                | Self::CrcMismatch { .. }
        )
    }

    /// Whether the error is a codec conversion failure.
    pub fn is_codec_error(&self) -> bool {
        matches!(self, Self::Decode { .. } | Self::Encode { .. })
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for ModbusError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}
