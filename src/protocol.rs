//! Modbus protocol definitions and data structures.
//!
//! This module holds the wire-level vocabulary shared by every transport and
//! by the server engine: function codes, exception codes, the
//! request/response model and PDU body encoding. Transports differ only in
//! how they wrap the PDU (MBAP header for TCP/UDP, unit id + CRC for RTU),
//! so the PDU body is built once here and reused.

use crate::error::{ModbusError, ModbusResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Register address (0-based word offset, 0-65535).
pub type ModbusAddress = u16;

/// Raw 16-bit register word.
pub type Word = u16;

/// Unit (slave) identifier on a shared link (1-247).
pub type UnitId = u8;

/// Supported Modbus function codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum FunctionCode {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    /// Parse a raw function code byte.
    pub fn from_u8(value: u8) -> ModbusResult<Self> {
        match value {
            0x01 => Ok(FunctionCode::ReadCoils),
            0x02 => Ok(FunctionCode::ReadDiscreteInputs),
            0x03 => Ok(FunctionCode::ReadHoldingRegisters),
            0x04 => Ok(FunctionCode::ReadInputRegisters),
            0x05 => Ok(FunctionCode::WriteSingleCoil),
            0x06 => Ok(FunctionCode::WriteSingleRegister),
            0x0F => Ok(FunctionCode::WriteMultipleCoils),
            0x10 => Ok(FunctionCode::WriteMultipleRegisters),
            _ => Err(ModbusError::invalid_function(value)),
        }
    }

    /// The raw function code byte.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Whether this is one of the four read functions.
    pub fn is_read(self) -> bool {
        matches!(
            self,
            FunctionCode::ReadCoils
                | FunctionCode::ReadDiscreteInputs
                | FunctionCode::ReadHoldingRegisters
                | FunctionCode::ReadInputRegisters
        )
    }

    /// Whether this is one of the four write functions.
    pub fn is_write(self) -> bool {
        !self.is_read()
    }

    /// Whether the function addresses single bits rather than words.
    pub fn is_bit_function(self) -> bool {
        matches!(
            self,
            FunctionCode::ReadCoils
                | FunctionCode::ReadDiscreteInputs
                | FunctionCode::WriteSingleCoil
                | FunctionCode::WriteMultipleCoils
        )
    }

    /// The register bank this function operates on.
    pub fn block_type(self) -> BlockType {
        match self {
            FunctionCode::ReadCoils
            | FunctionCode::WriteSingleCoil
            | FunctionCode::WriteMultipleCoils => BlockType::Coil,
            FunctionCode::ReadDiscreteInputs => BlockType::Discrete,
            FunctionCode::ReadInputRegisters => BlockType::Input,
            FunctionCode::ReadHoldingRegisters
            | FunctionCode::WriteSingleRegister
            | FunctionCode::WriteMultipleRegisters => BlockType::Holding,
        }
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FunctionCode::ReadCoils => "Read Coils",
            FunctionCode::ReadDiscreteInputs => "Read Discrete Inputs",
            FunctionCode::ReadHoldingRegisters => "Read Holding Registers",
            FunctionCode::ReadInputRegisters => "Read Input Registers",
            FunctionCode::WriteSingleCoil => "Write Single Coil",
            FunctionCode::WriteSingleRegister => "Write Single Register",
            FunctionCode::WriteMultipleCoils => "Write Multiple Coils",
            FunctionCode::WriteMultipleRegisters => "Write Multiple Registers",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// The four register banks of a Modbus unit.
///
/// Coils and discrete inputs are bit-addressed; input and holding registers
/// are word-addressed. Discrete and input banks are read-only on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockType {
    /// Read/write single-bit registers.
    Coil,
    /// Read-only single-bit registers.
    Discrete,
    /// Read-only 16-bit registers.
    Input,
    /// Read/write 16-bit registers.
    Holding,
}

impl BlockType {
    /// Whether this bank is bit-addressed.
    pub fn is_bit_type(self) -> bool {
        matches!(self, BlockType::Coil | BlockType::Discrete)
    }

    /// The read function code for this bank.
    pub fn read_function(self) -> FunctionCode {
        match self {
            BlockType::Coil => FunctionCode::ReadCoils,
            BlockType::Discrete => FunctionCode::ReadDiscreteInputs,
            BlockType::Input => FunctionCode::ReadInputRegisters,
            BlockType::Holding => FunctionCode::ReadHoldingRegisters,
        }
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlockType::Coil => "coil",
            BlockType::Discrete => "discrete",
            BlockType::Input => "input",
            BlockType::Holding => "holding",
        };
        f.write_str(name)
    }
}

/// Standard Modbus exception codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetFailedToRespond = 0x0B,
}

impl ExceptionCode {
    /// Parse a raw exception code byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ExceptionCode::IllegalFunction),
            0x02 => Some(ExceptionCode::IllegalDataAddress),
            0x03 => Some(ExceptionCode::IllegalDataValue),
            0x04 => Some(ExceptionCode::ServerDeviceFailure),
            0x05 => Some(ExceptionCode::Acknowledge),
            0x06 => Some(ExceptionCode::ServerDeviceBusy),
            0x08 => Some(ExceptionCode::MemoryParityError),
            0x0A => Some(ExceptionCode::GatewayPathUnavailable),
            0x0B => Some(ExceptionCode::GatewayTargetFailedToRespond),
            _ => None,
        }
    }

    /// The raw exception code byte.
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Modbus exception 0x{:02X}", self.to_u8())
    }
}

/// A single Modbus request.
///
/// `quantity` carries the register/bit count for read and multiple-write
/// functions; `data` carries write payload bytes in wire order (for
/// `WriteSingleCoil` a single nonzero byte means ON).
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusRequest {
    pub unit_id: UnitId,
    pub function: FunctionCode,
    pub address: ModbusAddress,
    pub quantity: u16,
    pub data: Vec<u8>,
}

impl ModbusRequest {
    /// Create a read request.
    pub fn new_read(
        unit_id: UnitId,
        function: FunctionCode,
        address: ModbusAddress,
        quantity: u16,
    ) -> Self {
        Self {
            unit_id,
            function,
            address,
            quantity,
            data: Vec::new(),
        }
    }

    /// Create a write request; the quantity is derived from the function and
    /// payload.
    pub fn new_write(
        unit_id: UnitId,
        function: FunctionCode,
        address: ModbusAddress,
        quantity: u16,
        data: Vec<u8>,
    ) -> Self {
        Self {
            unit_id,
            function,
            address,
            quantity,
            data,
        }
    }

    /// Validate unit id and quantity limits before hitting the wire.
    pub fn validate(&self) -> ModbusResult<()> {
        if self.unit_id == 0 || self.unit_id > 247 {
            return Err(ModbusError::invalid_data(format!(
                "Invalid unit id: {}",
                self.unit_id
            )));
        }

        if self.function.is_read() {
            if self.quantity == 0 {
                return Err(ModbusError::invalid_address(self.address, self.quantity));
            }
            let limit = if self.function.is_bit_function() {
                crate::MAX_BITS_PER_REQUEST
            } else {
                crate::MAX_WORDS_PER_REQUEST
            };
            if self.quantity > limit {
                return Err(ModbusError::invalid_address(self.address, self.quantity));
            }
        }

        if (self.address as u32 + self.quantity.max(1) as u32) > 0x1_0000 {
            return Err(ModbusError::invalid_address(self.address, self.quantity));
        }

        Ok(())
    }

    /// Encode the PDU body following the function code byte: address,
    /// quantity, byte count and payload as each function requires.
    ///
    /// The returned bytes are identical for every transport; only the frame
    /// wrapper differs.
    pub fn encode_pdu_body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(4 + self.data.len());
        body.extend_from_slice(&self.address.to_be_bytes());

        match self.function {
            FunctionCode::ReadCoils
            | FunctionCode::ReadDiscreteInputs
            | FunctionCode::ReadHoldingRegisters
            | FunctionCode::ReadInputRegisters => {
                body.extend_from_slice(&self.quantity.to_be_bytes());
            }

            FunctionCode::WriteSingleCoil => {
                let value: u16 = if self.data.first().copied().unwrap_or(0) != 0 {
                    0xFF00
                } else {
                    0x0000
                };
                body.extend_from_slice(&value.to_be_bytes());
            }

            FunctionCode::WriteSingleRegister => {
                if self.data.len() >= 2 {
                    body.extend_from_slice(&self.data[0..2]);
                } else {
                    body.extend_from_slice(&[0, 0]);
                }
            }

            FunctionCode::WriteMultipleCoils | FunctionCode::WriteMultipleRegisters => {
                body.extend_from_slice(&self.quantity.to_be_bytes());
                body.push(self.data.len() as u8);
                body.extend_from_slice(&self.data);
            }
        }

        body
    }
}

/// A single Modbus response.
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusResponse {
    pub unit_id: UnitId,
    pub function: FunctionCode,
    pub data: Vec<u8>,
    pub exception: Option<ExceptionCode>,
}

impl ModbusResponse {
    /// Create a successful response.
    pub fn new_success(unit_id: UnitId, function: FunctionCode, data: Vec<u8>) -> Self {
        Self {
            unit_id,
            function,
            data,
            exception: None,
        }
    }

    /// Create an exception response.
    pub fn new_exception(unit_id: UnitId, function: FunctionCode, exception_code: u8) -> Self {
        Self {
            unit_id,
            function,
            data: vec![exception_code],
            exception: ExceptionCode::from_u8(exception_code),
        }
    }

    /// Whether this is an exception response.
    pub fn is_exception(&self) -> bool {
        self.exception.is_some()
    }

    /// Convert an exception response into the matching error, if any.
    pub fn exception_error(&self) -> Option<ModbusError> {
        self.exception
            .map(|exc| ModbusError::exception(self.function.to_u8(), exc.to_u8()))
    }

    /// Interpret the response payload as register words.
    ///
    /// The payload is expected in the read-response layout: a byte count
    /// followed by big-endian word pairs.
    pub fn parse_words(&self) -> ModbusResult<Vec<Word>> {
        if let Some(err) = self.exception_error() {
            return Err(err);
        }

        if self.data.is_empty() {
            return Err(ModbusError::frame("Empty response data"));
        }

        let byte_count = self.data[0] as usize;
        if self.data.len() < 1 + byte_count {
            return Err(ModbusError::frame("Incomplete register data"));
        }
        if byte_count % 2 != 0 {
            return Err(ModbusError::frame("Odd register data length"));
        }

        let mut words = Vec::with_capacity(byte_count / 2);
        for i in (1..1 + byte_count).step_by(2) {
            words.push(u16::from_be_bytes([self.data[i], self.data[i + 1]]));
        }
        Ok(words)
    }

    /// Interpret the response payload as packed bits.
    ///
    /// Returns one boolean per transmitted bit, LSB-first within each byte;
    /// the caller truncates to the requested quantity.
    pub fn parse_bits(&self) -> ModbusResult<Vec<bool>> {
        if let Some(err) = self.exception_error() {
            return Err(err);
        }

        if self.data.is_empty() {
            return Err(ModbusError::frame("Empty response data"));
        }

        let byte_count = self.data[0] as usize;
        if self.data.len() < 1 + byte_count {
            return Err(ModbusError::frame("Incomplete bit data"));
        }

        let mut bits = Vec::with_capacity(byte_count * 8);
        for &byte in &self.data[1..1 + byte_count] {
            for bit_pos in 0..8 {
                bits.push((byte & (1 << bit_pos)) != 0);
            }
        }
        Ok(bits)
    }
}

/// PDU-level packing helpers shared by client and server paths.
pub mod pdu {
    use super::*;

    /// Render register words as big-endian bytes.
    pub fn words_to_bytes(words: &[Word]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(words.len() * 2);
        for &word in words {
            bytes.extend_from_slice(&word.to_be_bytes());
        }
        bytes
    }

    /// Interpret big-endian bytes as register words.
    pub fn bytes_to_words(bytes: &[u8]) -> ModbusResult<Vec<Word>> {
        if bytes.len() % 2 != 0 {
            return Err(ModbusError::invalid_data(
                "Byte array length must be even".to_string(),
            ));
        }
        Ok(bytes
            .chunks(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect())
    }

    /// Pack booleans into bytes, LSB-first.
    pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
        let mut bytes = vec![0u8; (bits.len() + 7) / 8];
        for (i, &bit) in bits.iter().enumerate() {
            if bit {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }
        bytes
    }

    /// Unpack bytes into `bit_count` booleans, LSB-first.
    pub fn unpack_bits(bytes: &[u8], bit_count: usize) -> Vec<bool> {
        let mut bits = Vec::with_capacity(bit_count);
        for i in 0..bit_count {
            let byte_index = i / 8;
            if byte_index < bytes.len() {
                bits.push((bytes[byte_index] & (1 << (i % 8))) != 0);
            } else {
                bits.push(false);
            }
        }
        bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_conversion() {
        assert_eq!(
            FunctionCode::from_u8(0x03).unwrap(),
            FunctionCode::ReadHoldingRegisters
        );
        assert_eq!(FunctionCode::ReadHoldingRegisters.to_u8(), 0x03);
        assert!(FunctionCode::from_u8(0xFF).is_err());
    }

    #[test]
    fn test_block_type_mapping() {
        assert_eq!(FunctionCode::ReadCoils.block_type(), BlockType::Coil);
        assert_eq!(
            FunctionCode::WriteMultipleRegisters.block_type(),
            BlockType::Holding
        );
        assert!(BlockType::Discrete.is_bit_type());
        assert_eq!(
            BlockType::Input.read_function(),
            FunctionCode::ReadInputRegisters
        );
    }

    #[test]
    fn test_exception_conversion() {
        assert_eq!(
            ExceptionCode::from_u8(0x02).unwrap(),
            ExceptionCode::IllegalDataAddress
        );
        assert_eq!(ExceptionCode::IllegalDataAddress.to_u8(), 0x02);
        assert!(ExceptionCode::from_u8(0x7F).is_none());
    }

    #[test]
    fn test_request_validation() {
        let ok = ModbusRequest::new_read(1, FunctionCode::ReadHoldingRegisters, 100, 10);
        assert!(ok.validate().is_ok());

        let bad_unit = ModbusRequest::new_read(0, FunctionCode::ReadHoldingRegisters, 100, 10);
        assert!(bad_unit.validate().is_err());

        let too_many = ModbusRequest::new_read(1, FunctionCode::ReadHoldingRegisters, 100, 200);
        assert!(too_many.validate().is_err());

        let overflow = ModbusRequest::new_read(1, FunctionCode::ReadHoldingRegisters, 65530, 10);
        assert!(overflow.validate().is_err());
    }

    #[test]
    fn test_pdu_body_read() {
        let req = ModbusRequest::new_read(1, FunctionCode::ReadHoldingRegisters, 0x0011, 2);
        assert_eq!(req.encode_pdu_body(), vec![0x00, 0x11, 0x00, 0x02]);
    }

    #[test]
    fn test_pdu_body_write_single_coil() {
        let req = ModbusRequest::new_write(1, FunctionCode::WriteSingleCoil, 5, 1, vec![1]);
        assert_eq!(req.encode_pdu_body(), vec![0x00, 0x05, 0xFF, 0x00]);

        let req = ModbusRequest::new_write(1, FunctionCode::WriteSingleCoil, 5, 1, vec![0]);
        assert_eq!(req.encode_pdu_body(), vec![0x00, 0x05, 0x00, 0x00]);
    }

    #[test]
    fn test_bit_packing_round_trip() {
        let bits = vec![true, false, true, true, false, false, false, false, true];
        let packed = pdu::pack_bits(&bits);
        assert_eq!(packed.len(), 2);
        let unpacked = pdu::unpack_bits(&packed, bits.len());
        assert_eq!(unpacked, bits);
    }

    #[test]
    fn test_word_bytes_round_trip() {
        let words = vec![0x1234, 0x5678];
        let bytes = pdu::words_to_bytes(&words);
        assert_eq!(bytes, vec![0x12, 0x34, 0x56, 0x78]);
        assert_eq!(pdu::bytes_to_words(&bytes).unwrap(), words);
        assert!(pdu::bytes_to_words(&[0x01]).is_err());
    }

    #[test]
    fn test_response_parsing() {
        let response = ModbusResponse::new_success(
            1,
            FunctionCode::ReadHoldingRegisters,
            vec![4, 0x12, 0x34, 0x56, 0x78],
        );
        assert_eq!(response.parse_words().unwrap(), vec![0x1234, 0x5678]);

        let response =
            ModbusResponse::new_success(1, FunctionCode::ReadCoils, vec![1, 0b1010_1010]);
        let bits = response.parse_bits().unwrap();
        assert!(!bits[0]);
        assert!(bits[1]);
        assert!(!bits[2]);
        assert!(bits[3]);
    }

    #[test]
    fn test_exception_response() {
        let response = ModbusResponse::new_exception(1, FunctionCode::ReadHoldingRegisters, 0x02);
        assert!(response.exception_error().is_some());
        assert!(response.parse_words().is_err());
    }
}
