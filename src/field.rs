//! Field descriptors: how a named device datum maps onto register words.
//!
//! A [`FieldDescriptor`] pins down everything needed to read or write one
//! value: address, data type, word length, the function code to use and the
//! word order, plus the numeric post-processing (unit multiplier and decimal
//! scale). Descriptors are immutable once built; device drivers construct
//! them and hand them to the connection layer.

use crate::codec::{self, DataType, Value, WordOrder};
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{BlockType, FunctionCode, ModbusAddress, Word};
use serde::{Deserialize, Serialize};

/// Description of one typed field at a register location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    /// Field name, unique within one device configuration.
    pub name: String,
    /// Starting register address.
    pub address: ModbusAddress,
    /// Semantic data type.
    pub data_type: DataType,
    /// Word length override for variable-length types; fixed-width types
    /// derive their length from the data type.
    #[serde(default)]
    pub word_length: Option<u16>,
    /// Function code used to read this field.
    pub function: FunctionCode,
    /// Word order for multi-word values.
    #[serde(default)]
    pub word_order: WordOrder,
    /// Multiplier applied to raw numeric readings (1 = disabled).
    #[serde(default = "default_multiplier")]
    pub unit_multiplier: f64,
    /// Maximum decimal places for numeric readings (-1 = disabled).
    #[serde(default = "default_scale")]
    pub decimal_scale: i32,
    /// Trim trailing NUL/space bytes from decoded strings.
    #[serde(default = "default_trim")]
    pub trim_strings: bool,
}

fn default_multiplier() -> f64 {
    1.0
}

fn default_scale() -> i32 {
    -1
}

fn default_trim() -> bool {
    true
}

impl FieldDescriptor {
    /// Create a descriptor with default word order and no post-processing.
    pub fn new(
        name: impl Into<String>,
        address: ModbusAddress,
        data_type: DataType,
        function: FunctionCode,
    ) -> Self {
        Self {
            name: name.into(),
            address,
            data_type,
            word_length: None,
            function,
            word_order: WordOrder::default(),
            unit_multiplier: 1.0,
            decimal_scale: -1,
            trim_strings: true,
        }
    }

    /// Override the word length (variable-length types).
    pub fn with_word_length(mut self, word_length: u16) -> Self {
        self.word_length = Some(word_length);
        self
    }

    /// Set the word order.
    pub fn with_word_order(mut self, word_order: WordOrder) -> Self {
        self.word_order = word_order;
        self
    }

    /// Set the unit multiplier.
    pub fn with_unit_multiplier(mut self, multiplier: f64) -> Self {
        self.unit_multiplier = multiplier;
        self
    }

    /// Set the decimal scale.
    pub fn with_decimal_scale(mut self, scale: i32) -> Self {
        self.decimal_scale = scale;
        self
    }

    /// Effective word length: the data type's fixed length, or the
    /// configured override, defaulting to one word.
    pub fn word_length(&self) -> u16 {
        self.data_type
            .word_length()
            .or(self.word_length)
            .unwrap_or(1)
    }

    /// The register bank this field lives in.
    pub fn block_type(&self) -> BlockType {
        self.function.block_type()
    }

    /// Decode this field from register words, applying unit multiplier and
    /// decimal scale to numeric results.
    pub fn decode(&self, words: &[Word]) -> ModbusResult<Value> {
        let raw = codec::decode(self.data_type, self.word_order, words)?;
        Ok(self.post_process(raw))
    }

    /// Decode a bit-bank reading.
    pub fn decode_bit(&self, bit: bool) -> Value {
        self.post_process(Value::Bool(bit))
    }

    fn post_process(&self, value: Value) -> Value {
        if !value.is_numeric() {
            if self.trim_strings {
                if let Value::Str(s) = &value {
                    return Value::Str(codec::trim_register_string(s));
                }
            }
            return value;
        }
        if self.unit_multiplier == 1.0 && self.decimal_scale < 0 {
            return value;
        }
        // multiplier first, then scale; the result becomes a float reading
        let mut v = value.as_f64().unwrap_or(0.0);
        v = codec::apply_unit_multiplier(v, self.unit_multiplier);
        v = codec::apply_decimal_scale(v, self.decimal_scale);
        Value::F64(v)
    }

    /// Encode a value for this field, inverting the unit multiplier on
    /// numeric values and enforcing the configured word length.
    ///
    /// The decimal-scale rounding rule is not re-applied on this path.
    pub fn encode(&self, value: &Value) -> ModbusResult<Vec<Word>> {
        let adjusted;
        let to_encode = if value.is_numeric() && self.unit_multiplier != 1.0 {
            let v = value
                .as_f64()
                .ok_or_else(|| ModbusError::encode("Numeric value required"))?;
            adjusted = Value::F64(codec::invert_unit_multiplier(v, self.unit_multiplier));
            &adjusted
        } else {
            value
        };

        let mut words = codec::encode(self.data_type, self.word_order, to_encode)?;

        let declared = self.word_length() as usize;
        if self.data_type.word_length().is_none() {
            if words.len() > declared {
                return Err(ModbusError::encode(format!(
                    "Field {:?}: value needs {} words but {} are configured",
                    self.name,
                    words.len(),
                    declared
                )));
            }
            // fixed-length wire layout: pad variable values to the block size
            words.resize(declared, 0);
        }

        Ok(words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn holding(name: &str, address: u16, data_type: DataType) -> FieldDescriptor {
        FieldDescriptor::new(
            name,
            address,
            data_type,
            FunctionCode::ReadHoldingRegisters,
        )
    }

    #[test]
    fn test_word_length_derivation() {
        assert_eq!(holding("a", 0, DataType::Int16).word_length(), 1);
        assert_eq!(holding("b", 0, DataType::Float64).word_length(), 4);
        assert_eq!(
            holding("c", 0, DataType::StringAscii)
                .with_word_length(8)
                .word_length(),
            8
        );
        // fixed-width types ignore an override
        assert_eq!(
            holding("d", 0, DataType::Int32).with_word_length(8).word_length(),
            2
        );
    }

    #[test]
    fn test_multiplier_then_scale() {
        let field = holding("power", 10, DataType::UInt16)
            .with_unit_multiplier(0.1)
            .with_decimal_scale(1);

        assert_eq!(field.decode(&[1230]).unwrap(), Value::F64(123.0));

        let words = field.encode(&Value::F64(123.0)).unwrap();
        assert_eq!(words, vec![1230]);
    }

    #[test]
    fn test_plain_numeric_keeps_native_type() {
        let field = holding("mode", 3, DataType::Int16);
        assert_eq!(field.decode(&[0xFFFE]).unwrap(), Value::I16(-2));
    }

    #[test]
    fn test_string_trim_and_overflow() {
        let field = holding("serial", 100, DataType::StringAscii).with_word_length(4);

        let words = field.encode(&Value::Str("AB-12".into())).unwrap();
        assert_eq!(words.len(), 4);
        match field.decode(&words).unwrap() {
            Value::Str(s) => assert_eq!(s, "AB-12"),
            other => panic!("expected string, got {:?}", other),
        }

        let too_long = field.encode(&Value::Str("ABCDEFGHIJK".into()));
        assert!(too_long.is_err());
    }

    #[test]
    fn test_coil_field_decode() {
        let field = FieldDescriptor::new("run", 2, DataType::Bool, FunctionCode::ReadCoils);
        assert_eq!(field.block_type(), BlockType::Coil);
        assert_eq!(field.decode_bit(true), Value::Bool(true));
    }
}
