//! Configuration surface.
//!
//! Plain value structs for transport parameters (serial, TCP, UDP) and a
//! lenient loader for per-unit register-block definitions. Configuration
//! documents come from the embedding application (YAML here, JSON via the
//! same serde structures); discovery and persistence of those documents is
//! out of scope.
//!
//! Loading is record-lenient: a block entry with an unknown data-type key
//! or a malformed numeric setting is reported as a human-readable issue
//! and skipped, and the rest of the document still loads.

use crate::codec::{DataType, WordOrder};
use crate::error::{ModbusError, ModbusResult};
use crate::field::FieldDescriptor;
use crate::protocol::{BlockType, UnitId};
use crate::server::MeasurementMapping;
use crate::transport::SerialSettings;
use log::warn;
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

/// Serial port parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialParams {
    /// Device path, e.g. `/dev/ttyUSB0` or `COM3`.
    pub port: String,
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    crate::DEFAULT_TIMEOUT_MS
}

/// Serial parity setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

impl SerialParams {
    /// The transaction timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Render into the serial line settings used by the RTU transport.
    pub fn line_settings(&self) -> ModbusResult<SerialSettings> {
        let data_bits = match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            8 => tokio_serial::DataBits::Eight,
            other => {
                return Err(ModbusError::configuration(format!(
                    "Invalid data bits: {}",
                    other
                )))
            }
        };
        let stop_bits = match self.stop_bits {
            1 => tokio_serial::StopBits::One,
            2 => tokio_serial::StopBits::Two,
            other => {
                return Err(ModbusError::configuration(format!(
                    "Invalid stop bits: {}",
                    other
                )))
            }
        };
        let parity = match self.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        };
        Ok(SerialSettings {
            data_bits,
            stop_bits,
            parity,
        })
    }
}

/// TCP endpoint parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpParams {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Seconds to keep a cached connection open with no activity;
    /// zero disables idle expiry.
    #[serde(default)]
    pub keep_open_secs: u64,
}

impl TcpParams {
    /// The transaction timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// The cached-connection idle expiry.
    pub fn keep_open(&self) -> Duration {
        Duration::from_secs(self.keep_open_secs)
    }

    /// Resolve the host/port to a socket address.
    pub fn resolve(&self) -> ModbusResult<SocketAddr> {
        resolve_host(&self.host, self.port)
    }
}

/// UDP endpoint parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpParams {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl UdpParams {
    /// The transaction timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Resolve the host/port to a socket address.
    pub fn resolve(&self) -> ModbusResult<SocketAddr> {
        resolve_host(&self.host, self.port)
    }
}

fn resolve_host(host: &str, port: u16) -> ModbusResult<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| ModbusError::configuration(format!("Cannot resolve {}:{}: {}", host, port, e)))?
        .next()
        .ok_or_else(|| {
            ModbusError::configuration(format!("No address found for {}:{}", host, port))
        })
}

/// One register block: a bank, a starting address and the fields laid out
/// consecutively within it.
#[derive(Debug, Clone)]
pub struct RegisterBlockConfig {
    pub block_type: BlockType,
    pub start_address: u16,
    pub fields: Vec<FieldDescriptor>,
}

/// All configured blocks for one unit id.
#[derive(Debug, Clone)]
pub struct UnitConfig {
    pub unit_id: UnitId,
    pub blocks: Vec<RegisterBlockConfig>,
}

impl UnitConfig {
    /// Flatten the blocks into measurement routings for the server's
    /// external write path. Entries without a source id are local-only
    /// fields and produce no routing.
    pub fn measurement_mappings(&self) -> Vec<MeasurementMapping> {
        let mut mappings = Vec::new();
        for block in &self.blocks {
            for field in &block.fields {
                if let Some((source_id, property)) = field.name.split_once('#') {
                    mappings.push(MeasurementMapping {
                        source_id: source_id.to_string(),
                        property: property.to_string(),
                        unit_id: self.unit_id,
                        field: field.clone(),
                    });
                }
            }
        }
        mappings
    }
}

/// Result of a lenient configuration load: the valid records plus the
/// human-readable issues for everything that was skipped.
#[derive(Debug, Default)]
pub struct ConfigLoad {
    pub units: Vec<UnitConfig>,
    pub issues: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(default)]
    units: Vec<RawUnit>,
}

#[derive(Debug, Deserialize)]
struct RawUnit {
    unit_id: UnitId,
    #[serde(default)]
    blocks: Vec<RawBlock>,
}

#[derive(Debug, Deserialize)]
struct RawBlock {
    block_type: String,
    #[serde(default)]
    start_address: u16,
    #[serde(default)]
    entries: Vec<RawEntry>,
}

/// Raw block entry; numeric settings arrive as strings so one bad record
/// cannot fail the whole document parse.
#[derive(Debug, Deserialize)]
struct RawEntry {
    name: String,
    data_type: String,
    #[serde(default)]
    word_length: Option<u16>,
    #[serde(default)]
    word_order: Option<String>,
    #[serde(default)]
    unit_multiplier: Option<String>,
    #[serde(default)]
    decimal_scale: Option<String>,
}

fn parse_block_type(key: &str) -> ModbusResult<BlockType> {
    match key {
        "coil" | "coils" => Ok(BlockType::Coil),
        "discrete" | "discretes" => Ok(BlockType::Discrete),
        "input" | "inputs" => Ok(BlockType::Input),
        "holding" | "holdings" => Ok(BlockType::Holding),
        other => Err(ModbusError::configuration(format!(
            "Unknown block type: {:?}",
            other
        ))),
    }
}

fn parse_word_order(key: &str) -> ModbusResult<WordOrder> {
    match key {
        "msw-first" | "most-first" => Ok(WordOrder::MostToLeastSignificant),
        "lsw-first" | "least-first" => Ok(WordOrder::LeastToMostSignificant),
        other => Err(ModbusError::configuration(format!(
            "Unknown word order: {:?}",
            other
        ))),
    }
}

fn build_field(
    entry: &RawEntry,
    block_type: BlockType,
    address: u16,
) -> ModbusResult<FieldDescriptor> {
    let data_type = DataType::from_key(&entry.data_type)?;

    let mut field = FieldDescriptor::new(
        entry.name.clone(),
        address,
        data_type,
        block_type.read_function(),
    );

    if let Some(word_length) = entry.word_length {
        field = field.with_word_length(word_length);
    }
    if let Some(order) = &entry.word_order {
        field = field.with_word_order(parse_word_order(order)?);
    }
    if let Some(multiplier) = &entry.unit_multiplier {
        let value: f64 = multiplier.parse().map_err(|_| {
            ModbusError::configuration(format!("Malformed unit multiplier: {:?}", multiplier))
        })?;
        field = field.with_unit_multiplier(value);
    }
    if let Some(scale) = &entry.decimal_scale {
        let value: i32 = scale.parse().map_err(|_| {
            ModbusError::configuration(format!("Malformed decimal scale: {:?}", scale))
        })?;
        field = field.with_decimal_scale(value);
    }

    Ok(field)
}

/// Load per-unit register block definitions from a YAML document.
///
/// Invalid records are skipped and reported in
/// [`ConfigLoad::issues`]; only a document that fails to parse at all is
/// an error.
pub fn load_units(yaml: &str) -> ModbusResult<ConfigLoad> {
    let raw: RawDocument = serde_yaml::from_str(yaml)?;
    let mut load = ConfigLoad::default();

    for raw_unit in raw.units {
        let mut blocks = Vec::new();
        for raw_block in &raw_unit.blocks {
            let block_type = match parse_block_type(&raw_block.block_type) {
                Ok(block_type) => block_type,
                Err(e) => {
                    let issue = format!("unit {}: {}", raw_unit.unit_id, e);
                    warn!("Skipping block: {}", issue);
                    load.issues.push(issue);
                    continue;
                }
            };

            let mut fields = Vec::new();
            let mut address = raw_block.start_address;
            for entry in &raw_block.entries {
                match build_field(entry, block_type, address) {
                    Ok(field) => {
                        // entries lay out consecutively within the block
                        let length = if block_type.is_bit_type() {
                            1
                        } else {
                            field.word_length()
                        };
                        address = address.wrapping_add(length);
                        fields.push(field);
                    }
                    Err(e) => {
                        let issue = format!(
                            "unit {} entry {:?}: {}",
                            raw_unit.unit_id, entry.name, e
                        );
                        warn!("Skipping entry: {}", issue);
                        load.issues.push(issue);
                    }
                }
            }

            blocks.push(RegisterBlockConfig {
                block_type,
                start_address: raw_block.start_address,
                fields,
            });
        }

        load.units.push(UnitConfig {
            unit_id: raw_unit.unit_id,
            blocks,
        });
    }

    Ok(load)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
units:
  - unit_id: 1
    blocks:
      - block_type: holding
        start_address: 100
        entries:
          - name: meter/1#watts
            data_type: u32
            unit_multiplier: "0.1"
            decimal_scale: "1"
          - name: meter/1#serial
            data_type: ascii
            word_length: 4
          - name: broken
            data_type: quadword
          - name: bad-number
            data_type: u16
            unit_multiplier: "ten"
          - name: meter/1#frequency
            data_type: f32
      - block_type: coil
        start_address: 0
        entries:
          - name: relay/1#enabled
            data_type: bool
"#;

    #[test]
    fn test_lenient_load() {
        let load = load_units(DOC).unwrap();
        assert_eq!(load.units.len(), 1);
        assert_eq!(load.issues.len(), 2);

        let unit = &load.units[0];
        assert_eq!(unit.unit_id, 1);
        let holding = &unit.blocks[0];
        assert_eq!(holding.fields.len(), 3);

        // addresses accumulate across entries, skipped ones excluded
        assert_eq!(holding.fields[0].address, 100); // u32, 2 words
        assert_eq!(holding.fields[1].address, 102); // ascii, 4 words
        assert_eq!(holding.fields[2].address, 106);
        assert_eq!(holding.fields[0].unit_multiplier, 0.1);
        assert_eq!(holding.fields[0].decimal_scale, 1);
    }

    #[test]
    fn test_measurement_mappings() {
        let load = load_units(DOC).unwrap();
        let mappings = load.units[0].measurement_mappings();
        assert_eq!(mappings.len(), 4);
        assert_eq!(mappings[0].source_id, "meter/1");
        assert_eq!(mappings[0].property, "watts");
        assert_eq!(mappings[3].unit_id, 1);
        assert_eq!(mappings[3].source_id, "relay/1");
    }

    #[test]
    fn test_unknown_block_type_skipped() {
        let doc = r#"
units:
  - unit_id: 2
    blocks:
      - block_type: analog
        entries: []
"#;
        let load = load_units(doc).unwrap();
        assert_eq!(load.units[0].blocks.len(), 0);
        assert_eq!(load.issues.len(), 1);
        assert!(load.issues[0].contains("Unknown block type"));
    }

    #[test]
    fn test_serial_params() {
        let params = SerialParams {
            port: "/dev/ttyUSB0".into(),
            baud_rate: 9600,
            data_bits: 8,
            parity: Parity::Even,
            stop_bits: 1,
            timeout_ms: 1000,
        };
        let settings = params.line_settings().unwrap();
        assert_eq!(settings.parity, tokio_serial::Parity::Even);

        let bad = SerialParams {
            data_bits: 9,
            ..params
        };
        assert!(bad.line_settings().is_err());
    }

    #[test]
    fn test_tcp_params_resolve() {
        let params = TcpParams {
            host: "127.0.0.1".into(),
            port: 1502,
            timeout_ms: 5000,
            keep_open_secs: 60,
        };
        assert_eq!(
            params.resolve().unwrap(),
            "127.0.0.1:1502".parse().unwrap()
        );
        assert_eq!(params.keep_open(), Duration::from_secs(60));
    }
}
