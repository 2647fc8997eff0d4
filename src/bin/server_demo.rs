//! Server demo: a Modbus TCP slave with a simulated meter behind it.
//!
//! Input registers churn with plausible meter readings pushed through the
//! measurement event path; holding registers and coils are writable by any
//! master. Point `poll_demo` (or any Modbus client) at the printed
//! address.

use anyhow::Result;
use rand::Rng;
use std::time::Duration;

use fieldgate_modbus::codec::DataType;
use fieldgate_modbus::field::FieldDescriptor;
use fieldgate_modbus::protocol::FunctionCode;
use fieldgate_modbus::server::{MeasurementMapping, ModbusTcpServer, ModbusTcpServerConfig};
use fieldgate_modbus::Value;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let bind = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:1502".to_string());

    let config = ModbusTcpServerConfig {
        bind_address: bind.parse()?,
        ..Default::default()
    };
    let mut server = ModbusTcpServer::with_config(config);

    server.set_measurement_mappings(vec![
        MeasurementMapping {
            source_id: "meter/1".into(),
            property: "watts".into(),
            unit_id: 1,
            field: FieldDescriptor::new(
                "watts",
                30,
                DataType::UInt32,
                FunctionCode::ReadInputRegisters,
            ),
        },
        MeasurementMapping {
            source_id: "meter/1".into(),
            property: "volts".into(),
            unit_id: 1,
            field: FieldDescriptor::new(
                "volts",
                12,
                DataType::UInt16,
                FunctionCode::ReadInputRegisters,
            )
            .with_unit_multiplier(0.1),
        },
        MeasurementMapping {
            source_id: "meter/1".into(),
            property: "frequency".into(),
            unit_id: 1,
            field: FieldDescriptor::new(
                "frequency",
                40,
                DataType::UInt16,
                FunctionCode::ReadInputRegisters,
            )
            .with_unit_multiplier(0.01),
        },
    ]);

    server.start().await?;
    println!(
        "Modbus TCP server running on {}  (ctrl-c to stop)",
        server.local_addr().map(|a| a.to_string()).unwrap_or(bind)
    );

    // simulated meter: push fresh readings through the event path
    loop {
        let (watts, volts, frequency) = {
            let mut rng = rand::thread_rng();
            (
                rng.gen_range(65_000..75_000) as u32,
                230.0 + rng.gen_range(-5.0..5.0),
                50.0 + rng.gen_range(-0.05..0.05),
            )
        };

        server.apply_measurement("meter/1", "watts", &Value::U32(watts))?;
        server.apply_measurement("meter/1", "volts", &Value::F64(volts))?;
        server.apply_measurement("meter/1", "frequency", &Value::F64(frequency))?;

        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
