//! Polling client demo.
//!
//! Connects to a Modbus TCP server (run `server_demo` in another terminal),
//! describes a handful of typed fields and polls them through the
//! coalescing, TTL-cached read path.

use anyhow::Result;
use std::time::Duration;

use fieldgate_modbus::codec::DataType;
use fieldgate_modbus::connection::{shared_link, FieldDevice, ModbusConnection, RetryPolicy};
use fieldgate_modbus::field::FieldDescriptor;
use fieldgate_modbus::protocol::FunctionCode;
use fieldgate_modbus::transport::TcpTransport;
use fieldgate_modbus::Value;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:1502".to_string());

    println!("Connecting to {} ...", address);
    let mut transport = TcpTransport::connect(address.parse()?, Duration::from_secs(5)).await?;
    transport.set_packet_logging(true);

    let connection = ModbusConnection::new(shared_link(transport), 1).with_retry(RetryPolicy {
        retries: 3,
        retry_delay: Duration::from_millis(60),
        retry_reconnect: true,
    });
    let device = FieldDevice::new(connection, Duration::from_secs(2));

    let fields = vec![
        FieldDescriptor::new("watts", 30, DataType::UInt32, FunctionCode::ReadInputRegisters),
        FieldDescriptor::new("volts", 12, DataType::UInt16, FunctionCode::ReadInputRegisters)
            .with_unit_multiplier(0.1)
            .with_decimal_scale(1),
        FieldDescriptor::new("frequency", 40, DataType::UInt16, FunctionCode::ReadInputRegisters)
            .with_unit_multiplier(0.01)
            .with_decimal_scale(2),
        FieldDescriptor::new("running", 0, DataType::Bool, FunctionCode::ReadCoils),
    ];

    for round in 1..=5 {
        let values = device.read_fields(&fields).await?;
        println!("--- poll {} ---", round);
        let mut names: Vec<_> = values.keys().collect();
        names.sort();
        for name in names {
            println!("  {:<10} = {}", name, values[name]);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    // toggle the run coil and show the expired cache picking it up
    let running = FieldDescriptor::new("running", 0, DataType::Bool, FunctionCode::ReadCoils);
    device.write_field(&running, &Value::Bool(true)).await?;
    let values = device.read_fields(&fields).await?;
    println!("after write: running = {}", values["running"]);

    let stats = device.connection().stats().await;
    println!(
        "requests: {}, responses: {}, errors: {}",
        stats.requests_sent, stats.responses_received, stats.errors
    );

    Ok(())
}
