//! # Server Engine
//!
//! The slave side of the stack: a process-wide table of per-unit register
//! banks plus a TCP request loop that parses inbound MBAP frames, reads or
//! mutates the table and writes wire-correct responses.
//!
//! Request errors are answered with standard protocol exception responses
//! (illegal function / illegal data address / illegal data value), never by
//! dropping the connection; only unrecoverable transport failures end a
//! client loop. When the server is restricted to a configured set of unit
//! ids, requests for other units are ignored outright so another device on
//! a shared network can answer them.
//!
//! An external write path ([`ModbusTcpServer::apply_measurement`]) pushes
//! observed values into the table through the same register codec the
//! client side uses, optionally gated by an operational-mode predicate:
//! when the predicate reports false the update is skipped entirely.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::codec::Value;
use crate::error::{ModbusError, ModbusResult};
use crate::field::FieldDescriptor;
use crate::protocol::{pdu, BlockType, UnitId};
use crate::register_bank::{ModbusRegisterBank, RegisterBankStats};
use crate::{MAX_BITS_PER_REQUEST, MAX_TCP_FRAME_SIZE, MAX_WORDS_PER_REQUEST, MBAP_HEADER_SIZE};

/// Server activity counters.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub connections_count: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub ignored_requests: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

/// TCP server configuration.
#[derive(Debug, Clone)]
pub struct ModbusTcpServerConfig {
    /// Listen address.
    pub bind_address: SocketAddr,
    /// Maximum simultaneously served client connections.
    pub max_connections: usize,
    /// Deadline for completing one frame once its header arrived.
    pub request_timeout: Duration,
    /// When set, requests for unit ids outside this set are ignored
    /// entirely (no response), not answered with an exception.
    pub allowed_units: Option<HashSet<UnitId>>,
    /// Whether Modbus write functions mutate the table; when disabled they
    /// are answered with an illegal-function exception.
    pub allow_writes: bool,
    /// Address-space cap per register block.
    pub bank_capacity: u32,
}

impl Default for ModbusTcpServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:502".parse().expect("static address"),
            max_connections: 100,
            request_timeout: Duration::from_secs(30),
            allowed_units: None,
            allow_writes: true,
            bank_capacity: 0x1_0000,
        }
    }
}

/// Process-wide map of unit id to register bank.
///
/// Banks are created on first use unless a unit restriction is configured.
/// Frame processing is synchronous; each bank serialises its own block
/// access internally, so handler tasks for different units never contend.
pub struct ServerRegisterTable {
    banks: RwLock<HashMap<UnitId, Arc<ModbusRegisterBank>>>,
    allowed_units: Option<HashSet<UnitId>>,
    allow_writes: bool,
    bank_capacity: u32,
}

impl ServerRegisterTable {
    /// Create a table from the server configuration.
    pub fn new(config: &ModbusTcpServerConfig) -> Self {
        Self {
            banks: RwLock::new(HashMap::new()),
            allowed_units: config.allowed_units.clone(),
            allow_writes: config.allow_writes,
            bank_capacity: config.bank_capacity,
        }
    }

    /// Fetch (or lazily create) the bank for a unit; `None` when the unit
    /// is not provisioned and the server is restricted.
    pub fn bank(&self, unit_id: UnitId) -> Option<Arc<ModbusRegisterBank>> {
        if let Some(allowed) = &self.allowed_units {
            if !allowed.contains(&unit_id) {
                return None;
            }
        }

        if let Ok(banks) = self.banks.read() {
            if let Some(bank) = banks.get(&unit_id) {
                return Some(bank.clone());
            }
        }

        let mut banks = self.banks.write().ok()?;
        Some(
            banks
                .entry(unit_id)
                .or_insert_with(|| Arc::new(ModbusRegisterBank::with_capacity(self.bank_capacity)))
                .clone(),
        )
    }

    /// Per-bank population counts for every provisioned unit.
    pub fn stats(&self) -> HashMap<UnitId, RegisterBankStats> {
        match self.banks.read() {
            Ok(banks) => banks.iter().map(|(k, v)| (*k, v.stats())).collect(),
            Err(_) => HashMap::new(),
        }
    }

    /// Process one complete MBAP frame into a response frame.
    ///
    /// `Ok(None)` means the request was deliberately ignored (unit id not
    /// provisioned under a restriction). `Err` is returned only for frames
    /// too malformed to answer; recognisable-but-invalid requests yield an
    /// exception response frame.
    pub fn process_frame(&self, frame: &[u8]) -> ModbusResult<Option<Vec<u8>>> {
        if frame.len() < MBAP_HEADER_SIZE + 2 {
            return Err(ModbusError::frame("Frame too short"));
        }

        let transaction_id = u16::from_be_bytes([frame[0], frame[1]]);
        let protocol_id = u16::from_be_bytes([frame[2], frame[3]]);
        let length = u16::from_be_bytes([frame[4], frame[5]]) as usize;
        let unit_id = frame[6];
        let function_code = frame[7];

        if protocol_id != 0 {
            return Err(ModbusError::frame("Invalid protocol id"));
        }
        if frame.len() < MBAP_HEADER_SIZE + length || length < 2 {
            return Err(ModbusError::frame("Incomplete frame"));
        }

        let bank = match self.bank(unit_id) {
            Some(bank) => bank,
            None => {
                debug!("Ignoring request for unprovisioned unit {}", unit_id);
                return Ok(None);
            }
        };

        let body = &frame[MBAP_HEADER_SIZE + 2..MBAP_HEADER_SIZE + length];
        let result = self.dispatch(function_code, body, &bank);

        let response = match result {
            Ok(payload) => {
                let mut response = Vec::with_capacity(MBAP_HEADER_SIZE + 2 + payload.len());
                response.extend_from_slice(&transaction_id.to_be_bytes());
                response.extend_from_slice(&0u16.to_be_bytes());
                response.extend_from_slice(&((payload.len() + 2) as u16).to_be_bytes());
                response.push(unit_id);
                response.push(function_code);
                response.extend_from_slice(&payload);
                response
            }
            Err(e) => {
                let exception_code = exception_code_for(&e);
                debug!(
                    "Request 0x{:02X} on unit {} rejected: {} (exception 0x{:02X})",
                    function_code, unit_id, e, exception_code
                );
                let mut response = Vec::with_capacity(MBAP_HEADER_SIZE + 3);
                response.extend_from_slice(&transaction_id.to_be_bytes());
                response.extend_from_slice(&0u16.to_be_bytes());
                response.extend_from_slice(&3u16.to_be_bytes());
                response.push(unit_id);
                response.push(function_code | 0x80);
                response.push(exception_code);
                response
            }
        };

        Ok(Some(response))
    }

    fn dispatch(
        &self,
        function_code: u8,
        body: &[u8],
        bank: &ModbusRegisterBank,
    ) -> ModbusResult<Vec<u8>> {
        match function_code {
            0x01 => Self::read_bits(body, |addr, qty| bank.read_coils(addr, qty)),
            0x02 => Self::read_bits(body, |addr, qty| bank.read_discretes(addr, qty)),
            0x03 => Self::read_words(body, |addr, qty| bank.read_holdings(addr, qty)),
            0x04 => Self::read_words(body, |addr, qty| bank.read_inputs(addr, qty)),
            0x05 if self.allow_writes => Self::write_single_coil(body, bank),
            0x06 if self.allow_writes => Self::write_single_register(body, bank),
            0x0F if self.allow_writes => Self::write_multiple_coils(body, bank),
            0x10 if self.allow_writes => Self::write_multiple_registers(body, bank),
            other => Err(ModbusError::invalid_function(other)),
        }
    }

    fn parse_addr_qty(body: &[u8]) -> ModbusResult<(u16, u16)> {
        if body.len() < 4 {
            return Err(ModbusError::invalid_data("Request body too short"));
        }
        Ok((
            u16::from_be_bytes([body[0], body[1]]),
            u16::from_be_bytes([body[2], body[3]]),
        ))
    }

    fn read_bits<F>(body: &[u8], read: F) -> ModbusResult<Vec<u8>>
    where
        F: FnOnce(u16, u16) -> ModbusResult<Vec<bool>>,
    {
        let (address, quantity) = Self::parse_addr_qty(body)?;
        if quantity == 0 || quantity > MAX_BITS_PER_REQUEST {
            return Err(ModbusError::invalid_data("Invalid bit quantity"));
        }

        let bits = read(address, quantity)?;
        let packed = pdu::pack_bits(&bits);
        let mut payload = vec![packed.len() as u8];
        payload.extend_from_slice(&packed);
        Ok(payload)
    }

    fn read_words<F>(body: &[u8], read: F) -> ModbusResult<Vec<u8>>
    where
        F: FnOnce(u16, u16) -> ModbusResult<Vec<u16>>,
    {
        let (address, quantity) = Self::parse_addr_qty(body)?;
        if quantity == 0 || quantity > MAX_WORDS_PER_REQUEST {
            return Err(ModbusError::invalid_data("Invalid word quantity"));
        }

        let words = read(address, quantity)?;
        let mut payload = vec![(words.len() * 2) as u8];
        payload.extend_from_slice(&pdu::words_to_bytes(&words));
        Ok(payload)
    }

    fn write_single_coil(body: &[u8], bank: &ModbusRegisterBank) -> ModbusResult<Vec<u8>> {
        let (address, raw) = Self::parse_addr_qty(body)?;
        let value = match raw {
            0x0000 => false,
            0xFF00 => true,
            other => {
                return Err(ModbusError::invalid_data(format!(
                    "Invalid coil value 0x{:04X}",
                    other
                )))
            }
        };
        bank.write_coil(address, value)?;
        // echo address and value
        Ok(body[0..4].to_vec())
    }

    fn write_single_register(body: &[u8], bank: &ModbusRegisterBank) -> ModbusResult<Vec<u8>> {
        let (address, value) = Self::parse_addr_qty(body)?;
        bank.write_holding(address, value)?;
        Ok(body[0..4].to_vec())
    }

    fn write_multiple_coils(body: &[u8], bank: &ModbusRegisterBank) -> ModbusResult<Vec<u8>> {
        let (address, quantity) = Self::parse_addr_qty(body)?;
        if body.len() < 5 {
            return Err(ModbusError::invalid_data("Request body too short"));
        }
        let byte_count = body[4] as usize;
        if quantity == 0
            || quantity > MAX_BITS_PER_REQUEST
            || byte_count != (quantity as usize + 7) / 8
            || body.len() < 5 + byte_count
        {
            return Err(ModbusError::invalid_data("Invalid coil write request"));
        }

        let bits = pdu::unpack_bits(&body[5..5 + byte_count], quantity as usize);
        bank.write_coils(address, &bits)?;
        Ok(body[0..4].to_vec())
    }

    fn write_multiple_registers(body: &[u8], bank: &ModbusRegisterBank) -> ModbusResult<Vec<u8>> {
        let (address, quantity) = Self::parse_addr_qty(body)?;
        if body.len() < 5 {
            return Err(ModbusError::invalid_data("Request body too short"));
        }
        let byte_count = body[4] as usize;
        if quantity == 0
            || quantity > MAX_WORDS_PER_REQUEST
            || byte_count != quantity as usize * 2
            || body.len() < 5 + byte_count
        {
            return Err(ModbusError::invalid_data("Invalid register write request"));
        }

        let words = pdu::bytes_to_words(&body[5..5 + byte_count])?;
        bank.write_holdings(address, &words)?;
        Ok(body[0..4].to_vec())
    }
}

/// Map an internal error to the protocol exception code for the response.
fn exception_code_for(error: &ModbusError) -> u8 {
    match error {
        ModbusError::InvalidFunction { .. } => 0x01,
        ModbusError::InvalidAddress { .. } => 0x02,
        ModbusError::InvalidData { .. } | ModbusError::Decode { .. } | ModbusError::Encode { .. } => {
            0x03
        }
        _ => 0x04,
    }
}

/// Routing of an external measurement event into the server table.
#[derive(Debug, Clone)]
pub struct MeasurementMapping {
    /// Event source identifier to match.
    pub source_id: String,
    /// Event property name to match.
    pub property: String,
    /// Target unit id.
    pub unit_id: UnitId,
    /// Register layout; the descriptor's function selects the bank.
    pub field: FieldDescriptor,
}

/// Operational-mode predicate guarding external table updates.
pub type GatePredicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// Modbus TCP server.
pub struct ModbusTcpServer {
    config: ModbusTcpServerConfig,
    table: Arc<ServerRegisterTable>,
    mappings: Vec<MeasurementMapping>,
    gate: Option<GatePredicate>,
    stats: Arc<Mutex<ServerStats>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    running: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
}

impl ModbusTcpServer {
    /// Create a server from a bind address string with default settings.
    pub fn new(bind_address: &str) -> ModbusResult<Self> {
        let bind_address = bind_address
            .parse()
            .map_err(|e| ModbusError::configuration(format!("Invalid bind address: {}", e)))?;
        Ok(Self::with_config(ModbusTcpServerConfig {
            bind_address,
            ..Default::default()
        }))
    }

    /// Create a server with explicit configuration.
    pub fn with_config(config: ModbusTcpServerConfig) -> Self {
        let table = Arc::new(ServerRegisterTable::new(&config));
        Self {
            config,
            table,
            mappings: Vec::new(),
            gate: None,
            stats: Arc::new(Mutex::new(ServerStats::default())),
            shutdown_tx: None,
            running: Arc::new(AtomicBool::new(false)),
            local_addr: None,
        }
    }

    /// The shared register table.
    pub fn table(&self) -> Arc<ServerRegisterTable> {
        self.table.clone()
    }

    /// The actual listening address (useful with an ephemeral bind port).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Register measurement routings for the external write path.
    pub fn set_measurement_mappings(&mut self, mappings: Vec<MeasurementMapping>) {
        self.mappings = mappings;
    }

    /// Install the operational-mode gate for the external write path.
    pub fn set_gate(&mut self, gate: GatePredicate) {
        self.gate = Some(gate);
    }

    /// Push an externally observed value into the table.
    ///
    /// The event is matched against the configured mappings by source id
    /// and property name; each match is encoded with its field's codec
    /// settings and written into the target bank. Returns whether any
    /// register was written. When the gate predicate reports false the
    /// update is skipped entirely, leaving every register untouched.
    pub fn apply_measurement(
        &self,
        source_id: &str,
        property: &str,
        value: &Value,
    ) -> ModbusResult<bool> {
        if let Some(gate) = &self.gate {
            if !(**gate)() {
                debug!(
                    "Skipping measurement {}/{}: operational mode gate closed",
                    source_id, property
                );
                return Ok(false);
            }
        }

        let mut applied = false;
        for mapping in self
            .mappings
            .iter()
            .filter(|m| m.source_id == source_id && m.property == property)
        {
            let bank = match self.table.bank(mapping.unit_id) {
                Some(bank) => bank,
                None => continue,
            };

            let field = &mapping.field;
            match field.block_type() {
                BlockType::Coil | BlockType::Discrete => {
                    let truthy = value
                        .as_i128()
                        .ok_or_else(|| ModbusError::encode("Bit field requires a numeric value"))?
                        != 0;
                    if field.block_type() == BlockType::Coil {
                        bank.write_coil(field.address, truthy)?;
                    } else {
                        bank.set_discrete(field.address, truthy)?;
                    }
                }
                BlockType::Holding => {
                    bank.write_holdings(field.address, &field.encode(value)?)?;
                }
                BlockType::Input => {
                    bank.set_inputs(field.address, &field.encode(value)?)?;
                }
            }
            applied = true;
        }
        Ok(applied)
    }

    /// Bind the listener and start serving in background tasks.
    pub async fn start(&mut self) -> ModbusResult<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(ModbusError::protocol("Server is already running"));
        }

        let listener = TcpListener::bind(self.config.bind_address).await.map_err(|e| {
            ModbusError::connection(format!(
                "Failed to bind to {}: {}",
                self.config.bind_address, e
            ))
        })?;
        self.local_addr = listener.local_addr().ok();

        info!(
            "Modbus TCP server listening on {}",
            self.local_addr
                .map(|a| a.to_string())
                .unwrap_or_else(|| self.config.bind_address.to_string())
        );

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());
        self.running.store(true, Ordering::SeqCst);

        let table = self.table.clone();
        let stats = self.stats.clone();
        let running = self.running.clone();
        let request_timeout = self.config.request_timeout;
        let max_connections = self.config.max_connections;
        let active = Arc::new(AtomicUsize::new(0));

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer)) => {
                                if active.load(Ordering::SeqCst) >= max_connections {
                                    warn!("Connection limit reached, rejecting {}", peer);
                                    continue;
                                }
                                active.fetch_add(1, Ordering::SeqCst);
                                debug!("Accepted connection from {}", peer);

                                let table = table.clone();
                                let stats = stats.clone();
                                let shutdown_rx = shutdown_tx.subscribe();
                                let active = active.clone();
                                tokio::spawn(async move {
                                    Self::handle_client(
                                        stream,
                                        peer,
                                        table,
                                        stats,
                                        shutdown_rx,
                                        request_timeout,
                                    )
                                    .await;
                                    active.fetch_sub(1, Ordering::SeqCst);
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept connection: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Shutdown signal received, stopping accept loop");
                        break;
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
        });

        Ok(())
    }

    /// Signal every task to stop.
    pub async fn stop(&mut self) -> ModbusResult<()> {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(());
        }
        self.running.store(false, Ordering::SeqCst);
        info!("Modbus TCP server stopped");
        Ok(())
    }

    /// Whether the accept loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Snapshot of the server statistics.
    pub fn stats(&self) -> ServerStats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Per-client request loop: read one frame, dispatch, answer; repeat
    /// until end-of-stream or an unrecoverable transport failure.
    async fn handle_client(
        mut stream: TcpStream,
        peer: SocketAddr,
        table: Arc<ServerRegisterTable>,
        stats: Arc<Mutex<ServerStats>>,
        mut shutdown_rx: broadcast::Receiver<()>,
        request_timeout: Duration,
    ) {
        info!("Client connected: {}", peer);
        if let Ok(mut stats) = stats.lock() {
            stats.connections_count += 1;
        }

        loop {
            let mut header = [0u8; MBAP_HEADER_SIZE];
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("Shutdown signal received for client {}", peer);
                    break;
                }
                result = stream.read_exact(&mut header) => {
                    if result.is_err() {
                        // end of stream
                        break;
                    }
                }
            }

            let length = u16::from_be_bytes([header[4], header[5]]) as usize;
            if length < 2 || MBAP_HEADER_SIZE + length > MAX_TCP_FRAME_SIZE {
                warn!("Unframeable request from {} (length {})", peer, length);
                break;
            }

            let mut frame = vec![0u8; MBAP_HEADER_SIZE + length];
            frame[..MBAP_HEADER_SIZE].copy_from_slice(&header);
            match timeout(
                request_timeout,
                stream.read_exact(&mut frame[MBAP_HEADER_SIZE..]),
            )
            .await
            {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    debug!("Read error from {}: {}", peer, e);
                    break;
                }
                Err(_) => {
                    warn!("Timed out mid-frame from {}", peer);
                    break;
                }
            }

            if let Ok(mut stats) = stats.lock() {
                stats.total_requests += 1;
                stats.bytes_received += frame.len() as u64;
            }

            match table.process_frame(&frame) {
                Ok(Some(response)) => {
                    if let Err(e) = stream.write_all(&response).await {
                        error!("Failed to send response to {}: {}", peer, e);
                        break;
                    }
                    if let Ok(mut stats) = stats.lock() {
                        stats.successful_requests += 1;
                        stats.bytes_sent += response.len() as u64;
                    }
                }
                Ok(None) => {
                    if let Ok(mut stats) = stats.lock() {
                        stats.ignored_requests += 1;
                    }
                }
                Err(e) => {
                    warn!("Dropping {}: unparseable frame ({})", peer, e);
                    if let Ok(mut stats) = stats.lock() {
                        stats.failed_requests += 1;
                    }
                    break;
                }
            }
        }

        info!("Client disconnected: {}", peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DataType;
    use crate::protocol::FunctionCode;

    fn table() -> ServerRegisterTable {
        ServerRegisterTable::new(&ModbusTcpServerConfig::default())
    }

    fn frame(tid: u16, unit: u8, function: u8, body: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&tid.to_be_bytes());
        frame.extend_from_slice(&0u16.to_be_bytes());
        frame.extend_from_slice(&((body.len() + 2) as u16).to_be_bytes());
        frame.push(unit);
        frame.push(function);
        frame.extend_from_slice(body);
        frame
    }

    #[test]
    fn test_holding_register_round_trip() {
        let table = table();

        // write 0x007B at address 17
        let write = frame(1, 1, 0x06, &[0x00, 0x11, 0x00, 0x7B]);
        let response = table.process_frame(&write).unwrap().unwrap();
        // write echoes address and value
        assert_eq!(&response[8..], &[0x00, 0x11, 0x00, 0x7B]);

        // read it back
        let read = frame(2, 1, 0x03, &[0x00, 0x11, 0x00, 0x01]);
        let response = table.process_frame(&read).unwrap().unwrap();
        assert_eq!(
            response,
            vec![0x00, 0x02, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x7B]
        );
    }

    #[test]
    fn test_coil_round_trip() {
        let table = table();

        let write = frame(1, 1, 0x05, &[0x00, 0x05, 0xFF, 0x00]);
        let response = table.process_frame(&write).unwrap().unwrap();
        assert_eq!(&response[8..], &[0x00, 0x05, 0xFF, 0x00]);

        let read = frame(2, 1, 0x01, &[0x00, 0x05, 0x00, 0x01]);
        let response = table.process_frame(&read).unwrap().unwrap();
        assert_eq!(&response[8..], &[0x01, 0x01]);
    }

    #[test]
    fn test_write_multiple_registers() {
        let table = table();

        let write = frame(
            1,
            1,
            0x10,
            &[0x00, 0x0A, 0x00, 0x02, 0x04, 0x01, 0x02, 0x03, 0x04],
        );
        let response = table.process_frame(&write).unwrap().unwrap();
        assert_eq!(&response[8..], &[0x00, 0x0A, 0x00, 0x02]);

        let read = frame(2, 1, 0x03, &[0x00, 0x0A, 0x00, 0x02]);
        let response = table.process_frame(&read).unwrap().unwrap();
        assert_eq!(&response[8..], &[0x04, 0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_unknown_function_answers_exception() {
        let table = table();
        let request = frame(7, 1, 0x2B, &[0x00, 0x00]);
        let response = table.process_frame(&request).unwrap().unwrap();
        assert_eq!(response[7], 0x2B | 0x80);
        assert_eq!(response[8], 0x01); // illegal function
    }

    #[test]
    fn test_invalid_quantity_answers_exception() {
        let table = table();
        let request = frame(7, 1, 0x03, &[0x00, 0x00, 0x00, 0xC8]); // 200 words
        let response = table.process_frame(&request).unwrap().unwrap();
        assert_eq!(response[7], 0x83);
        assert_eq!(response[8], 0x03); // illegal data value
    }

    #[test]
    fn test_out_of_range_answers_illegal_address() {
        let config = ModbusTcpServerConfig {
            bank_capacity: 100,
            ..Default::default()
        };
        let table = ServerRegisterTable::new(&config);
        let request = frame(7, 1, 0x03, &[0x00, 0x60, 0x00, 0x10]); // 96..112
        let response = table.process_frame(&request).unwrap().unwrap();
        assert_eq!(response[7], 0x83);
        assert_eq!(response[8], 0x02); // illegal data address
    }

    #[test]
    fn test_unit_gating_ignores_request() {
        let config = ModbusTcpServerConfig {
            allowed_units: Some([1u8].into_iter().collect()),
            ..Default::default()
        };
        let table = ServerRegisterTable::new(&config);

        let request = frame(1, 9, 0x03, &[0x00, 0x00, 0x00, 0x01]);
        assert!(table.process_frame(&request).unwrap().is_none());

        let request = frame(1, 1, 0x03, &[0x00, 0x00, 0x00, 0x01]);
        assert!(table.process_frame(&request).unwrap().is_some());
    }

    #[test]
    fn test_read_only_server_rejects_writes() {
        let config = ModbusTcpServerConfig {
            allow_writes: false,
            ..Default::default()
        };
        let table = ServerRegisterTable::new(&config);
        let write = frame(1, 1, 0x06, &[0x00, 0x00, 0x00, 0x01]);
        let response = table.process_frame(&write).unwrap().unwrap();
        assert_eq!(response[7], 0x86);
        assert_eq!(response[8], 0x01);
    }

    #[test]
    fn test_apply_measurement_with_gate() {
        let mut server = ModbusTcpServer::with_config(ModbusTcpServerConfig::default());
        server.set_measurement_mappings(vec![MeasurementMapping {
            source_id: "meter/1".into(),
            property: "watts".into(),
            unit_id: 1,
            field: FieldDescriptor::new(
                "watts",
                30,
                DataType::UInt32,
                FunctionCode::ReadInputRegisters,
            ),
        }]);

        let gate_open = Arc::new(AtomicBool::new(false));
        let gate = gate_open.clone();
        server.set_gate(Arc::new(move || gate.load(Ordering::SeqCst)));

        // gate closed: nothing written
        let applied = server
            .apply_measurement("meter/1", "watts", &Value::U32(70_000))
            .unwrap();
        assert!(!applied);

        gate_open.store(true, Ordering::SeqCst);
        let applied = server
            .apply_measurement("meter/1", "watts", &Value::U32(70_000))
            .unwrap();
        assert!(applied);

        let bank = server.table().bank(1).unwrap();
        assert_eq!(
            bank.read_inputs(30, 2).unwrap(),
            vec![(70_000u32 >> 16) as u16, (70_000u32 & 0xFFFF) as u16]
        );

        // unmatched events write nothing
        let applied = server
            .apply_measurement("meter/2", "watts", &Value::U32(1))
            .unwrap();
        assert!(!applied);
    }
}
