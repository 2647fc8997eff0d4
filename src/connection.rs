//! # Connection Layer
//!
//! A [`ModbusConnection`] addresses one unit over a shared physical link
//! and exposes typed register operations. All connections sharing a link
//! hold the link mutex for the complete request/response cycle, modelling
//! the single half-duplex channel under serial and most field networks:
//! transactions from any number of tasks execute strictly one at a time,
//! in submission order (the Tokio mutex queues waiters fairly), and
//! request/response bytes are never interleaved.
//!
//! Transient transport failures are retried up to the configured budget
//! with a fixed delay between attempts; protocol errors surface
//! immediately. With `retry_reconnect` enabled the link transport is closed
//! before a retry so the next attempt starts on a fresh socket.
//!
//! [`FieldDevice`] layers the device-driver interface on top: named
//! [`FieldDescriptor`] reads are coalesced into minimal wire transactions,
//! cached in a [`SampleStore`] under its TTL, and decoded through the
//! register codec. A confirmed field write expires the sample so the next
//! read observes the written value.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

use crate::codec::Value;
use crate::error::{ModbusError, ModbusResult};
use crate::field::FieldDescriptor;
use crate::logging::CallbackLogger;
use crate::protocol::{pdu, BlockType, FunctionCode, ModbusRequest, ModbusResponse, UnitId};
use crate::range::coalesce;
use crate::store::SampleStore;
use crate::transport::ModbusTransport;

/// Bounded-retry policy for transient transport failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure.
    pub retries: u32,
    /// Fixed delay between attempts.
    pub retry_delay: Duration,
    /// Close the link transport before retrying so the next attempt
    /// reconnects.
    pub retry_reconnect: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_delay: Duration::from_millis(60),
            retry_reconnect: false,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            retries: 0,
            retry_delay: Duration::ZERO,
            retry_reconnect: false,
        }
    }
}

/// Shared handle to one physical link.
///
/// Every [`ModbusConnection`] on the link clones this handle; the mutex is
/// the per-link lock.
pub type SharedLink = Arc<Mutex<dyn ModbusTransport>>;

/// Wrap a transport into a [`SharedLink`].
pub fn shared_link<T: ModbusTransport + 'static>(transport: T) -> SharedLink {
    Arc::new(Mutex::new(transport))
}

/// A per-unit connection over a shared link.
pub struct ModbusConnection {
    link: SharedLink,
    unit_id: UnitId,
    retry: RetryPolicy,
    logger: Option<CallbackLogger>,
}

impl ModbusConnection {
    /// Create a connection for `unit_id` on the given link.
    pub fn new(link: SharedLink, unit_id: UnitId) -> Self {
        Self {
            link,
            unit_id,
            retry: RetryPolicy::default(),
            logger: None,
        }
    }

    /// Replace the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Attach a request/response logger.
    pub fn with_logger(mut self, logger: CallbackLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// The unit id this connection addresses.
    pub fn unit_id(&self) -> UnitId {
        self.unit_id
    }

    /// The underlying link handle.
    pub fn link(&self) -> &SharedLink {
        &self.link
    }

    /// Execute a raw request against this connection's unit, holding the
    /// link lock for the full transaction and applying the retry policy.
    pub async fn execute(&self, mut request: ModbusRequest) -> ModbusResult<ModbusResponse> {
        request.unit_id = self.unit_id;

        if let Some(logger) = &self.logger {
            logger.log_request(
                request.unit_id,
                request.function.to_u8(),
                request.address,
                request.quantity,
                &request.data,
            );
        }

        let mut last_error: Option<ModbusError> = None;
        for attempt in 0..=self.retry.retries {
            if attempt > 0 && !self.retry.retry_delay.is_zero() {
                tokio::time::sleep(self.retry.retry_delay).await;
            }

            let mut link = self.link.lock().await;
            if attempt > 0 && self.retry.retry_reconnect {
                let _ = link.close().await;
            }

            match link.request(&request).await {
                Ok(response) => {
                    if let Some(logger) = &self.logger {
                        logger.log_response(
                            response.unit_id,
                            response.function.to_u8(),
                            &response.data,
                        );
                    }
                    return Ok(response);
                }
                Err(e) if e.is_recoverable() && attempt < self.retry.retries => {
                    warn!(
                        "Transaction attempt {}/{} on unit {} failed: {}",
                        attempt + 1,
                        self.retry.retries + 1,
                        self.unit_id,
                        e
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| ModbusError::internal("Retry loop ended without an error")))
    }

    /// Read coils (function 0x01).
    pub async fn read_coils(&self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        let request =
            ModbusRequest::new_read(self.unit_id, FunctionCode::ReadCoils, address, quantity);
        let response = self.execute(request).await?;
        Ok(response
            .parse_bits()?
            .into_iter()
            .take(quantity as usize)
            .collect())
    }

    /// Read discrete inputs (function 0x02).
    pub async fn read_discretes(&self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        let request = ModbusRequest::new_read(
            self.unit_id,
            FunctionCode::ReadDiscreteInputs,
            address,
            quantity,
        );
        let response = self.execute(request).await?;
        Ok(response
            .parse_bits()?
            .into_iter()
            .take(quantity as usize)
            .collect())
    }

    /// Read holding registers (function 0x03).
    pub async fn read_holding_registers(
        &self,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        let request = ModbusRequest::new_read(
            self.unit_id,
            FunctionCode::ReadHoldingRegisters,
            address,
            quantity,
        );
        self.execute(request).await?.parse_words()
    }

    /// Read input registers (function 0x04).
    pub async fn read_input_registers(
        &self,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        let request = ModbusRequest::new_read(
            self.unit_id,
            FunctionCode::ReadInputRegisters,
            address,
            quantity,
        );
        self.execute(request).await?.parse_words()
    }

    /// Write a single coil (function 0x05).
    pub async fn write_coil(&self, address: u16, value: bool) -> ModbusResult<()> {
        let request = ModbusRequest::new_write(
            self.unit_id,
            FunctionCode::WriteSingleCoil,
            address,
            1,
            vec![u8::from(value)],
        );
        self.execute(request).await.map(|_| ())
    }

    /// Write a single holding register (function 0x06).
    pub async fn write_register(&self, address: u16, value: u16) -> ModbusResult<()> {
        let request = ModbusRequest::new_write(
            self.unit_id,
            FunctionCode::WriteSingleRegister,
            address,
            1,
            value.to_be_bytes().to_vec(),
        );
        self.execute(request).await.map(|_| ())
    }

    /// Write multiple coils (function 0x0F).
    pub async fn write_coils(&self, address: u16, values: &[bool]) -> ModbusResult<()> {
        if values.is_empty() || values.len() > 1968 {
            return Err(ModbusError::invalid_data(format!(
                "Invalid coil write count: {}",
                values.len()
            )));
        }
        let request = ModbusRequest::new_write(
            self.unit_id,
            FunctionCode::WriteMultipleCoils,
            address,
            values.len() as u16,
            pdu::pack_bits(values),
        );
        self.execute(request).await.map(|_| ())
    }

    /// Write multiple holding registers (function 0x10).
    pub async fn write_registers(&self, address: u16, values: &[u16]) -> ModbusResult<()> {
        if values.is_empty() || values.len() > 123 {
            return Err(ModbusError::invalid_data(format!(
                "Invalid register write count: {}",
                values.len()
            )));
        }
        let request = ModbusRequest::new_write(
            self.unit_id,
            FunctionCode::WriteMultipleRegisters,
            address,
            values.len() as u16,
            pdu::words_to_bytes(values),
        );
        self.execute(request).await.map(|_| ())
    }

    /// Read `word_count` holding registers as raw bytes.
    pub async fn read_bytes(&self, address: u16, word_count: u16) -> ModbusResult<Vec<u8>> {
        let words = self.read_holding_registers(address, word_count).await?;
        Ok(crate::codec::words_to_bytes(&words))
    }

    /// Write raw bytes into holding registers, zero-padding to the word
    /// boundary.
    pub async fn write_bytes(&self, address: u16, bytes: &[u8]) -> ModbusResult<()> {
        let words = crate::codec::bytes_to_words(bytes);
        if words.len() == 1 {
            self.write_register(address, words[0]).await
        } else {
            self.write_registers(address, &words).await
        }
    }

    /// Read a fixed-length string from holding registers.
    pub async fn read_string(
        &self,
        address: u16,
        word_count: u16,
        trim: bool,
    ) -> ModbusResult<String> {
        let bytes = self.read_bytes(address, word_count).await?;
        let text = String::from_utf8(bytes)
            .map_err(|e| ModbusError::decode(format!("Invalid string data: {}", e)))?;
        Ok(if trim {
            crate::codec::trim_register_string(&text)
        } else {
            text
        })
    }

    /// Write a string into a fixed-length register block, NUL-padded.
    pub async fn write_string(&self, address: u16, word_count: u16, text: &str) -> ModbusResult<()> {
        if text.len() > word_count as usize * 2 {
            return Err(ModbusError::encode(format!(
                "String of {} bytes exceeds {} words",
                text.len(),
                word_count
            )));
        }
        let mut bytes = text.as_bytes().to_vec();
        bytes.resize(word_count as usize * 2, 0);
        self.write_bytes(address, &bytes).await
    }

    /// Whether the underlying link is connected.
    pub async fn is_connected(&self) -> bool {
        self.link.lock().await.is_connected()
    }

    /// Transport statistics for the underlying link.
    pub async fn stats(&self) -> crate::transport::TransportStats {
        self.link.lock().await.get_stats()
    }
}

/// Default maximum words per read transaction, the protocol limit.
pub const DEFAULT_MAX_READ_WORDS: u16 = 125;

/// Driver-facing view of one device: a connection, a TTL-cached sample and
/// the coalescing read path.
pub struct FieldDevice {
    connection: ModbusConnection,
    store: SampleStore,
    max_read_words: u16,
}

impl FieldDevice {
    /// Create a device wrapper with the given sample TTL.
    pub fn new(connection: ModbusConnection, cache_ttl: Duration) -> Self {
        Self {
            connection,
            store: SampleStore::new(cache_ttl),
            max_read_words: DEFAULT_MAX_READ_WORDS,
        }
    }

    /// Lower the per-transaction word limit for devices that cannot serve
    /// full-size reads.
    pub fn with_max_read_words(mut self, max_read_words: u16) -> Self {
        self.max_read_words = max_read_words.clamp(1, DEFAULT_MAX_READ_WORDS);
        self
    }

    /// The sample cache.
    pub fn store(&self) -> &SampleStore {
        &self.store
    }

    /// The underlying connection.
    pub fn connection(&self) -> &ModbusConnection {
        &self.connection
    }

    /// Read named fields, refreshing the sample from the device only when
    /// the cache is stale.
    ///
    /// Scattered field addresses are grouped by read function and coalesced
    /// into minimal contiguous transactions capped at the configured word
    /// limit, then decoded from the refreshed snapshot.
    pub async fn read_fields(
        &self,
        fields: &[FieldDescriptor],
    ) -> ModbusResult<HashMap<String, Value>> {
        if !self.store.is_fresh() {
            self.refresh(fields).await?;
        }

        let sample = self.store.snapshot();
        let registers = sample.registers();

        let mut values = HashMap::with_capacity(fields.len());
        for field in fields {
            let block = field.block_type();
            let value = if block.is_bit_type() {
                field.decode_bit(registers.bit(block, field.address))
            } else {
                let words = registers.words(block, field.address, field.word_length());
                field.decode(&words)?
            };
            values.insert(field.name.clone(), value);
        }
        Ok(values)
    }

    /// Write one field and expire the sample so the next read re-fetches.
    pub async fn write_field(&self, field: &FieldDescriptor, value: &Value) -> ModbusResult<()> {
        match field.block_type() {
            BlockType::Coil => {
                let truthy = value
                    .as_i128()
                    .ok_or_else(|| ModbusError::encode("Coil write requires a numeric value"))?
                    != 0;
                self.connection.write_coil(field.address, truthy).await?;
            }
            BlockType::Holding => {
                let words = field.encode(value)?;
                if words.len() == 1 {
                    self.connection.write_register(field.address, words[0]).await?;
                } else {
                    self.connection.write_registers(field.address, &words).await?;
                }
            }
            BlockType::Discrete | BlockType::Input => {
                return Err(ModbusError::invalid_data(format!(
                    "Field {:?} targets the read-only {} bank",
                    field.name,
                    field.block_type()
                )));
            }
        }

        self.store.expire();
        Ok(())
    }

    /// Fetch every field's registers from the device and commit them to the
    /// store as one atomic update.
    async fn refresh(&self, fields: &[FieldDescriptor]) -> ModbusResult<()> {
        let mut groups: BTreeMap<FunctionCode, Vec<&FieldDescriptor>> = BTreeMap::new();
        for field in fields {
            if !field.function.is_read() {
                return Err(ModbusError::configuration(format!(
                    "Field {:?} uses non-read function {}",
                    field.name, field.function
                )));
            }
            groups.entry(field.function).or_default().push(field);
        }

        let mut word_updates: Vec<(BlockType, u16, Vec<u16>)> = Vec::new();
        let mut bit_updates: Vec<(BlockType, u16, Vec<bool>)> = Vec::new();

        for (function, members) in groups {
            let block = function.block_type();
            let requests: Vec<(u16, u16)> = members
                .iter()
                .map(|f| (f.address, f.word_length()))
                .collect();

            for chunk in coalesce(&requests, self.max_read_words) {
                match function {
                    FunctionCode::ReadCoils => {
                        let bits = self.connection.read_coils(chunk.start, chunk.count).await?;
                        bit_updates.push((block, chunk.start, bits));
                    }
                    FunctionCode::ReadDiscreteInputs => {
                        let bits = self
                            .connection
                            .read_discretes(chunk.start, chunk.count)
                            .await?;
                        bit_updates.push((block, chunk.start, bits));
                    }
                    FunctionCode::ReadHoldingRegisters => {
                        let words = self
                            .connection
                            .read_holding_registers(chunk.start, chunk.count)
                            .await?;
                        word_updates.push((block, chunk.start, words));
                    }
                    FunctionCode::ReadInputRegisters => {
                        let words = self
                            .connection
                            .read_input_registers(chunk.start, chunk.count)
                            .await?;
                        word_updates.push((block, chunk.start, words));
                    }
                    _ => unreachable!("write functions filtered above"),
                }
            }
        }

        self.store.perform_updates(move |registers| {
            for (block, start, words) in word_updates {
                registers.set_words(block, start, &words)?;
            }
            for (block, start, bits) in bit_updates {
                for (i, bit) in bits.into_iter().enumerate() {
                    registers.set_bit(block, start.wrapping_add(i as u16), bit)?;
                }
            }
            Ok(true)
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DataType;
    use crate::transport::TransportStats;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Transport stub answering every read with incrementing words and
    /// optionally failing the first N requests.
    struct ScriptedTransport {
        transactions: Arc<AtomicU64>,
        fail_first: u64,
    }

    #[async_trait]
    impl ModbusTransport for ScriptedTransport {
        async fn request(&mut self, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
            let n = self.transactions.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(ModbusError::io("injected failure"));
            }
            let data = match request.function {
                FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
                    let bytes = pdu::pack_bits(&vec![true; request.quantity as usize]);
                    let mut data = vec![bytes.len() as u8];
                    data.extend_from_slice(&bytes);
                    data
                }
                FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
                    let words: Vec<u16> =
                        (0..request.quantity).map(|i| request.address + i).collect();
                    let mut data = vec![(words.len() * 2) as u8];
                    data.extend_from_slice(&pdu::words_to_bytes(&words));
                    data
                }
                _ => request.encode_pdu_body(),
            };
            Ok(ModbusResponse::new_success(
                request.unit_id,
                request.function,
                data,
            ))
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn close(&mut self) -> ModbusResult<()> {
            Ok(())
        }

        fn get_stats(&self) -> TransportStats {
            TransportStats::default()
        }
    }

    fn scripted(fail_first: u64) -> (SharedLink, Arc<AtomicU64>) {
        let transactions = Arc::new(AtomicU64::new(0));
        let link = shared_link(ScriptedTransport {
            transactions: transactions.clone(),
            fail_first,
        });
        (link, transactions)
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        let (link, transactions) = scripted(2);
        let conn = ModbusConnection::new(link, 1).with_retry(RetryPolicy {
            retries: 3,
            retry_delay: Duration::ZERO,
            retry_reconnect: false,
        });

        let words = conn.read_holding_registers(10, 2).await.unwrap();
        assert_eq!(words, vec![10, 11]);
        assert_eq!(transactions.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let (link, _) = scripted(10);
        let conn = ModbusConnection::new(link, 1).with_retry(RetryPolicy {
            retries: 2,
            retry_delay: Duration::ZERO,
            retry_reconnect: false,
        });

        let result = conn.read_holding_registers(0, 1).await;
        assert!(matches!(result, Err(ModbusError::Io { .. })));
    }

    #[tokio::test]
    async fn test_read_fields_coalesces_transactions() {
        let (link, transactions) = scripted(0);
        let conn = ModbusConnection::new(link, 1).with_retry(RetryPolicy::none());
        let device = FieldDevice::new(conn, Duration::from_secs(60));

        let fields = vec![
            FieldDescriptor::new("a", 0, DataType::UInt32, FunctionCode::ReadHoldingRegisters),
            FieldDescriptor::new("b", 2, DataType::UInt16, FunctionCode::ReadHoldingRegisters),
            FieldDescriptor::new("c", 10, DataType::UInt16, FunctionCode::ReadHoldingRegisters),
        ];

        let values = device.read_fields(&fields).await.unwrap();
        // addresses 0-2 merge into one chunk, 10 stands alone
        assert_eq!(transactions.load(Ordering::SeqCst), 2);
        assert_eq!(values["b"], Value::U16(2));
        assert_eq!(values["c"], Value::U16(10));
        assert_eq!(values["a"], Value::U32(1)); // words [0, 1]
    }

    #[tokio::test]
    async fn test_sample_cache_suppresses_refetch() {
        let (link, transactions) = scripted(0);
        let conn = ModbusConnection::new(link, 1).with_retry(RetryPolicy::none());
        let device = FieldDevice::new(conn, Duration::from_secs(60));

        let fields = vec![FieldDescriptor::new(
            "x",
            5,
            DataType::UInt16,
            FunctionCode::ReadInputRegisters,
        )];

        device.read_fields(&fields).await.unwrap();
        device.read_fields(&fields).await.unwrap();
        assert_eq!(transactions.load(Ordering::SeqCst), 1);

        device.store().expire();
        device.read_fields(&fields).await.unwrap();
        assert_eq!(transactions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_write_field_expires_sample() {
        let (link, transactions) = scripted(0);
        let conn = ModbusConnection::new(link, 1).with_retry(RetryPolicy::none());
        let device = FieldDevice::new(conn, Duration::from_secs(60));

        let read_field =
            FieldDescriptor::new("x", 5, DataType::UInt16, FunctionCode::ReadHoldingRegisters);
        device.read_fields(std::slice::from_ref(&read_field)).await.unwrap();
        assert!(device.store().is_fresh());

        device
            .write_field(&read_field, &Value::U16(99))
            .await
            .unwrap();
        assert!(!device.store().is_fresh());
        let _ = transactions;
    }

    #[tokio::test]
    async fn test_write_to_read_only_bank_rejected() {
        let (link, _) = scripted(0);
        let conn = ModbusConnection::new(link, 1);
        let device = FieldDevice::new(conn, Duration::from_secs(60));

        let field =
            FieldDescriptor::new("ro", 1, DataType::UInt16, FunctionCode::ReadInputRegisters);
        let result = device.write_field(&field, &Value::U16(1)).await;
        assert!(result.is_err());
    }
}
