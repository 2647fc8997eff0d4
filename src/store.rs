//! # Register Store
//!
//! In-memory, timestamped snapshot of a device's register banks with a
//! staleness (cache-TTL) policy.
//!
//! [`RegisterSet`] models the four banks of one unit; unset addresses read
//! as zero/false. [`SampleStore`] owns a `RegisterSet` behind a
//! single-writer lock: mutations go through
//! [`SampleStore::perform_updates`], readers take a cloned [`Sample`]
//! snapshot and never observe a partially applied update.

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{BlockType, Word};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Growable bit vector indexed by register address, capped at a configured
/// address-space size.
///
/// Backing storage grows on demand one 64-bit block at a time, so a unit
/// with a handful of high-addressed coils does not allocate the full
/// address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitArray {
    blocks: Vec<u64>,
    capacity: u32,
}

impl BitArray {
    /// Create an empty bit array covering `capacity` addresses.
    pub fn new(capacity: u32) -> Self {
        Self {
            blocks: Vec::new(),
            capacity,
        }
    }

    /// The configured address-space size.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Read one bit; addresses beyond the grown storage read as `false`.
    pub fn get(&self, address: u16) -> bool {
        let block = address as usize / 64;
        match self.blocks.get(block) {
            Some(bits) => (bits >> (address % 64)) & 1 == 1,
            None => false,
        }
    }

    /// Set one bit, growing storage as needed.
    pub fn set(&mut self, address: u16, value: bool) -> ModbusResult<()> {
        if address as u32 >= self.capacity {
            return Err(ModbusError::invalid_address(address, 1));
        }
        let block = address as usize / 64;
        if block >= self.blocks.len() {
            self.blocks.resize(block + 1, 0);
        }
        let mask = 1u64 << (address % 64);
        if value {
            self.blocks[block] |= mask;
        } else {
            self.blocks[block] &= !mask;
        }
        Ok(())
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> usize {
        self.blocks.iter().map(|b| b.count_ones() as usize).sum()
    }
}

impl Default for BitArray {
    fn default() -> Self {
        Self::new(0x1_0000)
    }
}

/// The four register banks of one unit.
///
/// Coils and discretes are bit vectors; holding and input registers are
/// sparse word maps. Cloning yields an independent snapshot.
#[derive(Debug, Clone, Default)]
pub struct RegisterSet {
    coils: BitArray,
    discretes: BitArray,
    holdings: HashMap<u16, Word>,
    inputs: HashMap<u16, Word>,
}

impl RegisterSet {
    /// Create an empty register set covering the full address space.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read one bit from a bit-addressed bank.
    pub fn bit(&self, block: BlockType, address: u16) -> bool {
        match block {
            BlockType::Coil => self.coils.get(address),
            BlockType::Discrete => self.discretes.get(address),
            BlockType::Input | BlockType::Holding => self.word(block, address) != 0,
        }
    }

    /// Write one bit into a bit-addressed bank.
    pub fn set_bit(&mut self, block: BlockType, address: u16, value: bool) -> ModbusResult<()> {
        match block {
            BlockType::Coil => self.coils.set(address, value),
            BlockType::Discrete => self.discretes.set(address, value),
            other => Err(ModbusError::invalid_data(format!(
                "{} bank is not bit-addressed",
                other
            ))),
        }
    }

    /// Read one word from a word-addressed bank; unset addresses read zero.
    pub fn word(&self, block: BlockType, address: u16) -> Word {
        let map = match block {
            BlockType::Holding => &self.holdings,
            BlockType::Input => &self.inputs,
            BlockType::Coil | BlockType::Discrete => {
                return self.bit(block, address) as Word;
            }
        };
        map.get(&address).copied().unwrap_or(0)
    }

    /// Read `count` consecutive words.
    pub fn words(&self, block: BlockType, address: u16, count: u16) -> Vec<Word> {
        (0..count)
            .map(|i| self.word(block, address.wrapping_add(i)))
            .collect()
    }

    /// Write one word into a word-addressed bank.
    pub fn set_word(&mut self, block: BlockType, address: u16, value: Word) -> ModbusResult<()> {
        let map = match block {
            BlockType::Holding => &mut self.holdings,
            BlockType::Input => &mut self.inputs,
            other => {
                return Err(ModbusError::invalid_data(format!(
                    "{} bank is not word-addressed",
                    other
                )))
            }
        };
        map.insert(address, value);
        Ok(())
    }

    /// Write consecutive words starting at `address`.
    pub fn set_words(&mut self, block: BlockType, address: u16, values: &[Word]) -> ModbusResult<()> {
        for (i, &value) in values.iter().enumerate() {
            self.set_word(block, address.wrapping_add(i as u16), value)?;
        }
        Ok(())
    }

    /// Total number of populated addresses across all banks.
    pub fn len(&self) -> usize {
        self.holdings.len() + self.inputs.len() + self.coils.count_ones() + self.discretes.count_ones()
    }

    /// Whether no register has been written yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A point-in-time snapshot of a unit's registers with its capture
/// timestamp and the store's staleness policy.
#[derive(Debug, Clone)]
pub struct Sample {
    registers: RegisterSet,
    timestamp: Option<Instant>,
    cache_ttl: Duration,
}

impl Sample {
    /// The captured register data.
    pub fn registers(&self) -> &RegisterSet {
        &self.registers
    }

    /// When the data was captured, if ever.
    pub fn timestamp(&self) -> Option<Instant> {
        self.timestamp
    }

    /// Whether the sample is still within its cache TTL.
    pub fn is_fresh(&self) -> bool {
        match self.timestamp {
            Some(ts) => ts.elapsed() < self.cache_ttl,
            None => false,
        }
    }
}

/// Single-writer register cache for one unit.
///
/// `perform_updates` serialises all mutations; `snapshot` clones the data
/// so readers hold no lock and never see a half-applied update. A sample
/// that has never been populated, or whose TTL has lapsed, or that was
/// explicitly [`SampleStore::expire`]d reports itself stale so the caller
/// refreshes from the device.
#[derive(Debug)]
pub struct SampleStore {
    inner: Mutex<SampleState>,
    cache_ttl: Duration,
}

#[derive(Debug)]
struct SampleState {
    registers: RegisterSet,
    timestamp: Option<Instant>,
}

impl SampleStore {
    /// Create an empty store with the given cache TTL.
    pub fn new(cache_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(SampleState {
                registers: RegisterSet::new(),
                timestamp: None,
            }),
            cache_ttl,
        }
    }

    /// The configured cache TTL.
    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    /// Whether the current sample is fresh.
    pub fn is_fresh(&self) -> bool {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match state.timestamp {
            Some(ts) => ts.elapsed() < self.cache_ttl,
            None => false,
        }
    }

    /// Force staleness so the next read performs a fresh device fetch.
    ///
    /// Called after a confirmed write so a subsequent read reflects the
    /// just-written value instead of a cached pre-write one.
    pub fn expire(&self) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.timestamp = None;
    }

    /// Copy-on-read snapshot of the current sample.
    pub fn snapshot(&self) -> Sample {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Sample {
            registers: state.registers.clone(),
            timestamp: state.timestamp,
            cache_ttl: self.cache_ttl,
        }
    }

    /// Apply a mutation under the writer lock.
    ///
    /// The closure receives the live register set and reports whether the
    /// update succeeded; on `Ok(true)` the sample timestamp refreshes, on
    /// `Ok(false)` or error the prior timestamp (and, on error, the data
    /// already written by the closure) is kept as-is and the sample stays
    /// on its old clock.
    pub fn perform_updates<F>(&self, update: F) -> ModbusResult<bool>
    where
        F: FnOnce(&mut RegisterSet) -> ModbusResult<bool>,
    {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let updated = update(&mut state.registers)?;
        if updated {
            state.timestamp = Some(Instant::now());
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_array() {
        let mut bits = BitArray::new(128);
        assert!(!bits.get(100));
        bits.set(100, true).unwrap();
        assert!(bits.get(100));
        bits.set(100, false).unwrap();
        assert!(!bits.get(100));
        assert!(bits.set(128, true).is_err());
    }

    #[test]
    fn test_register_set_defaults_to_zero() {
        let set = RegisterSet::new();
        assert_eq!(set.word(BlockType::Holding, 1000), 0);
        assert!(!set.bit(BlockType::Coil, 1000));
        assert!(set.is_empty());
    }

    #[test]
    fn test_register_set_banks_are_distinct() {
        let mut set = RegisterSet::new();
        set.set_word(BlockType::Holding, 5, 42).unwrap();
        set.set_word(BlockType::Input, 5, 77).unwrap();
        assert_eq!(set.word(BlockType::Holding, 5), 42);
        assert_eq!(set.word(BlockType::Input, 5), 77);

        set.set_bit(BlockType::Coil, 5, true).unwrap();
        assert!(set.bit(BlockType::Coil, 5));
        assert!(!set.bit(BlockType::Discrete, 5));
    }

    #[test]
    fn test_bank_kind_enforcement() {
        let mut set = RegisterSet::new();
        assert!(set.set_word(BlockType::Coil, 0, 1).is_err());
        assert!(set.set_bit(BlockType::Holding, 0, true).is_err());
    }

    #[test]
    fn test_store_freshness_lifecycle() {
        let store = SampleStore::new(Duration::from_secs(60));
        assert!(!store.is_fresh());

        store
            .perform_updates(|regs| {
                regs.set_word(BlockType::Holding, 0, 7)?;
                Ok(true)
            })
            .unwrap();
        assert!(store.is_fresh());

        store.expire();
        assert!(!store.is_fresh());
        // data survives expiry; only the clock is reset
        assert_eq!(store.snapshot().registers().word(BlockType::Holding, 0), 7);
    }

    #[test]
    fn test_failed_update_keeps_prior_timestamp() {
        let store = SampleStore::new(Duration::from_secs(60));
        let result = store.perform_updates(|regs| {
            regs.set_word(BlockType::Holding, 0, 1)?;
            Ok(false)
        });
        assert_eq!(result.unwrap(), false);
        assert!(!store.is_fresh());
    }

    #[test]
    fn test_snapshot_is_independent() {
        let store = SampleStore::new(Duration::from_millis(10));
        store
            .perform_updates(|regs| {
                regs.set_word(BlockType::Holding, 3, 11)?;
                Ok(true)
            })
            .unwrap();

        let snap = store.snapshot();
        store
            .perform_updates(|regs| {
                regs.set_word(BlockType::Holding, 3, 99)?;
                Ok(true)
            })
            .unwrap();

        assert_eq!(snap.registers().word(BlockType::Holding, 3), 11);
        assert_eq!(
            store.snapshot().registers().word(BlockType::Holding, 3),
            99
        );
    }

    #[test]
    fn test_ttl_expiry() {
        let store = SampleStore::new(Duration::from_millis(0));
        store.perform_updates(|_| Ok(true)).unwrap();
        // zero TTL means the sample is stale the moment it lands
        assert!(!store.is_fresh());
    }
}
