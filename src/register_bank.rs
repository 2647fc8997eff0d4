//! Thread-safe per-unit register storage for the server engine.
//!
//! Each bank is guarded by its own `RwLock`, so readers of one bank never
//! contend with writers of another, and two units (each owning a bank
//! instance) never block each other at all. Coils and discrete inputs use
//! the capped bit-vector storage from the store module; word banks are
//! sparse maps. All addressing is 0-based.

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::Word;
use crate::store::BitArray;
use std::collections::HashMap;
use std::sync::RwLock;

/// Register storage for one unit id on the server.
#[derive(Debug)]
pub struct ModbusRegisterBank {
    coils: RwLock<BitArray>,
    discretes: RwLock<BitArray>,
    holdings: RwLock<HashMap<u16, Word>>,
    inputs: RwLock<HashMap<u16, Word>>,
    /// Highest addressable register plus one.
    capacity: u32,
}

impl ModbusRegisterBank {
    /// Create a bank covering the full 16-bit address space.
    pub fn new() -> Self {
        Self::with_capacity(0x1_0000)
    }

    /// Create a bank capped at `capacity` addresses per block.
    pub fn with_capacity(capacity: u32) -> Self {
        let capacity = capacity.min(0x1_0000);
        Self {
            coils: RwLock::new(BitArray::new(capacity)),
            discretes: RwLock::new(BitArray::new(capacity)),
            holdings: RwLock::new(HashMap::new()),
            inputs: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    fn check_range(&self, address: u16, quantity: u16) -> ModbusResult<()> {
        if quantity == 0 || address as u32 + quantity as u32 > self.capacity {
            return Err(ModbusError::invalid_address(address, quantity));
        }
        Ok(())
    }

    /// Read coils (function 0x01).
    pub fn read_coils(&self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        self.check_range(address, quantity)?;
        let coils = self
            .coils
            .read()
            .map_err(|_| ModbusError::internal("Coil lock poisoned"))?;
        Ok((0..quantity).map(|i| coils.get(address + i)).collect())
    }

    /// Read discrete inputs (function 0x02).
    pub fn read_discretes(&self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        self.check_range(address, quantity)?;
        let discretes = self
            .discretes
            .read()
            .map_err(|_| ModbusError::internal("Discrete lock poisoned"))?;
        Ok((0..quantity).map(|i| discretes.get(address + i)).collect())
    }

    /// Read holding registers (function 0x03).
    pub fn read_holdings(&self, address: u16, quantity: u16) -> ModbusResult<Vec<Word>> {
        self.check_range(address, quantity)?;
        let holdings = self
            .holdings
            .read()
            .map_err(|_| ModbusError::internal("Holding lock poisoned"))?;
        Ok((0..quantity)
            .map(|i| holdings.get(&(address + i)).copied().unwrap_or(0))
            .collect())
    }

    /// Read input registers (function 0x04).
    pub fn read_inputs(&self, address: u16, quantity: u16) -> ModbusResult<Vec<Word>> {
        self.check_range(address, quantity)?;
        let inputs = self
            .inputs
            .read()
            .map_err(|_| ModbusError::internal("Input lock poisoned"))?;
        Ok((0..quantity)
            .map(|i| inputs.get(&(address + i)).copied().unwrap_or(0))
            .collect())
    }

    /// Write one coil (function 0x05).
    pub fn write_coil(&self, address: u16, value: bool) -> ModbusResult<()> {
        let mut coils = self
            .coils
            .write()
            .map_err(|_| ModbusError::internal("Coil lock poisoned"))?;
        coils.set(address, value)
    }

    /// Write multiple coils (function 0x0F).
    pub fn write_coils(&self, address: u16, values: &[bool]) -> ModbusResult<()> {
        self.check_range(address, values.len() as u16)?;
        let mut coils = self
            .coils
            .write()
            .map_err(|_| ModbusError::internal("Coil lock poisoned"))?;
        for (i, &value) in values.iter().enumerate() {
            coils.set(address + i as u16, value)?;
        }
        Ok(())
    }

    /// Write one holding register (function 0x06).
    pub fn write_holding(&self, address: u16, value: Word) -> ModbusResult<()> {
        self.check_range(address, 1)?;
        let mut holdings = self
            .holdings
            .write()
            .map_err(|_| ModbusError::internal("Holding lock poisoned"))?;
        holdings.insert(address, value);
        Ok(())
    }

    /// Write multiple holding registers (function 0x10).
    pub fn write_holdings(&self, address: u16, values: &[Word]) -> ModbusResult<()> {
        self.check_range(address, values.len() as u16)?;
        let mut holdings = self
            .holdings
            .write()
            .map_err(|_| ModbusError::internal("Holding lock poisoned"))?;
        for (i, &value) in values.iter().enumerate() {
            holdings.insert(address + i as u16, value);
        }
        Ok(())
    }

    /// Seed a discrete input (server-local data source).
    pub fn set_discrete(&self, address: u16, value: bool) -> ModbusResult<()> {
        let mut discretes = self
            .discretes
            .write()
            .map_err(|_| ModbusError::internal("Discrete lock poisoned"))?;
        discretes.set(address, value)
    }

    /// Seed an input register (server-local data source).
    pub fn set_input(&self, address: u16, value: Word) -> ModbusResult<()> {
        self.check_range(address, 1)?;
        let mut inputs = self
            .inputs
            .write()
            .map_err(|_| ModbusError::internal("Input lock poisoned"))?;
        inputs.insert(address, value);
        Ok(())
    }

    /// Seed consecutive input registers (server-local data source).
    pub fn set_inputs(&self, address: u16, values: &[Word]) -> ModbusResult<()> {
        self.check_range(address, values.len() as u16)?;
        let mut inputs = self
            .inputs
            .write()
            .map_err(|_| ModbusError::internal("Input lock poisoned"))?;
        for (i, &value) in values.iter().enumerate() {
            inputs.insert(address + i as u16, value);
        }
        Ok(())
    }

    /// Populated-address counts per bank.
    pub fn stats(&self) -> RegisterBankStats {
        RegisterBankStats {
            coils_count: self.coils.read().map(|b| b.count_ones()).unwrap_or(0),
            discretes_count: self.discretes.read().map(|b| b.count_ones()).unwrap_or(0),
            holdings_count: self.holdings.read().map(|m| m.len()).unwrap_or(0),
            inputs_count: self.inputs.read().map(|m| m.len()).unwrap_or(0),
        }
    }
}

impl Default for ModbusRegisterBank {
    fn default() -> Self {
        Self::new()
    }
}

/// Populated-address counts per bank.
#[derive(Debug, Clone)]
pub struct RegisterBankStats {
    pub coils_count: usize,
    pub discretes_count: usize,
    pub holdings_count: usize,
    pub inputs_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coil_operations() {
        let bank = ModbusRegisterBank::new();

        bank.write_coil(10, true).unwrap();
        assert_eq!(bank.read_coils(10, 1).unwrap(), vec![true]);

        bank.write_coils(20, &[true, false, true]).unwrap();
        assert_eq!(bank.read_coils(20, 3).unwrap(), vec![true, false, true]);
    }

    #[test]
    fn test_register_operations() {
        let bank = ModbusRegisterBank::new();

        bank.write_holding(5, 42).unwrap();
        assert_eq!(bank.read_holdings(5, 1).unwrap(), vec![42]);

        bank.write_holdings(100, &[100, 200, 300]).unwrap();
        assert_eq!(bank.read_holdings(100, 3).unwrap(), vec![100, 200, 300]);

        // unset registers read as zero
        assert_eq!(bank.read_holdings(9999, 2).unwrap(), vec![0, 0]);
    }

    #[test]
    fn test_input_and_discrete_seeding() {
        let bank = ModbusRegisterBank::new();

        bank.set_input(7, 0x1234).unwrap();
        assert_eq!(bank.read_inputs(7, 1).unwrap(), vec![0x1234]);

        bank.set_discrete(3, true).unwrap();
        assert_eq!(bank.read_discretes(3, 1).unwrap(), vec![true]);
    }

    #[test]
    fn test_capacity_enforced() {
        let bank = ModbusRegisterBank::with_capacity(100);
        assert!(bank.write_holding(99, 1).is_ok());
        assert!(bank.write_holding(100, 1).is_err());
        assert!(bank.read_coils(90, 20).is_err());
        assert!(bank.read_holdings(0, 0).is_err());
    }

    #[test]
    fn test_stats() {
        let bank = ModbusRegisterBank::new();
        bank.write_coil(0, true).unwrap();
        bank.write_holding(0, 1).unwrap();
        bank.set_input(0, 1).unwrap();
        let stats = bank.stats();
        assert_eq!(stats.coils_count, 1);
        assert_eq!(stats.holdings_count, 1);
        assert_eq!(stats.inputs_count, 1);
        assert_eq!(stats.discretes_count, 0);
    }
}
