/// Process image for server-side data storage
///
/// This module provides thread-safe storage for the data a slave exposes:
/// coils, discrete inputs, holding registers, input registers and files.
///
/// Every collection is sized when the image is built and never grows. All
/// addresses are zero-based; a range that does not fit inside its collection
/// fails with `IllegalDataAddress`, which the slave turns into an exception
/// response.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::RwLock;

use crate::error::{ModbusError, ModbusResult};

/// Element counts of each collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessImageLayout {
    pub coils: u16,
    pub discrete_inputs: u16,
    pub holding_registers: u16,
    pub input_registers: u16,
}

/// A file of records addressed by Read File Record
///
/// Record numbers are unique but need not be contiguous. Reading a record
/// that was never set yields zeros.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    number: u16,
    record_count: u16,
    records: BTreeMap<u16, Vec<u16>>,
}

impl File {
    pub fn new(number: u16, record_count: u16) -> Self {
        Self {
            number,
            record_count,
            records: BTreeMap::new(),
        }
    }

    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn record_count(&self) -> u16 {
        self.record_count
    }

    /// Store the registers of one record, replacing any previous content
    pub fn set_record(&mut self, record_number: u16, registers: Vec<u16>) -> ModbusResult<()> {
        if record_number >= self.record_count {
            return Err(ModbusError::illegal_data_address(record_number, 1));
        }
        self.records.insert(record_number, registers);
        Ok(())
    }

    /// Read `length` registers of a record
    ///
    /// A record shorter than `length` is padded with zeros.
    pub fn read_record(&self, record_number: u16, length: u16) -> ModbusResult<Vec<u16>> {
        if record_number >= self.record_count {
            return Err(ModbusError::illegal_data_address(record_number, length));
        }
        let mut registers = vec![0u16; length as usize];
        if let Some(record) = self.records.get(&record_number) {
            for (slot, value) in registers.iter_mut().zip(record) {
                *slot = *value;
            }
        }
        Ok(registers)
    }
}

/// In-memory store of a slave's addressable data
#[derive(Debug, Default)]
pub struct ProcessImage {
    /// Coils (read/write) - 1 bit each
    coils: RwLock<Vec<bool>>,
    /// Discrete inputs (read-only from the network) - 1 bit each
    discrete_inputs: RwLock<Vec<bool>>,
    /// Holding registers (read/write) - 16 bits each
    holding_registers: RwLock<Vec<u16>>,
    /// Input registers (read-only from the network) - 16 bits each
    input_registers: RwLock<Vec<u16>>,
    files: RwLock<BTreeMap<u16, File>>,
}

fn checked_range(len: usize, address: u16, quantity: u16) -> ModbusResult<Range<usize>> {
    let start = address as usize;
    let end = start + quantity as usize;
    if end > len {
        return Err(ModbusError::illegal_data_address(address, quantity));
    }
    Ok(start..end)
}

fn lock_error(collection: &str) -> ModbusError {
    ModbusError::internal(format!("Failed to lock {}", collection))
}

impl ProcessImage {
    /// Create an image with every collection zero-filled to its layout size
    pub fn new(layout: ProcessImageLayout) -> Self {
        Self {
            coils: RwLock::new(vec![false; layout.coils as usize]),
            discrete_inputs: RwLock::new(vec![false; layout.discrete_inputs as usize]),
            holding_registers: RwLock::new(vec![0; layout.holding_registers as usize]),
            input_registers: RwLock::new(vec![0; layout.input_registers as usize]),
            files: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create an image holding exactly the given holding registers
    pub fn with_holding_registers(values: &[u16]) -> Self {
        let image = Self::default();
        if let Ok(mut registers) = image.holding_registers.write() {
            *registers = values.to_vec();
        }
        image
    }

    /// Read coils starting at address (function code 0x01)
    pub fn read_coils(&self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        let coils = self.coils.read().map_err(|_| lock_error("coils"))?;
        let range = checked_range(coils.len(), address, quantity)?;
        Ok(coils[range].to_vec())
    }

    /// Write single coil (function code 0x05)
    pub fn write_coil(&self, address: u16, value: bool) -> ModbusResult<()> {
        self.write_coils(address, &[value])
    }

    /// Write multiple coils (function code 0x0F)
    pub fn write_coils(&self, address: u16, values: &[bool]) -> ModbusResult<()> {
        let mut coils = self.coils.write().map_err(|_| lock_error("coils"))?;
        let range = checked_range(coils.len(), address, values.len() as u16)?;
        coils[range].copy_from_slice(values);
        Ok(())
    }

    /// Read discrete inputs starting at address (function code 0x02)
    pub fn read_discrete_inputs(&self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        let inputs = self.discrete_inputs.read().map_err(|_| lock_error("discrete inputs"))?;
        let range = checked_range(inputs.len(), address, quantity)?;
        Ok(inputs[range].to_vec())
    }

    /// Set discrete input values (local side only)
    pub fn set_discrete_inputs(&self, address: u16, values: &[bool]) -> ModbusResult<()> {
        let mut inputs = self.discrete_inputs.write().map_err(|_| lock_error("discrete inputs"))?;
        let range = checked_range(inputs.len(), address, values.len() as u16)?;
        inputs[range].copy_from_slice(values);
        Ok(())
    }

    /// Read holding registers starting at address (function code 0x03)
    pub fn read_holding_registers(&self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        let registers = self.holding_registers.read().map_err(|_| lock_error("holding registers"))?;
        let range = checked_range(registers.len(), address, quantity)?;
        Ok(registers[range].to_vec())
    }

    /// Write single register (function code 0x06)
    pub fn write_holding_register(&self, address: u16, value: u16) -> ModbusResult<()> {
        self.write_holding_registers(address, &[value])
    }

    /// Write multiple registers (function code 0x10)
    pub fn write_holding_registers(&self, address: u16, values: &[u16]) -> ModbusResult<()> {
        let mut registers = self.holding_registers.write().map_err(|_| lock_error("holding registers"))?;
        let range = checked_range(registers.len(), address, values.len() as u16)?;
        registers[range].copy_from_slice(values);
        Ok(())
    }

    /// Read input registers starting at address (function code 0x04)
    pub fn read_input_registers(&self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        let registers = self.input_registers.read().map_err(|_| lock_error("input registers"))?;
        let range = checked_range(registers.len(), address, quantity)?;
        Ok(registers[range].to_vec())
    }

    /// Set input register values (local side only)
    pub fn set_input_registers(&self, address: u16, values: &[u16]) -> ModbusResult<()> {
        let mut registers = self.input_registers.write().map_err(|_| lock_error("input registers"))?;
        let range = checked_range(registers.len(), address, values.len() as u16)?;
        registers[range].copy_from_slice(values);
        Ok(())
    }

    /// Add a file, replacing any file with the same number
    pub fn add_file(&self, file: File) -> ModbusResult<()> {
        let mut files = self.files.write().map_err(|_| lock_error("files"))?;
        files.insert(file.number(), file);
        Ok(())
    }

    /// Set the content of one record of a registered file
    pub fn set_file_record(&self, file_number: u16, record_number: u16, registers: Vec<u16>) -> ModbusResult<()> {
        let mut files = self.files.write().map_err(|_| lock_error("files"))?;
        files
            .get_mut(&file_number)
            .ok_or_else(|| ModbusError::illegal_data_address(file_number, 1))?
            .set_record(record_number, registers)
    }

    /// Read a record (function code 0x14)
    pub fn read_file_record(&self, file_number: u16, record_number: u16, length: u16) -> ModbusResult<Vec<u16>> {
        let files = self.files.read().map_err(|_| lock_error("files"))?;
        files
            .get(&file_number)
            .ok_or_else(|| ModbusError::illegal_data_address(file_number, 1))?
            .read_record(record_number, length)
    }

    /// Get process image statistics
    pub fn get_stats(&self) -> ModbusResult<ProcessImageStats> {
        Ok(ProcessImageStats {
            coils_count: self.coils.read().map_err(|_| lock_error("coils"))?.len(),
            discrete_inputs_count: self.discrete_inputs.read().map_err(|_| lock_error("discrete inputs"))?.len(),
            holding_registers_count: self.holding_registers.read().map_err(|_| lock_error("holding registers"))?.len(),
            input_registers_count: self.input_registers.read().map_err(|_| lock_error("input registers"))?.len(),
            files_count: self.files.read().map_err(|_| lock_error("files"))?.len(),
        })
    }
}

/// Process image statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessImageStats {
    pub coils_count: usize,
    pub discrete_inputs_count: usize,
    pub holding_registers_count: usize,
    pub input_registers_count: usize,
    pub files_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> ProcessImage {
        ProcessImage::new(ProcessImageLayout {
            coils: 16,
            discrete_inputs: 8,
            holding_registers: 10,
            input_registers: 4,
        })
    }

    #[test]
    fn test_coil_operations() {
        let image = image();

        image.write_coil(10, true).unwrap();
        assert_eq!(image.read_coils(10, 1).unwrap(), vec![true]);

        image.write_coils(12, &[true, false, true]).unwrap();
        assert_eq!(image.read_coils(12, 3).unwrap(), vec![true, false, true]);

        assert!(image.write_coils(15, &[true, true]).is_err());
    }

    #[test]
    fn test_register_operations() {
        let image = image();

        image.write_holding_register(5, 42).unwrap();
        assert_eq!(image.read_holding_registers(5, 1).unwrap(), vec![42]);

        image.write_holding_registers(7, &[100, 200, 300]).unwrap();
        assert_eq!(image.read_holding_registers(7, 3).unwrap(), vec![100, 200, 300]);
    }

    #[test]
    fn test_bounds_are_fixed() {
        let image = image();

        // Every index below the size is readable, the size itself is not
        for index in 0..10 {
            assert!(image.read_holding_registers(index, 1).is_ok());
        }
        assert_eq!(
            image.read_holding_registers(10, 1),
            Err(ModbusError::illegal_data_address(10, 1))
        );
        assert!(image.read_holding_registers(0xFFFF, 2).is_err());
        assert!(image.write_holding_register(10, 1).is_err());
        assert_eq!(image.get_stats().unwrap().holding_registers_count, 10);
    }

    #[test]
    fn test_read_only_collections() {
        let image = image();

        image.set_discrete_inputs(0, &[true, true]).unwrap();
        image.set_input_registers(2, &[7, 8]).unwrap();
        assert_eq!(image.read_discrete_inputs(0, 3).unwrap(), vec![true, true, false]);
        assert_eq!(image.read_input_registers(0, 4).unwrap(), vec![0, 0, 7, 8]);
        assert!(image.read_input_registers(3, 2).is_err());
    }

    #[test]
    fn test_file_records() {
        let image = image();
        image.add_file(File::new(4, 10)).unwrap();
        image.set_file_record(4, 1, vec![0x0DFE, 0x0020]).unwrap();

        assert_eq!(image.read_file_record(4, 1, 2).unwrap(), vec![0x0DFE, 0x0020]);
        // Unset record reads as zeros
        assert_eq!(image.read_file_record(4, 5, 3).unwrap(), vec![0, 0, 0]);
        // Short record is padded
        assert_eq!(image.read_file_record(4, 1, 3).unwrap(), vec![0x0DFE, 0x0020, 0]);

        assert!(image.read_file_record(4, 10, 1).is_err());
        assert!(image.read_file_record(9, 0, 1).is_err());
        assert!(image.set_file_record(4, 10, vec![1]).is_err());
    }

    #[test]
    fn test_single_register_fixture() {
        let image = ProcessImage::with_holding_registers(&[251]);
        assert_eq!(image.read_holding_registers(0, 1).unwrap(), vec![251]);
        assert!(image.read_holding_registers(1, 1).is_err());
    }
}
