//! I2C devices.

use super::transfer::{check_block_length, RawTransfer, Register, RegisterTransfer};
use crate::config::I2cConfig;
use crate::error::Result;

/// A device at a fixed address on an I2C bus.
pub trait I2c: RawTransfer + RegisterTransfer {
    fn config(&self) -> &I2cConfig;

    fn bus(&self) -> u32 {
        self.config().bus
    }

    fn device(&self) -> u16 {
        self.config().device
    }

    /// Write then read in one transaction, with a repeated start between the
    /// two halves. Returns how many bytes were read.
    fn write_read(&self, write: &[u8], read: &mut [u8]) -> Result<usize>;

    /// SMBus process call: write `value` to `register` and read the device's
    /// reply word in the same transaction.
    fn process_call(&self, register: u8, value: u16) -> Result<u16>;

    /// SMBus block process call: write a block and read the reply block in
    /// the same transaction. Blocks over 32 bytes fail with
    /// [`crate::Error::OutOfBounds`] before the bus is touched.
    fn block_process_call(&self, register: u8, data: &[u8]) -> Result<Vec<u8>> {
        check_block_length(data.len())?;
        self.block_process_call_unchecked(register, data)
    }

    /// Backend half of [`I2c::block_process_call`]; `data` already fits an
    /// SMBus block.
    fn block_process_call_unchecked(&self, register: u8, data: &[u8]) -> Result<Vec<u8>>;
}

impl dyn I2c {
    pub fn register(&self, address: u8) -> Register<'_, dyn I2c> {
        Register::new(self, address)
    }
}

impl Register<'_, dyn I2c> {
    pub fn process_call(&self, value: u16) -> Result<u16> {
        self.device().process_call(self.address(), value)
    }

    pub fn block_process_call(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.device().block_process_call(self.address(), data)
    }
}
