use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use crate::error::BusError;

/// A storage-simulating bus device.
///
/// Register writes are stored per register and returned by the next read of
/// that register; registers never written read as zeros. Raw writes queue
/// bytes that raw reads drain. A process call stores its argument and reads
/// it back under one lock, so it always echoes the written value.
#[derive(Debug, Default)]
pub struct MockDevice {
    state: Mutex<DeviceState>,
}

#[derive(Debug, Default)]
struct DeviceState {
    registers: HashMap<u8, Vec<u8>>,
    fifo: VecDeque<u8>,
    fail_next: Option<BusError>,
    glitches: usize,
    register_reads: usize,
}

impl DeviceState {
    fn take_failure(&mut self) -> Result<(), BusError> {
        match self.fail_next.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn store(&mut self, register: u8, data: &[u8]) {
        self.registers.insert(register, data.to_vec());
    }

    fn load(&mut self, register: u8, buf: &mut [u8]) -> usize {
        self.register_reads += 1;
        let count = match self.registers.get(&register) {
            Some(stored) => {
                let count = stored.len().min(buf.len());
                buf[..count].copy_from_slice(&stored[..count]);
                count
            }
            None => {
                buf.fill(0);
                buf.len()
            }
        };

        // A glitch flips the second byte so word and block payloads differ
        // while a block's length byte stays intact.
        if self.glitches > 0 && count > 0 {
            self.glitches -= 1;
            let index = 1.min(count - 1);
            buf[index] ^= 0xff;
        }
        count
    }
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next operation with `err`.
    pub fn fail_next(&self, err: BusError) {
        self.lock().fail_next = Some(err);
    }

    /// Corrupt the next `count` register reads.
    pub fn glitch_reads(&self, count: usize) {
        self.lock().glitches = count;
    }

    /// Number of register reads served so far.
    pub fn register_reads(&self) -> usize {
        self.lock().register_reads
    }

    /// Stored contents of `register`, without counting as a read.
    pub fn peek(&self, register: u8) -> Option<Vec<u8>> {
        self.lock().registers.get(&register).cloned()
    }

    /// Bytes queued by raw writes and not yet read.
    pub fn pending(&self) -> usize {
        self.lock().fifo.len()
    }

    pub fn write(&self, data: &[u8]) -> Result<(), BusError> {
        let mut state = self.lock();
        state.take_failure()?;
        state.fifo.extend(data.iter().copied());
        Ok(())
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize, BusError> {
        let mut state = self.lock();
        state.take_failure()?;
        let count = state.fifo.len().min(buf.len());
        for (slot, byte) in buf.iter_mut().zip(state.fifo.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    pub fn write_register(&self, register: u8, data: &[u8]) -> Result<(), BusError> {
        let mut state = self.lock();
        state.take_failure()?;
        state.store(register, data);
        Ok(())
    }

    pub fn read_register(&self, register: u8, buf: &mut [u8]) -> Result<usize, BusError> {
        let mut state = self.lock();
        state.take_failure()?;
        Ok(state.load(register, buf))
    }

    pub fn process_call(&self, register: u8, value: u16) -> Result<u16, BusError> {
        let mut state = self.lock();
        state.take_failure()?;
        state.store(register, &value.to_le_bytes());
        let mut word = [0u8; 2];
        let count = state.load(register, &mut word);
        if count != word.len() {
            return Err(BusError::ShortRead {
                expected: word.len(),
                actual: count,
            });
        }
        Ok(u16::from_le_bytes(word))
    }

    pub fn block_process_call(&self, register: u8, data: &[u8]) -> Result<Vec<u8>, BusError> {
        let mut state = self.lock();
        state.take_failure()?;
        state.store(register, data);
        let mut buf = vec![0u8; data.len()];
        let count = state.load(register, &mut buf);
        buf.truncate(count);
        Ok(buf)
    }

    /// Full-duplex exchange; the device shifts back what it receives.
    pub fn transfer(&self, write: &[u8], read: &mut [u8]) -> Result<(), BusError> {
        let mut state = self.lock();
        state.take_failure()?;
        let count = write.len().min(read.len());
        read[..count].copy_from_slice(&write[..count]);
        read[count..].fill(0);
        Ok(())
    }
}
