//! Raw and register-addressed transfers for bus devices.
//!
//! Backends implement two primitives per domain, [`RawTransfer::write_bytes`]
//! / [`RawTransfer::read_bytes`] for whole-device transfers and
//! [`RegisterTransfer::write_register_bytes`] /
//! [`RegisterTransfer::read_register_bytes`] for transfers prefixed by a
//! register address. Every width variant (byte, little-endian word, slice,
//! SMBus block, buffer, string) is provided on top of them and may be
//! overridden where the bus has a native transaction for it.
//!
//! Offset and length arguments are checked before any bytes reach the bus,
//! so a bounds error never leaves a partial transfer behind.

use std::io::IoSlice;
use std::thread;
use std::time::Duration;

use bytes::{Buf, BufMut};

use super::Io;
use crate::error::{BusError, Error, Result};
use crate::tracing::prelude::*;

/// Largest payload of an SMBus block transfer.
pub const SMBUS_BLOCK_MAX: usize = 32;

/// Character encoding used by string transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum::Display)]
pub enum Charset {
    #[default]
    #[strum(serialize = "US-ASCII")]
    Ascii,
    #[strum(serialize = "ISO-8859-1")]
    Latin1,
    #[strum(serialize = "UTF-8")]
    Utf8,
}

impl Charset {
    pub fn encode(self, text: &str) -> Result<Vec<u8>> {
        match self {
            Charset::Utf8 => Ok(text.as_bytes().to_vec()),
            Charset::Ascii if text.is_ascii() => Ok(text.as_bytes().to_vec()),
            Charset::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).map_err(|_| self.error()))
                .collect(),
            Charset::Ascii => Err(self.error()),
        }
    }

    pub fn decode(self, bytes: &[u8]) -> Result<String> {
        match self {
            Charset::Ascii if bytes.is_ascii() => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
            Charset::Ascii => Err(self.error()),
            Charset::Latin1 => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
            Charset::Utf8 => String::from_utf8(bytes.to_vec()).map_err(|_| self.error()),
        }
    }

    fn error(self) -> Error {
        Error::Encoding {
            charset: self.to_string(),
        }
    }
}

/// Fail with [`Error::OutOfBounds`] unless `offset..offset + length` lies
/// within `capacity`.
pub fn check_bounds(offset: usize, length: usize, capacity: usize) -> Result<()> {
    match offset.checked_add(length) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(Error::OutOfBounds {
            offset,
            length,
            capacity,
        }),
    }
}

pub(crate) fn check_block_length(length: usize) -> Result<()> {
    check_bounds(0, length, SMBUS_BLOCK_MAX)
}

// Most chunks a buffer is asked to expose when gathering a write.
const GATHER_CHUNKS: usize = 64;

// Copy the first `length` bytes of `buf` without consuming them. None when
// the buffer does not expose that many bytes through its chunks.
fn gather(buf: &dyn Buf, length: usize) -> Option<Vec<u8>> {
    let mut slices = [IoSlice::new(&[]); GATHER_CHUNKS];
    let count = buf.chunks_vectored(&mut slices);
    let mut data = Vec::with_capacity(length);
    for slice in &slices[..count] {
        let take = (length - data.len()).min(slice.len());
        data.extend_from_slice(&slice[..take]);
        if data.len() == length {
            return Some(data);
        }
    }
    None
}

// Hand `length` bytes of `buf` to `write`, advancing `buf` only once the
// write succeeded. A buffer that hides its chunks is drained up front.
fn write_from_buf(
    buf: &mut dyn Buf,
    length: usize,
    write: impl FnOnce(&[u8]) -> Result<()>,
) -> Result<()> {
    check_bounds(0, length, buf.remaining())?;
    if buf.chunk().len() >= length {
        write(&buf.chunk()[..length])?;
    } else if let Some(data) = gather(&*buf, length) {
        write(&data)?;
    } else {
        let mut data = vec![0u8; length];
        buf.copy_to_slice(&mut data);
        return write(&data);
    }
    buf.advance(length);
    Ok(())
}

fn short_read(id: &str, operation: &'static str, expected: usize, actual: usize) -> Error {
    Error::bus(id, operation, BusError::ShortRead { expected, actual })
}

/// Transfers addressed to the device as a whole.
pub trait RawTransfer: Io {
    fn write_bytes(&self, data: &[u8]) -> Result<()>;

    /// Read up to `buf.len()` bytes; returns how many arrived.
    fn read_bytes(&self, buf: &mut [u8]) -> Result<usize>;

    fn write_byte(&self, value: u8) -> Result<()> {
        self.write_bytes(&[value])
    }

    /// Write a 16-bit word, low byte first.
    fn write_word(&self, value: u16) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    fn write_slice(&self, data: &[u8], offset: usize, length: usize) -> Result<()> {
        check_bounds(offset, length, data.len())?;
        self.write_bytes(&data[offset..offset + length])
    }

    /// Write `length` bytes taken from `buf`, advancing it by `length` on
    /// success.
    fn write_buf(&self, buf: &mut dyn Buf, length: usize) -> Result<()> {
        write_from_buf(buf, length, |data| self.write_bytes(data))
    }

    fn write_str(&self, text: &str, charset: Charset) -> Result<()> {
        self.write_bytes(&charset.encode(text)?)
    }

    /// Fill `buf` completely or fail with a short read.
    fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        let actual = self.read_bytes(buf)?;
        if actual != buf.len() {
            return Err(short_read(self.id(), "read", buf.len(), actual));
        }
        Ok(())
    }

    fn read_byte(&self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_word(&self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Read exactly `length` bytes into `buf[offset..offset + length]`.
    fn read_into(&self, buf: &mut [u8], offset: usize, length: usize) -> Result<()> {
        check_bounds(offset, length, buf.len())?;
        self.read_exact(&mut buf[offset..offset + length])
    }

    fn read_vec(&self, length: usize) -> Result<Vec<u8>> {
        let mut data = vec![0u8; length];
        self.read_exact(&mut data)?;
        Ok(data)
    }

    /// Read `length` bytes and append them to `buf`.
    fn read_buf(&self, buf: &mut dyn BufMut, length: usize) -> Result<()> {
        check_bounds(0, length, buf.remaining_mut())?;
        let data = self.read_vec(length)?;
        buf.put_slice(&data);
        Ok(())
    }

    fn read_string(&self, length: usize, charset: Charset) -> Result<String> {
        charset.decode(&self.read_vec(length)?)
    }
}

/// Transfers prefixed by a register address.
pub trait RegisterTransfer: Io {
    fn write_register_bytes(&self, register: u8, data: &[u8]) -> Result<()>;

    /// Select `register` and read up to `buf.len()` bytes from it.
    fn read_register_bytes(&self, register: u8, buf: &mut [u8]) -> Result<usize>;

    fn write_register_byte(&self, register: u8, value: u8) -> Result<()> {
        self.write_register_bytes(register, &[value])
    }

    fn write_register_word(&self, register: u8, value: u16) -> Result<()> {
        self.write_register_bytes(register, &value.to_le_bytes())
    }

    fn write_register_slice(
        &self,
        register: u8,
        data: &[u8],
        offset: usize,
        length: usize,
    ) -> Result<()> {
        check_bounds(offset, length, data.len())?;
        self.write_register_bytes(register, &data[offset..offset + length])
    }

    fn write_register_buf(&self, register: u8, buf: &mut dyn Buf, length: usize) -> Result<()> {
        write_from_buf(buf, length, |data| self.write_register_bytes(register, data))
    }

    fn write_register_str(&self, register: u8, text: &str, charset: Charset) -> Result<()> {
        self.write_register_bytes(register, &charset.encode(text)?)
    }

    /// SMBus block write: the length byte followed by at most 32 bytes.
    fn write_register_block(&self, register: u8, data: &[u8]) -> Result<()> {
        check_block_length(data.len())?;
        let mut framed = Vec::with_capacity(data.len() + 1);
        framed.push(data.len() as u8);
        framed.extend_from_slice(data);
        self.write_register_bytes(register, &framed)
    }

    fn read_register_exact(&self, register: u8, buf: &mut [u8]) -> Result<()> {
        let actual = self.read_register_bytes(register, buf)?;
        if actual != buf.len() {
            return Err(short_read(self.id(), "read register", buf.len(), actual));
        }
        Ok(())
    }

    fn read_register_byte(&self, register: u8) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_register_exact(register, &mut buf)?;
        Ok(buf[0])
    }

    fn read_register_word(&self, register: u8) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_register_exact(register, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_register_into(
        &self,
        register: u8,
        buf: &mut [u8],
        offset: usize,
        length: usize,
    ) -> Result<()> {
        check_bounds(offset, length, buf.len())?;
        self.read_register_exact(register, &mut buf[offset..offset + length])
    }

    fn read_register_vec(&self, register: u8, length: usize) -> Result<Vec<u8>> {
        let mut data = vec![0u8; length];
        self.read_register_exact(register, &mut data)?;
        Ok(data)
    }

    fn read_register_buf(&self, register: u8, buf: &mut dyn BufMut, length: usize) -> Result<()> {
        check_bounds(0, length, buf.remaining_mut())?;
        let data = self.read_register_vec(register, length)?;
        buf.put_slice(&data);
        Ok(())
    }

    fn read_register_string(&self, register: u8, length: usize, charset: Charset) -> Result<String> {
        charset.decode(&self.read_register_vec(register, length)?)
    }

    /// SMBus block read: the device reports the payload length in the first
    /// byte.
    fn read_register_block(&self, register: u8) -> Result<Vec<u8>> {
        let mut buf = [0u8; SMBUS_BLOCK_MAX + 1];
        let actual = self.read_register_bytes(register, &mut buf)?;
        if actual == 0 {
            return Err(short_read(self.id(), "read block", 1, 0));
        }
        let count = usize::from(buf[0]);
        if count > SMBUS_BLOCK_MAX {
            return Err(Error::bus(self.id(), "read block", BusError::BlockLength(count)));
        }
        if actual < count + 1 {
            return Err(short_read(self.id(), "read block", count + 1, actual));
        }
        Ok(buf[1..=count].to_vec())
    }
}

/// A register address on an open device.
///
/// Borrowing the device keeps the register valid only while the handle is.
#[derive(Debug)]
pub struct Register<'a, D: RegisterTransfer + ?Sized> {
    device: &'a D,
    address: u8,
}

impl<D: RegisterTransfer + ?Sized> Clone for Register<'_, D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D: RegisterTransfer + ?Sized> Copy for Register<'_, D> {}

impl<'a, D: RegisterTransfer + ?Sized> Register<'a, D> {
    pub fn new(device: &'a D, address: u8) -> Self {
        Self { device, address }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn device(&self) -> &'a D {
        self.device
    }

    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.device.write_register_bytes(self.address, data)
    }

    pub fn write_byte(&self, value: u8) -> Result<()> {
        self.device.write_register_byte(self.address, value)
    }

    pub fn write_word(&self, value: u16) -> Result<()> {
        self.device.write_register_word(self.address, value)
    }

    pub fn write_slice(&self, data: &[u8], offset: usize, length: usize) -> Result<()> {
        self.device
            .write_register_slice(self.address, data, offset, length)
    }

    pub fn write_buf(&self, buf: &mut dyn Buf, length: usize) -> Result<()> {
        self.device.write_register_buf(self.address, buf, length)
    }

    pub fn write_str(&self, text: &str, charset: Charset) -> Result<()> {
        self.device.write_register_str(self.address, text, charset)
    }

    pub fn write_block(&self, data: &[u8]) -> Result<()> {
        self.device.write_register_block(self.address, data)
    }

    pub fn read_byte(&self) -> Result<u8> {
        self.device.read_register_byte(self.address)
    }

    pub fn read_word(&self) -> Result<u16> {
        self.device.read_register_word(self.address)
    }

    pub fn read_into(&self, buf: &mut [u8], offset: usize, length: usize) -> Result<()> {
        self.device
            .read_register_into(self.address, buf, offset, length)
    }

    pub fn read_vec(&self, length: usize) -> Result<Vec<u8>> {
        self.device.read_register_vec(self.address, length)
    }

    pub fn read_buf(&self, buf: &mut dyn BufMut, length: usize) -> Result<()> {
        self.device.read_register_buf(self.address, buf, length)
    }

    pub fn read_string(&self, length: usize, charset: Charset) -> Result<String> {
        self.device
            .read_register_string(self.address, length, charset)
    }

    pub fn read_block(&self) -> Result<Vec<u8>> {
        self.device.read_register_block(self.address)
    }

    /// Read the word back until it equals `expected`.
    pub fn verify_word(&self, expected: u16, policy: &RetryPolicy) -> Result<u16> {
        verify(policy, self.device.id(), Some(self.address), &expected, || {
            self.read_word()
        })
    }

    /// Read the block back until it equals `expected`.
    pub fn verify_block(&self, expected: &[u8], policy: &RetryPolicy) -> Result<Vec<u8>> {
        let expected = expected.to_vec();
        verify(policy, self.device.id(), Some(self.address), &expected, || {
            self.read_block()
        })
    }
}

/// Backoff schedule for read-back verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: usize,
    delays: Vec<Duration>,
}

impl RetryPolicy {
    /// `delays[n]` is slept before attempt `n`; attempts past the end of the
    /// schedule reuse its last entry.
    pub fn new(attempts: usize, delays: Vec<Duration>) -> Self {
        Self {
            attempts: attempts.max(1),
            delays,
        }
    }

    /// A single attempt with no delay.
    pub fn once() -> Self {
        Self::new(1, Vec::new())
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn delay_before(&self, attempt: usize) -> Duration {
        self.delays
            .get(attempt)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            3,
            vec![
                Duration::ZERO,
                Duration::from_millis(10),
                Duration::from_millis(100),
            ],
        )
    }
}

/// Call `read` until it yields `expected`, following `policy`.
///
/// Mismatches and transient bus errors consume an attempt; any other error is
/// returned immediately. Running out of attempts is a
/// [`Error::DataMismatch`].
pub fn verify<T, F>(
    policy: &RetryPolicy,
    id: &str,
    register: Option<u8>,
    expected: &T,
    mut read: F,
) -> Result<T>
where
    T: PartialEq,
    F: FnMut() -> Result<T>,
{
    for attempt in 0..policy.attempts() {
        let delay = policy.delay_before(attempt);
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        match read() {
            Ok(value) if value == *expected => return Ok(value),
            Ok(_) => {
                debug!(id, attempt = attempt + 1, "Read back mismatched");
            }
            Err(e) if e.is_retryable() => {
                debug!(id, attempt = attempt + 1, error = %e, "Read back failed");
            }
            Err(e) => return Err(e),
        }
    }

    Err(Error::DataMismatch {
        id: id.to_string(),
        register,
        attempts: policy.attempts(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::io::IoType;
    use crate::Context;
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    // Minimal in-memory device; register reads return what was last written
    // and raw reads drain what was raw-written.
    struct Scratch {
        identity: Identity,
        registers: Mutex<[u8; 256]>,
        fifo: Mutex<VecDeque<u8>>,
    }

    impl Scratch {
        fn new() -> Self {
            Self {
                identity: Identity::new("scratch", "scratch", ""),
                registers: Mutex::new([0; 256]),
                fifo: Mutex::new(VecDeque::new()),
            }
        }
    }

    impl Io for Scratch {
        fn identity(&self) -> &Identity {
            &self.identity
        }
        fn io_type(&self) -> IoType {
            IoType::I2c
        }
        fn provider_id(&self) -> &str {
            "scratch"
        }
        fn shutdown(&self, _ctx: &Context) -> Result<()> {
            Ok(())
        }
        fn is_shutdown(&self) -> bool {
            false
        }
    }

    impl RawTransfer for Scratch {
        fn write_bytes(&self, data: &[u8]) -> Result<()> {
            self.fifo.lock().unwrap().extend(data);
            Ok(())
        }
        fn read_bytes(&self, buf: &mut [u8]) -> Result<usize> {
            let mut fifo = self.fifo.lock().unwrap();
            let n = buf.len().min(fifo.len());
            for slot in buf.iter_mut().take(n) {
                *slot = fifo.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl RegisterTransfer for Scratch {
        fn write_register_bytes(&self, register: u8, data: &[u8]) -> Result<()> {
            let mut regs = self.registers.lock().unwrap();
            for (i, b) in data.iter().enumerate() {
                regs[(usize::from(register) + i) % 256] = *b;
            }
            Ok(())
        }
        fn read_register_bytes(&self, register: u8, buf: &mut [u8]) -> Result<usize> {
            let regs = self.registers.lock().unwrap();
            for (i, slot) in buf.iter_mut().enumerate() {
                *slot = regs[(usize::from(register) + i) % 256];
            }
            Ok(buf.len())
        }
    }

    #[test]
    fn test_word_is_little_endian() {
        let dev = Scratch::new();
        dev.write_register_word(5, 0xBEEF).unwrap();
        assert_eq!(dev.read_register_vec(5, 2).unwrap(), vec![0xEF, 0xBE]);
        assert_eq!(dev.read_register_word(5).unwrap(), 0xBEEF);
    }

    #[test]
    fn test_bounds_checked_before_transfer() {
        let dev = Scratch::new();
        let data = [1u8, 2, 3, 4];
        let err = dev.write_register_slice(0, &data, 2, 3).unwrap_err();
        assert!(matches!(
            err,
            Error::OutOfBounds {
                offset: 2,
                length: 3,
                capacity: 4
            }
        ));
        assert!(!err.is_retryable());
        assert_eq!(dev.read_register_byte(0).unwrap(), 0);

        let err = dev.write_register_block(0, &[0u8; 33]).unwrap_err();
        assert!(matches!(err, Error::OutOfBounds { capacity: 32, .. }));
    }

    #[test]
    fn test_read_into_window_leaves_rest_untouched() {
        let dev = Scratch::new();
        dev.write_register_bytes(8, &[0xAA, 0xBB]).unwrap();

        let mut buf = [0x11u8; 6];
        dev.read_register_into(8, &mut buf, 2, 2).unwrap();
        assert_eq!(buf, [0x11, 0x11, 0xAA, 0xBB, 0x11, 0x11]);
    }

    #[test]
    fn test_buffer_positions_advance_by_length() {
        let dev = Scratch::new();

        let mut source: &[u8] = &[1, 2, 3, 4, 5];
        dev.write_register_buf(0, &mut source, 3).unwrap();
        assert_eq!(source, &[4, 5]);

        let mut sink = Vec::<u8>::new();
        dev.read_register_buf(0, &mut sink, 3).unwrap();
        assert_eq!(sink, vec![1, 2, 3]);

        let mut small: &[u8] = &[9];
        assert!(matches!(
            dev.write_register_buf(0, &mut small, 2),
            Err(Error::OutOfBounds { .. })
        ));
        assert_eq!(small, &[9]);
    }

    #[test]
    fn test_block_and_string_round_trip() {
        let dev = Scratch::new();
        let reg = Register::new(&dev, 10);

        reg.write_block(b"hello block").unwrap();
        assert_eq!(reg.read_block().unwrap(), b"hello block".to_vec());

        reg.write_str("café", Charset::Latin1).unwrap();
        assert_eq!(reg.read_string(4, Charset::Latin1).unwrap(), "café");
        assert!(matches!(
            reg.write_str("café", Charset::Ascii),
            Err(Error::Encoding { .. })
        ));
    }

    #[test]
    fn test_raw_read_short() {
        let dev = Scratch::new();
        dev.write_bytes(&[7]).unwrap();
        let err = dev.read_word().unwrap_err();
        assert!(matches!(
            err,
            Error::Bus {
                source: BusError::ShortRead {
                    expected: 2,
                    actual: 1
                },
                ..
            }
        ));
    }

    #[test]
    fn test_verify_retries_then_matches() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::new(3, vec![Duration::ZERO, Duration::from_millis(1)]);
        let value = verify(&policy, "dev", Some(1), &42u16, || {
            calls.set(calls.get() + 1);
            Ok(if calls.get() < 3 { 0 } else { 42 })
        })
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_verify_exhausts_budget() {
        let calls = Cell::new(0);
        let err = verify(&RetryPolicy::default(), "dev", Some(10), &1u8, || {
            calls.set(calls.get() + 1);
            Ok(0u8)
        })
        .unwrap_err();
        assert!(matches!(
            err,
            Error::DataMismatch {
                attempts: 3,
                register: Some(10),
                ..
            }
        ));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_verify_stops_on_hard_error() {
        let calls = Cell::new(0);
        let err = verify(&RetryPolicy::default(), "dev", None, &1u8, || {
            calls.set(calls.get() + 1);
            Err(Error::bus("dev", "read", BusError::CommandRejected(1)))
        })
        .unwrap_err();
        assert!(matches!(err, Error::Bus { .. }));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_default_policy_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts(), 3);
        assert_eq!(policy.delay_before(0), Duration::ZERO);
        assert_eq!(policy.delay_before(1), Duration::from_millis(10));
        assert_eq!(policy.delay_before(2), Duration::from_millis(100));
        assert_eq!(policy.delay_before(7), Duration::from_millis(100));
    }
}
