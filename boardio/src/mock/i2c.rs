use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::{MockBase, MockDevice, MockHandle};
use crate::config::{I2cConfig, IoConfig};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::io::i2c::I2c;
use crate::io::transfer::{RawTransfer, RegisterTransfer};
use crate::provider::I2cProvider;

/// I2C handle backed by a shared [`MockDevice`].
#[derive(Debug)]
pub struct MockI2c {
    base: MockHandle,
    config: I2cConfig,
    device: Arc<MockDevice>,
}

impl MockI2c {
    fn live(&self) -> Result<&MockDevice> {
        self.base.ensure_live()?;
        Ok(&self.device)
    }

    fn teardown(&self) -> Result<()> {
        Ok(())
    }
}

mock_io!(MockI2c, I2c);

impl RawTransfer for MockI2c {
    fn write_bytes(&self, data: &[u8]) -> Result<()> {
        self.live()?
            .write(data)
            .map_err(|e| Error::bus(self.base.id(), "write", e))
    }

    fn read_bytes(&self, buf: &mut [u8]) -> Result<usize> {
        self.live()?
            .read(buf)
            .map_err(|e| Error::bus(self.base.id(), "read", e))
    }
}

impl RegisterTransfer for MockI2c {
    fn write_register_bytes(&self, register: u8, data: &[u8]) -> Result<()> {
        self.live()?
            .write_register(register, data)
            .map_err(|e| Error::bus(self.base.id(), "write register", e))
    }

    fn read_register_bytes(&self, register: u8, buf: &mut [u8]) -> Result<usize> {
        self.live()?
            .read_register(register, buf)
            .map_err(|e| Error::bus(self.base.id(), "read register", e))
    }
}

impl I2c for MockI2c {
    fn config(&self) -> &I2cConfig {
        &self.config
    }

    // The first written byte selects the register; any further bytes are
    // stored there before the read.
    fn write_read(&self, write: &[u8], read: &mut [u8]) -> Result<usize> {
        match write.split_first() {
            None => self.read_bytes(read),
            Some((&register, payload)) => {
                if !payload.is_empty() {
                    self.write_register_bytes(register, payload)?;
                }
                self.read_register_bytes(register, read)
            }
        }
    }

    fn process_call(&self, register: u8, value: u16) -> Result<u16> {
        self.live()?
            .process_call(register, value)
            .map_err(|e| Error::bus(self.base.id(), "process call", e))
    }

    fn block_process_call_unchecked(&self, register: u8, data: &[u8]) -> Result<Vec<u8>> {
        self.live()?
            .block_process_call(register, data)
            .map_err(|e| Error::bus(self.base.id(), "block process call", e))
    }
}

/// Provider of I2C handles. Handles opened on the same bus and address
/// share one [`MockDevice`].
pub struct MockI2cProvider {
    base: MockBase,
    devices: Mutex<HashMap<(u32, u16), Arc<MockDevice>>>,
}

impl MockI2cProvider {
    pub fn new() -> Self {
        Self {
            base: MockBase::new("mock-i2c", "Mock I2C"),
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// The simulated device at `address` on `bus`, created on first use.
    pub fn device(&self, bus: u32, address: u16) -> Arc<MockDevice> {
        Arc::clone(
            self.devices
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry((bus, address))
                .or_default(),
        )
    }
}

impl Default for MockI2cProvider {
    fn default() -> Self {
        Self::new()
    }
}

mock_provider!(MockI2cProvider);

impl I2cProvider for MockI2cProvider {
    fn create(&self, _ctx: &Context, config: I2cConfig) -> Result<Arc<dyn I2c>> {
        Ok(Arc::new(MockI2c {
            base: MockHandle::new(config.identity(), self.base.identity.id()),
            device: self.device(config.bus, config.device),
            config,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BusError;
    use crate::io::transfer::{Charset, RetryPolicy};
    use crate::io::{kind, Io};
    use crate::ContextBuilder;
    use bytes::Buf;
    use rand::Rng;
    use std::time::Duration;

    fn open(id: &str, bus: u32, device: u16) -> (Context, Arc<MockI2cProvider>, Arc<dyn I2c>) {
        let provider = Arc::new(MockI2cProvider::new());
        let ctx = ContextBuilder::new()
            .add_provider(provider.clone().into_provider())
            .build()
            .unwrap();
        let config = I2cConfig::builder()
            .id(id)
            .bus(bus)
            .device(device)
            .build()
            .unwrap();
        let i2c = ctx.create::<kind::I2c>(config).unwrap();
        (ctx, provider, i2c)
    }

    fn fast_retries() -> RetryPolicy {
        RetryPolicy::new(
            3,
            vec![Duration::ZERO, Duration::from_millis(1), Duration::from_millis(2)],
        )
    }

    #[test]
    fn test_word_round_trip() {
        let (_ctx, provider, i2c) = open("i2c-4", 1, 0x04);
        let register = i2c.register(5);
        register.write_word(0xBEEF).unwrap();
        assert_eq!(register.read_word().unwrap(), 0xBEEF);
        assert_eq!(provider.device(1, 0x04).peek(5).unwrap(), vec![0xEF, 0xBE]);
        assert_eq!(i2c.bus(), 1);
        assert_eq!(i2c.device(), 0x04);
    }

    #[test]
    fn test_process_call_echoes() {
        let (_ctx, _provider, i2c) = open("i2c-4", 1, 0x04);
        for value in [0x0000, 0x1234, 0xBEEF, 0xFFFF] {
            assert_eq!(i2c.register(7).process_call(value).unwrap(), value);
        }
        let data = [1u8, 2, 3, 4, 5];
        assert_eq!(i2c.register(8).block_process_call(&data).unwrap(), data);
    }

    #[test]
    fn test_byte_and_string_round_trip() {
        let (_ctx, _provider, i2c) = open("i2c-4", 1, 0x04);
        i2c.write_register_byte(1, 0x5A).unwrap();
        assert_eq!(i2c.read_register_byte(1).unwrap(), 0x5A);

        i2c.write_register_str(2, "boardio", Charset::Ascii).unwrap();
        assert_eq!(
            i2c.read_register_string(2, 7, Charset::Ascii).unwrap(),
            "boardio"
        );

        let mut window = [0xEEu8; 6];
        i2c.write_register_bytes(3, &[9, 8]).unwrap();
        i2c.read_register_into(3, &mut window, 2, 2).unwrap();
        assert_eq!(window, [0xEE, 0xEE, 9, 8, 0xEE, 0xEE]);
    }

    #[test]
    fn test_block_verify_survives_one_glitch() {
        let (_ctx, provider, i2c) = open("i2c-4", 1, 0x04);
        let mut rng = rand::thread_rng();
        let block: Vec<u8> = (0..20).map(|_| rng.gen()).collect();

        let register = i2c.register(10);
        register.write_block(&block).unwrap();

        let device = provider.device(1, 0x04);
        device.glitch_reads(1);
        let before = device.register_reads();
        assert_eq!(register.verify_block(&block, &fast_retries()).unwrap(), block);
        assert_eq!(device.register_reads() - before, 2);
    }

    #[test]
    fn test_block_verify_reports_mismatch_past_budget() {
        let (_ctx, provider, i2c) = open("i2c-4", 1, 0x04);
        let block = vec![0x11u8; 20];
        let register = i2c.register(10);
        register.write_block(&block).unwrap();

        provider.device(1, 0x04).glitch_reads(3);
        let err = register.verify_block(&block, &fast_retries()).unwrap_err();
        assert!(matches!(
            err,
            Error::DataMismatch {
                register: Some(10),
                attempts: 3,
                ..
            }
        ));
    }

    #[test]
    fn test_transient_bus_error_is_retried() {
        let (_ctx, provider, i2c) = open("i2c-4", 1, 0x04);
        let register = i2c.register(6);
        register.write_word(0x0102).unwrap();

        provider.device(1, 0x04).fail_next(BusError::NoAck(0x04));
        assert_eq!(register.verify_word(0x0102, &fast_retries()).unwrap(), 0x0102);

        provider.device(1, 0x04).fail_next(BusError::CommandRejected(6));
        let err = register.verify_word(0x0102, &fast_retries()).unwrap_err();
        assert!(matches!(err, Error::Bus { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_block_too_long_never_reaches_bus() {
        let (_ctx, provider, i2c) = open("i2c-4", 1, 0x04);
        let err = i2c.register(11).write_block(&[0u8; 33]).unwrap_err();
        assert!(matches!(err, Error::OutOfBounds { .. }));
        assert!(provider.device(1, 0x04).peek(11).is_none());
    }

    #[test]
    fn test_failed_buffer_write_keeps_position() {
        let (_ctx, provider, i2c) = open("i2c-4", 1, 0x04);
        let device = provider.device(1, 0x04);

        let mut split = (&[1u8, 2][..]).chain(&[3u8, 4, 5][..]);
        device.fail_next(BusError::NoAck(0x04));
        assert!(i2c.write_register_buf(6, &mut split, 4).is_err());
        assert_eq!(split.remaining(), 5);
        assert!(device.peek(6).is_none());

        i2c.write_register_buf(6, &mut split, 4).unwrap();
        assert_eq!(split.remaining(), 1);
        assert_eq!(device.peek(6).unwrap(), vec![1, 2, 3, 4]);

        let mut raw = (&[8u8][..]).chain(&[9u8][..]);
        device.fail_next(BusError::Timeout);
        assert!(i2c.write_buf(&mut raw, 2).is_err());
        assert_eq!(raw.remaining(), 2);
        i2c.write_buf(&mut raw, 2).unwrap();
        assert_eq!(raw.remaining(), 0);
        assert_eq!(device.pending(), 2);
    }

    #[test]
    fn test_block_process_call_limited_to_smbus_block() {
        let (_ctx, provider, i2c) = open("i2c-4", 1, 0x04);
        let err = i2c.block_process_call(3, &[7u8; 40]).unwrap_err();
        assert!(matches!(
            err,
            Error::OutOfBounds {
                length: 40,
                capacity: 32,
                ..
            }
        ));
        assert!(provider.device(1, 0x04).peek(3).is_none());

        let full = [7u8; 32];
        assert_eq!(i2c.register(3).block_process_call(&full).unwrap(), full);
    }

    #[test]
    fn test_write_read_selects_register() {
        let (_ctx, _provider, i2c) = open("i2c-4", 1, 0x04);
        let mut buf = [0u8; 2];
        assert_eq!(i2c.write_read(&[4, 0xAB, 0xCD], &mut buf).unwrap(), 2);
        assert_eq!(buf, [0xAB, 0xCD]);

        i2c.write_bytes(&[1, 2, 3]).unwrap();
        let mut raw = [0u8; 3];
        assert_eq!(i2c.write_read(&[], &mut raw).unwrap(), 3);
        assert_eq!(raw, [1, 2, 3]);
        assert!(i2c.read_byte().is_err());
    }

    #[test]
    fn test_closed_after_shutdown() {
        let (ctx, _provider, i2c) = open("i2c-4", 1, 0x04);
        ctx.registry().remove("i2c-4").unwrap();
        assert!(i2c.is_shutdown());
        assert!(matches!(
            i2c.read_register_byte(0),
            Err(Error::Closed { .. })
        ));
    }
}
