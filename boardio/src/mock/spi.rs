use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::{MockBase, MockDevice, MockHandle};
use crate::config::{IoConfig, SpiConfig};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::io::spi::Spi;
use crate::io::transfer::{check_bounds, RawTransfer, RegisterTransfer};
use crate::provider::SpiProvider;

/// SPI handle backed by a shared [`MockDevice`]. Full-duplex transfers
/// loop the written bytes back.
#[derive(Debug)]
pub struct MockSpi {
    base: MockHandle,
    config: SpiConfig,
    device: Arc<MockDevice>,
}

impl MockSpi {
    fn live(&self) -> Result<&MockDevice> {
        self.base.ensure_live()?;
        Ok(&self.device)
    }

    fn teardown(&self) -> Result<()> {
        Ok(())
    }
}

mock_io!(MockSpi, Spi);

impl RawTransfer for MockSpi {
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

impl RegisterTransfer for MockSpi {
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

impl Spi for MockSpi {
    fn config(&self) -> &SpiConfig {
        &self.config
    }

    fn transfer(&self, write: &[u8], read: &mut [u8]) -> Result<()> {
        check_bounds(0, write.len(), read.len())?;
        self.live()?
            .transfer(write, read)
            .map_err(|e| Error::bus(self.base.id(), "transfer", e))
    }
}

/// Provider of SPI handles. Handles on the same bus and channel share one
/// [`MockDevice`].
pub struct MockSpiProvider {
    base: MockBase,
    devices: Mutex<HashMap<(u32, u32), Arc<MockDevice>>>,
}

impl MockSpiProvider {
    pub fn new() -> Self {
        Self {
            base: MockBase::new("mock-spi", "Mock SPI"),
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// The simulated device on `channel` of `bus`, created on first use.
    pub fn device(&self, bus: u32, channel: u32) -> Arc<MockDevice> {
        Arc::clone(
            self.devices
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry((bus, channel))
                .or_default(),
        )
    }
}

impl Default for MockSpiProvider {
    fn default() -> Self {
        Self::new()
    }
}

mock_provider!(MockSpiProvider);

impl SpiProvider for MockSpiProvider {
    fn create(&self, _ctx: &Context, config: SpiConfig) -> Result<Arc<dyn Spi>> {
        Ok(Arc::new(MockSpi {
            base: MockHandle::new(config.identity(), self.base.identity.id()),
            device: self.device(config.bus, config.channel),
            config,
        }))
    }
}
