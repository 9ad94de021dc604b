use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use super::{MockBase, MockHandle};
use crate::config::{IoConfig, SerialConfig};
use crate::context::Context;
use crate::error::Result;
use crate::io::serial::{Serial, StreamState};
use crate::io::transfer::RawTransfer;
use crate::provider::SerialProvider;
use crate::tracing::prelude::*;

/// The far end of a simulated serial line.
#[derive(Debug, Default)]
pub struct MockPort {
    incoming: Mutex<VecDeque<u8>>,
    transmitted: Mutex<Vec<u8>>,
}

impl MockPort {
    /// Queue bytes for the handle to read.
    pub fn receive(&self, data: &[u8]) {
        self.incoming
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(data.iter().copied());
    }

    /// Everything the handle has written so far.
    pub fn transmitted(&self) -> Vec<u8> {
        self.transmitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Debug)]
pub struct MockSerial {
    base: MockHandle,
    config: SerialConfig,
    stream: StreamState,
    port: Arc<MockPort>,
}

impl MockSerial {
    fn teardown(&self) -> Result<()> {
        self.stream.close();
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        self.base.ensure_live()?;
        self.stream.ensure_open(self.base.id())
    }
}

mock_io!(MockSerial, Serial);

impl RawTransfer for MockSerial {
    fn write_bytes(&self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.port
            .transmitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
        Ok(())
    }

    fn read_bytes(&self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        let mut incoming = self
            .port
            .incoming
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let count = incoming.len().min(buf.len());
        for (slot, byte) in buf.iter_mut().zip(incoming.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }
}

impl Serial for MockSerial {
    fn config(&self) -> &SerialConfig {
        &self.config
    }

    fn open(&self) -> Result<()> {
        self.base.ensure_live()?;
        if self.stream.open() {
            debug!(id = self.base.id(), line = %self.config.line, "Mock serial opened");
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.stream.close() {
            debug!(id = self.base.id(), "Mock serial closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_open()
    }

    fn available(&self) -> Result<usize> {
        self.ensure_open()?;
        Ok(self
            .port
            .incoming
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len())
    }

    fn drain(&self) -> Result<()> {
        self.ensure_open()
    }
}

/// Provider of serial handles. Handles opened on the same device path share
/// one [`MockPort`].
pub struct MockSerialProvider {
    base: MockBase,
    ports: Mutex<HashMap<String, Arc<MockPort>>>,
}

impl MockSerialProvider {
    pub fn new() -> Self {
        Self {
            base: MockBase::new("mock-serial", "Mock Serial"),
            ports: Mutex::new(HashMap::new()),
        }
    }

    /// The simulated line at `device`, created on first use.
    pub fn port(&self, device: &str) -> Arc<MockPort> {
        Arc::clone(
            self.ports
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(device.to_string())
                .or_default(),
        )
    }
}

impl Default for MockSerialProvider {
    fn default() -> Self {
        Self::new()
    }
}

mock_provider!(MockSerialProvider);

impl SerialProvider for MockSerialProvider {
    /// Handles are returned open.
    fn create(&self, _ctx: &Context, config: SerialConfig) -> Result<Arc<dyn Serial>> {
        let serial = MockSerial {
            base: MockHandle::new(config.identity(), self.base.identity.id()),
            port: self.port(&config.device),
            config,
            stream: StreamState::new(),
        };
        serial.open()?;
        Ok(Arc::new(serial))
    }
}
