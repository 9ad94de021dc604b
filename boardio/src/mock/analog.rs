use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use super::{MockBase, MockHandle};
use crate::config::{AnalogInputConfig, AnalogOutputConfig, IoConfig};
use crate::context::Context;
use crate::error::Result;
use crate::io::analog::{AnalogInput, AnalogOutput, AnalogRange, AnalogValueChange};
use crate::io::digital::Listeners;
use crate::provider::{AnalogInputProvider, AnalogOutputProvider};

// Store `value` and notify listeners when it differs from the old one.
fn store(
    cell: &Mutex<i32>,
    listeners: &Listeners<AnalogValueChange>,
    source: &str,
    value: i32,
) {
    let previous = std::mem::replace(
        &mut *cell.lock().unwrap_or_else(PoisonError::into_inner),
        value,
    );
    if previous != value {
        listeners.dispatch(&AnalogValueChange {
            source: source.to_string(),
            value,
            previous,
        });
    }
}

/// Analog input whose reading is set from the host side.
#[derive(Debug)]
pub struct MockAnalogInput {
    base: MockHandle,
    config: AnalogInputConfig,
    value: Mutex<i32>,
    listeners: Listeners<AnalogValueChange>,
}

impl MockAnalogInput {
    /// Set the simulated reading, clamped to the configured range.
    pub fn simulate(&self, value: i32) {
        let value = self.config.range.clamp(value);
        store(&self.value, &self.listeners, self.base.id(), value);
    }

    fn teardown(&self) -> Result<()> {
        self.listeners.clear();
        Ok(())
    }
}

mock_io!(MockAnalogInput, AnalogInput);

impl AnalogInput for MockAnalogInput {
    fn value(&self) -> Result<i32> {
        self.base.ensure_live()?;
        Ok(*self.value.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn range(&self) -> AnalogRange {
        self.config.range
    }

    fn listeners(&self) -> &Listeners<AnalogValueChange> {
        &self.listeners
    }
}

pub struct MockAnalogInputProvider {
    base: MockBase,
    inputs: Mutex<HashMap<u32, Weak<MockAnalogInput>>>,
}

impl MockAnalogInputProvider {
    pub fn new() -> Self {
        Self {
            base: MockBase::new("mock-analog-input", "Mock Analog Input"),
            inputs: Mutex::new(HashMap::new()),
        }
    }

    pub fn input(&self, address: u32) -> Option<Arc<MockAnalogInput>> {
        self.inputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&address)
            .and_then(Weak::upgrade)
    }

    /// Set the reading at `address`; false when no input exists there.
    pub fn simulate(&self, address: u32, value: i32) -> bool {
        self.input(address)
            .map(|input| input.simulate(value))
            .is_some()
    }
}

impl Default for MockAnalogInputProvider {
    fn default() -> Self {
        Self::new()
    }
}

mock_provider!(MockAnalogInputProvider);

impl AnalogInputProvider for MockAnalogInputProvider {
    fn create(&self, _ctx: &Context, config: AnalogInputConfig) -> Result<Arc<dyn AnalogInput>> {
        let address = config.address;
        let input = Arc::new(MockAnalogInput {
            base: MockHandle::new(config.identity(), self.base.identity.id()),
            value: Mutex::new(config.range.min),
            config,
            listeners: Listeners::new(),
        });
        self.inputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address, Arc::downgrade(&input));
        Ok(input)
    }
}

/// Analog output holding its last written value.
#[derive(Debug)]
pub struct MockAnalogOutput {
    base: MockHandle,
    config: AnalogOutputConfig,
    value: Mutex<i32>,
    listeners: Listeners<AnalogValueChange>,
}

impl MockAnalogOutput {
    fn teardown(&self) -> Result<()> {
        if let Some(value) = self.config.shutdown {
            store(
                &self.value,
                &self.listeners,
                self.base.id(),
                self.config.range.clamp(value),
            );
        }
        self.listeners.clear();
        Ok(())
    }
}

mock_io!(MockAnalogOutput, AnalogOutput);

impl AnalogOutput for MockAnalogOutput {
    fn value(&self) -> Result<i32> {
        self.base.ensure_live()?;
        Ok(*self.value.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn set_value(&self, value: i32) -> Result<()> {
        self.base.ensure_live()?;
        let value = self.config.range.check(self.base.id(), value)?;
        store(&self.value, &self.listeners, self.base.id(), value);
        Ok(())
    }

    fn range(&self) -> AnalogRange {
        self.config.range
    }

    fn listeners(&self) -> &Listeners<AnalogValueChange> {
        &self.listeners
    }
}

pub struct MockAnalogOutputProvider {
    base: MockBase,
}

impl MockAnalogOutputProvider {
    pub fn new() -> Self {
        Self {
            base: MockBase::new("mock-analog-output", "Mock Analog Output"),
        }
    }
}

impl Default for MockAnalogOutputProvider {
    fn default() -> Self {
        Self::new()
    }
}

mock_provider!(MockAnalogOutputProvider);

impl AnalogOutputProvider for MockAnalogOutputProvider {
    fn create(&self, _ctx: &Context, config: AnalogOutputConfig) -> Result<Arc<dyn AnalogOutput>> {
        let initial = match config.initial {
            Some(value) => config.range.check(&config.base.id, value)?,
            None => config.range.min,
        };
        Ok(Arc::new(MockAnalogOutput {
            base: MockHandle::new(config.identity(), self.base.identity.id()),
            value: Mutex::new(initial),
            config,
            listeners: Listeners::new(),
        }))
    }
}
