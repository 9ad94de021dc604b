use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use super::{MockBase, MockHandle};
use crate::config::{DigitalInputConfig, DigitalOutputConfig, IoConfig};
use crate::context::Context;
use crate::error::Result;
use crate::io::digital::{
    DigitalInput, DigitalOutput, DigitalState, DigitalStateChange, Listeners, PullResistance,
};
use crate::provider::{DigitalInputProvider, DigitalOutputProvider};
use crate::tracing::prelude::*;

/// Digital input whose level is set from the host side.
#[derive(Debug)]
pub struct MockDigitalInput {
    base: MockHandle,
    config: DigitalInputConfig,
    state: Mutex<DigitalState>,
    listeners: Listeners<DigitalStateChange>,
}

impl MockDigitalInput {
    fn new(config: DigitalInputConfig, provider_id: &str) -> Self {
        // Pulled-up lines idle high.
        let idle = DigitalState::from(config.pull == PullResistance::PullUp);
        Self {
            base: MockHandle::new(config.identity(), provider_id),
            config,
            state: Mutex::new(idle),
            listeners: Listeners::new(),
        }
    }

    pub fn address(&self) -> u32 {
        self.config.address
    }

    /// Drive the simulated line; listeners hear about actual changes.
    pub fn simulate(&self, state: DigitalState) {
        let previous = std::mem::replace(
            &mut *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            state,
        );
        if previous != state {
            self.listeners.dispatch(&DigitalStateChange {
                source: self.base.id().to_string(),
                state,
            });
        }
    }

    fn teardown(&self) -> Result<()> {
        self.listeners.clear();
        Ok(())
    }
}

mock_io!(MockDigitalInput, DigitalInput);

impl DigitalInput for MockDigitalInput {
    fn state(&self) -> Result<DigitalState> {
        self.base.ensure_live()?;
        Ok(*self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn pull(&self) -> PullResistance {
        self.config.pull
    }

    fn listeners(&self) -> &Listeners<DigitalStateChange> {
        &self.listeners
    }
}

pub struct MockDigitalInputProvider {
    base: MockBase,
    inputs: Mutex<HashMap<u32, Weak<MockDigitalInput>>>,
}

impl MockDigitalInputProvider {
    pub fn new() -> Self {
        Self {
            base: MockBase::new("mock-digital-input", "Mock Digital Input"),
            inputs: Mutex::new(HashMap::new()),
        }
    }

    /// The live input at `address`, if one was created.
    pub fn input(&self, address: u32) -> Option<Arc<MockDigitalInput>> {
        self.inputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&address)
            .and_then(Weak::upgrade)
    }

    /// Drive the line at `address`; false when no input exists there.
    pub fn simulate(&self, address: u32, state: DigitalState) -> bool {
        match self.input(address) {
            Some(input) => {
                input.simulate(state);
                true
            }
            None => false,
        }
    }
}

impl Default for MockDigitalInputProvider {
    fn default() -> Self {
        Self::new()
    }
}

mock_provider!(MockDigitalInputProvider);

impl DigitalInputProvider for MockDigitalInputProvider {
    fn create(&self, _ctx: &Context, config: DigitalInputConfig) -> Result<Arc<dyn DigitalInput>> {
        let address = config.address;
        let input = Arc::new(MockDigitalInput::new(config, self.base.identity.id()));
        self.inputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address, Arc::downgrade(&input));
        trace!(id = input.base.id(), address, "Mock digital input created");
        Ok(input)
    }
}

/// Digital output that remembers the level it was driven to.
#[derive(Debug)]
pub struct MockDigitalOutput {
    base: MockHandle,
    config: DigitalOutputConfig,
    state: Mutex<DigitalState>,
    listeners: Listeners<DigitalStateChange>,
}

impl MockDigitalOutput {
    fn new(config: DigitalOutputConfig, provider_id: &str) -> Self {
        let initial = config.initial.unwrap_or(DigitalState::Low);
        Self {
            base: MockHandle::new(config.identity(), provider_id),
            config,
            state: Mutex::new(initial),
            listeners: Listeners::new(),
        }
    }

    pub fn address(&self) -> u32 {
        self.config.address
    }

    fn drive(&self, state: DigitalState) {
        let previous = std::mem::replace(
            &mut *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            state,
        );
        if previous != state {
            self.listeners.dispatch(&DigitalStateChange {
                source: self.base.id().to_string(),
                state,
            });
        }
    }

    fn teardown(&self) -> Result<()> {
        if let Some(state) = self.config.shutdown {
            self.drive(state);
        }
        self.listeners.clear();
        Ok(())
    }
}

mock_io!(MockDigitalOutput, DigitalOutput);

impl DigitalOutput for MockDigitalOutput {
    fn state(&self) -> Result<DigitalState> {
        self.base.ensure_live()?;
        Ok(*self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn set_state(&self, state: DigitalState) -> Result<()> {
        self.base.ensure_live()?;
        self.drive(state);
        Ok(())
    }

    fn listeners(&self) -> &Listeners<DigitalStateChange> {
        &self.listeners
    }
}

pub struct MockDigitalOutputProvider {
    base: MockBase,
    outputs: Mutex<HashMap<u32, Weak<MockDigitalOutput>>>,
}

impl MockDigitalOutputProvider {
    pub fn new() -> Self {
        Self {
            base: MockBase::new("mock-digital-output", "Mock Digital Output"),
            outputs: Mutex::new(HashMap::new()),
        }
    }

    /// The output at `address`, if one was created and is still alive.
    pub fn output(&self, address: u32) -> Option<Arc<MockDigitalOutput>> {
        self.outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&address)
            .and_then(Weak::upgrade)
    }
}

impl Default for MockDigitalOutputProvider {
    fn default() -> Self {
        Self::new()
    }
}

mock_provider!(MockDigitalOutputProvider);

impl DigitalOutputProvider for MockDigitalOutputProvider {
    fn create(
        &self,
        _ctx: &Context,
        config: DigitalOutputConfig,
    ) -> Result<Arc<dyn DigitalOutput>> {
        let address = config.address;
        let output = Arc::new(MockDigitalOutput::new(config, self.base.identity.id()));
        self.outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address, Arc::downgrade(&output));
        trace!(id = output.base.id(), address, "Mock digital output created");
        Ok(output)
    }
}
