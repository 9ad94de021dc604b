use std::sync::{Arc, Mutex, PoisonError};

use super::{MockBase, MockHandle};
use crate::config::{IoConfig, PwmConfig};
use crate::context::Context;
use crate::error::Result;
use crate::io::pwm::{validate_duty_cycle, validate_frequency, Pwm, PwmPolarity};
use crate::provider::PwmProvider;

#[derive(Debug, Clone, Copy)]
struct Signal {
    on: bool,
    duty_cycle: f32,
    frequency: u32,
}

#[derive(Debug)]
pub struct MockPwm {
    base: MockHandle,
    config: PwmConfig,
    signal: Mutex<Signal>,
}

impl MockPwm {
    fn signal(&self) -> Signal {
        *self.signal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, apply: impl FnOnce(&mut Signal)) {
        apply(&mut self.signal.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn teardown(&self) -> Result<()> {
        let shutdown = self.config.shutdown;
        self.update(|signal| match shutdown {
            Some(duty_cycle) => {
                signal.duty_cycle = duty_cycle;
                signal.on = duty_cycle > 0.0;
            }
            None => signal.on = false,
        });
        Ok(())
    }
}

mock_io!(MockPwm, Pwm);

impl Pwm for MockPwm {
    fn on(&self) -> Result<()> {
        self.base.ensure_live()?;
        self.update(|signal| signal.on = true);
        Ok(())
    }

    fn off(&self) -> Result<()> {
        self.base.ensure_live()?;
        self.update(|signal| signal.on = false);
        Ok(())
    }

    fn is_on(&self) -> bool {
        self.signal().on
    }

    fn duty_cycle(&self) -> f32 {
        self.signal().duty_cycle
    }

    fn set_duty_cycle(&self, duty_cycle: f32) -> Result<()> {
        self.base.ensure_live()?;
        let duty_cycle = validate_duty_cycle(self.base.id(), duty_cycle)?;
        self.update(|signal| signal.duty_cycle = duty_cycle);
        Ok(())
    }

    fn frequency(&self) -> u32 {
        self.signal().frequency
    }

    fn set_frequency(&self, frequency: u32) -> Result<()> {
        self.base.ensure_live()?;
        let frequency = validate_frequency(self.base.id(), frequency)?;
        self.update(|signal| signal.frequency = frequency);
        Ok(())
    }

    fn polarity(&self) -> PwmPolarity {
        self.config.polarity
    }
}

pub struct MockPwmProvider {
    base: MockBase,
}

impl MockPwmProvider {
    pub fn new() -> Self {
        Self {
            base: MockBase::new("mock-pwm", "Mock PWM"),
        }
    }
}

impl Default for MockPwmProvider {
    fn default() -> Self {
        Self::new()
    }
}

mock_provider!(MockPwmProvider);

impl PwmProvider for MockPwmProvider {
    fn create(&self, _ctx: &Context, config: PwmConfig) -> Result<Arc<dyn Pwm>> {
        let id = config.id().to_string();
        let signal = Signal {
            on: false,
            duty_cycle: validate_duty_cycle(&id, config.duty_cycle)?,
            frequency: validate_frequency(&id, config.frequency)?,
        };
        Ok(Arc::new(MockPwm {
            base: MockHandle::new(config.identity(), self.base.identity.id()),
            config,
            signal: Mutex::new(signal),
        }))
    }
}
