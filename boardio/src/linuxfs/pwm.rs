//! sysfs PWM.
//!
//! Channel `N` of a chip lives under `<chip>/pwm<N>`. The kernel takes the
//! period and duty cycle in nanoseconds and rejects a duty cycle longer than
//! the period, so a frequency change parks the duty cycle at zero first.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use super::{export, unexport, write_attr, LinuxHandle, Root};
use crate::config::{IoConfig, PwmConfig};
use crate::context::Context;
use crate::error::Result;
use crate::identity::Identity;
use crate::io::pwm::{validate_duty_cycle, validate_frequency, Pwm, PwmPolarity};
use crate::provider::PwmProvider;
use crate::tracing::prelude::*;

const NANOS_PER_SECOND: u64 = 1_000_000_000;

fn period_ns(frequency: u32) -> u64 {
    NANOS_PER_SECOND / u64::from(frequency.max(1))
}

fn duty_ns(period: u64, duty_cycle: f32) -> u64 {
    (period as f64 * f64::from(duty_cycle) / 100.0).round() as u64
}

#[derive(Debug, Clone, Copy)]
struct Signal {
    on: bool,
    duty_cycle: f32,
    frequency: u32,
}

/// An exported PWM channel.
#[derive(Debug)]
struct Channel {
    chip: PathBuf,
    number: u32,
    node: PathBuf,
    exported: bool,
}

impl Channel {
    fn open(chip: &Path, number: u32) -> Result<Self> {
        let node = chip.join(format!("pwm{}", number));
        let exported = export(chip, number, &node, "period")?;
        Ok(Self {
            chip: chip.to_path_buf(),
            number,
            node,
            exported,
        })
    }

    fn write(&self, attr: &str, value: impl ToString) -> Result<()> {
        write_attr(&self.node.join(attr), value.to_string())
    }

    fn apply_frequency(&self, frequency: u32, duty_cycle: f32) -> Result<()> {
        let period = period_ns(frequency);
        self.write("duty_cycle", 0)?;
        self.write("period", period)?;
        self.write("duty_cycle", duty_ns(period, duty_cycle))
    }

    fn apply_duty_cycle(&self, frequency: u32, duty_cycle: f32) -> Result<()> {
        self.write("duty_cycle", duty_ns(period_ns(frequency), duty_cycle))
    }

    fn enable(&self, on: bool) -> Result<()> {
        self.write("enable", if on { 1 } else { 0 })
    }

    fn release(&self) -> Result<()> {
        if self.exported {
            unexport(&self.chip, self.number)?;
            debug!(channel = self.number, "Unexported");
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct LinuxFsPwm {
    handle: LinuxHandle,
    config: PwmConfig,
    channel: Channel,
    signal: Mutex<Signal>,
}

impl LinuxFsPwm {
    fn signal(&self) -> Signal {
        *self.signal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn teardown(&self) -> Result<()> {
        let signal = self.signal();
        match self.config.shutdown {
            Some(duty_cycle) => {
                self.channel
                    .apply_duty_cycle(signal.frequency, duty_cycle)?;
                self.channel.enable(duty_cycle > 0.0)?;
            }
            None => self.channel.enable(false)?,
        }
        self.channel.release()
    }
}

super::linux_io!(LinuxFsPwm, Pwm);

impl Pwm for LinuxFsPwm {
    fn on(&self) -> Result<()> {
        self.handle.ensure_live()?;
        let mut signal = self.signal.lock().unwrap_or_else(PoisonError::into_inner);
        self.channel.enable(true)?;
        signal.on = true;
        Ok(())
    }

    fn off(&self) -> Result<()> {
        self.handle.ensure_live()?;
        let mut signal = self.signal.lock().unwrap_or_else(PoisonError::into_inner);
        self.channel.enable(false)?;
        signal.on = false;
        Ok(())
    }

    fn is_on(&self) -> bool {
        self.signal().on
    }

    fn duty_cycle(&self) -> f32 {
        self.signal().duty_cycle
    }

    fn set_duty_cycle(&self, duty_cycle: f32) -> Result<()> {
        self.handle.ensure_live()?;
        let duty_cycle = validate_duty_cycle(self.handle.id(), duty_cycle)?;
        let mut signal = self.signal.lock().unwrap_or_else(PoisonError::into_inner);
        self.channel.apply_duty_cycle(signal.frequency, duty_cycle)?;
        signal.duty_cycle = duty_cycle;
        Ok(())
    }

    fn frequency(&self) -> u32 {
        self.signal().frequency
    }

    fn set_frequency(&self, frequency: u32) -> Result<()> {
        self.handle.ensure_live()?;
        let frequency = validate_frequency(self.handle.id(), frequency)?;
        let mut signal = self.signal.lock().unwrap_or_else(PoisonError::into_inner);
        if signal.frequency != frequency {
            self.channel.apply_frequency(frequency, signal.duty_cycle)?;
            signal.frequency = frequency;
        }
        Ok(())
    }

    fn polarity(&self) -> PwmPolarity {
        self.config.polarity
    }
}

pub struct LinuxFsPwmProvider {
    identity: Identity,
    root: Root,
}

super::linux_provider!(
    LinuxFsPwmProvider,
    "linuxfs-pwm",
    "Linux sysfs PWM",
    super::KEY_PWM_PATH,
    super::DEFAULT_PWM_PATH
);

impl PwmProvider for LinuxFsPwmProvider {
    /// The channel is configured but left disabled.
    fn create(&self, _ctx: &Context, config: PwmConfig) -> Result<Arc<dyn Pwm>> {
        let id = config.base.id.clone();
        let frequency = validate_frequency(&id, config.frequency)?;
        let duty_cycle = validate_duty_cycle(&id, config.duty_cycle)?;

        let channel = Channel::open(&self.root(), config.address)?;
        // Polarity can only change while the channel is disabled.
        let configured = channel
            .enable(false)
            .and_then(|_| channel.write("polarity", config.polarity))
            .and_then(|_| channel.apply_frequency(frequency, duty_cycle));
        if let Err(e) = configured {
            let _ = channel.release();
            return Err(e);
        }

        debug!(id = %id, channel = config.address, frequency, duty_cycle, "PWM opened");
        Ok(Arc::new(LinuxFsPwm {
            handle: LinuxHandle::new(config.identity(), self.identity.id()),
            signal: Mutex::new(Signal {
                on: false,
                duty_cycle,
                frequency,
            }),
            channel,
            config,
        }))
    }
}
