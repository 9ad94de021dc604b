//! Pulse-width modulation.

use strum::{Display, EnumString};

use super::Io;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum PwmPolarity {
    #[default]
    Normal,
    Inversed,
}

pub trait Pwm: Io {
    /// Start the output with the current duty cycle and frequency.
    fn on(&self) -> Result<()>;

    fn off(&self) -> Result<()>;

    fn is_on(&self) -> bool;

    /// Duty cycle in percent, 0 to 100.
    fn duty_cycle(&self) -> f32;

    fn set_duty_cycle(&self, duty_cycle: f32) -> Result<()>;

    /// Frequency in Hz.
    fn frequency(&self) -> u32;

    fn set_frequency(&self, frequency: u32) -> Result<()>;

    fn polarity(&self) -> PwmPolarity;

    fn on_with(&self, duty_cycle: f32, frequency: u32) -> Result<()> {
        self.set_frequency(frequency)?;
        self.set_duty_cycle(duty_cycle)?;
        self.on()
    }
}

/// Check a duty cycle percentage.
pub fn validate_duty_cycle(id: &str, duty_cycle: f32) -> Result<f32> {
    if (0.0..=100.0).contains(&duty_cycle) {
        Ok(duty_cycle)
    } else {
        Err(Error::ValueOutOfRange {
            id: id.to_string(),
            value: duty_cycle.to_string(),
            range: "[0, 100]".to_string(),
        })
    }
}

/// Check a frequency; zero cannot be expressed as a period.
pub fn validate_frequency(id: &str, frequency: u32) -> Result<u32> {
    if frequency == 0 {
        return Err(Error::ValueOutOfRange {
            id: id.to_string(),
            value: frequency.to_string(),
            range: "[1, 4294967295]".to_string(),
        });
    }
    Ok(frequency)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duty_cycle_bounds() {
        assert_eq!(validate_duty_cycle("fan", 0.0).unwrap(), 0.0);
        assert_eq!(validate_duty_cycle("fan", 100.0).unwrap(), 100.0);
        assert!(validate_duty_cycle("fan", 100.5).is_err());
        assert!(validate_duty_cycle("fan", -1.0).is_err());
        assert!(validate_duty_cycle("fan", f32::NAN).is_err());
        assert!(validate_frequency("fan", 0).is_err());
    }
}
