//! Analog input and output.

use std::fmt;

use super::digital::Listeners;
use super::Io;
use crate::error::{Error, Result};

/// Inclusive range of raw values a channel accepts or reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AnalogRange {
    pub min: i32,
    pub max: i32,
}

impl AnalogRange {
    pub fn new(min: i32, max: i32) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    pub fn contains(&self, value: i32) -> bool {
        (self.min..=self.max).contains(&value)
    }

    /// Reject `value` with [`Error::ValueOutOfRange`] when outside the range.
    pub fn check(&self, id: &str, value: i32) -> Result<i32> {
        if self.contains(value) {
            Ok(value)
        } else {
            Err(Error::ValueOutOfRange {
                id: id.to_string(),
                value: value.to_string(),
                range: self.to_string(),
            })
        }
    }

    pub fn clamp(&self, value: i32) -> i32 {
        value.clamp(self.min, self.max)
    }
}

impl Default for AnalogRange {
    fn default() -> Self {
        Self {
            min: 0,
            max: i32::from(u16::MAX),
        }
    }
}

impl fmt::Display for AnalogRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// Event dispatched when an analog value changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalogValueChange {
    pub source: String,
    pub value: i32,
    pub previous: i32,
}

pub trait AnalogInput: Io {
    fn value(&self) -> Result<i32>;

    fn range(&self) -> AnalogRange;

    fn listeners(&self) -> &Listeners<AnalogValueChange>;
}

pub trait AnalogOutput: Io {
    fn value(&self) -> Result<i32>;

    /// Drive `value`; values outside [`AnalogOutput::range`] are rejected.
    fn set_value(&self, value: i32) -> Result<()>;

    fn range(&self) -> AnalogRange;

    fn listeners(&self) -> &Listeners<AnalogValueChange>;

    /// Move the output by `delta`, saturating at the range bounds.
    fn step(&self, delta: i32) -> Result<i32> {
        let next = self.range().clamp(self.value()?.saturating_add(delta));
        self.set_value(next)?;
        Ok(next)
    }
}
