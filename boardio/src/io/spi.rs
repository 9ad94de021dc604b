//! SPI devices.

use std::fmt;
use std::str::FromStr;

use super::transfer::{RawTransfer, Register, RegisterTransfer};
use crate::config::SpiConfig;
use crate::error::Result;

/// Clock polarity and phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SpiMode {
    #[default]
    Mode0,
    Mode1,
    Mode2,
    Mode3,
}

impl SpiMode {
    pub fn bits(self) -> u8 {
        match self {
            SpiMode::Mode0 => 0,
            SpiMode::Mode1 => 1,
            SpiMode::Mode2 => 2,
            SpiMode::Mode3 => 3,
        }
    }

    /// Clock idles high.
    pub fn cpol(self) -> bool {
        self.bits() & 0b10 != 0
    }

    /// Data sampled on the trailing edge.
    pub fn cpha(self) -> bool {
        self.bits() & 0b01 != 0
    }
}

impl TryFrom<u8> for SpiMode {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(SpiMode::Mode0),
            1 => Ok(SpiMode::Mode1),
            2 => Ok(SpiMode::Mode2),
            3 => Ok(SpiMode::Mode3),
            other => Err(format!("SPI mode must be 0-3, got {}", other)),
        }
    }
}

impl FromStr for SpiMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        let digits = s
            .strip_prefix("mode")
            .or_else(|| s.strip_prefix("MODE"))
            .unwrap_or(s)
            .trim_start_matches('_');
        let value: u8 = digits
            .parse()
            .map_err(|e: std::num::ParseIntError| e.to_string())?;
        SpiMode::try_from(value)
    }
}

impl fmt::Display for SpiMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mode{}", self.bits())
    }
}

/// A device on one chip-select line of an SPI bus.
pub trait Spi: RawTransfer + RegisterTransfer {
    fn config(&self) -> &SpiConfig;

    fn bus(&self) -> u32 {
        self.config().bus
    }

    fn channel(&self) -> u32 {
        self.config().channel
    }

    fn mode(&self) -> SpiMode {
        self.config().mode
    }

    /// Full-duplex exchange: clocks out `write` while filling `read`.
    /// Both slices must have the same length.
    fn transfer(&self, write: &[u8], read: &mut [u8]) -> Result<()>;

    fn transfer_vec(&self, write: &[u8]) -> Result<Vec<u8>> {
        let mut read = vec![0u8; write.len()];
        self.transfer(write, &mut read)?;
        Ok(read)
    }
}

impl dyn Spi {
    pub fn register(&self, address: u8) -> Register<'_, dyn Spi> {
        Register::new(self, address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("3".parse::<SpiMode>().unwrap(), SpiMode::Mode3);
        assert_eq!("mode_1".parse::<SpiMode>().unwrap(), SpiMode::Mode1);
        assert!("4".parse::<SpiMode>().is_err());
        assert!(SpiMode::Mode2.cpol());
        assert!(!SpiMode::Mode2.cpha());
        assert_eq!(SpiMode::Mode1.to_string(), "mode1");
    }
}
