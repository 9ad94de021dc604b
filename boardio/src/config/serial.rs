//! Serial line parameters.

use std::fmt;
use std::str::FromStr;

use strum::{Display, EnumString};

/// Line speed in bits per second.
///
/// Any rate is accepted; the associated constants are the common presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Baud(pub u32);

impl Baud {
    pub const B50: Baud = Baud(50);
    pub const B75: Baud = Baud(75);
    pub const B110: Baud = Baud(110);
    pub const B134: Baud = Baud(134);
    pub const B150: Baud = Baud(150);
    pub const B200: Baud = Baud(200);
    pub const B300: Baud = Baud(300);
    pub const B600: Baud = Baud(600);
    pub const B1200: Baud = Baud(1200);
    pub const B1800: Baud = Baud(1800);
    pub const B2400: Baud = Baud(2400);
    pub const B4800: Baud = Baud(4800);
    pub const B9600: Baud = Baud(9600);
    pub const B19200: Baud = Baud(19200);
    pub const B38400: Baud = Baud(38400);
    pub const B57600: Baud = Baud(57600);
    pub const B115200: Baud = Baud(115_200);
    pub const B230400: Baud = Baud(230_400);

    pub const PRESETS: [Baud; 18] = [
        Baud::B50,
        Baud::B75,
        Baud::B110,
        Baud::B134,
        Baud::B150,
        Baud::B200,
        Baud::B300,
        Baud::B600,
        Baud::B1200,
        Baud::B1800,
        Baud::B2400,
        Baud::B4800,
        Baud::B9600,
        Baud::B19200,
        Baud::B38400,
        Baud::B57600,
        Baud::B115200,
        Baud::B230400,
    ];

    pub fn bits_per_second(self) -> u32 {
        self.0
    }

    pub fn is_preset(self) -> bool {
        Self::PRESETS.contains(&self)
    }
}

impl Default for Baud {
    fn default() -> Self {
        Baud::B9600
    }
}

impl fmt::Display for Baud {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Baud {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim().trim_start_matches(['b', 'B']);
        match digits.parse::<u32>() {
            Ok(0) => Err("baud rate must be non-zero".to_string()),
            Ok(rate) => Ok(Baud(rate)),
            Err(e) => Err(e.to_string()),
        }
    }
}

/// Bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    #[default]
    Eight,
}

impl DataBits {
    pub fn bits(self) -> u8 {
        match self {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        }
    }
}

impl TryFrom<u8> for DataBits {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            5 => Ok(DataBits::Five),
            6 => Ok(DataBits::Six),
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            other => Err(format!("data bits must be 5-8, got {}", other)),
        }
    }
}

impl FromStr for DataBits {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bits: u8 = s.trim().parse().map_err(|e: std::num::ParseIntError| e.to_string())?;
        DataBits::try_from(bits)
    }
}

impl fmt::Display for DataBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bits())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
    Mark,
    Space,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StopBits {
    #[default]
    One,
    Two,
}

impl StopBits {
    pub fn bits(self) -> u8 {
        match self {
            StopBits::One => 1,
            StopBits::Two => 2,
        }
    }
}

impl FromStr for StopBits {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1" => Ok(StopBits::One),
            "2" => Ok(StopBits::Two),
            other => Err(format!("stop bits must be 1 or 2, got {:?}", other)),
        }
    }
}

impl fmt::Display for StopBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bits())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum FlowControl {
    #[default]
    None,
    Hardware,
    Software,
}

/// Complete framing of a serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LineSettings {
    pub baud: Baud,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
}

impl LineSettings {
    /// 8 data bits, no parity, 1 stop bit, no flow control at `baud`.
    pub fn eight_n_one(baud: Baud) -> Self {
        Self {
            baud,
            ..Self::default()
        }
        .with_eight_n_one()
    }

    /// Reset the framing to 8N1 while keeping the line speed.
    pub fn with_eight_n_one(mut self) -> Self {
        self.data_bits = DataBits::Eight;
        self.parity = Parity::None;
        self.stop_bits = StopBits::One;
        self.flow_control = FlowControl::None;
        self
    }
}

impl fmt::Display for LineSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
            Parity::Mark => 'M',
            Parity::Space => 'S',
        };
        write!(
            f,
            "{} {}{}{}",
            self.baud, self.data_bits, parity, self.stop_bits
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baud_accepts_presets_and_arbitrary_rates() {
        assert_eq!("115200".parse::<Baud>().unwrap(), Baud::B115200);
        assert!(Baud::B115200.is_preset());

        let odd: Baud = "B250000".parse().unwrap();
        assert_eq!(odd.bits_per_second(), 250_000);
        assert!(!odd.is_preset());

        assert!("0".parse::<Baud>().is_err());
        assert!("fast".parse::<Baud>().is_err());
    }

    #[test]
    fn test_line_parameter_parsing() {
        assert_eq!("7".parse::<DataBits>().unwrap(), DataBits::Seven);
        assert!("9".parse::<DataBits>().is_err());
        assert_eq!("EVEN".parse::<Parity>().unwrap(), Parity::Even);
        assert_eq!("2".parse::<StopBits>().unwrap(), StopBits::Two);
        assert_eq!(
            "hardware".parse::<FlowControl>().unwrap(),
            FlowControl::Hardware
        );
        assert_eq!(Parity::Mark.to_string(), "mark");
    }

    #[test]
    fn test_eight_n_one() {
        let settings = LineSettings {
            baud: Baud::B57600,
            data_bits: DataBits::Seven,
            parity: Parity::Odd,
            stop_bits: StopBits::Two,
            flow_control: FlowControl::Software,
        }
        .with_eight_n_one();

        assert_eq!(settings, LineSettings::eight_n_one(Baud::B57600));
        assert_eq!(settings.to_string(), "57600 8N1");
    }
}
