//! Typed configuration for I/O handles.
//!
//! A [`ConfigBuilder`] accumulates string properties and turns them into one
//! of the config structs in a single [`ConfigBuilder::build`]. Every field is
//! parsed and validated there, so a missing `address` or an unparseable baud
//! rate is reported before any provider sees the config.

use std::marker::PhantomData;
use std::time::Duration;

use super::serial::{Baud, DataBits, FlowControl, LineSettings, Parity, StopBits};
use super::Properties;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::io::analog::AnalogRange;
use crate::io::digital::{DigitalState, PullResistance};
use crate::io::pwm::PwmPolarity;
use crate::io::spi::SpiMode;

pub const KEY_ID: &str = "id";
pub const KEY_NAME: &str = "name";
pub const KEY_DESCRIPTION: &str = "description";
pub const KEY_ADDRESS: &str = "address";
pub const KEY_BUS: &str = "bus";
pub const KEY_DEVICE: &str = "device";
pub const KEY_CHANNEL: &str = "channel";
pub const KEY_PULL: &str = "pull";
pub const KEY_DEBOUNCE: &str = "debounce";
pub const KEY_INITIAL: &str = "initial";
pub const KEY_SHUTDOWN: &str = "shutdown";
pub const KEY_FREQUENCY: &str = "frequency";
pub const KEY_DUTY_CYCLE: &str = "duty-cycle";
pub const KEY_POLARITY: &str = "polarity";
pub const KEY_BAUD: &str = "baud";
pub const KEY_MODE: &str = "mode";
pub const KEY_DATA_BITS: &str = "data-bits";
pub const KEY_PARITY: &str = "parity";
pub const KEY_STOP_BITS: &str = "stop-bits";
pub const KEY_FLOW_CONTROL: &str = "flow-control";
pub const KEY_RANGE_MIN: &str = "range.min";
pub const KEY_RANGE_MAX: &str = "range.max";

/// Fields every I/O config carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseConfig {
    pub id: String,
    pub name: String,
    pub description: String,
}

impl BaseConfig {
    /// `name` defaults to the id, `description` to empty.
    pub fn from_properties(props: &Properties) -> Result<Self> {
        let id = props.require(KEY_ID)?.trim();
        if id.is_empty() {
            return Err(invalid(KEY_ID, id, "id must not be blank"));
        }
        Ok(Self {
            id: id.to_string(),
            name: props.get_or(KEY_NAME, id).to_string(),
            description: props.get_or(KEY_DESCRIPTION, "").to_string(),
        })
    }

    pub fn identity(&self) -> Identity {
        Identity::new(&self.id, &self.name, &self.description)
    }
}

/// Access to the shared fields of a typed config.
pub trait IoConfig: Clone + Send + Sync + 'static {
    fn base(&self) -> &BaseConfig;

    fn id(&self) -> &str {
        &self.base().id
    }

    fn identity(&self) -> Identity {
        self.base().identity()
    }
}

/// Materialise a config from properties.
pub trait FromProperties: Sized {
    fn from_properties(props: &Properties) -> Result<Self>;
}

fn invalid(key: &str, value: &str, reason: impl Into<String>) -> Error {
    Error::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

// Integer property converted to a narrower type.
fn integer<T: TryFrom<i64>>(props: &Properties, key: &str) -> Result<Option<T>> {
    match props.integer(key)? {
        Some(value) => T::try_from(value)
            .map(Some)
            .map_err(|_| invalid(key, props.get_or(key, ""), "out of range")),
        None => Ok(None),
    }
}

fn require_integer<T: TryFrom<i64>>(props: &Properties, key: &str) -> Result<T> {
    integer(props, key)?.ok_or_else(|| Error::MissingKey(key.to_string()))
}

fn analog_range(props: &Properties) -> Result<AnalogRange> {
    let default = AnalogRange::default();
    let min = integer(props, KEY_RANGE_MIN)?.unwrap_or(default.min);
    let max = integer(props, KEY_RANGE_MAX)?.unwrap_or(default.max);
    if min > max {
        return Err(invalid(
            KEY_RANGE_MIN,
            props.get_or(KEY_RANGE_MIN, ""),
            "range.min exceeds range.max",
        ));
    }
    Ok(AnalogRange { min, max })
}

macro_rules! impl_io_config {
    ($($config:ident),+) => {
        $(
            impl IoConfig for $config {
                fn base(&self) -> &BaseConfig {
                    &self.base
                }
            }
        )+
    };
}

#[derive(Debug, Clone, PartialEq)]
pub struct DigitalInputConfig {
    pub base: BaseConfig,
    pub address: u32,
    pub pull: PullResistance,
    pub debounce: Duration,
}

impl FromProperties for DigitalInputConfig {
    fn from_properties(props: &Properties) -> Result<Self> {
        Ok(Self {
            base: BaseConfig::from_properties(props)?,
            address: require_integer(props, KEY_ADDRESS)?,
            pull: props.parse(KEY_PULL)?.unwrap_or_default(),
            // microseconds
            debounce: integer::<u64>(props, KEY_DEBOUNCE)?
                .map(Duration::from_micros)
                .unwrap_or(Duration::ZERO),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DigitalOutputConfig {
    pub base: BaseConfig,
    pub address: u32,
    pub initial: Option<DigitalState>,
    pub shutdown: Option<DigitalState>,
}

impl FromProperties for DigitalOutputConfig {
    fn from_properties(props: &Properties) -> Result<Self> {
        Ok(Self {
            base: BaseConfig::from_properties(props)?,
            address: require_integer(props, KEY_ADDRESS)?,
            initial: props.parse(KEY_INITIAL)?,
            shutdown: props.parse(KEY_SHUTDOWN)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalogInputConfig {
    pub base: BaseConfig,
    pub address: u32,
    pub range: AnalogRange,
}

impl FromProperties for AnalogInputConfig {
    fn from_properties(props: &Properties) -> Result<Self> {
        Ok(Self {
            base: BaseConfig::from_properties(props)?,
            address: require_integer(props, KEY_ADDRESS)?,
            range: analog_range(props)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalogOutputConfig {
    pub base: BaseConfig,
    pub address: u32,
    pub range: AnalogRange,
    pub initial: Option<i32>,
    pub shutdown: Option<i32>,
}

impl FromProperties for AnalogOutputConfig {
    fn from_properties(props: &Properties) -> Result<Self> {
        let range = analog_range(props)?;
        let initial: Option<i32> = integer(props, KEY_INITIAL)?;
        let shutdown: Option<i32> = integer(props, KEY_SHUTDOWN)?;
        for (key, value) in [(KEY_INITIAL, initial), (KEY_SHUTDOWN, shutdown)] {
            if let Some(value) = value {
                if !range.contains(value) {
                    return Err(invalid(key, &value.to_string(), format!("outside {}", range)));
                }
            }
        }
        Ok(Self {
            base: BaseConfig::from_properties(props)?,
            address: require_integer(props, KEY_ADDRESS)?,
            range,
            initial,
            shutdown,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PwmConfig {
    pub base: BaseConfig,
    pub address: u32,
    /// Hz
    pub frequency: u32,
    /// Percent
    pub duty_cycle: f32,
    pub polarity: PwmPolarity,
    pub shutdown: Option<f32>,
}

impl PwmConfig {
    pub const DEFAULT_FREQUENCY: u32 = 1000;
    pub const DEFAULT_DUTY_CYCLE: f32 = 50.0;
}

impl FromProperties for PwmConfig {
    fn from_properties(props: &Properties) -> Result<Self> {
        let frequency = integer(props, KEY_FREQUENCY)?.unwrap_or(Self::DEFAULT_FREQUENCY);
        if frequency == 0 {
            return Err(invalid(KEY_FREQUENCY, "0", "frequency must be non-zero"));
        }
        let duty_cycle = duty(props, KEY_DUTY_CYCLE)?.unwrap_or(Self::DEFAULT_DUTY_CYCLE);
        Ok(Self {
            base: BaseConfig::from_properties(props)?,
            address: require_integer(props, KEY_ADDRESS)?,
            frequency,
            duty_cycle,
            polarity: props.parse(KEY_POLARITY)?.unwrap_or_default(),
            shutdown: duty(props, KEY_SHUTDOWN)?,
        })
    }
}

fn duty(props: &Properties, key: &str) -> Result<Option<f32>> {
    match props.parse::<f32>(key)? {
        Some(value) if !(0.0..=100.0).contains(&value) => {
            Err(invalid(key, props.get_or(key, ""), "duty cycle must be 0-100"))
        }
        other => Ok(other),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct I2cConfig {
    pub base: BaseConfig,
    pub bus: u32,
    /// 7- or 10-bit device address
    pub device: u16,
}

impl FromProperties for I2cConfig {
    fn from_properties(props: &Properties) -> Result<Self> {
        let device: u16 = require_integer(props, KEY_DEVICE)?;
        if device > 0x3ff {
            return Err(invalid(KEY_DEVICE, props.get_or(KEY_DEVICE, ""), "not an I2C address"));
        }
        Ok(Self {
            base: BaseConfig::from_properties(props)?,
            bus: require_integer(props, KEY_BUS)?,
            device,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpiConfig {
    pub base: BaseConfig,
    pub bus: u32,
    /// Chip-select line
    pub channel: u32,
    /// Clock rate in Hz
    pub baud: u32,
    pub mode: SpiMode,
}

impl SpiConfig {
    pub const DEFAULT_BAUD: u32 = 1_000_000;
}

impl FromProperties for SpiConfig {
    fn from_properties(props: &Properties) -> Result<Self> {
        // The chip select may be given as either `channel` or `device`.
        let channel = match integer(props, KEY_CHANNEL)? {
            Some(channel) => channel,
            None => require_integer(props, KEY_DEVICE)
                .map_err(|_| Error::MissingKey(KEY_CHANNEL.to_string()))?,
        };
        let baud = integer(props, KEY_BAUD)?.unwrap_or(Self::DEFAULT_BAUD);
        if baud == 0 {
            return Err(invalid(KEY_BAUD, "0", "baud must be non-zero"));
        }
        Ok(Self {
            base: BaseConfig::from_properties(props)?,
            bus: integer(props, KEY_BUS)?.unwrap_or(0),
            channel,
            baud,
            mode: props.parse(KEY_MODE)?.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    pub base: BaseConfig,
    /// Device path, e.g. `/dev/ttyS0`
    pub device: String,
    pub line: LineSettings,
}

impl FromProperties for SerialConfig {
    fn from_properties(props: &Properties) -> Result<Self> {
        let defaults = LineSettings::default();
        Ok(Self {
            base: BaseConfig::from_properties(props)?,
            device: props.require(KEY_DEVICE)?.trim().to_string(),
            line: LineSettings {
                baud: props.parse(KEY_BAUD)?.unwrap_or(defaults.baud),
                data_bits: props.parse(KEY_DATA_BITS)?.unwrap_or(defaults.data_bits),
                parity: props.parse(KEY_PARITY)?.unwrap_or(defaults.parity),
                stop_bits: props.parse(KEY_STOP_BITS)?.unwrap_or(defaults.stop_bits),
                flow_control: props
                    .parse(KEY_FLOW_CONTROL)?
                    .unwrap_or(defaults.flow_control),
            },
        })
    }
}

impl_io_config!(
    DigitalInputConfig,
    DigitalOutputConfig,
    AnalogInputConfig,
    AnalogOutputConfig,
    PwmConfig,
    I2cConfig,
    SpiConfig,
    SerialConfig
);

/// Accumulates properties for a config of type `C`.
#[derive(Debug, Clone)]
pub struct ConfigBuilder<C> {
    pairs: Vec<(String, String)>,
    _config: PhantomData<fn() -> C>,
}

impl<C> Default for ConfigBuilder<C> {
    fn default() -> Self {
        Self {
            pairs: Vec::new(),
            _config: PhantomData,
        }
    }
}

impl<C: FromProperties> ConfigBuilder<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn property(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.pairs.push((key.into(), value.to_string()));
        self
    }

    /// Copy every property of `props`; later calls override earlier ones.
    pub fn properties(mut self, props: &Properties) -> Self {
        self.pairs
            .extend(props.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        self
    }

    pub fn id(self, id: impl ToString) -> Self {
        self.property(KEY_ID, id)
    }

    pub fn name(self, name: impl ToString) -> Self {
        self.property(KEY_NAME, name)
    }

    pub fn description(self, description: impl ToString) -> Self {
        self.property(KEY_DESCRIPTION, description)
    }

    pub fn build(self) -> Result<C> {
        let props: Properties = self.pairs.into_iter().collect();
        C::from_properties(&props)
    }
}

macro_rules! builder_setters {
    ($config:ident { $($method:ident: $ty:ty => $key:expr),+ $(,)? }) => {
        impl ConfigBuilder<$config> {
            $(
                pub fn $method(self, value: $ty) -> Self {
                    self.property($key, value)
                }
            )+
        }
    };
}

builder_setters!(DigitalInputConfig {
    address: u32 => KEY_ADDRESS,
    pull: PullResistance => KEY_PULL,
    debounce_micros: u64 => KEY_DEBOUNCE,
});

builder_setters!(DigitalOutputConfig {
    address: u32 => KEY_ADDRESS,
    initial: DigitalState => KEY_INITIAL,
    shutdown: DigitalState => KEY_SHUTDOWN,
});

builder_setters!(AnalogInputConfig {
    address: u32 => KEY_ADDRESS,
    min: i32 => KEY_RANGE_MIN,
    max: i32 => KEY_RANGE_MAX,
});

builder_setters!(AnalogOutputConfig {
    address: u32 => KEY_ADDRESS,
    min: i32 => KEY_RANGE_MIN,
    max: i32 => KEY_RANGE_MAX,
    initial: i32 => KEY_INITIAL,
    shutdown: i32 => KEY_SHUTDOWN,
});

builder_setters!(PwmConfig {
    address: u32 => KEY_ADDRESS,
    frequency: u32 => KEY_FREQUENCY,
    duty_cycle: f32 => KEY_DUTY_CYCLE,
    polarity: PwmPolarity => KEY_POLARITY,
    shutdown: f32 => KEY_SHUTDOWN,
});

builder_setters!(I2cConfig {
    bus: u32 => KEY_BUS,
    device: u16 => KEY_DEVICE,
});

builder_setters!(SpiConfig {
    bus: u32 => KEY_BUS,
    channel: u32 => KEY_CHANNEL,
    baud: u32 => KEY_BAUD,
    mode: SpiMode => KEY_MODE,
});

builder_setters!(SerialConfig {
    device: &str => KEY_DEVICE,
    baud: Baud => KEY_BAUD,
    data_bits: DataBits => KEY_DATA_BITS,
    parity: Parity => KEY_PARITY,
    stop_bits: StopBits => KEY_STOP_BITS,
    flow_control: FlowControl => KEY_FLOW_CONTROL,
});

impl ConfigBuilder<SerialConfig> {
    /// 8 data bits, no parity, 1 stop bit, no flow control.
    pub fn eight_n_one(self) -> Self {
        self.data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
    }
}

impl DigitalInputConfig {
    pub fn builder() -> ConfigBuilder<Self> {
        ConfigBuilder::new()
    }
}

impl DigitalOutputConfig {
    pub fn builder() -> ConfigBuilder<Self> {
        ConfigBuilder::new()
    }
}

impl AnalogInputConfig {
    pub fn builder() -> ConfigBuilder<Self> {
        ConfigBuilder::new()
    }
}

impl AnalogOutputConfig {
    pub fn builder() -> ConfigBuilder<Self> {
        ConfigBuilder::new()
    }
}

impl PwmConfig {
    pub fn builder() -> ConfigBuilder<Self> {
        ConfigBuilder::new()
    }
}

impl I2cConfig {
    pub fn builder() -> ConfigBuilder<Self> {
        ConfigBuilder::new()
    }
}

impl SpiConfig {
    pub fn builder() -> ConfigBuilder<Self> {
        ConfigBuilder::new()
    }
}

impl SerialConfig {
    pub fn builder() -> ConfigBuilder<Self> {
        ConfigBuilder::new()
    }
}
