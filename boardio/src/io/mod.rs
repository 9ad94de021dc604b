//! I/O handle contracts.
//!
//! Every live handle implements [`Io`] plus the capability trait of exactly
//! one [`IoType`]. Handles travel through the registry as the closed
//! [`IoInstance`] union, and generic code names a capability through the
//! zero-sized markers in [`kind`].

pub mod analog;
pub mod digital;
pub mod i2c;
pub mod pwm;
pub mod serial;
pub mod spi;
pub mod transfer;

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use strum::{Display, EnumIter, EnumString};

use crate::config::IoConfig;
use crate::context::Context;
use crate::error::Result;
use crate::identity::Identity;
use crate::provider::{Provider, ProviderInstance};

pub use analog::{AnalogInput, AnalogOutput};
pub use digital::{DigitalInput, DigitalOutput};
pub use i2c::I2c;
pub use pwm::Pwm;
pub use serial::Serial;
pub use spi::Spi;

/// The closed set of I/O capability kinds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, EnumIter,
)]
#[strum(ascii_case_insensitive)]
pub enum IoType {
    #[strum(serialize = "digital-input")]
    DigitalInput,
    #[strum(serialize = "digital-output")]
    DigitalOutput,
    #[strum(serialize = "analog-input")]
    AnalogInput,
    #[strum(serialize = "analog-output")]
    AnalogOutput,
    #[strum(serialize = "pwm")]
    Pwm,
    #[strum(serialize = "spi")]
    Spi,
    #[strum(serialize = "i2c")]
    I2c,
    #[strum(serialize = "serial")]
    Serial,
}

/// Contract shared by every I/O handle.
pub trait Io: Send + Sync + 'static {
    fn identity(&self) -> &Identity;

    fn id(&self) -> &str {
        self.identity().id()
    }

    fn name(&self) -> String {
        self.identity().name()
    }

    fn description(&self) -> String {
        self.identity().description()
    }

    fn io_type(&self) -> IoType;

    /// Id of the provider that created this handle.
    fn provider_id(&self) -> &str;

    /// Release the underlying resource. Calling this on a handle that is
    /// already shut down succeeds without touching the hardware again.
    fn shutdown(&self, ctx: &Context) -> Result<()>;

    fn is_shutdown(&self) -> bool;
}

/// Tracks whether a handle has completed its shutdown.
///
/// A failed shutdown leaves the state open so the caller may retry.
#[derive(Debug, Default)]
pub struct ShutdownState {
    done: Mutex<bool>,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `teardown` unless shutdown already completed.
    pub fn run(&self, teardown: impl FnOnce() -> Result<()>) -> Result<()> {
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        if *done {
            return Ok(());
        }
        teardown()?;
        *done = true;
        Ok(())
    }

    pub fn is_shutdown(&self) -> bool {
        *self.done.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Ties a capability kind to its handle, provider and config types.
pub trait IoKind: 'static {
    const TYPE: IoType;

    type Handle: ?Sized + Io;
    type Provider: ?Sized + Provider;
    type Config: IoConfig;

    fn into_instance(handle: Arc<Self::Handle>) -> IoInstance;

    fn from_instance(instance: IoInstance) -> Option<Arc<Self::Handle>>;

    fn into_provider_instance(provider: Arc<Self::Provider>) -> ProviderInstance;

    fn from_provider_instance(instance: ProviderInstance) -> Option<Arc<Self::Provider>>;

    /// Ask `provider` to build a handle from `config`.
    fn create(
        provider: &Self::Provider,
        ctx: &Context,
        config: Self::Config,
    ) -> Result<Arc<Self::Handle>>;
}

macro_rules! io_kinds {
    ($($variant:ident => $handle:ident, $provider:ident, $config:ident;)+) => {
        /// A live handle of any kind.
        #[derive(Clone)]
        pub enum IoInstance {
            $($variant(Arc<dyn $handle>),)+
        }

        impl IoInstance {
            pub fn io_type(&self) -> IoType {
                match self {
                    $(IoInstance::$variant(_) => IoType::$variant,)+
                }
            }

            pub fn identity(&self) -> &Identity {
                match self {
                    $(IoInstance::$variant(h) => h.identity(),)+
                }
            }

            pub fn id(&self) -> &str {
                self.identity().id()
            }

            pub fn provider_id(&self) -> &str {
                match self {
                    $(IoInstance::$variant(h) => h.provider_id(),)+
                }
            }

            pub fn shutdown(&self, ctx: &Context) -> Result<()> {
                match self {
                    $(IoInstance::$variant(h) => h.shutdown(ctx),)+
                }
            }

            pub fn is_shutdown(&self) -> bool {
                match self {
                    $(IoInstance::$variant(h) => h.is_shutdown(),)+
                }
            }
        }

        /// Marker types naming each capability kind.
        pub mod kind {
            $(
                #[derive(Debug, Clone, Copy)]
                pub struct $variant;
            )+
        }

        $(
            impl IoKind for kind::$variant {
                const TYPE: IoType = IoType::$variant;

                type Handle = dyn $handle;
                type Provider = dyn crate::provider::$provider;
                type Config = crate::config::$config;

                fn into_instance(handle: Arc<Self::Handle>) -> IoInstance {
                    IoInstance::$variant(handle)
                }

                fn from_instance(instance: IoInstance) -> Option<Arc<Self::Handle>> {
                    match instance {
                        IoInstance::$variant(h) => Some(h),
                        #[allow(unreachable_patterns)]
                        _ => None,
                    }
                }

                fn into_provider_instance(provider: Arc<Self::Provider>) -> ProviderInstance {
                    ProviderInstance::$variant(provider)
                }

                fn from_provider_instance(
                    instance: ProviderInstance,
                ) -> Option<Arc<Self::Provider>> {
                    match instance {
                        ProviderInstance::$variant(p) => Some(p),
                        #[allow(unreachable_patterns)]
                        _ => None,
                    }
                }

                fn create(
                    provider: &Self::Provider,
                    ctx: &Context,
                    config: Self::Config,
                ) -> Result<Arc<Self::Handle>> {
                    provider.create(ctx, config)
                }
            }
        )+
    };
}

io_kinds! {
    DigitalInput => DigitalInput, DigitalInputProvider, DigitalInputConfig;
    DigitalOutput => DigitalOutput, DigitalOutputProvider, DigitalOutputConfig;
    AnalogInput => AnalogInput, AnalogInputProvider, AnalogInputConfig;
    AnalogOutput => AnalogOutput, AnalogOutputProvider, AnalogOutputConfig;
    Pwm => Pwm, PwmProvider, PwmConfig;
    Spi => Spi, SpiProvider, SpiConfig;
    I2c => I2c, I2cProvider, I2cConfig;
    Serial => Serial, SerialProvider, SerialConfig;
}

impl fmt::Debug for IoInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoInstance")
            .field("type", &self.io_type())
            .field("id", &self.id())
            .field("provider", &self.provider_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use strum::IntoEnumIterator;

    #[test]
    fn test_io_type_names() {
        assert_eq!(IoType::I2c.to_string(), "i2c");
        assert_eq!(IoType::DigitalOutput.to_string(), "digital-output");
        assert_eq!("Analog-Input".parse::<IoType>().unwrap(), IoType::AnalogInput);
        assert_eq!(IoType::iter().count(), 8);
        for io_type in IoType::iter() {
            assert_eq!(io_type.to_string().parse::<IoType>().unwrap(), io_type);
        }
    }

    #[test]
    fn test_shutdown_state_retries_after_failure() {
        let state = ShutdownState::new();
        let mut calls = 0;

        let result = state.run(|| {
            calls += 1;
            Err(Error::EmptyProperties)
        });
        assert!(result.is_err());
        assert!(!state.is_shutdown());

        state
            .run(|| {
                calls += 1;
                Ok(())
            })
            .unwrap();
        state
            .run(|| {
                calls += 1;
                Ok(())
            })
            .unwrap();

        assert!(state.is_shutdown());
        assert_eq!(calls, 2);
    }
}
