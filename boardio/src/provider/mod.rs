//! Providers: backends that create I/O handles of one capability kind.
//!
//! A provider implements [`Provider`] plus exactly one of the typed provider
//! traits below. The typed trait fixes the [`IoType`] the provider serves, so
//! a provider can never hand out handles of two kinds.

pub mod manager;

use std::fmt;
use std::sync::Arc;

use crate::config::{
    AnalogInputConfig, AnalogOutputConfig, DigitalInputConfig, DigitalOutputConfig, I2cConfig,
    PwmConfig, SerialConfig, SpiConfig,
};
use crate::context::Context;
use crate::error::Result;
use crate::identity::Identity;
use crate::io::{
    AnalogInput, AnalogOutput, DigitalInput, DigitalOutput, I2c, IoType, Pwm, Serial, Spi,
};

pub use manager::ProvidersManager;

/// Lifecycle contract shared by every provider.
pub trait Provider: Send + Sync + 'static {
    fn identity(&self) -> &Identity;

    fn id(&self) -> &str {
        self.identity().id()
    }

    fn name(&self) -> String {
        self.identity().name()
    }

    /// Higher priorities win default selection.
    fn priority(&self) -> i32 {
        0
    }

    fn initialize(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    /// Shut down every handle this provider created.
    fn terminate(&self, ctx: &Context) -> Result<()> {
        terminate_handles(ctx, self.id())
    }
}

/// Remove and shut down every registered handle created by `provider_id`.
pub fn terminate_handles(ctx: &Context, provider_id: &str) -> Result<()> {
    ctx.registry().remove_owned_by(provider_id)
}

macro_rules! typed_providers {
    ($($variant:ident => $provider:ident($config:ident) -> $handle:ident;)+) => {
        $(
            pub trait $provider: Provider {
                fn create(&self, ctx: &Context, config: $config) -> Result<Arc<dyn $handle>>;

                fn into_provider(self: Arc<Self>) -> ProviderInstance
                where
                    Self: Sized,
                {
                    ProviderInstance::$variant(self)
                }
            }
        )+

        /// A provider of any kind.
        #[derive(Clone)]
        pub enum ProviderInstance {
            $($variant(Arc<dyn $provider>),)+
        }

        impl ProviderInstance {
            pub fn io_type(&self) -> IoType {
                match self {
                    $(ProviderInstance::$variant(_) => IoType::$variant,)+
                }
            }

            pub fn identity(&self) -> &Identity {
                match self {
                    $(ProviderInstance::$variant(p) => p.identity(),)+
                }
            }

            pub fn priority(&self) -> i32 {
                match self {
                    $(ProviderInstance::$variant(p) => p.priority(),)+
                }
            }

            pub fn initialize(&self, ctx: &Context) -> Result<()> {
                match self {
                    $(ProviderInstance::$variant(p) => p.initialize(ctx),)+
                }
            }

            pub fn terminate(&self, ctx: &Context) -> Result<()> {
                match self {
                    $(ProviderInstance::$variant(p) => p.terminate(ctx),)+
                }
            }
        }
    };
}

typed_providers! {
    DigitalInput => DigitalInputProvider(DigitalInputConfig) -> DigitalInput;
    DigitalOutput => DigitalOutputProvider(DigitalOutputConfig) -> DigitalOutput;
    AnalogInput => AnalogInputProvider(AnalogInputConfig) -> AnalogInput;
    AnalogOutput => AnalogOutputProvider(AnalogOutputConfig) -> AnalogOutput;
    Pwm => PwmProvider(PwmConfig) -> Pwm;
    Spi => SpiProvider(SpiConfig) -> Spi;
    I2c => I2cProvider(I2cConfig) -> I2c;
    Serial => SerialProvider(SerialConfig) -> Serial;
}

impl ProviderInstance {
    pub fn id(&self) -> &str {
        self.identity().id()
    }

    pub fn name(&self) -> String {
        self.identity().name()
    }

    /// Whether both values refer to the same provider object.
    pub fn ptr_eq(&self, other: &ProviderInstance) -> bool {
        fn addr<T: ?Sized>(p: &Arc<T>) -> *const () {
            Arc::as_ptr(p) as *const ()
        }
        let (a, b) = match (self, other) {
            (ProviderInstance::DigitalInput(a), ProviderInstance::DigitalInput(b)) => {
                (addr(a), addr(b))
            }
            (ProviderInstance::DigitalOutput(a), ProviderInstance::DigitalOutput(b)) => {
                (addr(a), addr(b))
            }
            (ProviderInstance::AnalogInput(a), ProviderInstance::AnalogInput(b)) => {
                (addr(a), addr(b))
            }
            (ProviderInstance::AnalogOutput(a), ProviderInstance::AnalogOutput(b)) => {
                (addr(a), addr(b))
            }
            (ProviderInstance::Pwm(a), ProviderInstance::Pwm(b)) => (addr(a), addr(b)),
            (ProviderInstance::Spi(a), ProviderInstance::Spi(b)) => (addr(a), addr(b)),
            (ProviderInstance::I2c(a), ProviderInstance::I2c(b)) => (addr(a), addr(b)),
            (ProviderInstance::Serial(a), ProviderInstance::Serial(b)) => (addr(a), addr(b)),
            _ => return false,
        };
        a == b
    }
}

impl fmt::Debug for ProviderInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderInstance")
            .field("type", &self.io_type())
            .field("id", &self.id())
            .field("priority", &self.priority())
            .finish()
    }
}

/// Factory for a provider discovered at link time.
pub type ProviderFactoryFn = fn() -> ProviderInstance;

/// Provider descriptor collected by inventory.
///
/// Backends register with `inventory::submit!`; [`ProvidersManager::initialize`]
/// instantiates every descriptor when auto-detection is enabled.
pub struct ProviderDescriptor {
    pub id: &'static str,
    pub create_fn: ProviderFactoryFn,
}

inventory::collect!(ProviderDescriptor);

/// Every provider registered through inventory.
pub fn discovered() -> impl Iterator<Item = &'static ProviderDescriptor> {
    inventory::iter::<ProviderDescriptor>().into_iter()
}
