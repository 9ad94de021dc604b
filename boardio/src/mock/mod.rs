//! In-memory backends for every I/O type.
//!
//! The mock providers need no hardware. Applications use them to run board
//! logic on a workstation, and the crate's tests use them to drive the
//! registry and managers. Bus devices are backed by [`MockDevice`], which
//! stores register writes and returns them on read, so a value written to a
//! register reads back unchanged unless a glitch or bus failure is injected.
//!
//! Mock providers are not submitted to inventory; add them explicitly, for
//! example with [`providers`].

use std::io;
use std::sync::Arc;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::provider::{terminate_handles, ProviderInstance};

/// Builder methods and the [`crate::provider::Provider`] impl shared by
/// every mock provider. The provider struct must have a `base: MockBase`
/// field.
macro_rules! mock_provider {
    ($provider:ident) => {
        impl $provider {
            pub fn with_id(mut self, id: impl Into<String>) -> Self {
                self.base = self.base.with_id(id.into());
                self
            }

            pub fn with_priority(mut self, priority: i32) -> Self {
                self.base.priority = priority;
                self
            }

            /// Make [`crate::provider::Provider::initialize`] fail.
            pub fn failing_initialize(mut self) -> Self {
                self.base.fail_initialize = true;
                self
            }

            /// Make [`crate::provider::Provider::terminate`] fail after its
            /// handles have been shut down.
            pub fn failing_terminate(mut self) -> Self {
                self.base.fail_terminate = true;
                self
            }
        }

        impl crate::provider::Provider for $provider {
            fn identity(&self) -> &crate::identity::Identity {
                &self.base.identity
            }

            fn priority(&self) -> i32 {
                self.base.priority
            }

            fn initialize(&self, ctx: &crate::context::Context) -> crate::error::Result<()> {
                self.base.initialize(ctx)
            }

            fn terminate(&self, ctx: &crate::context::Context) -> crate::error::Result<()> {
                self.base.terminate(ctx)
            }
        }
    };
}

/// `Io` impl for a mock handle with a `base: MockHandle` field and an
/// inherent `teardown(&self) -> Result<()>`.
macro_rules! mock_io {
    ($handle:ident, $io_type:ident) => {
        impl crate::io::Io for $handle {
            fn identity(&self) -> &crate::identity::Identity {
                &self.base.identity
            }

            fn io_type(&self) -> crate::io::IoType {
                crate::io::IoType::$io_type
            }

            fn provider_id(&self) -> &str {
                &self.base.provider_id
            }

            fn shutdown(&self, _ctx: &crate::context::Context) -> crate::error::Result<()> {
                self.base.shutdown.run(|| self.teardown())
            }

            fn is_shutdown(&self) -> bool {
                self.base.shutdown.is_shutdown()
            }
        }
    };
}

mod analog;
mod device;
mod digital;
mod i2c;
pub mod platform;
mod pwm;
mod serial;
mod spi;

pub use analog::{
    MockAnalogInput, MockAnalogInputProvider, MockAnalogOutput, MockAnalogOutputProvider,
};
pub use device::MockDevice;
pub use digital::{
    MockDigitalInput, MockDigitalInputProvider, MockDigitalOutput, MockDigitalOutputProvider,
};
pub use i2c::{MockI2c, MockI2cProvider};
pub use platform::MockPlatform;
pub use pwm::{MockPwm, MockPwmProvider};
pub use serial::{MockPort, MockSerial, MockSerialProvider};
pub use spi::{MockSpi, MockSpiProvider};

/// Provider settings common to every mock.
#[derive(Debug)]
pub(crate) struct MockBase {
    identity: Identity,
    priority: i32,
    fail_initialize: bool,
    fail_terminate: bool,
}

impl MockBase {
    fn new(id: &str, name: &str) -> Self {
        Self {
            identity: Identity::new(id, name, "In-memory mock backend"),
            priority: 0,
            fail_initialize: false,
            fail_terminate: false,
        }
    }

    fn with_id(self, id: String) -> Self {
        Self {
            identity: Identity::new(id.clone(), id, self.identity.description()),
            ..self
        }
    }

    fn injected(&self, operation: &str) -> Error {
        Error::io(
            format!("mock://{}", self.identity.id()),
            io::Error::other(format!("injected {} failure", operation)),
        )
    }

    fn initialize(&self, _ctx: &Context) -> Result<()> {
        if self.fail_initialize {
            return Err(self.injected("initialize"));
        }
        Ok(())
    }

    fn terminate(&self, ctx: &Context) -> Result<()> {
        terminate_handles(ctx, self.identity.id())?;
        if self.fail_terminate {
            return Err(self.injected("terminate"));
        }
        Ok(())
    }
}

/// State every mock handle carries.
#[derive(Debug)]
pub(crate) struct MockHandle {
    identity: Identity,
    provider_id: String,
    shutdown: crate::io::ShutdownState,
}

impl MockHandle {
    fn new(identity: Identity, provider_id: &str) -> Self {
        Self {
            identity,
            provider_id: provider_id.to_string(),
            shutdown: crate::io::ShutdownState::new(),
        }
    }

    fn id(&self) -> &str {
        self.identity.id()
    }

    /// Fail with [`Error::Closed`] once the handle has been shut down.
    fn ensure_live(&self) -> Result<()> {
        if self.shutdown.is_shutdown() {
            return Err(Error::Closed {
                id: self.id().to_string(),
            });
        }
        Ok(())
    }
}

/// One of each mock provider, under its default id.
pub fn providers() -> Vec<ProviderInstance> {
    use crate::provider::{
        AnalogInputProvider, AnalogOutputProvider, DigitalInputProvider, DigitalOutputProvider,
        I2cProvider, PwmProvider, SerialProvider, SpiProvider,
    };

    vec![
        Arc::new(MockDigitalInputProvider::new()).into_provider(),
        Arc::new(MockDigitalOutputProvider::new()).into_provider(),
        Arc::new(MockAnalogInputProvider::new()).into_provider(),
        Arc::new(MockAnalogOutputProvider::new()).into_provider(),
        Arc::new(MockPwmProvider::new()).into_provider(),
        Arc::new(MockSpiProvider::new()).into_provider(),
        Arc::new(MockI2cProvider::new()).into_provider(),
        Arc::new(MockSerialProvider::new()).into_provider(),
    ]
}

/// Default ids of the providers returned by [`providers`].
pub const PROVIDER_IDS: [&str; 8] = [
    "mock-digital-input",
    "mock-digital-output",
    "mock-analog-input",
    "mock-analog-output",
    "mock-pwm",
    "mock-spi",
    "mock-i2c",
    "mock-serial",
];
