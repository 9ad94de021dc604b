//! sysfs GPIO.
//!
//! Each pin lives under `<root>/gpio<N>` with `direction` and `value`
//! attributes. A pin already exported by someone else is used as is and left
//! exported on shutdown; a pin this handle exported is unexported again.
//! Inputs are polled by a [`StateMonitor`] that reports debounced changes to
//! the handle's listeners.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::{export, read_attr, unexport, write_attr, LinuxHandle, Root};
use crate::config::{DigitalInputConfig, DigitalOutputConfig, IoConfig};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::io::digital::{
    DigitalInput, DigitalOutput, DigitalState, DigitalStateChange, Listeners, PullResistance,
    StateMonitor,
};
use crate::provider::{DigitalInputProvider, DigitalOutputProvider};
use crate::tracing::prelude::*;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// An exported sysfs GPIO pin.
#[derive(Debug)]
struct Pin {
    root: PathBuf,
    number: u32,
    node: PathBuf,
    exported: bool,
}

impl Pin {
    fn open(root: &Path, number: u32) -> Result<Self> {
        let node = root.join(format!("gpio{}", number));
        let exported = export(root, number, &node, "value")?;
        Ok(Self {
            root: root.to_path_buf(),
            number,
            node,
            exported,
        })
    }

    fn value_path(&self) -> PathBuf {
        self.node.join("value")
    }

    fn set_direction(&self, direction: &str) -> Result<()> {
        write_attr(&self.node.join("direction"), direction)
    }

    fn read(&self) -> Result<DigitalState> {
        read_level(&self.value_path())
    }

    fn write(&self, state: DigitalState) -> Result<()> {
        write_attr(&self.value_path(), if state.is_high() { "1" } else { "0" })
    }

    fn release(&self) -> Result<()> {
        if self.exported {
            unexport(&self.root, self.number)?;
            debug!(pin = self.number, "Unexported");
        }
        Ok(())
    }
}

fn read_level(path: &Path) -> Result<DigitalState> {
    let raw = read_attr(path)?;
    raw.parse().map_err(|e: String| {
        Error::io(path, io::Error::new(io::ErrorKind::InvalidData, e))
    })
}

#[derive(Debug)]
pub struct LinuxFsDigitalInput {
    handle: LinuxHandle,
    config: DigitalInputConfig,
    pin: Pin,
    listeners: Arc<Listeners<DigitalStateChange>>,
    monitor: StateMonitor,
}

impl LinuxFsDigitalInput {
    fn teardown(&self) -> Result<()> {
        self.monitor.stop();
        self.listeners.clear();
        self.pin.release()
    }
}

super::linux_io!(LinuxFsDigitalInput, DigitalInput);

impl DigitalInput for LinuxFsDigitalInput {
    fn state(&self) -> Result<DigitalState> {
        self.handle.ensure_live()?;
        self.pin.read()
    }

    fn pull(&self) -> PullResistance {
        self.config.pull
    }

    fn listeners(&self) -> &Listeners<DigitalStateChange> {
        &self.listeners
    }
}

pub struct LinuxFsDigitalInputProvider {
    identity: Identity,
    root: Root,
}

super::linux_provider!(
    LinuxFsDigitalInputProvider,
    "linuxfs-digital-input",
    "Linux sysfs Digital Input",
    super::KEY_GPIO_PATH,
    super::DEFAULT_GPIO_PATH
);

impl DigitalInputProvider for LinuxFsDigitalInputProvider {
    fn create(&self, _ctx: &Context, config: DigitalInputConfig) -> Result<Arc<dyn DigitalInput>> {
        let pin = Pin::open(&self.root(), config.address)?;
        if let Err(e) = pin.set_direction("in") {
            let _ = pin.release();
            return Err(e);
        }
        if config.pull != PullResistance::Off {
            // sysfs has no bias control; the line is biased in the device tree.
            debug!(pin = config.address, pull = %config.pull, "Pull resistance not applied");
        }

        let id = config.base.id.clone();
        let listeners = Arc::new(Listeners::new());
        let dispatch = Arc::clone(&listeners);
        let source = id.clone();
        let value_path = pin.value_path();
        let monitor = match StateMonitor::spawn(
            id.as_str(),
            POLL_INTERVAL,
            config.debounce,
            move || read_level(&value_path),
            move |state| {
                dispatch.dispatch(&DigitalStateChange {
                    source: source.clone(),
                    state,
                })
            },
        ) {
            Ok(monitor) => monitor,
            Err(e) => {
                let _ = pin.release();
                return Err(e);
            }
        };

        debug!(id = %id, pin = config.address, "GPIO input opened");
        Ok(Arc::new(LinuxFsDigitalInput {
            handle: LinuxHandle::new(config.identity(), self.identity.id()),
            config,
            pin,
            listeners,
            monitor,
        }))
    }
}

#[derive(Debug)]
pub struct LinuxFsDigitalOutput {
    handle: LinuxHandle,
    config: DigitalOutputConfig,
    pin: Pin,
    state: Mutex<DigitalState>,
    listeners: Listeners<DigitalStateChange>,
}

impl LinuxFsDigitalOutput {
    fn teardown(&self) -> Result<()> {
        if let Some(state) = self.config.shutdown {
            self.pin.write(state)?;
        }
        self.listeners.clear();
        self.pin.release()
    }
}

super::linux_io!(LinuxFsDigitalOutput, DigitalOutput);

impl DigitalOutput for LinuxFsDigitalOutput {
    fn state(&self) -> Result<DigitalState> {
        self.handle.ensure_live()?;
        Ok(*self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn set_state(&self, state: DigitalState) -> Result<()> {
        self.handle.ensure_live()?;
        let previous = {
            let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            self.pin.write(state)?;
            std::mem::replace(&mut *current, state)
        };
        if previous != state {
            self.listeners.dispatch(&DigitalStateChange {
                source: self.handle.id().to_string(),
                state,
            });
        }
        Ok(())
    }

    fn listeners(&self) -> &Listeners<DigitalStateChange> {
        &self.listeners
    }
}

pub struct LinuxFsDigitalOutputProvider {
    identity: Identity,
    root: Root,
}

super::linux_provider!(
    LinuxFsDigitalOutputProvider,
    "linuxfs-digital-output",
    "Linux sysfs Digital Output",
    super::KEY_GPIO_PATH,
    super::DEFAULT_GPIO_PATH
);

impl DigitalOutputProvider for LinuxFsDigitalOutputProvider {
    fn create(
        &self,
        _ctx: &Context,
        config: DigitalOutputConfig,
    ) -> Result<Arc<dyn DigitalOutput>> {
        let pin = Pin::open(&self.root(), config.address)?;
        // "high" and "low" set the direction and level without a glitch.
        let initial = config.initial.unwrap_or_default();
        let direction = if initial.is_high() { "high" } else { "low" };
        let opened = pin.set_direction(direction).and_then(|_| pin.write(initial));
        if let Err(e) = opened {
            let _ = pin.release();
            return Err(e);
        }

        debug!(id = %config.base.id, pin = config.address, %initial, "GPIO output opened");
        Ok(Arc::new(LinuxFsDigitalOutput {
            handle: LinuxHandle::new(config.identity(), self.identity.id()),
            config,
            pin,
            state: Mutex::new(initial),
            listeners: Listeners::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{kind, Io};
    use crate::provider::Provider;
    use crate::ContextBuilder;
    use std::fs;
    use std::sync::mpsc;
    use tempfile::TempDir;

    // A pin the "kernel" has already exported.
    fn fake_pin(root: &Path, number: u32, value: &str) {
        let node = root.join(format!("gpio{}", number));
        fs::create_dir(&node).unwrap();
        fs::write(node.join("direction"), "in").unwrap();
        fs::write(node.join("value"), value).unwrap();
    }

    fn attr(root: &Path, number: u32, name: &str) -> String {
        fs::read_to_string(root.join(format!("gpio{}", number)).join(name)).unwrap()
    }

    #[test]
    fn test_output_drives_value_file() {
        let root = TempDir::new().unwrap();
        fake_pin(root.path(), 17, "0");
        let provider = Arc::new(LinuxFsDigitalOutputProvider::with_path(root.path()));
        let ctx = ContextBuilder::new()
            .add_provider(provider.into_provider())
            .build()
            .unwrap();

        let config = DigitalOutputConfig::builder()
            .id("led")
            .address(17)
            .initial(DigitalState::High)
            .shutdown(DigitalState::Low)
            .build()
            .unwrap();
        let led = ctx.create::<kind::DigitalOutput>(config).unwrap();
        assert_eq!(attr(root.path(), 17, "direction"), "high");
        assert_eq!(attr(root.path(), 17, "value"), "1");

        led.toggle().unwrap();
        assert_eq!(attr(root.path(), 17, "value"), "0");
        led.high().unwrap();

        ctx.registry().remove("led").unwrap();
        assert!(led.is_shutdown());
        assert_eq!(attr(root.path(), 17, "value"), "0");
        // Exported before we came; left exported.
        assert!(!root.path().join("unexport").exists());
        assert!(matches!(led.high(), Err(Error::Closed { .. })));
    }

    #[test]
    fn test_input_reports_changes() {
        let root = TempDir::new().unwrap();
        fake_pin(root.path(), 4, "1");
        let ctx = ContextBuilder::new()
            .add_provider(Arc::new(LinuxFsDigitalInputProvider::with_path(root.path())).into_provider())
            .build()
            .unwrap();

        let config = DigitalInputConfig::builder()
            .id("button")
            .address(4)
            .build()
            .unwrap();
        let button = ctx.create::<kind::DigitalInput>(config).unwrap();
        assert_eq!(attr(root.path(), 4, "direction"), "in");
        assert!(button.is_high().unwrap());

        let (tx, rx) = mpsc::channel();
        button.listeners().add(move |change: &DigitalStateChange| {
            let _ = tx.send(change.clone());
        });
        // Let the monitor settle on the idle level first.
        std::thread::sleep(Duration::from_millis(50));
        fs::write(root.path().join("gpio4").join("value"), "0").unwrap();

        let change = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(change.source, "button");
        assert_eq!(change.state, DigitalState::Low);

        button.shutdown(&ctx).unwrap();
        assert!(button.listeners().is_empty());
    }

    #[test]
    fn test_missing_pin_fails_to_export() {
        let root = TempDir::new().unwrap();
        let provider = LinuxFsDigitalOutputProvider::with_path(root.path());
        assert_eq!(provider.root(), root.path());
        assert_eq!(provider.priority(), crate::linuxfs::PRIORITY);

        let ctx = ContextBuilder::new()
            .add_provider(Arc::new(provider).into_provider())
            .build()
            .unwrap();
        let config = DigitalOutputConfig::builder()
            .id("relay")
            .address(99)
            .build()
            .unwrap();
        let err = ctx.create::<kind::DigitalOutput>(config).err().unwrap();
        assert!(matches!(err, Error::Io { .. }));
        assert!(!ctx.registry().exists("relay"));
    }
}
