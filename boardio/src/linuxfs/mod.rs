//! Linux backends reached through the filesystem.
//!
//! - [`gpio`]: sysfs GPIO (`/sys/class/gpio`) digital inputs and outputs.
//! - [`pwm`]: sysfs PWM (`/sys/class/pwm/pwmchip0`).
//! - [`i2c`]: i2c-dev character devices (`/dev/i2c-N`) driven by ioctl.
//!
//! Every provider and the [`LinuxFsPlatform`] bundling them are submitted to
//! inventory, so auto-detection finds them. Roots default to the standard
//! kernel paths and can be moved with the `linux.gpio.path`,
//! `linux.pwm.path` and `linux.i2c.path` properties.

pub mod gpio;
pub mod i2c;
pub mod pwm;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::thread;
use std::time::Duration;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::platform::{Platform, PlatformDescriptor, PlatformProviders};
use crate::tracing::prelude::*;

pub use gpio::{LinuxFsDigitalInputProvider, LinuxFsDigitalOutputProvider};
pub use i2c::LinuxFsI2cProvider;
pub use pwm::LinuxFsPwmProvider;

pub const KEY_GPIO_PATH: &str = "linux.gpio.path";
pub const KEY_PWM_PATH: &str = "linux.pwm.path";
pub const KEY_I2C_PATH: &str = "linux.i2c.path";

pub const DEFAULT_GPIO_PATH: &str = "/sys/class/gpio";
pub const DEFAULT_PWM_PATH: &str = "/sys/class/pwm/pwmchip0";
pub const DEFAULT_I2C_PATH: &str = "/dev";

/// Priority of the Linux providers; above the mocks.
pub const PRIORITY: i32 = 50;

// Time the kernel (and udev rules fixing permissions) get to populate an
// exported node.
const EXPORT_POLL: Duration = Duration::from_millis(10);
const EXPORT_ATTEMPTS: usize = 20;

/// Read a sysfs attribute, trimmed.
pub(crate) fn read_attr(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map(|value| value.trim().to_string())
        .map_err(|e| Error::io(path, e))
}

pub(crate) fn write_attr(path: &Path, value: impl AsRef<[u8]>) -> Result<()> {
    fs::write(path, value).map_err(|e| Error::io(path, e))
}

/// Export `index` under `root` unless `node` already exists, waiting for
/// `probe` inside the node to appear. Returns whether this call exported it.
pub(crate) fn export(root: &Path, index: u32, node: &Path, probe: &str) -> Result<bool> {
    if node.exists() {
        return Ok(false);
    }

    write_attr(&root.join("export"), index.to_string())?;
    let probe = node.join(probe);
    for _ in 0..EXPORT_ATTEMPTS {
        if probe.exists() {
            debug!(node = %node.display(), "Exported");
            return Ok(true);
        }
        thread::sleep(EXPORT_POLL);
    }
    Err(Error::io(
        probe,
        io::Error::new(io::ErrorKind::NotFound, "exported node did not appear"),
    ))
}

pub(crate) fn unexport(root: &Path, index: u32) -> Result<()> {
    write_attr(&root.join("unexport"), index.to_string())
}

/// Filesystem root a provider works under, replaceable from properties at
/// initialization.
#[derive(Debug)]
pub(crate) struct Root {
    key: &'static str,
    path: RwLock<PathBuf>,
    pinned: bool,
}

impl Root {
    fn new(key: &'static str, default: &str) -> Self {
        Self {
            key,
            path: RwLock::new(PathBuf::from(default)),
            pinned: false,
        }
    }

    // A root set explicitly is never replaced by properties.
    fn pinned(key: &'static str, path: PathBuf) -> Self {
        Self {
            key,
            path: RwLock::new(path),
            pinned: true,
        }
    }

    fn configure(&self, ctx: &Context) {
        if self.pinned {
            return;
        }
        if let Some(path) = ctx.properties().get(self.key) {
            *self.path.write().unwrap_or_else(PoisonError::into_inner) = PathBuf::from(path);
        }
    }

    pub(crate) fn get(&self) -> PathBuf {
        self.path
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Builder methods and `Provider` impl shared by the Linux providers. The
/// provider struct must have `identity: Identity` and `root: Root` fields.
macro_rules! linux_provider {
    ($provider:ident, $id:expr, $name:expr, $key:expr, $default:expr) => {
        impl $provider {
            pub const ID: &'static str = $id;

            pub fn new() -> Self {
                Self {
                    identity: Identity::new($id, $name, "Linux filesystem backend"),
                    root: Root::new($key, $default),
                }
            }

            /// Work under `path` instead of the configured root.
            pub fn with_path(path: impl Into<PathBuf>) -> Self {
                Self {
                    identity: Identity::new($id, $name, "Linux filesystem backend"),
                    root: Root::pinned($key, path.into()),
                }
            }

            pub fn root(&self) -> PathBuf {
                self.root.get()
            }
        }

        impl Default for $provider {
            fn default() -> Self {
                Self::new()
            }
        }

        impl crate::provider::Provider for $provider {
            fn identity(&self) -> &Identity {
                &self.identity
            }

            fn priority(&self) -> i32 {
                crate::linuxfs::PRIORITY
            }

            fn initialize(&self, ctx: &Context) -> Result<()> {
                self.root.configure(ctx);
                debug!(provider = $id, root = %self.root().display(), "Provider initialized");
                Ok(())
            }
        }

        inventory::submit! {
            crate::provider::ProviderDescriptor {
                id: $id,
                create_fn: || std::sync::Arc::new($provider::new()).into_provider(),
            }
        }
    };
}
pub(crate) use linux_provider;

/// State every Linux handle carries.
#[derive(Debug)]
pub(crate) struct LinuxHandle {
    identity: Identity,
    provider_id: String,
    shutdown: crate::io::ShutdownState,
}

impl LinuxHandle {
    pub(crate) fn new(identity: Identity, provider_id: &str) -> Self {
        Self {
            identity,
            provider_id: provider_id.to_string(),
            shutdown: crate::io::ShutdownState::new(),
        }
    }

    pub(crate) fn id(&self) -> &str {
        self.identity.id()
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.shutdown.is_shutdown() {
            return Err(Error::Closed {
                id: self.id().to_string(),
            });
        }
        Ok(())
    }
}

/// `Io` impl for a handle with a `handle: LinuxHandle` field and an inherent
/// `teardown(&self) -> Result<()>`.
macro_rules! linux_io {
    ($handle:ident, $io_type:ident) => {
        impl crate::io::Io for $handle {
            fn identity(&self) -> &Identity {
                &self.handle.identity
            }

            fn io_type(&self) -> crate::io::IoType {
                crate::io::IoType::$io_type
            }

            fn provider_id(&self) -> &str {
                &self.handle.provider_id
            }

            fn shutdown(&self, _ctx: &Context) -> Result<()> {
                self.handle.shutdown.run(|| self.teardown())
            }

            fn is_shutdown(&self) -> bool {
                self.handle.shutdown.is_shutdown()
            }
        }
    };
}
pub(crate) use linux_io;

/// Bundles the Linux providers. Enabled when the GPIO sysfs root exists.
pub struct LinuxFsPlatform {
    identity: Identity,
    providers: PlatformProviders,
}

impl LinuxFsPlatform {
    pub const ID: &'static str = "linuxfs";

    pub fn new() -> Self {
        Self {
            identity: Identity::new(Self::ID, "Linux FS", "sysfs GPIO and PWM, i2c-dev I2C"),
            providers: PlatformProviders::new(),
        }
    }
}

impl Default for LinuxFsPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for LinuxFsPlatform {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn weight(&self) -> i32 {
        10
    }

    fn enabled(&self, ctx: &Context) -> bool {
        let root = ctx
            .properties()
            .get(KEY_GPIO_PATH)
            .unwrap_or(DEFAULT_GPIO_PATH);
        Path::new(root).is_dir()
    }

    fn provider_ids(&self) -> Vec<String> {
        [
            LinuxFsDigitalInputProvider::ID,
            LinuxFsDigitalOutputProvider::ID,
            LinuxFsPwmProvider::ID,
            LinuxFsI2cProvider::ID,
        ]
        .iter()
        .map(|id| id.to_string())
        .collect()
    }

    fn providers(&self) -> &PlatformProviders {
        &self.providers
    }
}

inventory::submit! {
    PlatformDescriptor {
        id: LinuxFsPlatform::ID,
        create_fn: || std::sync::Arc::new(LinuxFsPlatform::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ContextBuilder;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_export_skipped_when_present() {
        let root = TempDir::new().unwrap();
        let node = root.path().join("gpio4");
        fs::create_dir(&node).unwrap();

        assert!(!export(root.path(), 4, &node, "value").unwrap());
        assert!(!root.path().join("export").exists());
    }

    #[test]
    fn test_export_times_out_without_kernel() {
        let root = TempDir::new().unwrap();
        let node = root.path().join("gpio4");

        let err = export(root.path(), 4, &node, "value").unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
        assert_eq!(read_attr(&root.path().join("export")).unwrap(), "4");
    }

    #[test]
    fn test_platform_enabled_by_gpio_root() {
        let root = TempDir::new().unwrap();
        let present = ContextBuilder::new()
            .property(KEY_GPIO_PATH, root.path().display())
            .build()
            .unwrap();
        let missing = ContextBuilder::new()
            .property(KEY_GPIO_PATH, root.path().join("absent").display())
            .build()
            .unwrap();

        let platform: Arc<dyn Platform> = Arc::new(LinuxFsPlatform::new());
        assert!(platform.enabled(&present));
        assert!(!platform.enabled(&missing));
        assert_eq!(platform.provider_ids().len(), 4);
    }

    #[test]
    fn test_root_follows_properties_unless_pinned() {
        let ctx = ContextBuilder::new()
            .property(KEY_GPIO_PATH, "/tmp/fake-gpio")
            .build()
            .unwrap();

        let configurable = Root::new(KEY_GPIO_PATH, DEFAULT_GPIO_PATH);
        configurable.configure(&ctx);
        assert_eq!(configurable.get(), PathBuf::from("/tmp/fake-gpio"));

        let pinned = Root::pinned(KEY_GPIO_PATH, PathBuf::from("/srv/gpio"));
        pinned.configure(&ctx);
        assert_eq!(pinned.get(), PathBuf::from("/srv/gpio"));
    }

    #[test]
    fn test_discovery_lists_linux_backends() {
        let ids: Vec<&str> = crate::provider::discovered().map(|d| d.id).collect();
        assert!(ids.contains(&LinuxFsI2cProvider::ID));
        assert!(ids.contains(&LinuxFsPwmProvider::ID));
        assert!(crate::platform::discovered().any(|d| d.id == LinuxFsPlatform::ID));
    }
}
