//! The runtime context.
//!
//! A [`Context`] owns the three shared stores (the handle [`Registry`], the
//! [`ProvidersManager`] and the [`PlatformsManager`]) together with the
//! loaded [`Properties`]. It is passed explicitly to every provider, platform
//! and handle operation; there is no process-wide default, so independent
//! contexts can coexist in one process.
//!
//! ```no_run
//! use boardio::config::DigitalOutputConfig;
//! use boardio::io::{kind, DigitalOutput};
//! use boardio::ContextBuilder;
//!
//! # fn main() -> boardio::Result<()> {
//! let ctx = ContextBuilder::new().auto_detect(true).build()?;
//! let config = DigitalOutputConfig::builder().id("led").address(17).build()?;
//! let led = ctx.create::<kind::DigitalOutput>(config)?;
//! led.toggle()?;
//! ctx.shutdown()?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::config::{IoConfig, Properties, PropertiesLoader};
use crate::error::{aggregate, Collection, Error, Result};
use crate::identity::validate_id;
use crate::io::{Io, IoKind};
use crate::platform::{Platform, PlatformsManager};
use crate::provider::{ProviderInstance, ProvidersManager};
use crate::registry::Registry;
use crate::tracing::prelude::*;

pub(crate) struct ContextInner {
    properties: Properties,
    registry: Registry,
    providers: ProvidersManager,
    platforms: PlatformsManager,
    shutdown: AtomicBool,
    shutdown_lock: Mutex<()>,
}

/// Shared handle to a running context. Clones refer to the same context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Recover a context from the back-reference held by a store.
    pub(crate) fn upgrade(weak: &Weak<ContextInner>) -> Result<Context> {
        weak.upgrade()
            .map(|inner| Context { inner })
            .ok_or(Error::ContextDropped)
    }

    pub fn properties(&self) -> &Properties {
        &self.inner.properties
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn providers(&self) -> &ProvidersManager {
        &self.inner.providers
    }

    pub fn platforms(&self) -> &PlatformsManager {
        &self.inner.platforms
    }

    /// The default platform.
    pub fn platform(&self) -> Result<Arc<dyn Platform>> {
        self.platforms().default()
    }

    /// Provider used for capability `K` when the caller names none.
    ///
    /// The default platform's provider wins when it carries one for `K`;
    /// otherwise the Providers manager's default for `K` is used.
    ///
    /// A platform slot is resolved by id through the Providers manager, so a
    /// removed provider is never handed out and a replaced one resolves to
    /// its new instance.
    pub fn provider<K: IoKind>(&self) -> Result<Arc<K::Provider>> {
        if let Ok(platform) = self.platform() {
            if let Some(attached) = platform.providers().get(K::TYPE) {
                match self.providers().get_as::<K>(attached.id()) {
                    Ok(provider) => return Ok(provider),
                    Err(e) => debug!(
                        platform = platform.id(),
                        provider = attached.id(),
                        error = %e,
                        "Platform provider no longer registered"
                    ),
                }
            }
        }
        self.providers().default_as::<K>()
    }

    /// Create and register a handle using the default provider for `K`.
    pub fn create<K: IoKind>(&self, config: K::Config) -> Result<Arc<K::Handle>> {
        let provider = self.provider::<K>()?;
        self.create_with::<K>(&provider, config)
    }

    /// Create and register a handle using `provider`.
    ///
    /// A handle whose registration fails is shut down before the error is
    /// returned, so nothing leaks outside the registry.
    pub fn create_with<K: IoKind>(
        &self,
        provider: &K::Provider,
        config: K::Config,
    ) -> Result<Arc<K::Handle>> {
        if self.is_shutdown() {
            return Err(Error::Closed {
                id: "context".to_string(),
            });
        }

        let id = validate_id(Collection::Registry, config.id())?.to_string();
        if self.registry().exists(&id) {
            return Err(Error::AlreadyExists {
                kind: Collection::Registry,
                operation: "create",
                id,
            });
        }

        let handle = K::create(provider, self, config)?;
        if let Err(e) = self.registry().add(K::into_instance(Arc::clone(&handle))) {
            if let Err(shutdown) = handle.shutdown(self) {
                warn!(id = %id, error = %shutdown, "Unregistered handle failed to shut down");
            }
            return Err(e);
        }
        debug!(id = %id, io_type = %K::TYPE, "Handle created");
        Ok(handle)
    }

    /// Shut down every handle, then every platform, then every provider.
    ///
    /// Each stage runs even when an earlier one failed; the failures are
    /// reported together. Later calls return immediately.
    pub fn shutdown(&self) -> Result<()> {
        let _guard = self
            .inner
            .shutdown_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Ok(());
        }
        info!("Shutting down context");

        let mut failures = Vec::new();
        let stages: [(&str, Result<()>); 3] = [
            ("registry", self.registry().shutdown()),
            ("platforms", self.platforms().shutdown()),
            ("providers", self.providers().terminate()),
        ];
        for (stage, outcome) in stages {
            if let Err(e) = outcome {
                warn!(stage, error = %e, "Shutdown stage failed");
                failures.push(e);
            }
        }

        self.inner.shutdown.store(true, Ordering::Release);
        aggregate("context shutdown", failures)
    }

    /// [`Context::shutdown`] on the blocking thread pool.
    pub async fn shutdown_async(&self) -> Result<()> {
        let ctx = self.clone();
        tokio::task::spawn_blocking(move || ctx.shutdown())
            .await
            .map_err(|e| Error::io("context shutdown", io::Error::other(e)))?
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("handles", &self.registry().len())
            .field("providers", &self.providers().len())
            .field("platforms", &self.platforms().len())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// Assembles a [`Context`].
///
/// Providers are initialized before platforms so that platforms can attach
/// them. Auto-detection is off unless requested.
#[derive(Default)]
pub struct ContextBuilder {
    properties: Properties,
    overrides: Vec<(String, String)>,
    auto_detect: bool,
    providers: Vec<ProviderInstance>,
    platforms: Vec<Arc<dyn Platform>>,
    default_platform: Option<String>,
    default_providers: Vec<String>,
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from the standard layered property sources.
    pub fn standard() -> Result<Self> {
        Ok(Self::new().properties(PropertiesLoader::standard().load()?))
    }

    /// Merge `properties` over those already set.
    pub fn properties(mut self, properties: Properties) -> Self {
        self.properties = self.properties.merged(&properties);
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.overrides.push((key.into(), value.to_string()));
        self
    }

    /// Also add every provider and platform registered through inventory.
    pub fn auto_detect(mut self, enabled: bool) -> Self {
        self.auto_detect = enabled;
        self
    }

    pub fn add_provider(mut self, provider: ProviderInstance) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn add_providers(mut self, providers: impl IntoIterator<Item = ProviderInstance>) -> Self {
        self.providers.extend(providers);
        self
    }

    pub fn add_platform(mut self, platform: Arc<dyn Platform>) -> Self {
        self.platforms.push(platform);
        self
    }

    /// Pin the default platform by id or type name.
    pub fn default_platform(mut self, key: impl Into<String>) -> Self {
        self.default_platform = Some(key.into());
        self
    }

    /// Pin a provider as the default for its type.
    pub fn default_provider(mut self, id: impl Into<String>) -> Self {
        self.default_providers.push(id.into());
        self
    }

    pub fn build(self) -> Result<Context> {
        let properties: Properties = self
            .properties
            .merged(&self.overrides.into_iter().collect());

        let inner = Arc::new_cyclic(|weak: &Weak<ContextInner>| ContextInner {
            properties,
            registry: Registry::new(weak.clone()),
            providers: ProvidersManager::new(weak.clone()),
            platforms: PlatformsManager::new(weak.clone()),
            shutdown: AtomicBool::new(false),
            shutdown_lock: Mutex::new(()),
        });
        let ctx = Context { inner };

        ctx.providers().initialize(self.auto_detect, self.providers);
        ctx.platforms().initialize(self.auto_detect, self.platforms);

        for id in &self.default_providers {
            ctx.providers().set_default(id)?;
        }
        if let Some(key) = &self.default_platform {
            ctx.platforms().set_default(key)?;
        }

        info!(
            providers = ctx.providers().len(),
            platforms = ctx.platforms().len(),
            "Context ready"
        );
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DigitalOutputConfig, I2cConfig};
    use crate::io::digital::DigitalState;
    use crate::io::{kind, IoType};
    use crate::mock::{MockDigitalOutputProvider, MockI2cProvider, MockPlatform};
    use crate::provider::{DigitalOutputProvider, I2cProvider};

    fn led_config(id: &str) -> DigitalOutputConfig {
        DigitalOutputConfig::builder()
            .id(id)
            .address(4)
            .build()
            .unwrap()
    }

    #[test]
    fn test_contexts_are_independent() {
        let a = ContextBuilder::new()
            .add_provider(Arc::new(MockDigitalOutputProvider::new()).into_provider())
            .build()
            .unwrap();
        let b = ContextBuilder::new()
            .add_provider(Arc::new(MockDigitalOutputProvider::new()).into_provider())
            .build()
            .unwrap();

        a.create::<kind::DigitalOutput>(led_config("led")).unwrap();
        b.create::<kind::DigitalOutput>(led_config("led")).unwrap();
        assert_eq!(a.registry().len(), 1);
        assert_eq!(b.registry().len(), 1);
    }

    #[test]
    fn test_properties_and_overrides() {
        let base: Properties = [("i2c.bus", "1"), ("name", "base")].into_iter().collect();
        let ctx = ContextBuilder::new()
            .properties(base)
            .property("name", "override")
            .build()
            .unwrap();
        assert_eq!(ctx.properties().get("i2c.bus"), Some("1"));
        assert_eq!(ctx.properties().get("name"), Some("override"));
    }

    #[test]
    fn test_create_without_provider() {
        let ctx = ContextBuilder::new().build().unwrap();
        let err = ctx
            .create::<kind::DigitalOutput>(led_config("led"))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            Error::NotFoundForType {
                io_type: IoType::DigitalOutput,
                ..
            }
        ));
    }

    #[test]
    fn test_create_rejects_duplicate_id() {
        let ctx = ContextBuilder::new()
            .add_provider(Arc::new(MockDigitalOutputProvider::new()).into_provider())
            .build()
            .unwrap();
        let first = ctx.create::<kind::DigitalOutput>(led_config("led")).unwrap();
        let err = ctx
            .create::<kind::DigitalOutput>(led_config("led"))
            .err()
            .unwrap();
        assert!(matches!(err, Error::AlreadyExists { .. }));
        assert!(!first.is_shutdown());
        assert_eq!(ctx.registry().len(), 1);
    }

    #[test]
    fn test_default_platform_provider_wins() {
        let low = Arc::new(
            MockDigitalOutputProvider::new()
                .with_id("platform-out")
                .with_priority(0),
        );
        let high = Arc::new(
            MockDigitalOutputProvider::new()
                .with_id("global-out")
                .with_priority(100),
        );
        let ctx = ContextBuilder::new()
            .add_provider(low.into_provider())
            .add_provider(high.into_provider())
            .add_platform(Arc::new(
                MockPlatform::new("board", 1).with_provider_ids(["platform-out"]),
            ))
            .build()
            .unwrap();

        let led = ctx.create::<kind::DigitalOutput>(led_config("led")).unwrap();
        assert_eq!(led.provider_id(), "platform-out");

        assert_eq!(
            ctx.provider::<kind::DigitalOutput>().unwrap().id(),
            "platform-out"
        );

        // Without a carrying platform the manager default applies.
        ctx.platforms().remove("board").unwrap();
        assert_eq!(
            ctx.provider::<kind::DigitalOutput>().unwrap().id(),
            "global-out"
        );
    }

    fn board_context(provider: Arc<MockDigitalOutputProvider>) -> Context {
        ContextBuilder::new()
            .add_provider(provider.into_provider())
            .add_platform(Arc::new(MockPlatform::new("board", 1).with_mock_providers()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_removed_platform_provider_not_used() {
        let ctx = board_context(Arc::new(MockDigitalOutputProvider::new()));
        assert!(ctx.platform().unwrap().provider_as::<kind::DigitalOutput>().is_some());

        ctx.providers().remove("mock-digital-output").unwrap();
        assert!(ctx.providers().is_empty());

        let err = ctx
            .create::<kind::DigitalOutput>(led_config("led"))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            Error::NotFoundForType {
                io_type: IoType::DigitalOutput,
                ..
            }
        ));
        assert!(!ctx.registry().exists("led"));
    }

    #[test]
    fn test_replaced_platform_provider_resolves_new_instance() {
        let original = Arc::new(MockDigitalOutputProvider::new());
        let ctx = board_context(original.clone());

        let fresh = Arc::new(MockDigitalOutputProvider::new().with_priority(7));
        ctx.providers()
            .replace(fresh.clone().into_provider())
            .unwrap();
        assert_eq!(ctx.provider::<kind::DigitalOutput>().unwrap().priority(), 7);

        ctx.create::<kind::DigitalOutput>(led_config("led")).unwrap();
        assert!(fresh.output(4).is_some());
        assert!(original.output(4).is_none());
    }

    #[test]
    fn test_builder_pins_defaults() {
        let ctx = ContextBuilder::new()
            .add_provider(
                Arc::new(MockDigitalOutputProvider::new().with_id("a").with_priority(1))
                    .into_provider(),
            )
            .add_provider(
                Arc::new(MockDigitalOutputProvider::new().with_id("b").with_priority(9))
                    .into_provider(),
            )
            .add_platform(Arc::new(MockPlatform::new("light", 1)))
            .add_platform(Arc::new(MockPlatform::new("heavy", 5)))
            .default_provider("a")
            .default_platform("light")
            .build()
            .unwrap();

        assert_eq!(ctx.provider::<kind::DigitalOutput>().unwrap().id(), "a");
        assert_eq!(ctx.platform().unwrap().id(), "light");

        let missing = ContextBuilder::new().default_provider("ghost").build();
        assert!(matches!(missing, Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_shutdown_order_and_idempotence() {
        let ctx = ContextBuilder::new()
            .add_provider(Arc::new(MockDigitalOutputProvider::new()).into_provider())
            .add_provider(Arc::new(MockI2cProvider::new()).into_provider())
            .add_platform(Arc::new(MockPlatform::new("board", 1)))
            .build()
            .unwrap();

        let led = ctx.create::<kind::DigitalOutput>(led_config("led")).unwrap();
        led.set_state(DigitalState::High).unwrap();
        let i2c_config = I2cConfig::builder()
            .id("sensor")
            .bus(1)
            .device(0x48)
            .build()
            .unwrap();
        let sensor = ctx.create::<kind::I2c>(i2c_config).unwrap();

        ctx.shutdown().unwrap();
        assert!(ctx.is_shutdown());
        assert!(led.is_shutdown());
        assert!(sensor.is_shutdown());
        assert!(ctx.registry().is_empty());
        assert!(ctx.platforms().is_empty());
        assert!(ctx.providers().is_empty());

        ctx.shutdown().unwrap();
        assert!(ctx
            .create::<kind::DigitalOutput>(led_config("late"))
            .is_err());
    }

    #[test]
    fn test_store_outlives_context() {
        let ctx = ContextBuilder::new()
            .add_provider(Arc::new(MockDigitalOutputProvider::new()).into_provider())
            .build()
            .unwrap();
        let provider = ctx.providers().get("mock-digital-output").unwrap();
        drop(ctx);
        // The provider is still usable as a value after its context is gone.
        assert_eq!(provider.io_type(), IoType::DigitalOutput);
    }

    #[tokio::test]
    async fn test_shutdown_async() {
        let ctx = ContextBuilder::new()
            .add_provider(Arc::new(MockDigitalOutputProvider::new()).into_provider())
            .build()
            .unwrap();
        let led = ctx.create::<kind::DigitalOutput>(led_config("led")).unwrap();

        ctx.shutdown_async().await.unwrap();
        assert!(led.is_shutdown());
        assert!(ctx.is_shutdown());
    }
}
