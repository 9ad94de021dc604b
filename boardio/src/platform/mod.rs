//! Platforms: named bundles of providers describing one board profile.
//!
//! A platform lists the provider ids it wants. During
//! [`Platform::initialize`] those ids are resolved through the context's
//! Providers manager and attached, at most one per [`IoType`].

pub mod manager;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::context::Context;
use crate::error::Result;
use crate::identity::Identity;
use crate::io::{IoKind, IoType};
use crate::provider::ProviderInstance;
use crate::tracing::prelude::*;

pub use manager::PlatformsManager;

pub trait Platform: Send + Sync + 'static {
    fn identity(&self) -> &Identity;

    fn id(&self) -> &str {
        self.identity().id()
    }

    fn name(&self) -> String {
        self.identity().name()
    }

    /// Larger weights win default-platform selection.
    fn weight(&self) -> i32 {
        0
    }

    /// Whether this platform applies to the running system.
    fn enabled(&self, _ctx: &Context) -> bool {
        true
    }

    /// Ids of the providers this platform bundles.
    fn provider_ids(&self) -> Vec<String>;

    fn providers(&self) -> &PlatformProviders;

    /// Resolve and attach [`Platform::provider_ids`]. Ids not present in
    /// the context are skipped.
    fn initialize(&self, ctx: &Context) -> Result<()> {
        for id in self.provider_ids() {
            match ctx.providers().get(&id) {
                Ok(provider) => {
                    if let Some(previous) = self.providers().attach(provider) {
                        debug!(
                            platform = self.id(),
                            replaced = previous.id(),
                            "Provider slot reassigned"
                        );
                    }
                }
                Err(e) => {
                    debug!(platform = self.id(), provider = %id, error = %e, "Provider unavailable");
                }
            }
        }
        Ok(())
    }

    fn shutdown(&self, _ctx: &Context) -> Result<()> {
        self.providers().clear();
        Ok(())
    }

    /// Fully qualified Rust type name, used as a fallback lookup key.
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

impl dyn Platform {
    /// The attached provider for capability `K`, if any.
    pub fn provider_as<K: IoKind>(&self) -> Option<Arc<K::Provider>> {
        self.providers()
            .get(K::TYPE)
            .and_then(K::from_provider_instance)
    }

    /// Whether `key` names this platform by id, full type name, or the last
    /// segment of the type name.
    pub fn matches(&self, key: &str) -> bool {
        let type_name = self.type_name();
        self.id() == key
            || type_name == key
            || type_name.rsplit("::").next() == Some(key)
    }
}

/// Providers attached to a platform, one per [`IoType`].
#[derive(Default)]
pub struct PlatformProviders {
    slots: RwLock<HashMap<IoType, ProviderInstance>>,
}

impl PlatformProviders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `provider` to its type's slot, returning the provider it
    /// displaced.
    pub fn attach(&self, provider: ProviderInstance) -> Option<ProviderInstance> {
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(provider.io_type(), provider)
    }

    pub fn detach(&self, io_type: IoType) -> Option<ProviderInstance> {
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&io_type)
    }

    pub fn get(&self, io_type: IoType) -> Option<ProviderInstance> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&io_type)
            .cloned()
    }

    pub fn all(&self) -> Vec<ProviderInstance> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        let mut providers: Vec<ProviderInstance> = slots.values().cloned().collect();
        providers.sort_by_key(|p| p.io_type());
        providers
    }

    pub fn clear(&self) {
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Factory for a platform discovered at link time.
pub type PlatformFactoryFn = fn() -> Arc<dyn Platform>;

/// Platform descriptor collected by inventory.
pub struct PlatformDescriptor {
    pub id: &'static str,
    pub create_fn: PlatformFactoryFn,
}

inventory::collect!(PlatformDescriptor);

/// Every platform registered through inventory.
pub fn discovered() -> impl Iterator<Item = &'static PlatformDescriptor> {
    inventory::iter::<PlatformDescriptor>().into_iter()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::kind;
    use crate::mock::{MockDigitalOutputProvider, MockI2cProvider, MockPlatform};
    use crate::provider::{DigitalOutputProvider, I2cProvider};
    use crate::ContextBuilder;

    #[test]
    fn test_one_provider_per_type() {
        let slots = PlatformProviders::new();
        let first = Arc::new(MockDigitalOutputProvider::new().with_id("a")).into_provider();
        let second = Arc::new(MockDigitalOutputProvider::new().with_id("b")).into_provider();

        assert!(slots.attach(first).is_none());
        let displaced = slots.attach(second).unwrap();
        assert_eq!(displaced.id(), "a");
        assert_eq!(slots.len(), 1);
        assert_eq!(slots.get(IoType::DigitalOutput).unwrap().id(), "b");
        assert!(slots.detach(IoType::DigitalOutput).is_some());
        assert!(slots.is_empty());
    }

    #[test]
    fn test_initialize_attaches_known_providers() {
        let ctx = ContextBuilder::new()
            .add_provider(Arc::new(MockI2cProvider::new()).into_provider())
            .build()
            .unwrap();

        let platform: Arc<dyn Platform> = Arc::new(
            MockPlatform::new("board", 1)
                .with_provider_ids(["mock-i2c", "not-registered"]),
        );
        platform.initialize(&ctx).unwrap();

        assert!(platform.provider_as::<kind::I2c>().is_some());
        assert!(platform.provider_as::<kind::Spi>().is_none());
        assert_eq!(platform.providers().len(), 1);

        platform.shutdown(&ctx).unwrap();
        assert!(platform.providers().is_empty());
    }

    #[test]
    fn test_matches_by_type_name() {
        let platform: Arc<dyn Platform> = Arc::new(MockPlatform::new("board", 1));
        assert!(platform.matches("board"));
        assert!(platform.matches("MockPlatform"));
        assert!(platform.matches(platform.type_name()));
        assert!(!platform.matches("Other"));
    }
}
