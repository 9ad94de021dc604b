use crate::context::Context;
use crate::identity::Identity;
use crate::platform::{Platform, PlatformProviders};

/// Platform with a fixed weight and enablement, bundling providers by id.
pub struct MockPlatform {
    identity: Identity,
    weight: i32,
    enabled: bool,
    provider_ids: Vec<String>,
    providers: PlatformProviders,
}

impl MockPlatform {
    pub fn new(id: &str, weight: i32) -> Self {
        Self {
            identity: Identity::new(id, id, "In-memory mock platform"),
            weight,
            enabled: true,
            provider_ids: Vec::new(),
            providers: PlatformProviders::new(),
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_provider_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.provider_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Bundle every provider returned by [`super::providers`].
    pub fn with_mock_providers(self) -> Self {
        self.with_provider_ids(super::PROVIDER_IDS)
    }
}

impl Platform for MockPlatform {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn weight(&self) -> i32 {
        self.weight
    }

    fn enabled(&self, _ctx: &Context) -> bool {
        self.enabled
    }

    fn provider_ids(&self) -> Vec<String> {
        self.provider_ids.clone()
    }

    fn providers(&self) -> &PlatformProviders {
        &self.providers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::IoType;
    use crate::ContextBuilder;
    use std::sync::Arc;
    use strum::IntoEnumIterator;

    #[test]
    fn test_mock_platform_bundles_every_type() {
        let ctx = ContextBuilder::new()
            .add_providers(crate::mock::providers())
            .add_platform(Arc::new(MockPlatform::new("mock", 0).with_mock_providers()))
            .build()
            .unwrap();

        let platform = ctx.platform().unwrap();
        assert_eq!(platform.id(), "mock");
        for io_type in IoType::iter() {
            assert!(platform.providers().get(io_type).is_some());
        }
    }
}
