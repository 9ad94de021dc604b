//! The Platforms manager.
//!
//! Default selection is weight based. Platforms are considered in
//! registration order and only while enabled; the first enabled platform
//! becomes the default, and a later one replaces it only with a strictly
//! greater weight. [`PlatformsManager::set_default`] pins the choice.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use super::{discovered, Platform};
use crate::context::{Context, ContextInner};
use crate::error::{aggregate, Collection, Error, Result};
use crate::identity::validate_id;
use crate::tracing::prelude::*;

const KIND: Collection = Collection::Platforms;

struct Entry {
    seq: u64,
    platform: Arc<dyn Platform>,
}

#[derive(Debug, Clone)]
struct DefaultSlot {
    id: String,
    pinned: bool,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    default: Option<DefaultSlot>,
    next_seq: u64,
}

impl State {
    fn ordered(&self) -> Vec<&Entry> {
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries
    }

    // Id of the entry matching `key` by id, or failing that by type name.
    fn resolve(&self, key: &str) -> Option<String> {
        if self.entries.contains_key(key) {
            return Some(key.to_string());
        }
        self.ordered()
            .into_iter()
            .find(|entry| entry.platform.matches(key))
            .map(|entry| entry.platform.id().to_string())
    }

    fn default_weight(&self) -> Option<i32> {
        self.default
            .as_ref()
            .and_then(|slot| self.entries.get(&slot.id))
            .map(|entry| entry.platform.weight())
    }

    // Re-derive the default among the platforms whose id is in `enabled`.
    fn recompute_default(&mut self, enabled: &HashSet<String>) {
        if let Some(slot) = &self.default {
            if slot.pinned && self.entries.contains_key(&slot.id) {
                return;
            }
        }

        let mut best: Option<(&Entry, i32)> = None;
        for entry in self.ordered() {
            if !enabled.contains(entry.platform.id()) {
                continue;
            }
            let weight = entry.platform.weight();
            if best.map_or(true, |(_, w)| weight > w) {
                best = Some((entry, weight));
            }
        }

        self.default = best.map(|(entry, _)| DefaultSlot {
            id: entry.platform.id().to_string(),
            pinned: false,
        });
        if let Some(slot) = &self.default {
            debug!(platform = %slot.id, "Default platform recomputed");
        }
    }
}

pub struct PlatformsManager {
    context: Weak<ContextInner>,
    mutation: Mutex<()>,
    state: RwLock<State>,
}

impl PlatformsManager {
    pub(crate) fn new(context: Weak<ContextInner>) -> Self {
        Self {
            context,
            mutation: Mutex::new(()),
            state: RwLock::new(State::default()),
        }
    }

    fn context(&self) -> Result<Context> {
        Context::upgrade(&self.context)
    }

    /// Add discovered platforms (when `auto_detect` is set) and then
    /// `explicit` ones, skipping any that fail. Returns how many were added.
    pub fn initialize(&self, auto_detect: bool, explicit: Vec<Arc<dyn Platform>>) -> usize {
        let mut candidates = Vec::new();
        if auto_detect {
            for descriptor in discovered() {
                trace!(platform = descriptor.id, "Discovered platform");
                candidates.push((descriptor.create_fn)());
            }
        }
        candidates.extend(explicit);

        let mut added = 0;
        for platform in candidates {
            let id = platform.id().to_string();
            match self.add(platform) {
                Ok(()) => added += 1,
                Err(e) => warn!(platform = %id, error = %e, "Skipping platform"),
            }
        }
        info!(count = added, "Platforms initialized");
        added
    }

    pub fn add(&self, platform: Arc<dyn Platform>) -> Result<()> {
        let id = validate_id(KIND, platform.id())?.to_string();
        let ctx = self.context()?;
        let _guard = self.mutation.lock().unwrap_or_else(PoisonError::into_inner);

        if self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .contains_key(&id)
        {
            return Err(Error::AlreadyExists {
                kind: KIND,
                operation: "add",
                id,
            });
        }

        platform
            .initialize(&ctx)
            .map_err(|e| Error::InitializeFailed {
                id: id.clone(),
                source: Box::new(e),
            })?;

        let enabled = platform.enabled(&ctx);
        let weight = platform.weight();
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(id.clone(), Entry { seq, platform });
        debug!(platform = %id, weight, enabled, "Platform added");

        let pinned = state.default.as_ref().is_some_and(|slot| slot.pinned);
        if enabled && !pinned && state.default_weight().map_or(true, |w| weight > w) {
            info!(platform = %id, weight, "Default platform selected");
            state.default = Some(DefaultSlot { id, pinned: false });
        }
        Ok(())
    }

    /// Look up a platform by id, falling back to its type name.
    pub fn get(&self, key: &str) -> Result<Arc<dyn Platform>> {
        let key = validate_id(KIND, key)?;
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .resolve(key)
            .and_then(|id| state.entries.get(&id))
            .map(|entry| Arc::clone(&entry.platform))
            .ok_or_else(|| Error::NotFound {
                kind: KIND,
                operation: "get",
                id: key.to_string(),
            })
    }

    pub fn exists(&self, key: &str) -> bool {
        self.get(key).is_ok()
    }

    /// Every platform, in registration order.
    pub fn all(&self) -> Vec<Arc<dyn Platform>> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ordered()
            .into_iter()
            .map(|entry| Arc::clone(&entry.platform))
            .collect()
    }

    /// Shut down and delete a platform. The entry is deleted even when its
    /// shutdown fails.
    pub fn remove(&self, key: &str) -> Result<Arc<dyn Platform>> {
        let key = validate_id(KIND, key)?;
        let ctx = self.context()?;
        let _guard = self.mutation.lock().unwrap_or_else(PoisonError::into_inner);

        let (id, remaining) = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            let id = state.resolve(key).ok_or_else(|| Error::NotFound {
                kind: KIND,
                operation: "remove",
                id: key.to_string(),
            })?;
            let remaining: Vec<Arc<dyn Platform>> = state
                .ordered()
                .into_iter()
                .filter(|entry| entry.platform.id() != id)
                .map(|entry| Arc::clone(&entry.platform))
                .collect();
            (id, remaining)
        };
        // `enabled` may read this manager, so it runs outside the state lock.
        let enabled: HashSet<String> = remaining
            .iter()
            .filter(|platform| platform.enabled(&ctx))
            .map(|platform| platform.id().to_string())
            .collect();

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let platform = match state.entries.remove(&id) {
            Some(entry) => entry.platform,
            None => {
                return Err(Error::NotFound {
                    kind: KIND,
                    operation: "remove",
                    id,
                })
            }
        };
        if state.default.as_ref().is_some_and(|slot| slot.id == id) {
            state.default = None;
            state.recompute_default(&enabled);
        }
        drop(state);
        debug!(platform = %id, "Platform removed");

        platform
            .shutdown(&ctx)
            .map_err(|e| Error::TerminateFailed {
                id,
                source: Box::new(e),
            })?;
        Ok(platform)
    }

    /// The current default platform.
    pub fn default(&self) -> Result<Arc<dyn Platform>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .default
            .as_ref()
            .and_then(|slot| state.entries.get(&slot.id))
            .map(|entry| Arc::clone(&entry.platform))
            .ok_or(Error::NoDefault { kind: KIND })
    }

    /// Pin the platform named by `key` as the default.
    pub fn set_default(&self, key: &str) -> Result<()> {
        let key = validate_id(KIND, key)?;
        let _guard = self.mutation.lock().unwrap_or_else(PoisonError::into_inner);
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let id = state.resolve(key).ok_or_else(|| Error::NotFound {
            kind: KIND,
            operation: "set default",
            id: key.to_string(),
        })?;
        info!(platform = %id, "Default platform pinned");
        state.default = Some(DefaultSlot { id, pinned: true });
        Ok(())
    }

    /// Shut down every platform and clear the manager, continuing past
    /// failures.
    pub fn shutdown(&self) -> Result<()> {
        let ctx = self.context()?;
        let _guard = self.mutation.lock().unwrap_or_else(PoisonError::into_inner);

        let platforms: Vec<Arc<dyn Platform>> = self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ordered()
            .into_iter()
            .map(|entry| Arc::clone(&entry.platform))
            .collect();

        let mut failures = Vec::new();
        for platform in platforms.iter().rev() {
            if let Err(e) = platform.shutdown(&ctx) {
                warn!(platform = platform.id(), error = %e, "Platform failed to shut down");
                failures.push(Error::TerminateFailed {
                    id: platform.id().to_string(),
                    source: Box::new(e),
                });
            }
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.entries.clear();
        state.default = None;
        drop(state);

        aggregate("platform shutdown", failures)
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::mock::MockPlatform;
    use crate::platform::PlatformProviders;
    use crate::ContextBuilder;

    // Enabled only while a platform named "anchor" is registered.
    struct Companion {
        identity: Identity,
        providers: PlatformProviders,
    }

    impl Platform for Companion {
        fn identity(&self) -> &Identity {
            &self.identity
        }
        fn weight(&self) -> i32 {
            5
        }
        fn enabled(&self, ctx: &Context) -> bool {
            ctx.platforms().exists("anchor")
        }
        fn provider_ids(&self) -> Vec<String> {
            Vec::new()
        }
        fn providers(&self) -> &PlatformProviders {
            &self.providers
        }
    }

    fn platform(id: &str, weight: i32) -> Arc<dyn Platform> {
        Arc::new(MockPlatform::new(id, weight))
    }

    fn empty_context() -> Context {
        ContextBuilder::new().build().unwrap()
    }

    #[test]
    fn test_duplicate_platform_rejected() {
        let ctx = empty_context();
        ctx.platforms().add(platform("board", 1)).unwrap();
        let err = ctx.platforms().add(platform("board", 2)).unwrap_err();
        assert!(matches!(
            err,
            Error::AlreadyExists {
                kind: Collection::Platforms,
                ..
            }
        ));
        assert_eq!(ctx.platforms().len(), 1);
    }

    #[test]
    fn test_default_by_strictly_greater_weight() {
        let ctx = empty_context();
        let platforms = ctx.platforms();
        assert!(matches!(platforms.default(), Err(Error::NoDefault { .. })));

        platforms.add(platform("first", 5)).unwrap();
        assert_eq!(platforms.default().unwrap().id(), "first");

        platforms.add(platform("equal", 5)).unwrap();
        assert_eq!(platforms.default().unwrap().id(), "first");

        platforms.add(platform("lighter", 1)).unwrap();
        assert_eq!(platforms.default().unwrap().id(), "first");

        platforms.add(platform("heavier", 9)).unwrap();
        assert_eq!(platforms.default().unwrap().id(), "heavier");
    }

    #[test]
    fn test_disabled_platform_never_default() {
        let ctx = empty_context();
        let platforms = ctx.platforms();
        platforms
            .add(Arc::new(MockPlatform::new("off", 100).with_enabled(false)))
            .unwrap();
        assert!(platforms.default().is_err());

        platforms.add(platform("on", 1)).unwrap();
        assert_eq!(platforms.default().unwrap().id(), "on");
    }

    #[test]
    fn test_removing_default_recomputes() {
        let ctx = empty_context();
        let platforms = ctx.platforms();
        platforms.add(platform("a", 3)).unwrap();
        platforms.add(platform("b", 7)).unwrap();
        platforms.add(platform("c", 3)).unwrap();

        platforms.remove("b").unwrap();
        assert_eq!(platforms.default().unwrap().id(), "a");
        assert!(matches!(
            platforms.remove("b"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_set_default_pins() {
        let ctx = empty_context();
        let platforms = ctx.platforms();
        platforms.add(platform("a", 1)).unwrap();
        platforms.set_default("a").unwrap();
        platforms.add(platform("b", 50)).unwrap();
        assert_eq!(platforms.default().unwrap().id(), "a");
        assert!(platforms.set_default("zzz").is_err());
    }

    #[test]
    fn test_lookup_falls_back_to_type_name() {
        let ctx = empty_context();
        ctx.platforms().add(platform("board", 1)).unwrap();

        assert!(ctx.platforms().exists("board"));
        assert_eq!(ctx.platforms().get("MockPlatform").unwrap().id(), "board");
        assert!(ctx.platforms().exists("boardio::mock::platform::MockPlatform"));
        assert!(!ctx.platforms().exists("Nope"));
        assert!(!ctx.platforms().exists(" "));
    }

    #[test]
    fn test_shutdown_clears_everything() {
        let ctx = empty_context();
        ctx.platforms().add(platform("a", 1)).unwrap();
        ctx.platforms().add(platform("b", 2)).unwrap();
        ctx.platforms().shutdown().unwrap();
        assert!(ctx.platforms().is_empty());
        assert!(ctx.platforms().default().is_err());
    }

    #[test]
    fn test_recompute_lets_platforms_read_manager() {
        let ctx = empty_context();
        let platforms = ctx.platforms();
        platforms.add(platform("anchor", 1)).unwrap();
        platforms.add(platform("heavy", 9)).unwrap();
        platforms
            .add(Arc::new(Companion {
                identity: Identity::new("companion", "companion", ""),
                providers: PlatformProviders::new(),
            }))
            .unwrap();
        assert_eq!(platforms.default().unwrap().id(), "heavy");

        platforms.remove("heavy").unwrap();
        assert_eq!(platforms.default().unwrap().id(), "companion");
    }
}
