//! The Providers manager.
//!
//! Owns every provider in a context and selects one default per [`IoType`]:
//! the highest priority wins, and among equal priorities the provider added
//! first keeps the slot. [`ProvidersManager::set_default`] pins a choice so
//! later additions never displace it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use super::{discovered, ProviderInstance};
use crate::context::{Context, ContextInner};
use crate::error::{aggregate, Collection, Error, Result};
use crate::identity::validate_id;
use crate::io::{IoKind, IoType};
use crate::tracing::prelude::*;

const KIND: Collection = Collection::Providers;

struct Entry {
    seq: u64,
    provider: ProviderInstance,
}

#[derive(Debug, Clone)]
struct DefaultSlot {
    id: String,
    pinned: bool,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    defaults: HashMap<IoType, DefaultSlot>,
    next_seq: u64,
}

impl State {
    fn snapshot(&self) -> Vec<ProviderInstance> {
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.iter().map(|entry| entry.provider.clone()).collect()
    }

    // Re-derive the default for `io_type`. A pinned slot survives as long as
    // its provider is still present with that type.
    fn recompute_default(&mut self, io_type: IoType) {
        if let Some(slot) = self.defaults.get(&io_type) {
            let still_valid = self
                .entries
                .get(&slot.id)
                .is_some_and(|entry| entry.provider.io_type() == io_type);
            if slot.pinned && still_valid {
                return;
            }
        }

        let best = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.provider.io_type() == io_type)
            // Highest priority; earliest registration breaks ties.
            .max_by(|(_, a), (_, b)| {
                a.provider
                    .priority()
                    .cmp(&b.provider.priority())
                    .then(b.seq.cmp(&a.seq))
            })
            .map(|(id, _)| id.clone());

        let previous = self.defaults.get(&io_type).map(|slot| slot.id.clone());
        match best {
            Some(id) => {
                if previous.as_deref() != Some(id.as_str()) {
                    debug!(io_type = %io_type, provider = %id, "Default provider changed");
                }
                self.defaults.insert(io_type, DefaultSlot { id, pinned: false });
            }
            None => {
                self.defaults.remove(&io_type);
            }
        }
    }
}

pub struct ProvidersManager {
    context: Weak<ContextInner>,
    mutation: Mutex<()>,
    state: RwLock<State>,
}

impl ProvidersManager {
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

    /// Add discovered providers (when `auto_detect` is set) and then
    /// `explicit` ones. A provider that fails to add is logged and skipped.
    /// Returns how many were added.
    pub fn initialize(&self, auto_detect: bool, explicit: Vec<ProviderInstance>) -> usize {
        let mut candidates = Vec::new();
        if auto_detect {
            for descriptor in discovered() {
                trace!(provider = descriptor.id, "Discovered provider");
                candidates.push((descriptor.create_fn)());
            }
        }
        candidates.extend(explicit);

        let mut added = 0;
        for provider in candidates {
            let id = provider.id().to_string();
            match self.add(provider) {
                Ok(()) => added += 1,
                Err(e) => warn!(provider = %id, error = %e, "Skipping provider"),
            }
        }
        info!(count = added, "Providers initialized");
        added
    }

    /// Initialize and store a provider.
    pub fn add(&self, provider: ProviderInstance) -> Result<()> {
        let id = validate_id(KIND, provider.id())?.to_string();
        let ctx = self.context()?;
        let _guard = self.mutation.lock().unwrap_or_else(PoisonError::into_inner);

        if self.contains(&id) {
            return Err(Error::AlreadyExists {
                kind: KIND,
                operation: "add",
                id,
            });
        }

        provider
            .initialize(&ctx)
            .map_err(|e| Error::InitializeFailed {
                id: id.clone(),
                source: Box::new(e),
            })?;

        let io_type = provider.io_type();
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let seq = state.next_seq;
        state.next_seq += 1;
        debug!(provider = %id, io_type = %io_type, priority = provider.priority(), "Provider added");
        state.entries.insert(id, Entry { seq, provider });
        state.recompute_default(io_type);
        Ok(())
    }

    /// Add several providers, stopping at the first failure.
    pub fn add_all(&self, providers: impl IntoIterator<Item = ProviderInstance>) -> Result<()> {
        for provider in providers {
            self.add(provider)?;
        }
        Ok(())
    }

    fn contains(&self, id: &str) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .contains_key(id)
    }

    fn lookup(&self, id: &str, operation: &'static str) -> Result<ProviderInstance> {
        let id = validate_id(KIND, id)?;
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(id)
            .map(|entry| entry.provider.clone())
            .ok_or_else(|| Error::NotFound {
                kind: KIND,
                operation,
                id: id.to_string(),
            })
    }

    pub fn get(&self, id: &str) -> Result<ProviderInstance> {
        self.lookup(id, "get")
    }

    /// Fetch a provider as the typed provider of capability `K`.
    pub fn get_as<K: IoKind>(&self, id: &str) -> Result<Arc<K::Provider>> {
        let provider = self.get(id)?;
        let actual = provider.io_type();
        K::from_provider_instance(provider).ok_or_else(|| Error::TypeMismatch {
            kind: KIND,
            id: id.trim().to_string(),
            expected: K::TYPE,
            actual,
        })
    }

    pub fn exists(&self, id: &str) -> bool {
        self.get(id).is_ok()
    }

    /// Every provider, in registration order.
    pub fn all(&self) -> Vec<ProviderInstance> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }

    /// Providers serving `io_type`. None at all is an error.
    pub fn all_of(&self, io_type: IoType) -> Result<Vec<ProviderInstance>> {
        let matching: Vec<ProviderInstance> = self
            .all()
            .into_iter()
            .filter(|provider| provider.io_type() == io_type)
            .collect();
        if matching.is_empty() {
            return Err(Error::NotFoundForType {
                kind: KIND,
                io_type,
            });
        }
        Ok(matching)
    }

    pub fn all_as<K: IoKind>(&self) -> Result<Vec<Arc<K::Provider>>> {
        Ok(self
            .all_of(K::TYPE)?
            .into_iter()
            .filter_map(K::from_provider_instance)
            .collect())
    }

    /// Swap in a new instance for an existing id.
    ///
    /// The old instance is terminated first. Its failure to terminate does
    /// not stop the new instance from being installed; every failure is
    /// returned together. A new instance that fails to initialize is not
    /// installed and the id is left unregistered.
    pub fn replace(&self, provider: ProviderInstance) -> Result<()> {
        let id = validate_id(KIND, provider.id())?.to_string();
        let ctx = self.context()?;
        let _guard = self.mutation.lock().unwrap_or_else(PoisonError::into_inner);

        let old = self.lookup(&id, "replace")?;
        let mut failures = Vec::new();

        if let Err(e) = old.terminate(&ctx) {
            warn!(provider = %id, error = %e, "Replaced provider failed to terminate");
            failures.push(Error::TerminateFailed {
                id: id.clone(),
                source: Box::new(e),
            });
        }

        let initialized = provider.initialize(&ctx);
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let old_type = old.io_type();
        let new_type = provider.io_type();

        match initialized {
            Ok(()) => {
                if let Some(entry) = state.entries.get_mut(&id) {
                    entry.provider = provider;
                }
                info!(provider = %id, "Provider replaced");
            }
            Err(e) => {
                state.entries.remove(&id);
                failures.push(Error::InitializeFailed {
                    id: id.clone(),
                    source: Box::new(e),
                });
            }
        }

        state.recompute_default(old_type);
        if new_type != old_type {
            state.recompute_default(new_type);
        }
        drop(state);

        aggregate("replace", failures)
    }

    /// Terminate and delete a provider.
    ///
    /// The entry is deleted even when terminate fails; the failure is
    /// returned as [`Error::TerminateFailed`].
    pub fn remove(&self, id: &str) -> Result<ProviderInstance> {
        let id = validate_id(KIND, id)?.to_string();
        let ctx = self.context()?;
        let _guard = self.mutation.lock().unwrap_or_else(PoisonError::into_inner);

        let provider = self.lookup(&id, "remove")?;
        let terminated = provider.terminate(&ctx);

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.entries.remove(&id);
        state.recompute_default(provider.io_type());
        drop(state);
        debug!(provider = %id, "Provider removed");

        terminated.map_err(|e| Error::TerminateFailed {
            id,
            source: Box::new(e),
        })?;
        Ok(provider)
    }

    /// The default provider for `io_type`.
    pub fn default_of(&self, io_type: IoType) -> Result<ProviderInstance> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .defaults
            .get(&io_type)
            .and_then(|slot| state.entries.get(&slot.id))
            .map(|entry| entry.provider.clone())
            .ok_or(Error::NotFoundForType {
                kind: KIND,
                io_type,
            })
    }

    pub fn default_as<K: IoKind>(&self) -> Result<Arc<K::Provider>> {
        let provider = self.default_of(K::TYPE)?;
        let actual = provider.io_type();
        let id = provider.id().to_string();
        K::from_provider_instance(provider).ok_or(Error::TypeMismatch {
            kind: KIND,
            id,
            expected: K::TYPE,
            actual,
        })
    }

    /// Pin `id` as the default for its type, overriding priority.
    pub fn set_default(&self, id: &str) -> Result<()> {
        let _guard = self.mutation.lock().unwrap_or_else(PoisonError::into_inner);
        let provider = self.lookup(id, "set default")?;
        let io_type = provider.io_type();
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .defaults
            .insert(
                io_type,
                DefaultSlot {
                    id: provider.id().to_string(),
                    pinned: true,
                },
            );
        info!(io_type = %io_type, provider = provider.id(), "Default provider pinned");
        Ok(())
    }

    /// Terminate every provider and clear the manager, continuing past
    /// failures.
    pub fn terminate(&self) -> Result<()> {
        let ctx = self.context()?;
        let _guard = self.mutation.lock().unwrap_or_else(PoisonError::into_inner);

        let providers = self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot();

        let mut failures = Vec::new();
        for provider in providers.iter().rev() {
            if let Err(e) = provider.terminate(&ctx) {
                warn!(provider = provider.id(), error = %e, "Provider failed to terminate");
                failures.push(Error::TerminateFailed {
                    id: provider.id().to_string(),
                    source: Box::new(e),
                });
            }
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.entries.clear();
        state.defaults.clear();
        drop(state);

        aggregate("provider terminate", failures)
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
