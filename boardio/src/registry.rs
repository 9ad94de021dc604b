//! Registry of live I/O handles.
//!
//! The registry owns every handle created through a [`Context`]. Ids are
//! unique across all I/O types. Every entry is live: a handle leaves the
//! registry only after its shutdown succeeded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use crate::context::{Context, ContextInner};
use crate::error::{aggregate, Collection, Error, Result};
use crate::identity::validate_id;
use crate::io::{IoInstance, IoKind, IoType};
use crate::tracing::prelude::*;

const KIND: Collection = Collection::Registry;

struct Entry {
    seq: u64,
    instance: IoInstance,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    next_seq: u64,
}

pub struct Registry {
    context: Weak<ContextInner>,
    // Serialises add/remove so a shutdown in progress never races a
    // concurrent add or remove of the same id.
    mutation: Mutex<()>,
    state: RwLock<State>,
}

impl Registry {
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

    /// Register a handle under its id.
    pub fn add(&self, instance: IoInstance) -> Result<()> {
        let id = validate_id(KIND, instance.id())?.to_string();
        let _guard = self.mutation.lock().unwrap_or_else(PoisonError::into_inner);
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        if state.entries.contains_key(&id) {
            return Err(Error::AlreadyExists {
                kind: KIND,
                operation: "add",
                id,
            });
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        debug!(id = %id, io_type = %instance.io_type(), provider = instance.provider_id(), "Handle registered");
        state.entries.insert(id, Entry { seq, instance });
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<IoInstance> {
        let id = validate_id(KIND, id)?;
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(id)
            .map(|entry| entry.instance.clone())
            .ok_or_else(|| Error::NotFound {
                kind: KIND,
                operation: "get",
                id: id.to_string(),
            })
    }

    /// Fetch a handle as the capability `K`.
    ///
    /// A handle of another type is a [`Error::TypeMismatch`], distinct from
    /// [`Error::NotFound`].
    pub fn get_as<K: IoKind>(&self, id: &str) -> Result<Arc<K::Handle>> {
        let instance = self.get(id)?;
        let actual = instance.io_type();
        K::from_instance(instance).ok_or_else(|| Error::TypeMismatch {
            kind: KIND,
            id: id.trim().to_string(),
            expected: K::TYPE,
            actual,
        })
    }

    /// Whether `id` is registered. Invalid ids are simply absent.
    pub fn exists(&self, id: &str) -> bool {
        self.get(id).is_ok()
    }

    pub fn exists_of(&self, id: &str, io_type: IoType) -> bool {
        self.get(id)
            .map(|instance| instance.io_type() == io_type)
            .unwrap_or(false)
    }

    /// Shut down and unregister a handle.
    ///
    /// When the handle's shutdown fails it stays registered and the error is
    /// returned as [`Error::ShutdownFailed`].
    pub fn remove(&self, id: &str) -> Result<IoInstance> {
        let id = validate_id(KIND, id)?;
        let ctx = self.context()?;
        let _guard = self.mutation.lock().unwrap_or_else(PoisonError::into_inner);
        self.remove_locked(&ctx, id)
    }

    fn remove_locked(&self, ctx: &Context, id: &str) -> Result<IoInstance> {
        let instance = self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(id)
            .map(|entry| entry.instance.clone())
            .ok_or_else(|| Error::NotFound {
                kind: KIND,
                operation: "remove",
                id: id.to_string(),
            })?;

        // Readers are not blocked while the handle shuts down.
        if let Err(e) = instance.shutdown(ctx) {
            return Err(Error::ShutdownFailed {
                id: id.to_string(),
                instance,
                source: Box::new(e),
            });
        }

        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .remove(id);
        debug!(id, "Handle removed");
        Ok(instance)
    }

    /// Remove every handle created by `provider_id`, continuing past
    /// failures.
    pub fn remove_owned_by(&self, provider_id: &str) -> Result<()> {
        let ctx = self.context()?;
        let _guard = self.mutation.lock().unwrap_or_else(PoisonError::into_inner);
        let ids: Vec<String> = self
            .snapshot()
            .into_iter()
            .filter(|instance| instance.provider_id() == provider_id)
            .map(|instance| instance.id().to_string())
            .collect();
        self.sweep(&ctx, ids, "remove provider handles")
    }

    /// Remove every handle, continuing past failures.
    pub fn shutdown(&self) -> Result<()> {
        let ctx = self.context()?;
        let _guard = self.mutation.lock().unwrap_or_else(PoisonError::into_inner);
        let ids: Vec<String> = self
            .snapshot()
            .into_iter()
            .map(|instance| instance.id().to_string())
            .collect();
        self.sweep(&ctx, ids, "registry shutdown")
    }

    fn sweep(&self, ctx: &Context, ids: Vec<String>, operation: &'static str) -> Result<()> {
        let failures: Vec<Error> = ids
            .iter()
            .filter_map(|id| match self.remove_locked(ctx, id) {
                Ok(_) => None,
                Err(e) => {
                    warn!(id = %id, error = %e, "Handle shutdown failed");
                    Some(e)
                }
            })
            .collect();
        aggregate(operation, failures)
    }

    fn snapshot(&self) -> Vec<IoInstance> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<&Entry> = state.entries.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.iter().map(|entry| entry.instance.clone()).collect()
    }

    /// Every registered handle, in registration order.
    pub fn all(&self) -> Vec<IoInstance> {
        self.snapshot()
    }

    pub fn all_of(&self, io_type: IoType) -> Vec<IoInstance> {
        self.snapshot()
            .into_iter()
            .filter(|instance| instance.io_type() == io_type)
            .collect()
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
    use crate::config::DigitalOutputConfig;
    use crate::identity::Identity;
    use crate::io::digital::{DigitalOutput, DigitalState, Listeners};
    use crate::io::{kind, Io, ShutdownState};
    use crate::mock::MockDigitalOutputProvider;
    use crate::provider::DigitalOutputProvider;
    use crate::ContextBuilder;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    // Output that counts shutdown calls and can be told to fail them.
    struct CountingOutput {
        identity: Identity,
        calls: AtomicUsize,
        fail: AtomicBool,
        state: ShutdownState,
        listeners: Listeners<crate::io::digital::DigitalStateChange>,
    }

    impl CountingOutput {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                identity: Identity::new(id, id, ""),
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                state: ShutdownState::new(),
                listeners: Listeners::new(),
            })
        }
    }

    impl Io for CountingOutput {
        fn identity(&self) -> &Identity {
            &self.identity
        }
        fn io_type(&self) -> IoType {
            IoType::DigitalOutput
        }
        fn provider_id(&self) -> &str {
            "counting"
        }
        fn shutdown(&self, _ctx: &Context) -> Result<()> {
            self.state.run(|| {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if self.fail.load(Ordering::SeqCst) {
                    return Err(Error::Closed {
                        id: self.id().to_string(),
                    });
                }
                Ok(())
            })
        }
        fn is_shutdown(&self) -> bool {
            self.state.is_shutdown()
        }
    }

    impl DigitalOutput for CountingOutput {
        fn state(&self) -> Result<DigitalState> {
            Ok(DigitalState::Low)
        }
        fn set_state(&self, _state: DigitalState) -> Result<()> {
            Ok(())
        }
        fn listeners(&self) -> &Listeners<crate::io::digital::DigitalStateChange> {
            &self.listeners
        }
    }

    fn instance(handle: &Arc<CountingOutput>) -> IoInstance {
        IoInstance::DigitalOutput(handle.clone())
    }

    #[test]
    fn test_duplicate_id_rejected_across_types() {
        let ctx = ContextBuilder::new().build().unwrap();
        let registry = ctx.registry();

        registry.add(instance(&CountingOutput::new("x"))).unwrap();
        let err = registry
            .add(instance(&CountingOutput::new(" x ")))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { kind: Collection::Registry, .. }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_blank_id_is_invalid_not_missing() {
        let ctx = ContextBuilder::new().build().unwrap();
        let registry = ctx.registry();

        assert!(matches!(
            registry.add(instance(&CountingOutput::new("  "))),
            Err(Error::InvalidId { .. })
        ));
        assert!(matches!(registry.get(""), Err(Error::InvalidId { .. })));
        assert!(matches!(registry.get("nope"), Err(Error::NotFound { .. })));
        assert!(!registry.exists(""));
        assert!(!registry.exists("nope"));
    }

    #[test]
    fn test_type_mismatch_is_not_not_found() {
        let ctx = ContextBuilder::new()
            .add_provider(Arc::new(MockDigitalOutputProvider::new()).into_provider())
            .build()
            .unwrap();

        let config = DigitalOutputConfig::builder()
            .id("x")
            .address(4)
            .build()
            .unwrap();
        ctx.create::<kind::DigitalOutput>(config).unwrap();

        let err = ctx.registry().get_as::<kind::AnalogInput>("x").err().unwrap();
        assert!(matches!(
            err,
            Error::TypeMismatch {
                expected: IoType::AnalogInput,
                actual: IoType::DigitalOutput,
                ..
            }
        ));
        assert!(ctx.registry().exists_of("x", IoType::DigitalOutput));
        assert!(!ctx.registry().exists_of("x", IoType::AnalogInput));
    }

    #[test]
    fn test_shutdown_sweep_calls_each_handle_once() {
        let ctx = ContextBuilder::new().build().unwrap();
        let registry = ctx.registry();
        let handles: Vec<_> = (0..5)
            .map(|i| CountingOutput::new(&format!("out-{}", i)))
            .collect();
        for handle in &handles {
            registry.add(instance(handle)).unwrap();
        }

        registry.shutdown().unwrap();

        assert!(registry.all().is_empty());
        for handle in &handles {
            assert_eq!(handle.calls.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_failed_shutdown_blocks_removal() {
        let ctx = ContextBuilder::new().build().unwrap();
        let registry = ctx.registry();

        let stuck = CountingOutput::new("stuck");
        stuck.fail.store(true, Ordering::SeqCst);
        let fine = CountingOutput::new("fine");
        registry.add(instance(&stuck)).unwrap();
        registry.add(instance(&fine)).unwrap();

        let err = registry.remove("stuck").unwrap_err();
        match err {
            Error::ShutdownFailed { id, instance, .. } => {
                assert_eq!(id, "stuck");
                assert_eq!(instance.id(), "stuck");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(registry.exists("stuck"));

        // The sweep keeps going past the failing entry.
        let err = registry.shutdown().unwrap_err();
        assert_eq!(err.failures().len(), 1);
        assert_eq!(fine.calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);

        stuck.fail.store(false, Ordering::SeqCst);
        registry.remove("stuck").unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_all_preserves_registration_order() {
        let ctx = ContextBuilder::new().build().unwrap();
        let registry = ctx.registry();
        for id in ["c", "a", "b"] {
            registry.add(instance(&CountingOutput::new(id))).unwrap();
        }
        let ids: Vec<String> = registry
            .all()
            .iter()
            .map(|i| i.id().to_string())
            .collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
        assert_eq!(registry.all_of(IoType::DigitalOutput).len(), 3);
        assert!(registry.all_of(IoType::Pwm).is_empty());
    }

    #[test]
    fn test_concurrent_adds_admit_one() {
        let ctx = ContextBuilder::new().build().unwrap();
        let registry = ctx.registry();
        let contenders: Vec<Arc<CountingOutput>> =
            (0..8).map(|_| CountingOutput::new("shared")).collect();
        let barrier = std::sync::Barrier::new(contenders.len());

        let outcomes: Vec<Result<()>> = std::thread::scope(|scope| {
            let workers: Vec<_> = contenders
                .iter()
                .map(|handle| {
                    let barrier = &barrier;
                    scope.spawn(move || {
                        barrier.wait();
                        registry.add(instance(handle))
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, Error::AlreadyExists { .. })));
        assert_eq!(registry.len(), 1);
    }
}
