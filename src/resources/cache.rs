//! Reference-counted cache of asynchronously built resources.
//!
//! [`ResourceCache::acquire_ref`] maps a logical key to a resource that is built at most once,
//! however many callers ask for it while it is still pending. Each acquisition returns a
//! [`ResourceRef`]; the resource is disposed exactly when the last reference is released.
//!
//! Construction runs on the context's local executor. A failed construction rejects every
//! holder with the same [`AcquisitionError`] and evicts the entry so a later acquisition retries.
//! A reference released while its resource is still pending keeps the entry alive in an orphaned
//! state: a new acquisition adopts the pending build, otherwise the resource is disposed as soon
//! as it resolves.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt,
    future::Future,
    rc::{Rc, Weak},
    sync::Arc,
};

use futures::{
    FutureExt,
    executor::LocalSpawner,
    future::{LocalBoxFuture, Shared},
    task::LocalSpawnExt,
};

use crate::{Result, error::AcquisitionError};

type SharedResult<T> = Shared<LocalBoxFuture<'static, std::result::Result<Rc<T>, AcquisitionError>>>;

struct Entry<T> {
    generation: u64,
    refs: usize,
    shared: SharedResult<T>,
}

struct Inner<T> {
    entries: HashMap<String, Entry<T>>,
    next_generation: u64,
    factory_calls: u64,
}

impl<T> Inner<T> {
    fn matching(&mut self, key: &str, generation: u64) -> Option<&mut Entry<T>> {
        self.entries
            .get_mut(key)
            .filter(|entry| entry.generation == generation)
    }
}

pub struct ResourceCache<T: 'static> {
    name: &'static str,
    inner: Rc<RefCell<Inner<T>>>,
    spawner: LocalSpawner,
    disposer: Rc<dyn Fn(&T)>,
}

impl<T: 'static> fmt::Debug for ResourceCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("ResourceCache")
            .field("name", &self.name)
            .field("entries", &inner.entries.len())
            .field("factory_calls", &inner.factory_calls)
            .finish()
    }
}

impl<T: 'static> ResourceCache<T> {
    /// `disposer` is called once per resource when its last reference goes away.
    pub fn new(name: &'static str, spawner: LocalSpawner, disposer: impl Fn(&T) + 'static) -> Self {
        Self {
            name,
            inner: Rc::new(RefCell::new(Inner {
                entries: HashMap::new(),
                next_generation: 0,
                factory_calls: 0,
            })),
            spawner,
            disposer: Rc::new(disposer),
        }
    }

    /// Returns a reference to the resource for `key`, invoking `factory` only if no live or
    /// pending entry exists. The factory must not acquire its own key.
    pub fn acquire_ref<F, Fut>(&self, key: &str, factory: F) -> ResourceRef<T>
    where
        F: FnOnce(&str) -> Fut,
        Fut: Future<Output = Result<T>> + 'static,
    {
        if let Some(entry) = self.inner.borrow_mut().entries.get_mut(key) {
            entry.refs += 1;
            log::trace!("{}: `{}` now has {} refs", self.name, key, entry.refs);
            return self.make_ref(key, entry.generation, entry.shared.clone());
        }

        log::debug!("{}: building `{}`", self.name, key);
        let pending = factory(key);
        let owned_key = key.to_string();
        let shared = async move {
            pending.await.map(Rc::new).map_err(|e| AcquisitionError {
                key: owned_key,
                source: Arc::new(e),
            })
        }
        .boxed_local()
        .shared();

        let generation = {
            let mut inner = self.inner.borrow_mut();
            inner.factory_calls += 1;
            inner.next_generation += 1;
            let generation = inner.next_generation;
            inner.entries.insert(
                key.to_string(),
                Entry {
                    generation,
                    refs: 1,
                    shared: shared.clone(),
                },
            );
            generation
        };

        // Factories that finish synchronously are resolved before the first frame sees them.
        if shared.clone().now_or_never().is_some() {
            self.settle(key, generation, &shared);
        } else {
            let inner = Rc::downgrade(&self.inner);
            let disposer = self.disposer.clone();
            let name = self.name;
            let owned_key = key.to_string();
            let task = shared.clone();
            let spawned = self.spawner.spawn_local(async move {
                let _ = task.clone().await;
                if let Some(inner) = inner.upgrade() {
                    settle(name, &inner, &disposer, &owned_key, generation, &task);
                }
            });
            if let Err(e) = spawned {
                log::error!("{}: could not schedule `{}`: {}", self.name, key, e);
            }
        }
        self.make_ref(key, generation, shared)
    }

    fn settle(&self, key: &str, generation: u64, shared: &SharedResult<T>) {
        settle(self.name, &self.inner, &self.disposer, key, generation, shared);
    }

    fn make_ref(&self, key: &str, generation: u64, shared: SharedResult<T>) -> ResourceRef<T> {
        ResourceRef {
            name: self.name,
            key: key.to_string(),
            generation,
            shared,
            cache: Rc::downgrade(&self.inner),
            disposer: self.disposer.clone(),
            released: Cell::new(false),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.borrow().entries.contains_key(key)
    }

    /// Outstanding references for `key`, 0 when absent.
    pub fn ref_count(&self, key: &str) -> usize {
        self.inner.borrow().entries.get(key).map_or(0, |e| e.refs)
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many times a factory was invoked over the cache's lifetime.
    pub fn factory_calls(&self) -> u64 {
        self.inner.borrow().factory_calls
    }
}

/// Handles a resolved build: failures are evicted, orphans are disposed.
fn settle<T>(
    name: &str,
    inner: &RefCell<Inner<T>>,
    disposer: &Rc<dyn Fn(&T)>,
    key: &str,
    generation: u64,
    shared: &SharedResult<T>,
) {
    let Some(result) = shared.peek() else {
        return;
    };
    let orphan = {
        let mut inner = inner.borrow_mut();
        let Some(entry) = inner.matching(key, generation) else {
            return;
        };
        match result {
            Err(e) => {
                log::warn!("{}: evicting `{}`: {}", name, key, e);
                inner.entries.remove(key);
                None
            }
            Ok(resource) if entry.refs == 0 => {
                inner.entries.remove(key);
                Some(resource.clone())
            }
            Ok(_) => None,
        }
    };
    if let Some(resource) = orphan {
        log::debug!("{}: disposing orphaned `{}`", name, key);
        disposer(&resource);
    }
}

/// A counted reference to a cached resource.
///
/// Dropping the reference releases it. Cloning takes another reference.
pub struct ResourceRef<T: 'static> {
    name: &'static str,
    key: String,
    generation: u64,
    shared: SharedResult<T>,
    cache: Weak<RefCell<Inner<T>>>,
    disposer: Rc<dyn Fn(&T)>,
    released: Cell<bool>,
}

impl<T: 'static> fmt::Debug for ResourceRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRef")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .field("resolved", &self.shared.peek().is_some())
            .field("released", &self.released.get())
            .finish()
    }
}

impl<T: 'static> ResourceRef<T> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Resolves to the shared resource, or to the error every holder observes.
    pub fn promise(&self) -> impl Future<Output = std::result::Result<Rc<T>, AcquisitionError>> + 'static {
        self.shared.clone()
    }

    /// The build result if it is already known.
    pub fn peek(&self) -> Option<std::result::Result<Rc<T>, AcquisitionError>> {
        self.shared.peek().cloned()
    }

    /// The resource if it resolved successfully.
    pub fn get(&self) -> Option<Rc<T>> {
        match self.shared.peek() {
            Some(Ok(resource)) => Some(resource.clone()),
            _ => None,
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.get()
    }

    /// Gives the reference back. Releasing twice is a no-op.
    pub fn dispose(&self) {
        if self.released.replace(true) {
            return;
        }
        let Some(cache) = self.cache.upgrade() else {
            return;
        };
        let resolved = {
            let mut inner = cache.borrow_mut();
            let Some(entry) = inner.matching(&self.key, self.generation) else {
                return;
            };
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs > 0 {
                return;
            }
            match self.shared.peek() {
                None => {
                    log::trace!("{}: `{}` orphaned while pending", self.name, self.key);
                    return;
                }
                Some(result) => {
                    inner.entries.remove(&self.key);
                    result.clone().ok()
                }
            }
        };
        if let Some(resource) = resolved {
            log::debug!("{}: last reference to `{}` released", self.name, self.key);
            (self.disposer)(&resource);
        }
    }
}

impl<T: 'static> Clone for ResourceRef<T> {
    fn clone(&self) -> Self {
        let mut released = self.released.get();
        if !released {
            let counted = self.cache.upgrade().is_some_and(|cache| {
                let mut inner = cache.borrow_mut();
                match inner.matching(&self.key, self.generation) {
                    Some(entry) => {
                        entry.refs += 1;
                        true
                    }
                    None => false,
                }
            });
            released = !counted;
        }
        Self {
            name: self.name,
            key: self.key.clone(),
            generation: self.generation,
            shared: self.shared.clone(),
            cache: self.cache.clone(),
            disposer: self.disposer.clone(),
            released: Cell::new(released),
        }
    }
}

impl<T: 'static> Drop for ResourceRef<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}
