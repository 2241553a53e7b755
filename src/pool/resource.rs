use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::any::{type_name, Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::PoolConfig;
use crate::errors::{MemtuneError, Result};
use crate::runtime::CollectorHandle;

/// Capability of a pooled type.
///
/// The defaults describe an always-reusable object with nothing to reset.
pub trait Poolable: 'static {
    /// Restore default state before the object is handed out again
    fn reset(&mut self) {}

    /// Whether the object may go back to, or come out of, the free list
    fn is_reusable(&mut self) -> bool {
        true
    }

    /// Approximate heap footprint, counted as memory saved when evicted
    fn estimated_size(&self) -> usize {
        std::mem::size_of_val(self)
    }
}

/// Object-safe view of a `Poolable` stored in a free list
trait PoolObject {
    fn reset_object(&mut self);
    fn check_reusable(&mut self) -> bool;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Poolable> PoolObject for T {
    fn reset_object(&mut self) {
        self.reset()
    }

    fn check_reusable(&mut self) -> bool {
        self.is_reusable()
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

type Factory = Box<dyn FnMut() -> anyhow::Result<Box<dyn PoolObject>>>;

/// Stable handle issued when a pooled object is constructed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolEntryId(u64);

impl fmt::Display for PoolEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry-{}", self.0)
    }
}

/// Checked-out ids of one class, shared with outstanding checkouts
type InUseSet = Rc<RefCell<HashMap<PoolEntryId, Duration>>>;

/// Removes its id from the in-use set when dropped
struct InUseGuard {
    id: PoolEntryId,
    in_use: Weak<RefCell<HashMap<PoolEntryId, Duration>>>,
}

impl Drop for InUseGuard {
    fn drop(&mut self) {
        if let Some(in_use) = self.in_use.upgrade() {
            in_use.borrow_mut().remove(&self.id);
        }
    }
}

/// An object checked out of a [`ResourcePool`].
///
/// Hand it back with `release`. Dropping it (or calling `discard`) stops
/// tracking it without pooling.
pub struct Checkout<T> {
    id: PoolEntryId,
    class: String,
    object: Box<T>,
    _guard: InUseGuard,
}

impl<T> Checkout<T> {
    pub fn id(&self) -> PoolEntryId {
        self.id
    }

    pub fn class(&self) -> &str {
        &self.class
    }
}

impl<T> Deref for Checkout<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.object
    }
}

impl<T> DerefMut for Checkout<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.object
    }
}

impl<T: fmt::Debug> fmt::Debug for Checkout<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Checkout")
            .field("id", &self.id)
            .field("class", &self.class)
            .field("object", &self.object)
            .finish()
    }
}

/// Per-class registration options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolOptions {
    /// Free-list capacity; the pool's `max_pool_size` when absent
    pub max_size: Option<usize>,
}

impl PoolOptions {
    pub fn max_size(max_size: usize) -> Self {
        Self {
            max_size: Some(max_size),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub created: u64,
    pub reused: u64,
    pub available: usize,
    pub in_use: usize,
    /// `reused / (created + reused)`
    pub reuse_rate: f64,
    /// Estimated bytes released by idle sweeps, across all classes
    pub memory_saved: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub evicted: usize,
    pub memory_freed: u64,
}

struct PooledEntry {
    id: PoolEntryId,
    object: Box<dyn PoolObject>,
    released_at: Duration,
    estimated_size: usize,
}

struct ClassPool {
    type_id: TypeId,
    type_name: &'static str,
    available: Vec<PooledEntry>,
    in_use: InUseSet,
    factory: Option<Factory>,
    max_size: usize,
    created: u64,
    reused: u64,
}

impl ClassPool {
    fn holds<T: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    fn track(&self, id: PoolEntryId, now: Duration) -> InUseGuard {
        self.in_use.borrow_mut().insert(id, now);
        InUseGuard {
            id,
            in_use: Rc::downgrade(&self.in_use),
        }
    }
}

/// Per-class free lists with idle expiry and validity checks.
///
/// Objects come back out of the pool only after passing the idle limit and
/// their own [`Poolable::is_reusable`] probe; invalid entries met on the way
/// are discarded. Not thread-safe: confine a pool to one thread.
pub struct ResourcePool {
    config: PoolConfig,
    clock: Arc<dyn Clock>,
    pools: IndexMap<String, ClassPool>,
    next_id: u64,
    memory_saved: u64,
    collection_hint: Option<Box<dyn FnMut()>>,
}

impl ResourcePool {
    pub fn new(config: PoolConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            pools: IndexMap::new(),
            next_id: 0,
            memory_saved: 0,
            collection_hint: None,
        }
    }

    /// Called after a cleanup that evicted something
    pub fn with_collection_hint(mut self, hint: impl FnMut() + 'static) -> Self {
        self.collection_hint = Some(Box::new(hint));
        self
    }

    /// Use a runtime collector as the collection hint
    pub fn with_collector(self, collector: Arc<dyn CollectorHandle>) -> Self {
        self.with_collection_hint(move || {
            if let Err(e) = collector.collect_cycles() {
                warn!("Collection hint after pool cleanup failed: {}", e);
            }
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_registered(&self, class: &str) -> bool {
        self.pools.contains_key(class)
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.pools.keys().map(String::as_str)
    }

    fn insert_class<T: Poolable>(&mut self, class: &str, options: PoolOptions, factory: Option<Factory>) -> Result<()> {
        let max_size = options.max_size.unwrap_or(self.config.max_pool_size);
        if max_size == 0 {
            return Err(MemtuneError::configuration(format!(
                "Pool for class '{}' must allow at least one entry",
                class
            )));
        }

        if self.pools.contains_key(class) {
            debug!("Re-registering pool class '{}', free list dropped", class);
        }
        self.pools.insert(
            class.to_string(),
            ClassPool {
                type_id: TypeId::of::<T>(),
                type_name: type_name::<T>(),
                available: Vec::new(),
                in_use: Rc::new(RefCell::new(HashMap::new())),
                factory,
                max_size,
                created: 0,
                reused: 0,
            },
        );
        Ok(())
    }

    /// Register a class constructed with `T::default()`
    pub fn register<T: Poolable + Default>(&mut self, class: &str) -> Result<()> {
        self.register_with_factory(class, PoolOptions::default(), || Ok(T::default()))
    }

    /// Register a class whose objects come from `factory`
    pub fn register_with_factory<T, F>(&mut self, class: &str, options: PoolOptions, mut factory: F) -> Result<()>
    where
        T: Poolable,
        F: FnMut() -> anyhow::Result<T> + 'static,
    {
        let factory: Factory = Box::new(move || factory().map(|object| Box::new(object) as Box<dyn PoolObject>));
        self.insert_class::<T>(class, options, Some(factory))
    }

    /// Register a class without a factory; objects are built per call with
    /// `acquire_or_else`
    pub fn register_class<T: Poolable>(&mut self, class: &str, options: PoolOptions) -> Result<()> {
        self.insert_class::<T>(class, options, None)
    }

    /// Check out an object, registering `T` under `class` on first use.
    ///
    /// New objects come from the class factory when it has one, otherwise
    /// from `T::default()`.
    pub fn acquire<T: Poolable + Default>(&mut self, class: &str) -> Result<Checkout<T>> {
        let has_factory = match self.pools.get(class) {
            Some(pool) => pool.factory.is_some(),
            None => {
                self.register::<T>(class)?;
                true
            }
        };
        if has_factory {
            self.checkout(class, None::<fn() -> T>)
        } else {
            self.checkout(class, Some(T::default))
        }
    }

    /// Check out an object of an already registered class, building new ones
    /// with its factory
    pub fn acquire_registered<T: Poolable>(&mut self, class: &str) -> Result<Checkout<T>> {
        if !self.pools.contains_key(class) {
            return Err(MemtuneError::UnknownClass {
                class: class.to_string(),
            });
        }
        self.checkout(class, None::<fn() -> T>)
    }

    /// Check out an object, building a new one with `ctor` when nothing in
    /// the free list is reusable
    pub fn acquire_or_else<T: Poolable>(&mut self, class: &str, ctor: impl FnOnce() -> T) -> Result<Checkout<T>> {
        if !self.pools.contains_key(class) {
            self.register_class::<T>(class, PoolOptions::default())?;
        }
        self.checkout(class, Some(ctor))
    }

    fn checkout<T: Poolable>(&mut self, class: &str, ctor: Option<impl FnOnce() -> T>) -> Result<Checkout<T>> {
        let now = self.clock.now();
        let max_idle = self.config.max_idle_time();
        let pool = self.pools.get_mut(class).ok_or_else(|| MemtuneError::UnknownClass {
            class: class.to_string(),
        })?;
        if !pool.holds::<T>() {
            return Err(MemtuneError::TypeMismatch {
                class: class.to_string(),
                expected: type_name::<T>(),
            });
        }

        let mut discarded = 0;
        while let Some(mut entry) = pool.available.pop() {
            let idle = now.saturating_sub(entry.released_at);
            if idle > max_idle || !entry.object.check_reusable() {
                discarded += 1;
                continue;
            }

            entry.object.reset_object();
            let Ok(object) = entry.object.into_any().downcast::<T>() else {
                discarded += 1;
                continue;
            };

            let guard = pool.track(entry.id, now);
            pool.reused += 1;
            if discarded > 0 {
                debug!("Discarded {} stale '{}' entries", discarded, class);
            }
            return Ok(Checkout {
                id: entry.id,
                class: class.to_string(),
                object,
                _guard: guard,
            });
        }
        if discarded > 0 {
            debug!("Discarded {} stale '{}' entries", discarded, class);
        }

        let object: Box<T> = match (ctor, pool.factory.as_mut()) {
            (Some(ctor), _) => Box::new(ctor()),
            (None, Some(factory)) => {
                let built = factory().map_err(|e| MemtuneError::FactoryFailed {
                    class: class.to_string(),
                    message: format!("{:#}", e),
                })?;
                built.into_any().downcast::<T>().map_err(|_| MemtuneError::TypeMismatch {
                    class: class.to_string(),
                    expected: type_name::<T>(),
                })?
            }
            (None, None) => {
                return Err(MemtuneError::FactoryFailed {
                    class: class.to_string(),
                    message: "no factory registered".to_string(),
                })
            }
        };

        self.next_id += 1;
        let id = PoolEntryId(self.next_id);
        let guard = pool.track(id, now);
        pool.created += 1;

        Ok(Checkout {
            id,
            class: class.to_string(),
            object,
            _guard: guard,
        })
    }

    /// Return an object to its free list. Returns true when it was pooled,
    /// false when it was dropped instead.
    pub fn release<T: Poolable>(&mut self, checkout: Checkout<T>) -> bool {
        let Checkout {
            id,
            class,
            mut object,
            _guard: guard,
        } = checkout;
        drop(guard);
        let now = self.clock.now();

        let Some(pool) = self.pools.get_mut(&class) else {
            return false;
        };

        if !pool.holds::<T>() {
            return false;
        }
        if !object.is_reusable() {
            debug!("Dropping non-reusable '{}' object {}", class, id);
            return false;
        }
        if pool.available.len() >= pool.max_size {
            debug!("Free list for '{}' is full, dropping {}", class, id);
            return false;
        }

        let estimated_size = object.estimated_size();
        pool.available.push(PooledEntry {
            id,
            object,
            released_at: now,
            estimated_size,
        });
        true
    }

    /// Stop tracking an object without pooling it
    pub fn discard<T>(&mut self, checkout: Checkout<T>) {
        debug!("Discarding '{}' object {}", checkout.class, checkout.id);
        drop(checkout);
    }

    /// Evict entries idle longer than `max_idle_time`
    pub fn cleanup(&mut self) -> CleanupReport {
        let now = self.clock.now();
        let max_idle = self.config.max_idle_time();
        let mut report = CleanupReport::default();

        for pool in self.pools.values_mut() {
            pool.available.retain(|entry| {
                let keep = now.saturating_sub(entry.released_at) <= max_idle;
                if !keep {
                    report.evicted += 1;
                    report.memory_freed += entry.estimated_size as u64;
                }
                keep
            });
        }

        if report.evicted > 0 {
            self.memory_saved += report.memory_freed;
            debug!(
                "Pool cleanup evicted {} entries (~{} bytes)",
                report.evicted, report.memory_freed
            );
            if let Some(hint) = self.collection_hint.as_mut() {
                hint();
            }
        }
        report
    }

    /// Counters for one class, or aggregated over every class.
    ///
    /// Unknown classes report zeros.
    pub fn stats(&self, class: Option<&str>) -> PoolStats {
        let mut stats = PoolStats {
            memory_saved: self.memory_saved,
            ..PoolStats::default()
        };

        let pools: Vec<&ClassPool> = match class {
            Some(class) => self.pools.get(class).into_iter().collect(),
            None => self.pools.values().collect(),
        };
        for pool in pools {
            stats.created += pool.created;
            stats.reused += pool.reused;
            stats.available += pool.available.len();
            stats.in_use += pool.in_use.borrow().len();
        }

        let total = stats.created + stats.reused;
        stats.reuse_rate = if total > 0 {
            stats.reused as f64 / total as f64
        } else {
            0.0
        };
        stats
    }

    /// Ids waiting in the free list of `class`
    pub fn available_ids(&self, class: &str) -> Vec<PoolEntryId> {
        self.pools
            .get(class)
            .map(|pool| pool.available.iter().map(|entry| entry.id).collect())
            .unwrap_or_default()
    }

    /// Ids currently checked out of `class`
    pub fn in_use_ids(&self, class: &str) -> Vec<PoolEntryId> {
        let mut ids: Vec<PoolEntryId> = self
            .pools
            .get(class)
            .map(|pool| pool.in_use.borrow().keys().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Empty the free list of `class`; checked-out objects are untouched
    pub fn clear_pool(&mut self, class: &str) {
        if let Some(pool) = self.pools.get_mut(class) {
            pool.available.clear();
        }
    }

    pub fn clear_all(&mut self) {
        for pool in self.pools.values_mut() {
            pool.available.clear();
        }
    }
}

impl fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let classes: Vec<(&str, &str)> = self
            .pools
            .iter()
            .map(|(class, pool)| (class.as_str(), pool.type_name))
            .collect();
        f.debug_struct("ResourcePool")
            .field("classes", &classes)
            .field("memory_saved", &self.memory_saved)
            .finish()
    }
}
