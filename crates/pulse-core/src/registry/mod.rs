//! TTL registry: tracks live entries (peers, sessions) that expire unless
//! refreshed.
//!
//! Every entry shares one TTL of `interval` ticks; a tick happens every
//! `resolution`. Effective lifetime ≈ `resolution × interval`.
//!
//! All state sits behind one mutex, so every operation is atomic and
//! linearizable with respect to every other, including clock-driven
//! expiry. A tick costs O(1) plus O(k) for the k entries expiring in it.
//!
//! Callbacks:
//!   - `on_expire(&key, &value)` fires exactly once per entry whose TTL runs
//!     out. Never on `remove` or `clear`.
//!   - `on_release(key, value, cause)` fires exactly once per entry leaving
//!     the registry, whatever the cause. Defaults to dropping the payload.
//!
//! In [`ExpiryMode::Synchronous`] `on_expire` runs on the clock thread while
//! the registry lock is held: it must be fast and must not call back into
//! the registry, or it deadlocks. [`ExpiryMode::Deferred`] runs it after the
//! lock is released instead.

mod clock;
mod list;

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;

use list::DeltaList;

/// Initial hash index capacity when the builder isn't told otherwise.
pub const DEFAULT_BUCKETS: usize = 64;

/// Outcome of [`Registry::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Update {
    /// The key was present; it was moved to the tail with a full TTL.
    Refreshed,
    /// The key was absent; a new entry was inserted.
    Created,
}

/// Why an entry left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCause {
    Expired,
    Removed,
    Cleared,
}

/// When `on_expire` runs relative to the registry lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpiryMode {
    /// Under the lock, inside the tick. Callbacks must not reenter.
    #[default]
    Synchronous,
    /// After the tick has released the lock, still on the clock thread and
    /// in expiry order. Callbacks may use the registry, but another
    /// operation can run between the unlink and the callback.
    Deferred,
}

/// What drives [`Registry::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockMode {
    /// A background thread ticks every `resolution`.
    #[default]
    Thread,
    /// Nothing does; the owner calls `tick` itself.
    Manual,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid registry config: {0}")]
    InvalidConfig(&'static str),
    #[error("failed to spawn registry clock: {0}")]
    Clock(#[source] std::io::Error),
}

type ExpireFn<K, V> = Box<dyn Fn(&K, &V) + Send + Sync>;
type ReleaseFn<K, V> = Box<dyn Fn(K, V, RemovalCause) + Send + Sync>;

struct Hooks<K, V> {
    on_expire: Option<ExpireFn<K, V>>,
    on_release: Option<ReleaseFn<K, V>>,
}

// A panicking hook is logged and skipped: the rest of the batch still gets
// its callbacks and the clock thread keeps running.
impl<K, V> Hooks<K, V> {
    fn expire(&self, key: &K, value: &V) {
        if let Some(f) = &self.on_expire {
            if panic::catch_unwind(AssertUnwindSafe(|| f(key, value))).is_err() {
                tracing::error!("registry on_expire callback panicked");
            }
        }
    }

    fn release(&self, key: K, value: V, cause: RemovalCause) {
        if let Some(f) = &self.on_release {
            if panic::catch_unwind(AssertUnwindSafe(|| f(key, value, cause))).is_err() {
                tracing::error!(?cause, "registry on_release callback panicked");
            }
        }
    }
}

struct Shared<K, V, S> {
    list: Mutex<DeltaList<K, V, S>>,
    hooks: Hooks<K, V>,
    mode: ExpiryMode,
    resolution: Duration,
    interval: u32,
}

impl<K, V, S> Shared<K, V, S>
where
    K: Hash + Eq + Clone,
    S: BuildHasher,
{
    fn lock(&self) -> MutexGuard<'_, DeltaList<K, V, S>> {
        // The list is consistent whenever a callback runs, so a panic in one
        // leaves nothing half-done.
        self.list.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn advance(&self) {
        let expired = match self.mode {
            ExpiryMode::Synchronous => {
                let mut list = self.lock();
                let expired = list.tick();
                for (key, value) in &expired {
                    self.hooks.expire(key, value);
                }
                expired
            }
            ExpiryMode::Deferred => {
                let expired = self.lock().tick();
                for (key, value) in &expired {
                    self.hooks.expire(key, value);
                }
                expired
            }
        };

        if !expired.is_empty() {
            tracing::trace!(count = expired.len(), "registry entries expired");
        }
        for (key, value) in expired {
            self.hooks.release(key, value, RemovalCause::Expired);
        }
    }
}

impl<K, V, S> clock::Tick for Shared<K, V, S>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Send + 'static,
    S: BuildHasher + Send + 'static,
{
    fn tick(&self) {
        self.advance();
    }
}

/// A shared handle to a TTL registry. Cloning is cheap; all clones see the
/// same entries.
pub struct Registry<K, V, S = RandomState> {
    shared: Arc<Shared<K, V, S>>,
}

impl<K, V, S> Clone for Registry<K, V, S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K, V, S> fmt::Debug for Registry<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("resolution", &self.shared.resolution)
            .field("interval", &self.shared.interval)
            .field("mode", &self.shared.mode)
            .finish_non_exhaustive()
    }
}

impl<K, V> Registry<K, V, RandomState> {
    /// Start configuring a registry whose entries live `interval` ticks of
    /// `resolution` each.
    pub fn builder(resolution: Duration, interval: u32) -> RegistryBuilder<K, V, RandomState> {
        RegistryBuilder::new(resolution, interval)
    }
}

impl<K, V, S> Registry<K, V, S>
where
    K: Hash + Eq + Clone,
    S: BuildHasher,
{
    /// Insert an entry with a full TTL unless an equal key is present.
    ///
    /// An existing entry is left alone (its TTL is *not* refreshed) and
    /// `value` is dropped. Returns whether a new entry was created.
    pub fn insert(&self, key: K, value: V) -> bool {
        let created = self.shared.lock().insert(key, value);
        tracing::trace!(created, "registry insert");
        created
    }

    /// Refresh an entry: move it to the tail with a full TTL, keeping its
    /// current payload (`value` is dropped). Inserts it if absent.
    pub fn update(&self, key: K, value: V) -> Update {
        if self.shared.lock().update(key, value) {
            Update::Refreshed
        } else {
            Update::Created
        }
    }

    /// Refresh an existing entry. Returns false, changing nothing, if absent.
    pub fn touch<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shared.lock().touch(key)
    }

    /// Remove an entry. `on_release` runs with [`RemovalCause::Removed`];
    /// `on_expire` does not. Returns false if the key was absent.
    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let removed = self.shared.lock().remove(key);
        match removed {
            Some((key, value)) => {
                self.shared.hooks.release(key, value, RemovalCause::Removed);
                true
            }
            None => false,
        }
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shared.lock().contains(key)
    }

    /// Copy out the payload for `key`.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.shared.lock().get(key).cloned()
    }

    /// Run `f` on the payload for `key` while the lock is held.
    pub fn get_with<Q, R>(&self, key: &Q, f: impl FnOnce(&V) -> R) -> Option<R>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shared.lock().get(key).map(f)
    }

    /// Ticks until `key` expires, if present.
    pub fn ttl<Q>(&self, key: &Q) -> Option<u32>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shared.lock().ttl(key)
    }

    /// Drop every entry. `on_release` runs with [`RemovalCause::Cleared`]
    /// for each; `on_expire` never does.
    pub fn clear(&self) {
        let drained = self.shared.lock().drain();
        tracing::debug!(count = drained.len(), "registry cleared");
        for (key, value) in drained {
            self.shared.hooks.release(key, value, RemovalCause::Cleared);
        }
    }

    /// Visit entries soonest-to-expire first, under the lock. Returning
    /// `ControlFlow::Break` stops early. The visitor must not touch the
    /// registry.
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&K, &V) -> ControlFlow<()>,
    {
        let list = self.shared.lock();
        for (key, value) in list.iter() {
            if visit(key, value).is_break() {
                break;
            }
        }
    }

    pub fn size(&self) -> usize {
        self.shared.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Advance time by one tick, expiring whatever runs out. The clock
    /// thread calls this every `resolution`; with [`ClockMode::Manual`] the
    /// owner does.
    pub fn tick(&self) {
        self.shared.advance();
    }

    pub fn resolution(&self) -> Duration {
        self.shared.resolution
    }

    pub fn interval(&self) -> u32 {
        self.shared.interval
    }
}

// ── Builder ───────────────────────────────────────────────────────────────────

/// Configures and constructs a [`Registry`].
///
/// ```
/// use std::time::Duration;
/// use pulse_core::registry::Registry;
///
/// let peers: Registry<String, u16> = Registry::builder(Duration::from_secs(1), 30)
///     .on_expire(|name: &String, _port: &u16| println!("{name} went quiet"))
///     .build()
///     .unwrap();
/// peers.insert("alpha".to_string(), 7070);
/// assert!(peers.contains("alpha"));
/// ```
pub struct RegistryBuilder<K, V, S = RandomState> {
    resolution: Duration,
    interval: u32,
    buckets: usize,
    hasher: S,
    on_expire: Option<ExpireFn<K, V>>,
    on_release: Option<ReleaseFn<K, V>>,
    mode: ExpiryMode,
    clock: ClockMode,
}

impl<K, V> RegistryBuilder<K, V, RandomState> {
    pub fn new(resolution: Duration, interval: u32) -> Self {
        Self {
            resolution,
            interval,
            buckets: DEFAULT_BUCKETS,
            hasher: RandomState::new(),
            on_expire: None,
            on_release: None,
            mode: ExpiryMode::default(),
            clock: ClockMode::default(),
        }
    }
}

impl<K, V, S> RegistryBuilder<K, V, S> {
    /// Initial capacity of the hash index.
    pub fn buckets(mut self, buckets: usize) -> Self {
        self.buckets = buckets;
        self
    }

    /// Hash policy for keys. Equality is always `K: Eq`.
    pub fn hasher<S2>(self, hasher: S2) -> RegistryBuilder<K, V, S2> {
        RegistryBuilder {
            resolution: self.resolution,
            interval: self.interval,
            buckets: self.buckets,
            hasher,
            on_expire: self.on_expire,
            on_release: self.on_release,
            mode: self.mode,
            clock: self.clock,
        }
    }

    pub fn on_expire<F>(mut self, f: F) -> Self
    where
        F: Fn(&K, &V) + Send + Sync + 'static,
    {
        self.on_expire = Some(Box::new(f));
        self
    }

    pub fn on_release<F>(mut self, f: F) -> Self
    where
        F: Fn(K, V, RemovalCause) + Send + Sync + 'static,
    {
        self.on_release = Some(Box::new(f));
        self
    }

    pub fn expiry_mode(mut self, mode: ExpiryMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn clock(mut self, clock: ClockMode) -> Self {
        self.clock = clock;
        self
    }

    /// Build the registry and, for [`ClockMode::Thread`], start its clock.
    pub fn build(self) -> Result<Registry<K, V, S>, RegistryError>
    where
        K: Hash + Eq + Clone + Send + 'static,
        V: Send + 'static,
        S: BuildHasher + Send + 'static,
    {
        if self.resolution.is_zero() {
            return Err(RegistryError::InvalidConfig("resolution must be non-zero"));
        }
        if self.interval == 0 {
            return Err(RegistryError::InvalidConfig("interval must be at least one tick"));
        }

        let shared = Arc::new(Shared {
            list: Mutex::new(DeltaList::new(self.interval, self.buckets, self.hasher)),
            hooks: Hooks {
                on_expire: self.on_expire,
                on_release: self.on_release,
            },
            mode: self.mode,
            resolution: self.resolution,
            interval: self.interval,
        });

        if self.clock == ClockMode::Thread {
            clock::spawn(Arc::downgrade(&shared), self.resolution).map_err(RegistryError::Clock)?;
        }

        tracing::debug!(
            resolution_ms = self.resolution.as_millis() as u64,
            interval = self.interval,
            mode = ?self.mode,
            "registry created"
        );
        Ok(Registry { shared })
    }
}
