//! Lock-free, insert-only string-keyed registry.
//!
//! The registry backs the global class table but is generic over its value
//! type so it can be used (and tested) on its own.
//!
//! # Architecture
//!
//! A fixed array of buckets, each the head of a singly linked list:
//! - Keys are hashed once with the registry's `BuildHasher` (`FxBuildHasher`
//!   by default) and the bucket is `hash % capacity`
//! - New entries are appended at the tail with a single compare-and-swap on
//!   a null `next` pointer
//! - Entries are never removed or moved until the registry itself drops
//! - The bucket array never resizes
//!
//! # Thread Safety
//!
//! Any number of threads may call [`LockFreeRegistry::register`] and
//! [`LockFreeRegistry::fetch`] concurrently without locks. A successful
//! append is a `Release` CAS and every link is read with `Acquire`, so a
//! reader that sees an entry also sees its fully initialized key and value.
//! When two threads race to register the same key, exactly one succeeds.

use fxhash::FxBuildHasher;
use log::trace;
use std::fmt;
use std::hash::BuildHasher;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// One key/value pair in a bucket chain. Immutable once published.
struct Entry<V> {
    key: Box<str>,
    value: V,
    hash: u64,
    next: AtomicPtr<Entry<V>>,
}

impl<V> Entry<V> {
    fn matches(&self, hash: u64, key: &str) -> bool {
        self.hash == hash && &*self.key == key
    }
}

/// Insert-only concurrent map from string keys to values.
///
/// # Example
///
/// ```rust
/// use objrt::runtime::LockFreeRegistry;
///
/// let registry = LockFreeRegistry::new(16);
/// assert!(registry.register("Obj", 1));
/// assert!(!registry.register("Obj", 2));
/// assert_eq!(registry.fetch("Obj"), Some(&1));
/// assert_eq!(registry.fetch("Hash"), None);
/// ```
pub struct LockFreeRegistry<V, S = FxBuildHasher> {
    buckets: Box<[AtomicPtr<Entry<V>>]>,
    len: AtomicUsize,
    hasher: S,
    _owns: PhantomData<V>,
}

impl<V> LockFreeRegistry<V> {
    /// Creates a registry with `capacity` buckets.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::with_hasher(capacity, FxBuildHasher::default())
    }
}

impl<V, S: BuildHasher> LockFreeRegistry<V, S> {
    /// Creates a registry with `capacity` buckets and a custom hasher.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_hasher(capacity: usize, hasher: S) -> Self {
        assert!(capacity > 0, "registry capacity must be non-zero");
        let buckets = (0..capacity)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        Self {
            buckets,
            len: AtomicUsize::new(0),
            hasher,
            _owns: PhantomData,
        }
    }

    /// Registers `value` under `key` unless the key is already present.
    ///
    /// Returns `true` if this call inserted the entry.
    pub fn register(&self, key: &str, value: V) -> bool {
        self.try_register(key, value).is_ok()
    }

    /// Registers `value` under `key`, returning a reference to the stored
    /// value on success or handing `value` back if the key already exists.
    ///
    /// # Errors
    ///
    /// Returns `Err(value)` when another entry (possibly inserted by a
    /// concurrent caller a moment earlier) already owns `key`.
    pub fn try_register(&self, key: &str, value: V) -> Result<&V, V> {
        let hash = self.hasher.hash_one(key);
        let mut link = self.bucket(hash);

        // Walk to the tail first so a duplicate costs no allocation.
        loop {
            let current = link.load(Ordering::Acquire);
            if current.is_null() {
                break;
            }
            // SAFETY: published entries live until the registry drops.
            let entry = unsafe { &*current };
            if entry.matches(hash, key) {
                return Err(value);
            }
            link = &entry.next;
        }

        let node = Box::into_raw(Box::new(Entry {
            key: key.into(),
            value,
            hash,
            next: AtomicPtr::new(ptr::null_mut()),
        }));

        loop {
            match link.compare_exchange(
                ptr::null_mut(),
                node,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.len.fetch_add(1, Ordering::Relaxed);
                    // SAFETY: node is now owned by the registry.
                    return Ok(unsafe { &(*node).value });
                }
                Err(mut current) => {
                    trace!("registry append for '{key}' lost a race, rescanning");
                    // Lists only grow, so resuming from the contested link
                    // sees everything a rescan from the head would.
                    loop {
                        // SAFETY: non-null links point at published entries.
                        let entry = unsafe { &*current };
                        if entry.matches(hash, key) {
                            // SAFETY: node was never published.
                            let rejected = unsafe { Box::from_raw(node) };
                            return Err(rejected.value);
                        }
                        link = &entry.next;
                        current = link.load(Ordering::Acquire);
                        if current.is_null() {
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Looks up the value registered under `key`.
    pub fn fetch(&self, key: &str) -> Option<&V> {
        let hash = self.hasher.hash_one(key);
        let mut current = self.bucket(hash).load(Ordering::Acquire);
        while !current.is_null() {
            // SAFETY: published entries live until the registry drops.
            let entry = unsafe { &*current };
            if entry.matches(hash, key) {
                return Some(&entry.value);
            }
            current = entry.next.load(Ordering::Acquire);
        }
        None
    }

    fn bucket(&self, hash: u64) -> &AtomicPtr<Entry<V>> {
        #[allow(clippy::cast_possible_truncation)]
        let index = (hash % self.buckets.len() as u64) as usize;
        &self.buckets[index]
    }
}

impl<V, S> LockFreeRegistry<V, S> {
    /// Number of entries registered so far.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Returns `true` if nothing has been registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fixed bucket count.
    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    /// Iterates over every published entry.
    ///
    /// Entries registered while the iterator is live may or may not be seen.
    pub fn iter(&self) -> Iter<'_, V> {
        Iter {
            buckets: self.buckets.iter(),
            current: ptr::null(),
            _registry: PhantomData,
        }
    }
}

impl<V, S> Drop for LockFreeRegistry<V, S> {
    fn drop(&mut self) {
        for bucket in &mut *self.buckets {
            let mut current = *bucket.get_mut();
            while !current.is_null() {
                // SAFETY: &mut self means no reader is left; every entry
                // was created by Box::into_raw and is reachable exactly once.
                let mut entry = unsafe { Box::from_raw(current) };
                current = *entry.next.get_mut();
            }
        }
    }
}

// SAFETY: the registry owns its entries; moving it moves ownership of V.
unsafe impl<V: Send, S: Send> Send for LockFreeRegistry<V, S> {}

// SAFETY: shared access hands out &V to any thread and accepts V from any
// thread (it is dropped by whichever thread drops the registry), so V must
// be both Send and Sync. Links are only touched through atomics.
unsafe impl<V: Send + Sync, S: Sync> Sync for LockFreeRegistry<V, S> {}

impl<V, S> fmt::Debug for LockFreeRegistry<V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockFreeRegistry")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// Iterator over `(key, value)` pairs of a [`LockFreeRegistry`].
pub struct Iter<'a, V> {
    buckets: std::slice::Iter<'a, AtomicPtr<Entry<V>>>,
    current: *const Entry<V>,
    _registry: PhantomData<&'a V>,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = (&'a str, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if !self.current.is_null() {
                // SAFETY: entries outlive the borrow of the registry.
                let entry: &'a Entry<V> = unsafe { &*self.current };
                self.current = entry.next.load(Ordering::Acquire);
                return Some((&entry.key, &entry.value));
            }
            self.current = self.buckets.next()?.load(Ordering::Acquire);
        }
    }
}
