//! Single-flight, LRU-fronted cache of built modules.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use lru::LruCache;

use crate::error::{JitError, JitResult};
use crate::key::CacheKey;

/// Cooperative cancellation shared between a caller and the build it started.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> JitResult<()> {
        if self.is_cancelled() {
            Err(JitError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub builds: u64,
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    builds: AtomicU64,
    failures: AtomicU64,
}

type Flight<V> = Arc<OnceLock<JitResult<Arc<V>>>>;

/// Maps cache keys to built values.
///
/// At most one builder runs per key at a time; concurrent requests for the same key wait for it
/// and share its outcome. Failed builds are never remembered, so the next request retries.
/// Builds for different keys run in parallel: the locks only guard map bookkeeping.
pub struct ModuleCache<V> {
    ready: Mutex<LruCache<CacheKey, Arc<V>>>,
    inflight: Mutex<HashMap<CacheKey, Flight<V>>>,
    counters: Counters,
}

impl<V> ModuleCache<V> {
    /// `None` keeps every module until invalidated.
    pub fn new(capacity: Option<NonZeroUsize>) -> Self {
        let ready = match capacity {
            Some(capacity) => LruCache::new(capacity),
            None => LruCache::unbounded(),
        };
        Self {
            ready: Mutex::new(ready),
            inflight: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    pub fn get_or_build<F>(&self, key: CacheKey, cancel: &CancelToken, build: F) -> JitResult<Arc<V>>
    where
        F: FnOnce(&CancelToken) -> JitResult<V>,
    {
        cancel.check()?;
        let flight = {
            let mut inflight = self.inflight.lock().expect("module cache poisoned");
            if let Some(value) = self.ready.lock().expect("module cache poisoned").get(&key) {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::clone(value));
            }
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            Arc::clone(
                inflight
                    .entry(key)
                    .or_insert_with(|| Arc::new(OnceLock::new())),
            )
        };

        let _abandoned = AbandonedFlight {
            inflight: &self.inflight,
            key,
            flight: &flight,
        };
        let mut initialized = false;
        let result = flight
            .get_or_init(|| {
                initialized = true;
                self.counters.builds.fetch_add(1, Ordering::Relaxed);
                cancel.check()?;
                let built = build(cancel).map(Arc::new);
                cancel.check()?;
                built
            })
            .clone();

        if initialized {
            let mut inflight = self.inflight.lock().expect("module cache poisoned");
            match &result {
                Ok(value) => {
                    self.ready
                        .lock()
                        .expect("module cache poisoned")
                        .put(key, Arc::clone(value));
                }
                Err(_) => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                }
            }
            if matches!(inflight.get(&key), Some(current) if Arc::ptr_eq(current, &flight)) {
                inflight.remove(&key);
            }
        }
        result
    }

    /// Builds currently running or abandoned mid-way.
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().expect("module cache poisoned").len()
    }

    /// Returns the resident value without building or touching counters.
    pub fn peek(&self, key: &CacheKey) -> Option<Arc<V>> {
        self.ready
            .lock()
            .expect("module cache poisoned")
            .peek(key)
            .cloned()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.ready
            .lock()
            .expect("module cache poisoned")
            .contains(key)
    }

    /// Drops the resident entry; holders of the value keep it alive.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.ready
            .lock()
            .expect("module cache poisoned")
            .pop(key)
            .is_some()
    }

    pub fn clear(&self) {
        self.ready.lock().expect("module cache poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.ready.lock().expect("module cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> Option<NonZeroUsize> {
        let ready = self.ready.lock().expect("module cache poisoned");
        let cap = ready.cap();
        if cap.get() == usize::MAX {
            None
        } else {
            Some(cap)
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            builds: self.counters.builds.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }
}

/// Drops a flight whose builder unwound before producing a result.
struct AbandonedFlight<'a, V> {
    inflight: &'a Mutex<HashMap<CacheKey, Flight<V>>>,
    key: CacheKey,
    flight: &'a Flight<V>,
}

impl<V> Drop for AbandonedFlight<'_, V> {
    fn drop(&mut self) {
        if self.flight.get().is_some() {
            return;
        }
        let Ok(mut inflight) = self.inflight.lock() else {
            return;
        };
        if matches!(inflight.get(&self.key), Some(current) if Arc::ptr_eq(current, self.flight)) {
            inflight.remove(&self.key);
        }
    }
}

impl<V> Default for ModuleCache<V> {
    fn default() -> Self {
        Self::unbounded()
    }
}
