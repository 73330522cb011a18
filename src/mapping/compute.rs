//! The [`Compute`] trait and the key-level-exclusion reference map.

use std::collections::HashMap;
use std::convert::Infallible;
use std::hash::Hash;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use crate::mapping::error::{ComputeError, Result};

/// Atomic compute-or-insert operations on a concurrent associative map.
///
/// Implementors must provide **key-level exclusion**: while a mapping
/// function for a key runs, no other operation observes or mutates that key,
/// and a function for a missing key is invoked at most once per successful
/// install, no matter how many callers race on it.
///
/// The supplied function should be short and must not attempt to update any
/// other mapping of the same map instance. Detectable same-key re-entry
/// fails with [`ComputeError::Recursive`]; mutating *other* keys from within
/// the function is equally disallowed by this contract but not necessarily
/// detected.
pub trait Compute<K, V> {
    /// If `key` already maps to a value, returns it. Otherwise invokes `f`
    /// for the missing key under key-level exclusion, installs the `Some`
    /// result and returns it.
    ///
    /// # Errors
    ///
    /// - [`ComputeError::NullResult`] if `f` returns `Ok(None)`; the key
    ///   remains unmapped.
    /// - [`ComputeError::Recursive`] if `f` detectably re-enters the
    ///   computation for this key; the key remains unmapped.
    /// - [`ComputeError::Function`] carrying the error of `f` unchanged; no
    ///   mapping is installed.
    fn try_compute_if_absent<F, E>(&self, key: K, f: F) -> Result<V, E>
    where
        F: FnOnce(&K) -> std::result::Result<Option<V>, E>;

    /// Invokes `f` with the key and its current value (or `None`) under
    /// key-level exclusion, atomically installs the `Some` result and
    /// returns it.
    ///
    /// # Errors
    ///
    /// Same as [`try_compute_if_absent`](Compute::try_compute_if_absent),
    /// except that on every failure the prior mapping, if any, is left
    /// unchanged rather than removed.
    fn try_compute<F, E>(&self, key: K, f: F) -> Result<V, E>
    where
        F: FnOnce(&K, Option<&V>) -> std::result::Result<Option<V>, E>;

    /// Infallible-function form of
    /// [`try_compute_if_absent`](Compute::try_compute_if_absent); `None`
    /// still fails with [`ComputeError::NullResult`].
    fn compute_if_absent<F>(&self, key: K, f: F) -> Result<V>
    where
        F: FnOnce(&K) -> Option<V>,
        Self: Sized,
    {
        self.try_compute_if_absent(key, |k| Ok::<_, Infallible>(f(k)))
    }

    /// Infallible-function form of [`try_compute`](Compute::try_compute).
    fn compute<F>(&self, key: K, f: F) -> Result<V>
    where
        F: FnOnce(&K, Option<&V>) -> Option<V>,
        Self: Sized,
    {
        self.try_compute(key, |k, v| Ok::<_, Infallible>(f(k, v)))
    }
}

/// State of one key in the registry.
enum Slot<V> {
    /// A committed mapping.
    Present(V),
    /// A computation for this key is in flight on the given thread.
    Computing(ThreadId),
}

/// Reference implementation of the [`Compute`] contract.
///
/// A registry of per-key slots behind a single bookkeeping mutex. The mutex
/// is only ever held for map lookups and slot transitions, never while a
/// user-supplied function runs: a computing thread claims its key with an
/// in-flight marker, releases the registry lock, runs the function
/// and then commits or rolls back. Other threads touching the same key wait
/// on a condvar until the marker settles, which is what makes exclusion
/// per-key rather than map-wide. A thread that finds its *own* marker has
/// re-entered the computation and fails with [`ComputeError::Recursive`]
/// instead of deadlocking.
///
/// If the mapping function panics, a drop guard rolls the key back to its
/// pre-computation state, so waiters are released and the map stays usable.
///
/// Values are returned by clone, hence the `V: Clone` bound.
pub struct KeyLockMap<K, V> {
    slots: Mutex<HashMap<K, Slot<V>>>,
    settled: Condvar,
}

impl<K, V> KeyLockMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates an empty map.
    pub fn new() -> Self {
        KeyLockMap {
            slots: Mutex::new(HashMap::new()),
            settled: Condvar::new(),
        }
    }

    /// Poisoning carries no meaning here: the registry is only ever mutated
    /// in small slot transitions, and a panicking mapping function is rolled
    /// back by its claim guard.
    fn lock(&self) -> MutexGuard<'_, HashMap<K, Slot<V>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the value currently mapped to `key`, waiting out an in-flight
    /// computation by another thread.
    ///
    /// Called from within a mapping function for the same key, this returns
    /// `None`: the computation has not committed yet.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut slots = self.lock();
        loop {
            match slots.get(key) {
                Some(Slot::Present(v)) => return Some(v.clone()),
                Some(Slot::Computing(owner)) if *owner == thread::current().id() => return None,
                Some(Slot::Computing(_)) => {
                    slots = self
                        .settled
                        .wait(slots)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                None => return None,
            }
        }
    }

    /// Number of committed mappings. In-flight computations do not count.
    pub fn len(&self) -> usize {
        self.lock()
            .values()
            .filter(|s| matches!(s, Slot::Present(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claims `key` for a computation on the current thread, waiting while
    /// another thread computes it.
    ///
    /// Returns the prior committed value (to be restored on failure), or an
    /// error if the key is already being computed by this very thread.
    fn claim(&self, key: &K) -> std::result::Result<Option<V>, ()> {
        let me = thread::current().id();
        let mut slots = self.lock();
        loop {
            match slots.get(key) {
                Some(Slot::Computing(owner)) => {
                    if *owner == me {
                        return Err(());
                    }
                    slots = self
                        .settled
                        .wait(slots)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                _ => break,
            }
        }
        let prior = match slots.insert(key.clone(), Slot::Computing(me)) {
            Some(Slot::Present(v)) => Some(v),
            _ => None,
        };
        Ok(prior)
    }

    /// Commits a computed value for a claimed key and wakes waiters.
    fn install(&self, key: K, value: V) {
        let mut slots = self.lock();
        slots.insert(key, Slot::Present(value));
        drop(slots);
        self.settled.notify_all();
    }

    /// Rolls a claimed key back to its pre-computation state and wakes
    /// waiters.
    fn release(&self, key: &K, prior: Option<V>) {
        let mut slots = self.lock();
        match prior {
            Some(v) => {
                slots.insert(key.clone(), Slot::Present(v));
            }
            None => {
                slots.remove(key);
            }
        }
        drop(slots);
        self.settled.notify_all();
    }
}

impl<K, V> Default for KeyLockMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Rolls a claimed key back if the mapping function unwinds.
struct ClaimGuard<'a, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    map: &'a KeyLockMap<K, V>,
    key: Option<K>,
    prior: Option<V>,
}

impl<K, V> ClaimGuard<'_, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Disarms the guard and hands the prior value back for explicit
    /// settlement.
    fn defuse(mut self) -> Option<V> {
        self.key = None;
        self.prior.take()
    }
}

impl<K, V> Drop for ClaimGuard<'_, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.map.release(&key, self.prior.take());
        }
    }
}

impl<K, V> Compute<K, V> for KeyLockMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn try_compute_if_absent<F, E>(&self, key: K, f: F) -> Result<V, E>
    where
        F: FnOnce(&K) -> std::result::Result<Option<V>, E>,
    {
        match self.claim(&key) {
            // a committed value already exists: return it without invoking f
            Ok(Some(v)) => {
                self.release(&key, Some(v.clone()));
                Ok(v)
            }
            Ok(None) => {
                let guard = ClaimGuard {
                    map: self,
                    key: Some(key.clone()),
                    prior: None,
                };
                let outcome = f(&key);
                guard.defuse();
                match outcome {
                    Ok(Some(v)) => {
                        self.install(key, v.clone());
                        Ok(v)
                    }
                    Ok(None) => {
                        self.release(&key, None);
                        Err(ComputeError::NullResult)
                    }
                    Err(e) => {
                        self.release(&key, None);
                        Err(ComputeError::Function(e))
                    }
                }
            }
            Err(()) => Err(ComputeError::Recursive),
        }
    }

    fn try_compute<F, E>(&self, key: K, f: F) -> Result<V, E>
    where
        F: FnOnce(&K, Option<&V>) -> std::result::Result<Option<V>, E>,
    {
        match self.claim(&key) {
            Ok(prior) => {
                let guard = ClaimGuard {
                    map: self,
                    key: Some(key.clone()),
                    prior,
                };
                let outcome = f(&key, guard.prior.as_ref());
                let prior = guard.defuse();
                match outcome {
                    Ok(Some(v)) => {
                        self.install(key, v.clone());
                        Ok(v)
                    }
                    Ok(None) => {
                        self.release(&key, prior);
                        Err(ComputeError::NullResult)
                    }
                    Err(e) => {
                        self.release(&key, prior);
                        Err(ComputeError::Function(e))
                    }
                }
            }
            Err(()) => Err(ComputeError::Recursive),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_compute_if_absent_installs_missing_key() {
        let map: KeyLockMap<u32, String> = KeyLockMap::new();
        let v = map.compute_if_absent(1, |k| Some(format!("v{k}"))).unwrap();
        assert_eq!(v, "v1");
        assert_eq!(map.get(&1), Some("v1".to_string()));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_compute_if_absent_returns_existing_without_invoking() {
        let map: KeyLockMap<u32, i32> = KeyLockMap::new();
        map.compute_if_absent(7, |_| Some(70)).unwrap();

        let invoked = AtomicUsize::new(0);
        let v = map
            .compute_if_absent(7, |_| {
                invoked.fetch_add(1, Ordering::Relaxed);
                Some(-1)
            })
            .unwrap();
        assert_eq!(v, 70);
        assert_eq!(invoked.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_compute_if_absent_null_result_rejected() {
        let map: KeyLockMap<u32, i32> = KeyLockMap::new();
        let r = map.compute_if_absent(1, |_| None);
        assert_eq!(r, Err(ComputeError::NullResult));
        assert_eq!(map.get(&1), None);
        assert!(map.is_empty());
    }

    #[test]
    fn test_compute_inserts_and_updates() {
        let map: KeyLockMap<&str, i64> = KeyLockMap::new();
        let v = map.compute("hits", |_, cur| Some(cur.copied().unwrap_or(0) + 1));
        assert_eq!(v, Ok(1));
        let v = map.compute("hits", |_, cur| Some(cur.copied().unwrap_or(0) + 1));
        assert_eq!(v, Ok(2));
        assert_eq!(map.get(&"hits"), Some(2));
    }

    #[test]
    fn test_compute_null_result_keeps_prior() {
        let map: KeyLockMap<u32, i32> = KeyLockMap::new();
        map.compute_if_absent(1, |_| Some(5)).unwrap();
        let r = map.compute(1, |_, _| None);
        assert_eq!(r, Err(ComputeError::NullResult));
        assert_eq!(map.get(&1), Some(5));
    }

    #[test]
    fn test_function_error_propagates_and_installs_nothing() {
        let map: KeyLockMap<u32, i32> = KeyLockMap::new();
        let r = map.try_compute_if_absent(1, |_| Err::<Option<i32>, _>("boom"));
        assert_eq!(r, Err(ComputeError::Function("boom")));
        assert_eq!(map.get(&1), None);
    }

    #[test]
    fn test_function_error_keeps_prior_on_compute() {
        let map: KeyLockMap<u32, i32> = KeyLockMap::new();
        map.compute_if_absent(1, |_| Some(5)).unwrap();
        let r = map.try_compute(1, |_, _| Err::<Option<i32>, _>(42));
        assert_eq!(r, Err(ComputeError::Function(42)));
        assert_eq!(map.get(&1), Some(5));
    }

    #[test]
    fn test_reentrant_compute_same_key_detected() {
        let map: KeyLockMap<u32, i32> = KeyLockMap::new();
        map.compute_if_absent(1, |_| Some(10)).unwrap();

        let r = map.try_compute(1, |_, _| map.compute(1, |_, _| Some(99)).map(Some));
        assert_eq!(r, Err(ComputeError::Function(ComputeError::Recursive)));
        // the prior mapping survives the failed recursive attempt
        assert_eq!(map.get(&1), Some(10));
    }

    #[test]
    fn test_reentrant_compute_if_absent_detected() {
        let map: KeyLockMap<u32, i32> = KeyLockMap::new();
        let r = map.try_compute_if_absent(1, |_| {
            map.compute_if_absent(1, |_| Some(3)).map(Some)
        });
        assert_eq!(r, Err(ComputeError::Function(ComputeError::Recursive)));
        // nothing was ever installed
        assert_eq!(map.get(&1), None);
    }

    #[test]
    fn test_get_during_own_computation_sees_nothing() {
        let map: KeyLockMap<u32, i32> = KeyLockMap::new();
        map.compute_if_absent(1, |_| {
            assert_eq!(map.get(&1), None);
            Some(8)
        })
        .unwrap();
        assert_eq!(map.get(&1), Some(8));
    }

    #[test]
    fn test_exactly_once_under_contention() {
        const THREADS: usize = 8;

        let map: Arc<KeyLockMap<u32, u64>> = Arc::new(KeyLockMap::new());
        let invocations = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let map = Arc::clone(&map);
                let invocations = Arc::clone(&invocations);
                thread::spawn(move || {
                    map.compute_if_absent(42, |k| {
                        invocations.fetch_add(1, Ordering::Relaxed);
                        // widen the window so racing callers pile up behind
                        // the in-flight marker
                        thread::sleep(std::time::Duration::from_millis(10));
                        Some(u64::from(*k) * 2)
                    })
                    .unwrap()
                })
            })
            .collect();

        let results: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        // all callers observe the identical installed value
        assert!(results.iter().all(|&v| v == 84));
        // and the function ran exactly once for the missing key
        assert_eq!(invocations.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_independent_keys_do_not_exclude_each_other() {
        const THREADS: usize = 8;

        let map: Arc<KeyLockMap<usize, usize>> = Arc::new(KeyLockMap::new());
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let map = Arc::clone(&map);
                thread::spawn(move || map.compute_if_absent(i, |k| Some(k * k)).unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(map.len(), THREADS);
        for i in 0..THREADS {
            assert_eq!(map.get(&i), Some(i * i));
        }
    }

    #[test]
    fn test_panicking_function_rolls_the_claim_back() {
        let map: Arc<KeyLockMap<u32, i32>> = Arc::new(KeyLockMap::new());

        let m = Arc::clone(&map);
        let r = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            m.compute_if_absent(1, |_| -> Option<i32> { panic!("mapping function blew up") })
        }));
        assert!(r.is_err());

        // the claim was rolled back, so the key is free again
        assert_eq!(map.get(&1), None);
        assert_eq!(map.compute_if_absent(1, |_| Some(11)), Ok(11));
    }

    #[test]
    fn test_len_and_is_empty() {
        let map: KeyLockMap<u32, i32> = KeyLockMap::new();
        assert!(map.is_empty());
        map.compute_if_absent(1, |_| Some(1)).unwrap();
        map.compute_if_absent(2, |_| Some(2)).unwrap();
        assert_eq!(map.len(), 2);
        assert!(!map.is_empty());
    }
}
