//! The contention-adaptive striping engine.
//!
//! This module provides [`Cell`], a cache-padded CAS-only storage slot, and
//! [`Striped`], the retry/escalation engine shared by all accumulators built
//! on it. The engine owns a scalar base value (the uncontended fast path) and
//! an optional table of cells that is created lazily on the first observed
//! collision and doubled, as a last resort, while collisions persist.
//!
//! # Structural Invariants
//!
//! - The table is either absent or has a power-of-two length in
//!   `[2, max_cells()]`.
//! - Once present, the table never shrinks and installed cells are never
//!   removed or moved.
//! - The `busy` flag is the only pessimistic coordination point. It guards
//!   table creation and width doubling exclusively; cell updates and cell
//!   installation are plain CAS operations. It is a try-lock: a thread that
//!   cannot acquire it falls back to the base value instead of waiting.
//! - The running total is always `base` folded with every installed cell;
//!   no other field contributes.

use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, AtomicUsize, Ordering};
use std::sync::OnceLock;

use crossbeam_utils::{Backoff, CachePadded};

use crate::adders::{current_probe, rehash_probe, Combine};

/// Upper bound on the stripe width, derived from the hardware parallelism.
///
/// More cells than runnable threads cannot reduce contention any further, so
/// growth stops here and any remaining collisions are resolved by probe
/// rehashing alone.
pub(crate) fn max_cells() -> usize {
    static MAX_CELLS: OnceLock<usize> = OnceLock::new();
    *MAX_CELLS.get_or_init(|| {
        let ncpu = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        ncpu.next_power_of_two().max(2)
    })
}

/// One independently updatable storage slot of the stripe table.
///
/// The value is wrapped in [`CachePadded`] so that adjacent cells never share
/// a cache line. This is load-bearing, not cosmetic: without the padding,
/// hardware false sharing would re-introduce exactly the cross-core write
/// contention the striping exists to eliminate.
///
/// Compare-and-swap is the only mutation path.
pub(crate) struct Cell {
    value: CachePadded<AtomicI64>,
}

impl Cell {
    fn new(x: i64) -> Self {
        Cell {
            value: CachePadded::new(AtomicI64::new(x)),
        }
    }

    #[inline]
    pub(crate) fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Attempts to replace `expected` with `new`, reporting success.
    #[inline]
    fn cas(&self, expected: i64, new: i64) -> bool {
        self.value
            .compare_exchange(expected, new, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

/// The contention-adaptive accumulator engine.
///
/// `Striped` is generic over the [`Combine`] operation so that sum-like
/// accumulators (max, bitwise-or, ...) can share the retry/escalation
/// machinery; the concrete accumulator only supplies `combine` and its
/// identity element.
///
/// Updates never fail and never block: every anomaly (lost CAS race, slot
/// collision, structural lock held elsewhere) is handled internally by
/// retrying, rehashing the thread's probe, or falling back to the base value.
/// Reads ([`total`](Striped::total)) are weakly consistent and never
/// coordinate with writers.
pub struct Striped<C: Combine> {
    /// Fast-path scalar; also accumulates fallback updates while the
    /// structural lock is held elsewhere. Contributes to the total forever,
    /// even after the table exists.
    base: CachePadded<AtomicI64>,
    /// Structural try-lock guarding table creation and width doubling only.
    busy: AtomicBool,
    /// Published stripe width: 0 while the table is absent, otherwise a
    /// power of two in `[2, max_cells()]`, monotone non-decreasing.
    len: AtomicUsize,
    /// Slot-pointer array, allocated once at `max_cells()` by the creation
    /// winner. Cells are heap-allocated lazily and installed by CAS on the
    /// slot pointer; a doubling publishes a larger `len` and leaves every
    /// installed cell in place.
    table: OnceLock<Box<[AtomicPtr<Cell>]>>,
    _combine: PhantomData<fn() -> C>,
}

fn new_slot_array() -> Box<[AtomicPtr<Cell>]> {
    (0..max_cells())
        .map(|_| AtomicPtr::new(ptr::null_mut()))
        .collect()
}

impl<C: Combine> Striped<C> {
    /// Creates an engine whose total starts at the combiner's identity.
    pub fn new() -> Self {
        Self::with_base(C::IDENTITY)
    }

    /// Creates an engine whose base holds `value`, with no table and the
    /// structural lock free. This is the reconstruction path used when
    /// deserializing a persisted aggregate.
    pub fn with_base(value: i64) -> Self {
        Striped {
            base: CachePadded::new(AtomicI64::new(value)),
            busy: AtomicBool::new(false),
            len: AtomicUsize::new(0),
            table: OnceLock::new(),
            _combine: PhantomData,
        }
    }

    #[inline]
    fn cas_base(&self, expected: i64, new: i64) -> bool {
        self.base
            .compare_exchange(expected, new, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    fn try_lock(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    fn unlock(&self) {
        self.busy.store(false, Ordering::Release);
    }

    /// Live view of the stripe table: the first `len` slots. `None` while no
    /// contention has been observed.
    #[inline]
    fn live(&self) -> Option<(&[AtomicPtr<Cell>], usize)> {
        let n = self.len.load(Ordering::Acquire);
        if n == 0 {
            return None;
        }
        self.table.get().map(|t| (&t[..n], n))
    }

    /// Published stripe width; 0 while the table is absent.
    #[cfg(test)]
    pub(crate) fn cells_len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Applies one pending delta `x`.
    ///
    /// Fast path: a single CAS on the base value while no table exists, or a
    /// single CAS on the calling thread's cell once it does. Everything else
    /// escalates into [`retry_update`](Striped::retry_update).
    pub fn update(&self, x: i64) {
        match self.live() {
            None => {
                let b = self.base.load(Ordering::Relaxed);
                if self.cas_base(b, C::combine(b, x)) {
                    return;
                }
                // lost the race on base: real contention
                self.retry_update(x, true);
            }
            Some((slots, n)) => {
                let h = current_probe() as usize;
                let p = slots[(n - 1) & h].load(Ordering::Acquire);
                match unsafe { p.as_ref() } {
                    Some(cell) => {
                        let v = cell.value();
                        if !cell.cas(v, C::combine(v, x)) {
                            self.retry_update(x, false);
                        }
                    }
                    // our slot has no cell yet; install one in the slow path
                    None => self.retry_update(x, true),
                }
            }
        }
    }

    /// The retry/escalation ladder, entered after the fast path failed.
    ///
    /// `was_uncontended` is false when the caller already lost a CAS on its
    /// cell, in which case the probe is rehashed before that cell is tried
    /// again. Collisions escalate gradually: rehash first, and double the
    /// stripe width only when collisions persist below `max_cells()`. While
    /// another thread holds the structural lock the update falls back to the
    /// base value, so no thread ever waits on the lock.
    fn retry_update(&self, x: i64, mut was_uncontended: bool) {
        let mut h = current_probe() as usize;
        // set when the previous pass already collided on an occupied slot;
        // a second consecutive collision is what justifies growing
        let mut collide = false;
        let backoff = Backoff::new();
        loop {
            if let Some((slots, n)) = self.live() {
                let slot = &slots[(n - 1) & h];
                let p = slot.load(Ordering::Acquire);
                if p.is_null() {
                    // install a fresh cell already folding x; a plain CAS on
                    // the slot pointer, no structural lock involved
                    let cell = Box::into_raw(Box::new(Cell::new(C::combine(C::IDENTITY, x))));
                    match slot.compare_exchange(
                        ptr::null_mut(),
                        cell,
                        Ordering::Release,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => return,
                        Err(_) => {
                            // another thread claimed the slot first; the cell
                            // is there now, fold into it on the next pass
                            unsafe { drop(Box::from_raw(cell)) };
                            collide = false;
                            continue;
                        }
                    }
                }
                let cell = unsafe { &*p };
                if !was_uncontended {
                    // the caller's CAS on this slot just failed; rehash
                    // before hammering it again
                    was_uncontended = true;
                } else {
                    let v = cell.value();
                    if cell.cas(v, C::combine(v, x)) {
                        return;
                    }
                    if n >= max_cells() || self.len.load(Ordering::Acquire) != n {
                        // at full width, or someone already grew the table:
                        // rehashing is all that is left
                        collide = false;
                    } else if !collide {
                        collide = true;
                    } else if self.try_lock() {
                        if self.len.load(Ordering::Relaxed) == n {
                            // double the stripe width; installed cells keep
                            // their index, so no copying is needed
                            self.len.store(n << 1, Ordering::Release);
                        }
                        self.unlock();
                        collide = false;
                        continue;
                    }
                }
                h = rehash_probe() as usize;
            } else if self.len.load(Ordering::Acquire) == 0 && self.try_lock() {
                // we won the right to create the table
                let created = if self.len.load(Ordering::Relaxed) == 0 {
                    let slots = self.table.get_or_init(new_slot_array);
                    let cell = Box::into_raw(Box::new(Cell::new(C::combine(C::IDENTITY, x))));
                    slots[h & 1].store(cell, Ordering::Release);
                    self.len.store(2, Ordering::Release);
                    true
                } else {
                    false
                };
                self.unlock();
                if created {
                    return;
                }
            } else {
                // structural lock held elsewhere: treat the update as still
                // uncontended and fold it into the base value
                let b = self.base.load(Ordering::Relaxed);
                if self.cas_base(b, C::combine(b, x)) {
                    return;
                }
                backoff.spin();
            }
        }
    }

    /// Returns the current total: the base value folded with every installed
    /// cell.
    ///
    /// The result is **not** an atomic snapshot. Each of base and cells is
    /// read individually with no coordination against concurrent writers, so
    /// updates racing with this call may or may not be included. In the
    /// absence of concurrent writers the result is exact.
    pub fn total(&self) -> i64 {
        let mut total = self.base.load(Ordering::Relaxed);
        if let Some((slots, _)) = self.live() {
            for slot in slots {
                let p = slot.load(Ordering::Acquire);
                if let Some(cell) = unsafe { p.as_ref() } {
                    total = C::combine(total, cell.value());
                }
            }
        }
        total
    }
}

impl<C: Combine> Default for Striped<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Combine> Debug for Striped<C> {
    /// Formats the engine showing the base value and the installed cells.
    ///
    /// Output format: `{ base:value [slot]:value [slot]:value ... }`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ base:{}", self.base.load(Ordering::Relaxed))?;
        if let Some((slots, _)) = self.live() {
            for (i, slot) in slots.iter().enumerate() {
                let p = slot.load(Ordering::Acquire);
                if let Some(cell) = unsafe { p.as_ref() } {
                    write!(f, " [{i}]:{}", cell.value())?;
                }
            }
        }
        write!(f, " }}")
    }
}

impl<C: Combine> Drop for Striped<C> {
    fn drop(&mut self) {
        if let Some(slots) = self.table.get() {
            for slot in slots.iter() {
                let p = slot.load(Ordering::Relaxed);
                if !p.is_null() {
                    unsafe { drop(Box::from_raw(p)) };
                }
            }
        }
    }
}
