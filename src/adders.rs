//! Core module containing the accumulator implementations and shared
//! infrastructure.
//!
//! This module provides the per-thread probe machinery and the combining-
//! function seam used by the contention-adaptive engine, as well as the
//! concrete accumulator types built on top of it.
//!
//! # Architecture
//!
//! Updates escalate through three stages, each engaged only when the previous
//! one has demonstrably failed:
//!
//! ```text
//!   add(x)
//!     │
//!     ▼
//!   [1] base CAS ────────── success ──► done   (no table, no contention)
//!     │ lost race / table exists
//!     ▼
//!   [2] striped CAS on cells[probe & (len-1)]
//!     │ collision
//!     ├── rehash probe, retry another cell
//!     │ collisions persist
//!     ▼
//!   [3] structural try-lock: create table (len 2) or double it
//!         losers never wait - they fall back to [1]/[2]
//! ```
//!
//! # Thread Probes
//!
//! Each thread lazily receives a private non-zero pseudo-random probe, stored
//! in thread-local storage and owned exclusively by that thread. The probe is
//! only ever used as a mask-index (`probe & (len - 1)`) into the cell table.
//! When the thread loses a CAS race on a cell, its probe is rehashed with an
//! xorshift step so that colliding threads statistically drift apart instead
//! of fighting over the same slot forever.
//!
//! Seeding runs a splitmix64 finalizer over a global Weyl sequence, so probes
//! are well spread even though thread creation order is sequential.

pub mod adder;
pub mod striped;

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global Weyl-sequence state from which new thread probes are seeded.
static PROBE_SEED: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// The calling thread's probe. Zero means "not yet seeded".
    static PROBE: Cell<u64> = const { Cell::new(0) };
}

/// Returns the calling thread's probe, seeding it on first use.
///
/// The returned value is never zero, so a zero reading elsewhere can only
/// mean an unseeded thread.
#[inline]
pub(crate) fn current_probe() -> u64 {
    PROBE.with(|p| {
        let h = p.get();
        if h != 0 {
            h
        } else {
            let h = seed_probe();
            p.set(h);
            h
        }
    })
}

/// Produces a fresh non-zero probe from the global Weyl sequence.
///
/// Uses `Ordering::Relaxed`: we only need each thread to draw a distinct
/// increment, not any cross-thread synchronization.
fn seed_probe() -> u64 {
    let mut z = PROBE_SEED.fetch_add(0x9e37_79b9_7f4a_7c15, Ordering::Relaxed);
    // splitmix64 finalizer
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^= z >> 31;
    if z == 0 {
        1
    } else {
        z
    }
}

/// Rehashes the calling thread's probe after a lost CAS race and returns the
/// new value.
///
/// The xorshift64 step is a bijection on non-zero values, so a seeded probe
/// can never degenerate to zero.
#[inline]
pub(crate) fn rehash_probe() -> u64 {
    PROBE.with(|p| {
        let mut h = p.get();
        h ^= h << 13;
        h ^= h >> 7;
        h ^= h << 17;
        p.set(h);
        h
    })
}

/// The combining operation injected into the contention-adaptive engine.
///
/// Implementors supply the semantic of "fold one pending delta into the
/// running value". The engine itself is agnostic to what combining means; it
/// only guarantees that every delta is eventually folded in exactly once.
///
/// # Requirements
///
/// `combine` must be **commutative and associative**: concurrent updates are
/// applied in no particular order, and the total is only well defined when
/// the order cannot matter. Addition, maximum and bitwise-or qualify;
/// subtraction of absolute values does not (fold a negative delta instead).
///
/// # Extension Point
///
/// Sum-like accumulators for other operations (max, bitwise-or, ...) can
/// reuse the whole retry/escalation engine by providing a `Combine`
/// implementation; only integer addition ships with this crate.
pub trait Combine {
    /// The identity element. Fresh accumulators start here, and it is the
    /// value a never-written cell contributes to the total.
    const IDENTITY: i64;

    /// Folds one pending delta `x` into the current value.
    fn combine(current: i64, x: i64) -> i64;
}
