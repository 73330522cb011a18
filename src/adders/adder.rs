//! Scalar adder built on the contention-adaptive engine.
//!
//! This module provides [`Adder`], an accumulator whose combining operation
//! is integer addition. It is the type to reach for when many threads update
//! a common running total used for statistics collection rather than for
//! fine-grained synchronization control.

use std::fmt::{self, Debug, Display};

use num_traits::ToPrimitive;

use crate::adders::striped::Striped;
use crate::adders::Combine;

/// Wrapping 64-bit integer addition with identity 0.
///
/// Supplied to the [`Striped`] engine as its combining operation. Addition
/// is commutative and associative, so totals are independent of how
/// concurrent updates interleave; on overflow the sum wraps, like the
/// underlying atomic would.
pub struct Plus;

impl Combine for Plus {
    const IDENTITY: i64 = 0;

    #[inline]
    fn combine(current: i64, x: i64) -> i64 {
        current.wrapping_add(x)
    }
}

/// A scalable running total for heavily contended concurrent addition.
///
/// One or more variables together maintain an initially zero sum. While
/// updates are uncontended the adder is a single atomic value; when updates
/// are contended across threads it transparently stripes itself over a
/// dynamically grown set of cache-padded cells (see
/// [`Striped`] for the mechanism).
///
/// Compared to a lone `AtomicI64`, expected throughput under high contention
/// is significantly higher, at the expense of higher space consumption once
/// striping engages. Under low contention the two are equivalent.
///
/// # Consistency
///
/// [`add`](Adder::add) always succeeds, never blocks and never errors.
/// [`sum`](Adder::sum) is weakly consistent: concurrent updates racing with
/// the read may or may not be reflected, but a quiescent read is exact.
///
/// # Examples
///
/// ```rust
/// use sommatori::adders::adder::Adder;
///
/// let total = Adder::new();
/// total.add(5);
/// total.add(3);
/// assert_eq!(total.sum(), 8);
/// assert_eq!(total.to_string(), "8");
/// ```
pub struct Adder {
    engine: Striped<Plus>,
}

impl Adder {
    /// Creates a new adder with an initial sum of zero.
    pub fn new() -> Self {
        Adder {
            engine: Striped::new(),
        }
    }

    /// Reconstructs an adder from a previously persisted sum.
    ///
    /// The base value is set to `sum`, the cell table is absent and the
    /// structural lock is free; only the aggregate survives persistence, not
    /// the internal distribution across cells.
    pub fn from_sum(sum: i64) -> Self {
        Adder {
            engine: Striped::with_base(sum),
        }
    }

    /// Adds the given value.
    #[inline]
    pub fn add(&self, delta: i64) {
        self.engine.update(delta);
    }

    /// Subtracts the given value. Equivalent to `add(-delta)`.
    #[inline]
    pub fn sub(&self, delta: i64) {
        self.engine.update(delta.wrapping_neg());
    }

    /// Returns the current sum.
    ///
    /// The returned value is *not* an atomic snapshot: invocation in the
    /// absence of concurrent updates returns an accurate result, but updates
    /// that occur while the sum is being calculated might not be
    /// incorporated. Computed fresh on every call, never cached.
    #[inline]
    pub fn sum(&self) -> i64 {
        self.engine.total()
    }
}

impl Default for Adder {
    /// Creates a new adder with an initial sum of zero.
    fn default() -> Self {
        Self::new()
    }
}

impl Display for Adder {
    /// Formats the decimal digits of [`sum`](Adder::sum).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sum())
    }
}

impl Debug for Adder {
    /// Formats the internal state: base value and installed cells.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Adder {:?}", self.engine)
    }
}

/// Numeric views of the running total, widened or narrowed from
/// [`sum`](Adder::sum).
///
/// Every conversion is computed fresh on each call. Narrowing conversions
/// are checked: `to_i32` on a sum outside the `i32` range and `to_u64` on a
/// negative sum return `None` instead of silently truncating.
impl ToPrimitive for Adder {
    fn to_i64(&self) -> Option<i64> {
        Some(self.sum())
    }

    fn to_u64(&self) -> Option<u64> {
        self.sum().to_u64()
    }

    fn to_f64(&self) -> Option<f64> {
        Some(self.sum() as f64)
    }

    fn to_f32(&self) -> Option<f32> {
        Some(self.sum() as f32)
    }
}

/// Persisted representation: the single integer returned by
/// [`sum`](Adder::sum). The striping across cells is intentionally lost.
#[cfg(feature = "serde")]
impl serde::Serialize for Adder {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_i64(self.sum())
    }
}

/// Reconstruction: base set to the stored value, no cell table, structural
/// lock free.
#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Adder {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        <i64 as serde::Deserialize>::deserialize(deserializer).map(Adder::from_sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_new() {
        let adder = Adder::new();
        assert_eq!(adder.sum(), 0);
    }

    #[test]
    fn test_default() {
        let adder = Adder::default();
        assert_eq!(adder.sum(), 0);
    }

    #[test]
    fn test_add() {
        let adder = Adder::new();
        adder.add(1);
        assert_eq!(adder.sum(), 1);
        adder.add(5);
        adder.add(2);
        assert_eq!(adder.sum(), 8);
    }

    #[test]
    fn test_sub() {
        let adder = Adder::new();
        adder.add(10);
        adder.sub(3);
        assert_eq!(adder.sum(), 7);
    }

    #[test]
    fn test_negative_deltas() {
        let adder = Adder::new();
        adder.add(-5);
        adder.add(2);
        assert_eq!(adder.sum(), -3);
    }

    #[test]
    fn test_wrapping_overflow() {
        let adder = Adder::from_sum(i64::MAX);
        adder.add(1);
        assert_eq!(adder.sum(), i64::MIN);
    }

    #[test]
    fn test_from_sum() {
        let adder = Adder::from_sum(1234);
        assert_eq!(adder.sum(), 1234);
        // reconstruction starts from a bare base, no cell table
        assert_eq!(adder.engine.cells_len(), 0);
        adder.add(1);
        assert_eq!(adder.sum(), 1235);
    }

    #[test]
    fn test_display_is_decimal_sum() {
        let adder = Adder::new();
        adder.add(42);
        assert_eq!(format!("{adder}"), "42");
        adder.sub(100);
        assert_eq!(adder.to_string(), "-58");
    }

    #[test]
    fn test_debug() {
        let adder = Adder::new();
        adder.add(9);
        let s = format!("{adder:?}");
        assert!(s.starts_with("Adder {"));
        assert!(s.contains("base:9"));
    }

    #[test]
    fn test_numeric_views() {
        let adder = Adder::new();
        adder.add(1000);
        assert_eq!(adder.to_i64(), Some(1000));
        assert_eq!(adder.to_u64(), Some(1000));
        assert_eq!(adder.to_i32(), Some(1000));
        assert_eq!(adder.to_f64(), Some(1000.0));
        assert_eq!(adder.to_f32(), Some(1000.0));
    }

    #[test]
    fn test_numeric_views_are_checked() {
        let adder = Adder::from_sum(i64::MAX);
        assert_eq!(adder.to_i64(), Some(i64::MAX));
        assert_eq!(adder.to_i32(), None);

        let negative = Adder::from_sum(-1);
        assert_eq!(negative.to_u64(), None);
    }

    #[test]
    fn test_numeric_views_track_the_live_sum() {
        let adder = Adder::new();
        adder.add(1);
        assert_eq!(adder.to_i64(), Some(1));
        adder.add(1);
        // computed fresh on every call, never cached
        assert_eq!(adder.to_i64(), Some(2));
    }

    #[test]
    fn test_no_lost_updates_under_contention() {
        const THREADS: usize = 4;
        const ITERS: i64 = 1000;

        let adder = Arc::new(Adder::new());
        let mut handles = vec![];

        for _ in 0..THREADS {
            let a = Arc::clone(&adder);
            handles.push(thread::spawn(move || {
                for _ in 0..ITERS {
                    a.add(1);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(adder.sum(), THREADS as i64 * ITERS);
    }

    #[test]
    fn test_sum_independent_of_interleaving() {
        // the same multiset of deltas, split across threads two different
        // ways, must produce the same quiescent sum
        fn run(chunks: Vec<Vec<i64>>) -> i64 {
            let adder = Arc::new(Adder::new());
            let handles: Vec<_> = chunks
                .into_iter()
                .map(|chunk| {
                    let a = Arc::clone(&adder);
                    thread::spawn(move || {
                        for x in chunk {
                            a.add(x);
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            adder.sum()
        }

        let deltas: Vec<i64> = (-500..500).collect();
        let expected: i64 = deltas.iter().sum();

        let by_halves = run(deltas.chunks(500).map(<[i64]>::to_vec).collect());
        let by_eighths = run(deltas.chunks(125).map(<[i64]>::to_vec).collect());

        assert_eq!(by_halves, expected);
        assert_eq!(by_eighths, expected);
    }

    #[test]
    fn test_liveness_all_threads_on_one_adder() {
        // every add must complete even when all available threads hammer the
        // same accumulator; joining all handles is the completion proof
        let threads = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        const ITERS: i64 = 50_000;

        let adder = Arc::new(Adder::new());
        let mut handles = vec![];

        for _ in 0..threads {
            let a = Arc::clone(&adder);
            handles.push(thread::spawn(move || {
                for _ in 0..ITERS {
                    a.add(1);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(adder.sum(), threads as i64 * ITERS);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_serialize_is_the_scalar_sum() {
        let adder = Adder::new();
        adder.add(1500);
        adder.sub(200);
        let json = serde_json::to_string(&adder).unwrap();
        assert_eq!(json, "1300");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_deserialize_rebuilds_base_only() {
        let adder: Adder = serde_json::from_str("-77").unwrap();
        assert_eq!(adder.sum(), -77);
        assert_eq!(adder.engine.cells_len(), 0);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_round_trip_preserves_the_aggregate() {
        const THREADS: usize = 8;
        const ITERS: i64 = 5_000;

        // build an adder that has actually striped itself
        let adder = Arc::new(Adder::new());
        let mut handles = vec![];
        for _ in 0..THREADS {
            let a = Arc::clone(&adder);
            handles.push(thread::spawn(move || {
                for _ in 0..ITERS {
                    a.add(1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let json = serde_json::to_string(&*adder).unwrap();
        let restored: Adder = serde_json::from_str(&json).unwrap();

        // the aggregate round-trips; the cell distribution does not
        assert_eq!(restored.sum(), adder.sum());
        assert_eq!(restored.engine.cells_len(), 0);
    }
}
