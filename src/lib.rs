//! # Sommatori - Contention-Adaptive Striped Accumulators
//!
//! A Rust library providing a thread-safe running total that stays fast no
//! matter how many threads hammer it. Instead of a fixed shard count, the
//! accumulator **adapts to observed contention**: it starts as a single atomic
//! value and grows a table of cache-padded cells only when concurrent writers
//! actually collide.
//!
//! ## The Problem
//!
//! In multi-threaded applications, a naive approach to counting uses a single
//! atomic variable shared across all threads. While this is correct, it
//! creates a severe performance bottleneck: every update causes **cache line
//! bouncing** between CPU cores, as each core must acquire exclusive access to
//! the cache line containing the counter.
//!
//! Statically sharded counters fix the bottleneck but pay their full memory
//! footprint up front, even for counters that only one thread ever touches.
//!
//! ## The Solution: Adaptive Striping
//!
//! This library keeps the best of both worlds:
//!
//! 1. **Uncontended fast path**: while no contention has ever been observed,
//!    an [`Adder`](adders::adder::Adder) is a single CAS on one base value -
//!    no table, no extra memory.
//!
//! 2. **Lazy striping**: the first time two threads genuinely collide, a
//!    small table of cells is created. Each cell is wrapped in
//!    [`crossbeam_utils::CachePadded`] so that adjacent cells never share a
//!    cache line (**false sharing** would otherwise defeat the striping).
//!
//! 3. **Per-thread probes**: each thread carries a private pseudo-random
//!    probe that picks its cell. On collision the probe is rehashed, which
//!    statistically spreads the colliding threads apart.
//!
//! 4. **Growth as a last resort**: only when collisions persist across
//!    several rehashes does the table double, up to a bound derived from the
//!    hardware parallelism. Structural changes are coordinated by a tiny
//!    try-lock that nobody ever waits on: losers fall back to the ordinary
//!    CAS paths.
//!
//! 5. **Aggregation on read**: [`sum()`](adders::adder::Adder::sum) folds the
//!    base value and every live cell. Reads are a little more expensive and
//!    writes extremely fast, which is the right trade-off for counters (many
//!    writes, few reads).
//!
//! ## Quick Start
//!
//! ```rust
//! use sommatori::adders::adder::Adder;
//!
//! // Create an accumulator (can be shared across threads via Arc)
//! let total = Adder::new();
//!
//! // Add from any thread - never blocks, never fails
//! total.add(1);
//! total.add(5);
//!
//! // Read the running total (folds base + all live cells)
//! assert_eq!(total.sum(), 6);
//! ```
//!
//! Multi-threaded:
//!
//! ```rust
//! use sommatori::adders::adder::Adder;
//! use std::sync::Arc;
//! use std::thread;
//!
//! let total = Arc::new(Adder::new());
//! let mut handles = vec![];
//!
//! for _ in 0..4 {
//!     let t = Arc::clone(&total);
//!     handles.push(thread::spawn(move || {
//!         for _ in 0..1000 {
//!             t.add(1);
//!         }
//!     }));
//! }
//!
//! for h in handles {
//!     h.join().unwrap();
//! }
//!
//! assert_eq!(total.sum(), 4000);
//! ```
//!
//! ## Consistency Model
//!
//! `add` always succeeds and never blocks. `sum` is **weakly consistent**: it
//! has no linearization point relative to concurrent writers, so adds racing
//! with a `sum` may or may not be reflected. Once all writers have finished,
//! `sum` is exact. The combining operation must be commutative and
//! associative (true of addition), so the final total is independent of how
//! concurrent adds interleave.
//!
//! ## Memory Usage
//!
//! An uncontended accumulator costs one padded atomic. Under contention the
//! cell table grows in powers of two up to roughly the number of hardware
//! threads; each live cell occupies its own cache line. Memory is traded for
//! throughput only where contention has actually been observed.
//!
//! ## Serialization
//!
//! With the `serde` feature, an [`Adder`](adders::adder::Adder) serializes as
//! the single integer returned by `sum()`. Deserialization rebuilds an
//! accumulator whose base holds that value and whose cell table is absent:
//! only the aggregate survives a round trip, not the internal distribution.
//!
//! ## The Compute-Map Contract
//!
//! The [`mapping`] module specifies an atomic "compute-or-insert" contract
//! for concurrent associative maps - the [`Compute`](mapping::Compute) trait
//! with `compute_if_absent` / `compute`, their exactly-once, null-rejection
//! and reentrancy-detection semantics, and a small key-level-exclusion
//! reference implementation ([`KeyLockMap`](mapping::KeyLockMap)) that honors
//! the contract. A full scalable concurrent hash table is out of scope here.

pub mod adders;
pub mod mapping;
