//! Atomic "compute-or-insert" contract for concurrent associative maps.
//!
//! This module specifies the observable semantics a concurrent map must honor
//! to be a safe memoization target - the [`Compute`] trait - together with a
//! unified error taxonomy ([`ComputeError`]) and a small reference
//! implementation ([`KeyLockMap`]) that exercises the contract. A complete
//! scalable concurrent hash table is explicitly out of scope; the reference
//! map favors obviousness over throughput.
//!
//! # The Contract
//!
//! - `compute_if_absent(key, f)`: if `key` already maps to a value, return
//!   it; otherwise invoke `f(key)` at most once per missing key under
//!   key-level exclusion, install its value and return it.
//! - `compute(key, f)`: invoke `f(key, current)` under the same key-level
//!   exclusion and atomically install its value.
//!
//! Both operations may briefly block other operations on the *same* key while
//! the supplied function runs, so the function should be short and simple and
//! must not attempt to update any other mapping of the same map instance.
//! Re-entering the computation for the *same* key from within the function is
//! the one misuse that is actively detected: it would otherwise never
//! complete, and fails with [`ComputeError::Recursive`] instead.
//!
//! # Error Semantics
//!
//! Operations fail without partial progress:
//!
//! - [`ComputeError::NullResult`]: the function produced no value; nothing
//!   was installed and the prior mapping, if any, is unchanged.
//! - [`ComputeError::Recursive`]: detectable same-key recursion; nothing was
//!   changed. Signals a caller bug.
//! - [`ComputeError::Function`]: the function's own error, propagated
//!   unchanged; no mapping is installed by `compute_if_absent` and the prior
//!   mapping is retained by `compute`.
//!
//! # Example
//!
//! ```rust
//! use sommatori::mapping::{Compute, KeyLockMap};
//!
//! let memo: KeyLockMap<u32, u64> = KeyLockMap::new();
//!
//! // computed once per missing key, even under concurrent callers
//! let v = memo.compute_if_absent(10, |k| Some(u64::from(*k) * 2)).unwrap();
//! assert_eq!(v, 20);
//!
//! // subsequent calls return the installed value without recomputing
//! let again = memo.compute_if_absent(10, |_| unreachable!()).unwrap();
//! assert_eq!(again, 20);
//! ```

mod compute;
mod error;

pub use compute::{Compute, KeyLockMap};
pub use error::{ComputeError, Result};
