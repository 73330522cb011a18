//! Unified error type for the atomic-compute contract.
//!
//! The accumulator side of this crate has no error taxonomy at all - every
//! anomaly is absorbed by retrying. The compute-map contract is the one place
//! where failures are surfaced to callers, and they all funnel through
//! [`ComputeError`].

use std::convert::Infallible;

use thiserror::Error;

/// Errors raised by [`Compute`](crate::mapping::Compute) operations.
///
/// `E` is the error type of the user-supplied mapping function; operations
/// whose function cannot fail use the default [`Infallible`].
///
/// Every variant guarantees the absence of partial progress: when an
/// operation fails, the map holds exactly what it held before the call.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ComputeError<E = Infallible> {
    /// The mapping function produced no value. Nothing was installed and the
    /// prior mapping, if any, is unchanged.
    #[error("mapping function produced no value")]
    NullResult,

    /// The computation detectably attempted a recursive update for its own
    /// key, which would otherwise never complete. Nothing was changed; this
    /// signals a bug in the caller.
    #[error("recursive computation for the same key would never complete")]
    Recursive,

    /// The mapping function itself failed. The error is propagated unchanged
    /// and the prior state is untouched.
    #[error(transparent)]
    Function(E),
}

/// Result type for compute-map operations.
pub type Result<T, E = Infallible> = std::result::Result<T, ComputeError<E>>;
