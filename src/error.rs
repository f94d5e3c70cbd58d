//! Error types returned by the embedding API
//!
//! Argument and usage errors are returned to the caller. Touching GC state
//! from inside a collector-driven finalizer is not recoverable and goes
//! through [`fatal_error`] instead.

use thiserror::Error;

/// Errors reported synchronously by [`Env`](crate::Env) operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// A handle or value that was never valid, or a value of the wrong kind
    #[error("invalid argument")]
    InvalidArg,

    /// Misuse of a valid handle, such as unref below zero or a double delete
    #[error("generic failure")]
    GenericFailure,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Report a fatal usage error and abort the current operation.
///
/// The collector may already be in a state where continuing would corrupt it,
/// so there is no way back from here.
#[cold]
#[track_caller]
pub fn fatal_error(location: &str, message: &str) -> ! {
    tracing::error!(location, "{message}");
    panic!("FATAL ERROR: {location} {message}");
}
