//! Result alias and small combinators for side effects on results.

use crate::error::Error;

/// The standard Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Tap-style combinators for any `Result`.
///
/// Used where an error must be recorded (usually logged) but the result is
/// passed on unchanged.
pub trait GenericResultExt<T, E> {
    /// Perform a side effect on the Ok value without consuming the Result.
    fn tap_ok<F: FnOnce(&T)>(self, f: F) -> Self;

    /// Perform a side effect on the Err value without consuming the Result.
    fn tap_err<F: FnOnce(&E)>(self, f: F) -> Self;
}

impl<T, E> GenericResultExt<T, E> for std::result::Result<T, E> {
    fn tap_ok<F: FnOnce(&T)>(self, f: F) -> Self {
        if let Ok(ref v) = self {
            f(v);
        }
        self
    }

    fn tap_err<F: FnOnce(&E)>(self, f: F) -> Self {
        if let Err(ref e) = self {
            f(e);
        }
        self
    }
}
