//! Shared error primitives.
//!
//! Typed errors that callers are expected to match on are defined with `snafu` in the crate that owns them. Everything
//! else (collaborator failures, glue code, configuration plumbing) flows through [`GenericError`], which carries an
//! arbitrary error along with its chain of sources.
#![deny(warnings)]
#![deny(missing_docs)]

use std::fmt::Display;

/// An opaque error with an attached chain of context.
pub type GenericError = anyhow::Error;

#[doc(hidden)]
pub use anyhow::anyhow as _anyhow;

/// Constructs a [`GenericError`].
///
/// Accepts a string literal, a format string followed by its arguments, or a single value implementing `Debug` and
/// `Display`. When that value is itself a `std::error::Error`, its source chain is preserved.
#[macro_export]
macro_rules! generic_error {
    ($msg:literal $(,)?) => { $crate::_anyhow!($msg) };
    ($err:expr $(,)?) => { $crate::_anyhow!($err) };
    ($fmt:expr, $($arg:tt)*) => { $crate::_anyhow!($fmt, $($arg)*) };
}

mod private {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}
}

// `anyhow::Context` is wrapped rather than re-exported so that its methods don't collide with `snafu::ResultExt` when
// both traits are in scope.
/// Adds context to the error variant of a `Result`, converting it into a [`GenericError`].
pub trait ErrorContext<T, E>: private::Sealed {
    /// Wraps the error with the given context.
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static;

    /// Wraps the error with context produced by `f`, which is only called if there is an error.
    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ErrorContext<T, E> for Result<T, E>
where
    Result<T, E>: anyhow::Context<T, E>,
{
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
    {
        <Self as anyhow::Context<T, E>>::context(self, context)
    }

    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        <Self as anyhow::Context<T, E>>::with_context(self, f)
    }
}
