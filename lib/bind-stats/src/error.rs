use std::fmt::Display;

use carbon_pickle::{EncodeError, TransmitError};
use snafu::Snafu;

use crate::{fetch::FetchError, tree::TreeError};

/// A catch-all error type for process-level plumbing.
pub type GenericError = anyhow::Error;

/// Constructs a [`GenericError`] from a string literal, a format string, or an existing error value.
#[macro_export]
macro_rules! generic_error {
    ($msg:literal $(,)?) => { $crate::__anyhow!($msg) };
    ($err:expr $(,)?) => { $crate::__anyhow!($err) };
    ($fmt:expr, $($arg:tt)*) => { $crate::__anyhow!($fmt, $($arg)*) };
}

mod private {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}
}

/// Attaches human-readable context to an error while converting it into a [`GenericError`].
///
/// Named distinctly from `anyhow::Context` so that it can be imported alongside `snafu::ResultExt`.
pub trait ErrorContext<T, E>: private::Sealed {
    /// Wraps the error value with additional context.
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static;

    /// Wraps the error value with additional context that is only evaluated if an error occurred.
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
        anyhow::Context::context(self, context)
    }

    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        anyhow::Context::with_context(self, f)
    }
}

/// An error that abandons a single poll cycle.
///
/// None of these are fatal to the process: the poll loop logs them and waits for the next cycle.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum CycleError {
    /// The statistics endpoint could not be reached, or did not return a document.
    #[snafu(display("statistics source unavailable: {}", source))]
    SourceUnavailable {
        /// Source of the error.
        source: FetchError,
    },

    /// The statistics document was missing an expected field or held a non-numeric counter.
    #[snafu(display("malformed statistics: {}", source))]
    MalformedStatistics {
        /// Source of the error.
        source: TreeError,
    },

    /// The metric batch could not be encoded into a frame.
    #[snafu(display("failed to encode metric batch: {}", source))]
    EncodingFailed {
        /// Source of the error.
        source: EncodeError,
    },

    /// The frame could not be delivered to Carbon.
    #[snafu(display("Carbon unavailable: {}", source))]
    SinkUnavailable {
        /// Source of the error.
        source: TransmitError,
    },
}

impl CycleError {
    /// Returns a short, stable identifier for the class of error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceUnavailable { .. } => "source_unavailable",
            Self::MalformedStatistics { .. } => "malformed_statistics",
            Self::EncodingFailed { .. } => "encoding_failed",
            Self::SinkUnavailable { .. } => "sink_unavailable",
        }
    }
}
