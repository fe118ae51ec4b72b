use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// obsdb errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The storage engine could not be opened or is no longer usable
    /// (invalid path, disk full, lock held by another process). Fatal for
    /// the store.
    Unavailable(String),
    /// An observation referenced a data stream that is not registered.
    /// Rejected before any mutation.
    UnknownStream(u64),
    /// The query would select too many series or streams. The caller must
    /// refine the filter; nothing was read.
    TooBroad(String),
    /// Detected mismatch between correlated indexes. Surfaced, never
    /// silently repaired.
    Corruption(String),
    /// Invalid data, typically decoding errors or unexpected internal values.
    InvalidData(String),
    /// Invalid user input, typically filter or configuration errors.
    InvalidInput(String),
    /// A retryable engine-level error. Upper layers may retry.
    Transient(String),
    /// A write was attempted on a read-only view (retired stream,
    /// federated member).
    ReadOnly,
    /// An IO error.
    IO(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Unavailable(msg) => write!(f, "storage unavailable: {msg}"),
            Error::UnknownStream(id) => write!(f, "unknown data stream: {id}"),
            Error::TooBroad(msg) => write!(f, "query too broad: {msg}"),
            Error::Corruption(msg) => write!(f, "index corruption: {msg}"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::Transient(msg) => write!(f, "transient error: {msg}"),
            Error::ReadOnly => write!(f, "write attempted on read-only store"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
        }
    }
}

impl Error {
    /// Whether the failed operation can be safely retried as-is.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

/// Constructs an Error::InvalidData for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// An obsdb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl serde::de::Error for Error {
    fn custom<T: Display>(msg: T) -> Self {
        Error::InvalidData(msg.to_string())
    }
}

impl serde::ser::Error for Error {
    fn custom<T: Display>(msg: T) -> Self {
        Error::InvalidData(msg.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}
