//! Error types for pagestore
//!
//! A single error enum covers the whole engine: lifecycle violations,
//! access-mode violations, I/O failures and programming errors.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Common result type for pagestore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for pagestore
#[derive(Debug, Error)]
pub enum Error {
    /// Any operation on a storage after `close()`
    #[error("storage is already closed; path {}", path.display())]
    Closed { path: PathBuf },

    /// A mutating call on a storage opened read-only
    #[error("read-only storage can't be modified; path {}", path.display())]
    ReadOnly { path: PathBuf },

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    /// Page index outside `[0, max)`
    #[error("page {page} is outside of [0, {max})")]
    PageOutOfRange { page: u64, max: u64 },

    /// Several failures collected by a best-effort sequence (e.g. close)
    #[error("{}", CompoundDisplay(.0))]
    Compound(Vec<Error>),

    #[error("configuration error: {0}")]
    Configuration(String),
}

struct CompoundDisplay<'a>(&'a [Error]);

impl fmt::Display for CompoundDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred", self.0.len())?;
        for (i, err) in self.0.iter().enumerate() {
            write!(f, "; [{}] {}", i + 1, err)?;
        }
        Ok(())
    }
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an unsupported operation error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Fold a list of collected failures into a single error.
    ///
    /// Returns `None` for an empty list and the error itself when only one
    /// failure was collected.
    #[must_use]
    pub fn from_many(mut errors: Vec<Error>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Compound(errors)),
        }
    }

    /// Check if this error reports use of a closed storage
    #[must_use]
    pub fn is_closed(&self) -> bool {
        match self {
            Self::Closed { .. } => true,
            Self::Compound(errors) => errors.iter().any(Self::is_closed),
            _ => false,
        }
    }

    /// Check if this error is fatal to the caller.
    ///
    /// Fatal errors signal misuse of the engine; they never go away by
    /// repeating the call.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Closed { .. } | Self::PageOutOfRange { .. })
    }

    /// Check if the error originated from the file system
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Storage(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_fatal() {
        let closed = Error::Closed {
            path: PathBuf::from("/tmp/x"),
        };
        assert!(closed.is_fatal());
        assert!(closed.is_closed());
        assert!(Error::PageOutOfRange { page: 9, max: 4 }.is_fatal());
        assert!(!Error::storage("boom").is_fatal());
    }

    #[test]
    fn test_from_many() {
        assert!(Error::from_many(Vec::new()).is_none());

        let single = Error::from_many(vec![Error::storage("a")]).unwrap();
        assert!(matches!(single, Error::Storage(_)));

        let many = Error::from_many(vec![Error::storage("a"), Error::unsupported("b")]).unwrap();
        let msg = many.to_string();
        assert!(msg.starts_with("2 errors occurred"));
        assert!(msg.contains("storage error: a"));
        assert!(msg.contains("unsupported operation: b"));
    }

    #[test]
    fn test_compound_is_closed() {
        let err = Error::Compound(vec![
            Error::storage("flush failed"),
            Error::Closed {
                path: PathBuf::from("/tmp/y"),
            },
        ]);
        assert!(err.is_closed());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(err.is_io());
        assert!(err.to_string().contains("gone"));
    }
}
