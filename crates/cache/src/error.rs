//! Error types for the cache crate

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for cache controller operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error while cleaning or writing outputs
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(stowage::cache::io),
        help("Check file permissions and ensure the path exists")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "write", "create")
        operation: String,
    },

    /// Manifest could not be encoded or decoded
    #[error("Serialization error: {message}")]
    #[diagnostic(code(stowage::cache::serialization))]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
    },

    /// Outputs or manifest do not match what was declared
    #[error("Cache integrity error: {message}")]
    #[diagnostic(
        code(stowage::cache::integrity),
        help("The cache entry or the declared outputs are inconsistent; it will not be retried")
    )]
    Integrity {
        /// Error message describing the inconsistency
        message: String,
    },

    /// Configuration or validation error
    #[error("Cache configuration error: {message}")]
    #[diagnostic(code(stowage::cache::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Failure reported by the blob store
    #[error(transparent)]
    #[diagnostic(transparent)]
    Cas(#[from] stowage_cas::Error),

    /// Several failures recorded by one operation
    #[error("{message}")]
    #[diagnostic(code(stowage::cache::multiple_failures))]
    MultiCause {
        /// Summary of the failures
        message: String,
        /// The individual failures
        #[related]
        causes: Vec<Error>,
    },
}

impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an integrity error
    #[must_use]
    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity {
            message: msg.into(),
        }
    }

    /// Aggregate recorded failures: one is returned as is, several are wrapped
    #[must_use]
    pub fn aggregate(message: impl Into<String>, mut causes: Vec<Self>) -> Option<Self> {
        match causes.len() {
            0 => None,
            1 => causes.pop(),
            _ => Some(Self::MultiCause {
                message: message.into(),
                causes,
            }),
        }
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn remote_failure(key: &str) -> Error {
        Error::Cas(stowage_cas::Error::remote(key, "unavailable"))
    }

    #[test]
    fn aggregate_of_nothing_is_none() {
        assert!(Error::aggregate("failures", Vec::new()).is_none());
    }

    #[test]
    fn aggregate_single_failure_is_unwrapped() {
        let err = Error::aggregate("failures", vec![remote_failure("a")]).unwrap();
        assert!(matches!(err, Error::Cas(stowage_cas::Error::Remote { .. })));
    }

    #[test]
    fn aggregate_many_failures_keeps_all_causes() {
        let err =
            Error::aggregate("2 failures", vec![remote_failure("a"), remote_failure("b")]).unwrap();
        match err {
            Error::MultiCause { message, causes } => {
                assert_eq!(message, "2 failures");
                assert_eq!(causes.len(), 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn io_error_display_includes_path() {
        let err = Error::io(
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
            "/tmp/out",
            "create",
        );
        assert_eq!(err.to_string(), "I/O create failed: /tmp/out");
    }
}
