//! Error types for the CAS crate

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for blob store and cache access operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error while reading or writing blobs
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(stowage::cas::io),
        help("Check file permissions and available disk space")
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

    /// A string could not be parsed as a content hash
    #[error("Invalid content hash: {message}")]
    #[diagnostic(code(stowage::cas::invalid_hash))]
    InvalidHash {
        /// What was wrong with the input
        message: String,
    },

    /// The remote blob store rejected or failed a request
    #[error("Remote cache error for {key}: {message}")]
    #[diagnostic(
        code(stowage::cas::remote),
        help("The remote cache may be unavailable; results are still stored locally")
    )]
    Remote {
        /// Key of the blob involved
        key: String,
        /// Error message describing the remote failure
        message: String,
    },

    /// No usable cache location could be determined
    #[error("Configuration error: {message}")]
    #[diagnostic(
        code(stowage::cas::config),
        help("Set STOWAGE_CACHE_DIR to a writable directory")
    )]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },
}

impl Error {
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

    /// Create an I/O error without path context
    #[must_use]
    pub fn io_no_path(source: std::io::Error, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: None,
            operation: operation.into(),
        }
    }

    /// Create an invalid hash error
    #[must_use]
    pub fn invalid_hash(msg: impl Into<String>) -> Self {
        Self::InvalidHash {
            message: msg.into(),
        }
    }

    /// Create a remote store error
    #[must_use]
    pub fn remote(key: impl ToString, msg: impl Into<String>) -> Self {
        Self::Remote {
            key: key.to_string(),
            message: msg.into(),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }
}

/// Result type for CAS operations
pub type Result<T> = std::result::Result<T, Error>;
