//! Error types and result aliases shared by the enclave crates.

/// The result type used throughout enclave-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by identifiers, configuration and object storage.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An identifier did not parse.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// What made the identifier invalid.
        message: String,
    },

    /// An object store call failed.
    #[error("storage error: {message}")]
    Storage {
        /// What was being done.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A project bucket does not exist yet.
    #[error("bucket {bucket} does not exist")]
    MissingBucket {
        /// The bucket name.
        bucket: String,
    },

    /// No object store is registered under an alias.
    #[error("no storage registered under alias {alias}")]
    UnknownAlias {
        /// The alias looked up.
        alias: String,
    },

    /// A configuration value or argument was rejected.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A lock was poisoned or a channel closed unexpectedly.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a storage error without a cause.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a storage error wrapping its cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a missing bucket error.
    #[must_use]
    pub fn missing_bucket(bucket: impl Into<String>) -> Self {
        Self::MissingBucket {
            bucket: bucket.into(),
        }
    }

    /// Returns true if the object, bucket or alias does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::MissingBucket { .. } | Self::UnknownAlias { .. }
        )
    }
}
