use thiserror::Error;

/// Primary error type for cairn storage-engine operations.
///
/// Structured variants for the common cases; the page-cache layer itself
/// only ever produces [`CairnError::OutOfMemory`] and
/// [`CairnError::InvalidConfig`], but the enum is shared engine-wide.
#[derive(Error, Debug)]
pub enum CairnError {
    /// A buffer or table allocation failed against a configured bound.
    #[error("out of memory")]
    OutOfMemory,

    /// A configuration value was rejected at construction time.
    #[error("invalid configuration: {detail}")]
    InvalidConfig {
        /// What was wrong with the configuration.
        detail: String,
    },

    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl CairnError {
    /// Shorthand for an [`CairnError::Internal`] with a formatted message.
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::Internal(detail.into())
    }
}

/// Result alias used throughout the cairn crates.
pub type Result<T> = std::result::Result<T, CairnError>;
