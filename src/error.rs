//! Store error types.
//!
//! Contract outcomes (`NotFound`, `OutOfRange`, `InvalidArgument`,
//! `InvalidKind`, `Overflow`) are expected results and are surfaced verbatim.
//! Everything that goes wrong below the contract (IO, serialization,
//! connector failures) is wrapped in [`Error::Backend`].

use crate::value::Kind;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Store errors with structured context.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The operation needs a present key or element and there is none.
    #[error("not found: {key}")]
    NotFound { key: String },

    /// List index outside `[0, len)`.
    #[error("index {index} out of range for '{key}' (len {len})")]
    OutOfRange { key: String, index: usize, len: usize },

    /// Malformed argument (bad pop position, page < 1, non-string key).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation does not apply to the entry's current kind.
    #[error("'{key}' holds the wrong kind of entry: expected {expected}")]
    InvalidKind { key: String, expected: String },

    /// Counter arithmetic left the signed 64-bit range.
    #[error("counter overflow on '{key}'")]
    Overflow { key: String },

    /// IO, timeout, serialization, or adapter failure.
    #[error("backend failure: {0:#}")]
    Backend(#[source] anyhow::Error),

    /// A batch write applied some keys but not the ones listed.
    #[error("batch write failed for {} key(s): {}", failed.len(), failed.join(", "))]
    Partial {
        failed: Vec<String>,
        #[source]
        source: Box<Error>,
    },

    /// A `GetSet` producer failed; nothing was stored.
    #[error("producer failed for '{key}': {source:#}")]
    Producer {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// The store has been closed.
    #[error("store is closed")]
    Closed,

    /// Invalid descriptor, unknown store or connector.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    pub fn out_of_range(key: impl Into<String>, index: usize, len: usize) -> Self {
        Self::OutOfRange {
            key: key.into(),
            index,
            len,
        }
    }

    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument(reason.into())
    }

    /// The entry is not of the `expected` kind.
    pub fn invalid_kind(key: impl Into<String>, expected: Kind) -> Self {
        Self::InvalidKind {
            key: key.into(),
            expected: expected.to_string(),
        }
    }

    /// The entry is a scalar but does not parse as an integer.
    pub fn not_integer(key: impl Into<String>) -> Self {
        Self::InvalidKind {
            key: key.into(),
            expected: "integer".to_string(),
        }
    }

    pub fn overflow(key: impl Into<String>) -> Self {
        Self::Overflow { key: key.into() }
    }

    pub fn backend(source: impl Into<anyhow::Error>) -> Self {
        Self::Backend(source.into())
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config(reason.into())
    }

    /// Stable taxonomy name, used by process handlers and the script bridge.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NotFound",
            Self::OutOfRange { .. } => "OutOfRange",
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::InvalidKind { .. } => "InvalidKind",
            Self::Overflow { .. } => "Overflow",
            Self::Backend(_) | Self::Partial { .. } => "BackendFailure",
            Self::Producer { .. } => "ProducerFailure",
            Self::Closed => "Closed",
            Self::Config(_) => "Config",
        }
    }

    /// True for documented contract outcomes, false for infrastructure failures.
    pub fn is_contract(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::OutOfRange { .. }
                | Self::InvalidArgument(_)
                | Self::InvalidKind { .. }
                | Self::Overflow { .. }
        )
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Backend(err)
    }
}
