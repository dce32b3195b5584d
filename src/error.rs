use core::fmt;

use thiserror::Error;

/// Result alias for `strata`.
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline phase an error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Text normalization, cache lookups and embedding calls.
    Embedding,
    /// Projection, mixture fitting and size control.
    Clustering,
    /// Summarizer calls.
    Summarization,
    /// Serialization and configuration loading.
    Persistence,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Embedding => write!(f, "embedding"),
            Phase::Clustering => write!(f, "clustering"),
            Phase::Summarization => write!(f, "summarization"),
            Phase::Persistence => write!(f, "persistence"),
        }
    }
}

/// Failure reported by an external embedding or summarization capability.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The provider asked us to slow down.
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// The provider failed on its side (5xx and friends).
    #[error("server error: {0}")]
    Server(String),
    /// Anything that will not succeed on retry.
    #[error("{0}")]
    Fatal(String),
}

impl ProviderError {
    /// Whether a retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::RateLimited(_) | ProviderError::Server(_))
    }
}

/// Errors returned by the embedding, clustering and tree maintenance layers.
#[derive(Debug, Error)]
pub enum Error {
    /// Input was empty.
    #[error("empty input provided")]
    EmptyInput,

    /// Input is present but unusable (e.g. a tree with no nodes to rebuild from).
    #[error("degenerate input: {0}")]
    DegenerateInput(String),

    /// Vector dimension mismatch.
    #[error("dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch {
        /// Expected dimension.
        expected: usize,
        /// Found dimension.
        found: usize,
    },

    /// Invalid configuration or parameter value.
    #[error("invalid parameter '{name}': {message}")]
    InvalidParameter {
        /// Parameter name.
        name: &'static str,
        /// Error message.
        message: String,
    },

    /// A structural invariant of the tree or of a clustering result was broken.
    #[error("structural invariant violated: {0}")]
    InvariantViolation(String),

    /// A capability call failed for good (fatal, or transient with retries exhausted).
    #[error("{phase} failed after {attempts} attempt(s): {source}")]
    Provider {
        /// Phase the call belonged to.
        phase: Phase,
        /// Number of attempts made.
        attempts: u32,
        /// Last provider error.
        #[source]
        source: ProviderError,
    },

    /// Numerical failure inside projection or mixture fitting.
    #[error("clustering failed: {0}")]
    Clustering(String),

    /// Embedding cache storage failure.
    #[error("embedding cache error: {0}")]
    Cache(#[from] rusqlite::Error),

    /// Tree (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration file could not be parsed.
    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Some nodes of a batch could not be applied; see the update report.
    #[error("partial update: {failed} of {total} node(s) failed")]
    PartialUpdate {
        /// Nodes that failed.
        failed: usize,
        /// Nodes in the batch.
        total: usize,
    },
}

impl Error {
    /// Shorthand for [`Error::InvalidParameter`].
    pub fn invalid(name: &'static str, message: impl Into<String>) -> Self {
        Error::InvalidParameter {
            name,
            message: message.into(),
        }
    }

    /// Phase the error belongs to, if it can be attributed to one.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Error::Provider { phase, .. } => Some(*phase),
            Error::Cache(_) => Some(Phase::Embedding),
            Error::Clustering(_) | Error::DimensionMismatch { .. } => Some(Phase::Clustering),
            Error::Serialization(_) | Error::Config(_) | Error::Io(_) => Some(Phase::Persistence),
            _ => None,
        }
    }

    /// Whether this is a structural invariant violation.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Error::InvariantViolation(_))
    }
}
