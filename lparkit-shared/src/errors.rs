//! Error taxonomy for the lparkit driver.

use thiserror::Error;

/// Result alias used by every fallible lparkit operation.
pub type LparkitResult<T> = Result<T, LparkitError>;

/// Top-level driver error.
#[derive(Debug, Error)]
pub enum LparkitError {
    /// Driver options are missing or out of range.
    #[error("configuration error: {0}")]
    Config(String),

    /// A caller supplied an argument the driver cannot act on.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An operation was attempted in a state that does not permit it.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A remote entity could not be found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The remote management API rejected or failed a request.
    #[error("management API error during {operation}: {message}")]
    Api {
        /// Remote operation that failed.
        operation: String,
        /// Message reported by the API client.
        message: String,
    },

    /// Storage mapping or media operation failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Shared storage pool resolution failed.
    #[error(transparent)]
    StoragePool(#[from] StoragePoolError),

    /// Local persistence failed.
    #[error("database error: {0}")]
    Database(String),

    /// Local I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// (De)serialisation failed.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invariant violation inside the driver.
    #[error("internal error: {0}")]
    Internal(String),

    /// A flow failed and at least one of its reverts failed too.
    #[error("{cause} (revert failed: {})", join_revert_failures(.failures))]
    RevertFailed {
        /// Error that made the flow revert.
        cause: Box<LparkitError>,
        /// Reverts that returned an error, in the order they ran.
        failures: Vec<RevertFailure>,
    },
}

/// A task whose revert returned an error.
#[derive(Debug)]
pub struct RevertFailure {
    pub task: String,
    pub error: LparkitError,
}

fn join_revert_failures(failures: &[RevertFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("{}: {}", failure.task, failure.error))
        .collect::<Vec<_>>()
        .join(", ")
}

impl LparkitError {
    /// Builds an [`LparkitError::Api`] for the named remote operation.
    pub fn api(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Error that started a failed flow, looking through revert failures.
    pub fn root_cause(&self) -> &LparkitError {
        match self {
            Self::RevertFailed { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    /// Reverts that failed after this error, empty for plain errors.
    pub fn revert_failures(&self) -> &[RevertFailure] {
        match self {
            Self::RevertFailed { failures, .. } => failures,
            _ => &[],
        }
    }
}

/// Configuration ambiguity while resolving the shared storage pool.
///
/// All four kinds are fatal: they describe how the host is configured and
/// are never retried.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StoragePoolError {
    /// A pool name was configured but no pool carries it.
    #[error("unable to find a shared storage pool named '{name}'")]
    NotFoundByName {
        /// Configured pool name.
        name: String,
    },

    /// A pool name was configured and more than one pool carries it.
    #[error("found {count} shared storage pools named '{name}'")]
    TooManyFound {
        /// Configured pool name.
        name: String,
        /// Number of matching pools.
        count: usize,
    },

    /// No pool name is configured and the host has no pools.
    #[error("no shared storage pool name configured and none found on the host")]
    NoConfigNoneFound,

    /// No pool name is configured and the host has several pools.
    #[error(
        "no shared storage pool name configured and {count} pools found on the host; \
         configure ssp_name to choose one"
    )]
    NoConfigTooManyFound {
        /// Number of pools on the host.
        count: usize,
    },
}
