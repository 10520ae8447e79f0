//! Error types for the mesh operator.

use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A manifest document could not be decoded into an object
    #[error("unable to decode manifest document: {0}")]
    DecodeError(String),

    /// The requested object does not exist. Expected on the create path,
    /// not a failure in itself.
    #[error("{0} not found")]
    NotFound(String),

    /// Create was attempted for an object that already exists
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// The API server rejected the object as structurally invalid
    #[error("invalid object {0}: {1}")]
    Invalid(String, String),

    /// Optimistic-concurrency conflict; resolved by the next reconcile
    #[error("conflict writing {0}")]
    Conflict(String),

    /// The object was deleted while we were working with it
    #[error("{0} is gone")]
    Gone(String),

    /// Kubernetes API error not covered by a more specific kind
    #[error("Kubernetes API error: {0}")]
    KubeError(#[source] kube::Error),

    /// Operator configuration problem (missing charts dir, bad flag, ...)
    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Zero or more errors from a batch operation. Never constructed empty.
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Error::Invalid(..))
    }

    pub fn is_gone(&self) -> bool {
        matches!(self, Error::Gone(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// Errors worth a fast requeue rather than the slow error backoff.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Conflict(_) | Error::KubeError(_))
    }
}

impl From<kube::runtime::finalizer::Error<Error>> for Error {
    fn from(err: kube::runtime::finalizer::Error<Error>) -> Self {
        use kube::runtime::finalizer::Error as FinalizerError;
        match err {
            FinalizerError::ApplyFailed(e) | FinalizerError::CleanupFailed(e) => e,
            FinalizerError::AddFinalizer(e) | FinalizerError::RemoveFinalizer(e) => {
                Error::KubeError(e)
            }
            FinalizerError::UnnamedObject => {
                Error::ConfigError("object has no name".to_string())
            }
            FinalizerError::InvalidFinalizer => {
                Error::ConfigError("invalid finalizer name".to_string())
            }
        }
    }
}

/// Collects per-object errors from a batch operation. An empty collection
/// means full success and must never surface as an `Error`; use
/// [`AggregateError::into_result`] to enforce that.
#[derive(Debug, Default)]
pub struct AggregateError {
    errors: Vec<Error>,
}

impl AggregateError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: Error) {
        self.errors.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// Empty aggregate == success.
    pub fn into_result(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Aggregate(self))
        }
    }
}

impl From<Vec<Error>> for AggregateError {
    fn from(errors: Vec<Error>) -> Self {
        Self { errors }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.len() {
            0 => write!(f, "no errors"),
            1 => write!(f, "{}", self.errors[0]),
            _ => {
                write!(f, "[")?;
                for (i, err) in self.errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{err}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl std::error::Error for AggregateError {}

/// Number of leaf errors carried by an error value.
pub fn error_count(err: &Error) -> usize {
    match err {
        Error::Aggregate(agg) => agg.len(),
        _ => 1,
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
