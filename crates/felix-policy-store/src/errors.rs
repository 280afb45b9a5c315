use std::fmt;
use thiserror::Error;

/// Which half of a non-transactional replace failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    Delete,
    Insert,
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdatePhase::Delete => f.write_str("delete"),
            UpdatePhase::Insert => f.write_str("insert"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PolicyStoreError {
    #[error("invalid rule: {0} fields exceeds the maximum of 6")]
    InvalidRule(usize),
    #[error("unsupported filter type: {0}")]
    UnsupportedFilterType(String),
    #[error("duplicate key: {0}")]
    DuplicateKey(String),
    #[error("cannot save a filtered policy")]
    FilteredSave,
    #[error("length mismatch: {old} old rules vs {new} new rules")]
    LengthMismatch { old: usize, new: usize },
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] anyhow::Error),
    #[error("partial update: {phase} phase failed: {source}")]
    PartialUpdate {
        phase: UpdatePhase,
        #[source]
        source: Box<PolicyStoreError>,
    },
    #[error("operation canceled")]
    Canceled,
    #[error("no driver registered for scheme {0:?}")]
    UnknownScheme(String),
    #[error("invalid connection url: {0}")]
    InvalidUrl(String),
}

impl PolicyStoreError {
    pub fn unavailable(err: impl Into<anyhow::Error>) -> Self {
        Self::StoreUnavailable(err.into())
    }

    pub(crate) fn partial(phase: UpdatePhase, source: PolicyStoreError) -> Self {
        Self::PartialUpdate {
            phase,
            source: Box::new(source),
        }
    }
}

pub type PolicyStoreResult<T> = Result<T, PolicyStoreError>;

impl From<PolicyStoreError> for casbin::Error {
    fn from(err: PolicyStoreError) -> Self {
        casbin::error::AdapterError(Box::new(err)).into()
    }
}
