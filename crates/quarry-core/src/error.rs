use thiserror::Error;

use crate::index::IndexStatus;

/// Failure reported by a single store node.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("query rejected: {0}")]
    Rejected(String),
    #[error("timed out after {0}s")]
    Timeout(u64),
    #[error("cancelled")]
    Cancelled,
    #[error("decode error: {0}")]
    Decode(String),
}

/// One node that failed during a cluster fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFailure {
    pub ordinal: usize,
    pub host: String,
    pub port: u16,
    pub error: String,
}

impl std::fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "node {} ({}:{}): {}",
            self.ordinal, self.host, self.port, self.error
        )
    }
}

#[derive(Debug, Error)]
pub enum QuarryError {
    #[error("too many sort fields: {requested} requested, at most {max} allowed")]
    TooManyFields { requested: usize, max: usize },
    #[error("duplicate sort field '{0}'")]
    DuplicateField(String),
    #[error("sort field '{0}' is not allowed")]
    DisallowedField(String),
    #[error("sort field '{0}' must be indexed for large result sets")]
    IndexRequiredForScale(String),
    #[error("{op} on '{table}' failed: {source}")]
    Store {
        op: &'static str,
        table: String,
        #[source]
        source: StoreError,
    },
    #[error("{} of {total} nodes failed: {}", failed.len(), join_failures(failed))]
    ClusterPartialFailure {
        failed: Vec<NodeFailure>,
        total: usize,
    },
    #[error("index '{name}' cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        name: String,
        from: IndexStatus,
        to: IndexStatus,
    },
    #[error("invalid identifier '{0}': only letters, digits, '_' and '.' are allowed")]
    InvalidIdentifier(String),
    #[error("invalid page token: {0}")]
    InvalidToken(String),
    #[error("row is missing cursor value for '{0}'")]
    MissingCursorValue(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QuarryError {
    pub(crate) fn store(op: &'static str, table: impl Into<String>, source: StoreError) -> Self {
        QuarryError::Store {
            op,
            table: table.into(),
            source,
        }
    }

    /// Errors caused by the request itself.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            QuarryError::TooManyFields { .. }
                | QuarryError::DuplicateField(_)
                | QuarryError::DisallowedField(_)
                | QuarryError::IndexRequiredForScale(_)
                | QuarryError::InvalidIdentifier(_)
                | QuarryError::InvalidToken(_)
        )
    }
}

fn join_failures(failed: &[NodeFailure]) -> String {
    failed
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, QuarryError>;
