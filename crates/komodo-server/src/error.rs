use komodo_core::CoreError;
use komodo_store::StoreError;

/// Failure of a relay operation, classified by how it is reported.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Missing ids, non-member sender or a payload that does not parse.
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Repeating an operation whose effect already holds.
    #[error("{0}")]
    AlreadyInState(String),

    /// Internal bookkeeping disagreed with itself.
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error(transparent)]
    Parse(#[from] CoreError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RelayError {
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Parse(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_)) || matches!(self, Self::Store(e) if e.is_not_found())
    }

    pub fn is_idempotent(&self) -> bool {
        matches!(self, Self::AlreadyInState(_))
    }

    pub fn is_io(&self) -> bool {
        matches!(self, Self::Store(e) if !e.is_not_found())
    }

    /// Log at the level this class of failure warrants.
    pub fn report(&self, event: &str) {
        if self.is_io() || matches!(self, Self::Invariant(_)) {
            tracing::error!(event, error = %self, "relay operation failed");
        } else {
            tracing::warn!(event, error = %self, "relay request dropped");
        }
    }
}
