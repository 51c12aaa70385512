use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The client handed back a pagination token we can't parse. Reset to the first page.
    #[error("Malformed cursor: {0}")]
    MalformedCursor(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Read-state write rejected or timed out. The optimistic projection has
    /// already been rolled back when the caller sees this.
    #[error("Read-state commit failed: {0}")]
    CommitFailed(String),

    #[error("Page size {requested} exceeds maximum {max}")]
    CapacityExceeded { requested: u32, max: u32 },

    #[error("Unknown push topic: {0}")]
    UnknownTopic(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl SyncError {
    /// Transient failures are worth retrying with backoff; everything else
    /// needs the caller to change what it is asking for.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::StoreUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_store_unavailable_is_transient() {
        assert!(SyncError::StoreUnavailable("down".into()).is_transient());
        assert!(!SyncError::MalformedCursor("x".into()).is_transient());
        assert!(!SyncError::CommitFailed("rejected".into()).is_transient());
        assert!(!SyncError::CapacityExceeded { requested: 500, max: 100 }.is_transient());
    }

    #[test]
    fn capacity_message_names_both_sizes() {
        let err = SyncError::CapacityExceeded { requested: 500, max: 100 };
        assert_eq!(err.to_string(), "Page size 500 exceeds maximum 100");
    }
}
