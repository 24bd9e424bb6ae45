use thiserror::Error;

/// Error taxonomy for the data layer.
///
/// Every variant carries one caller-visible message; when the failure
/// originates in the storage engine the engine's own message is retained in
/// `cause`. Backends report [`DbError::Engine`] with a coarse
/// [`EngineErrorKind`]; the write path reclassifies those into the surface
/// the caller invoked (create/update/delete).
#[derive(Debug, Error)]
pub enum DbError {
    #[error("create failed ({kind:?}): {message}")]
    Create {
        kind: CreateFailureKind,
        message: String,
        cause: Option<String>,
    },

    #[error("read failed ({kind:?}): {message}")]
    Read {
        kind: ReadFailureKind,
        message: String,
    },

    #[error("update failed ({kind:?}): {message}")]
    Update {
        kind: UpdateFailureKind,
        message: String,
        cause: Option<String>,
    },

    #[error("delete failed ({kind:?}): {message}")]
    Delete {
        kind: DeleteFailureKind,
        message: String,
        cause: Option<String>,
    },

    #[error("transaction rolled back: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Box<DbError>,
    },

    #[error("storage connection failed ({kind:?}): {message}")]
    Connection {
        kind: ConnectionFailureKind,
        message: String,
    },

    #[error("migration failed ({kind:?}): {message}")]
    Migration {
        kind: MigrationFailureKind,
        message: String,
    },

    #[error("sync failed ({kind:?}): {message}")]
    Sync {
        kind: SyncFailureKind,
        message: String,
    },

    #[error("storage engine error ({kind:?}): {message}")]
    Engine {
        kind: EngineErrorKind,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateFailureKind {
    ConstraintViolation,
    InvalidData,
    AccessDenied,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFailureKind {
    NotFound,
    InvalidQuery,
    AccessDenied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateFailureKind {
    ConcurrencyConflict,
    ConstraintViolation,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteFailureKind {
    ConstraintViolation,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFailureKind {
    Unreachable,
    DatabaseLocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationFailureKind {
    SchemaMismatch,
    Corruption,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncFailureKind {
    /// Transient transport problem; the batch may be retried.
    Transport,
    /// The server rejected the batch outright; retrying cannot help.
    PermanentRejection,
}

/// Coarse classification a backend attaches to raw engine failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    ConstraintViolation,
    Locked,
    Other,
}

impl DbError {
    pub fn invalid_data(message: impl Into<String>) -> Self {
        DbError::Create {
            kind: CreateFailureKind::InvalidData,
            message: message.into(),
            cause: None,
        }
    }

    pub fn invalid_query(message: impl Into<String>) -> Self {
        DbError::Read {
            kind: ReadFailureKind::InvalidQuery,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        DbError::Read {
            kind: ReadFailureKind::NotFound,
            message: message.into(),
        }
    }

    pub fn engine(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        DbError::Engine {
            kind,
            message: message.into(),
        }
    }

    pub fn sync_transport(message: impl Into<String>) -> Self {
        DbError::Sync {
            kind: SyncFailureKind::Transport,
            message: message.into(),
        }
    }

    pub fn sync_rejected(message: impl Into<String>) -> Self {
        DbError::Sync {
            kind: SyncFailureKind::PermanentRejection,
            message: message.into(),
        }
    }

    /// True when retrying the same operation can plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            DbError::Sync { kind, .. } => *kind == SyncFailureKind::Transport,
            DbError::Connection { .. } => true,
            DbError::Engine { kind, .. } => *kind == EngineErrorKind::Locked,
            _ => false,
        }
    }

    /// Reclassifies a raw engine failure for the insert surface.
    pub(crate) fn into_create_failure(self) -> Self {
        match self {
            DbError::Engine { kind, message } => DbError::Create {
                kind: match kind {
                    EngineErrorKind::ConstraintViolation => CreateFailureKind::ConstraintViolation,
                    EngineErrorKind::Locked | EngineErrorKind::Other => CreateFailureKind::Unknown,
                },
                message: "row could not be created".to_string(),
                cause: Some(message),
            },
            other => other,
        }
    }

    /// Reclassifies a raw engine failure for the update surface.
    pub(crate) fn into_update_failure(self) -> Self {
        match self {
            DbError::Engine { kind, message } => DbError::Update {
                kind: match kind {
                    EngineErrorKind::ConstraintViolation => UpdateFailureKind::ConstraintViolation,
                    EngineErrorKind::Locked | EngineErrorKind::Other => UpdateFailureKind::NotFound,
                },
                message: "row could not be updated".to_string(),
                cause: Some(message),
            },
            other => other,
        }
    }

    /// Reclassifies a raw engine failure for the delete surface.
    pub(crate) fn into_delete_failure(self) -> Self {
        match self {
            DbError::Engine { kind, message } => DbError::Delete {
                kind: match kind {
                    EngineErrorKind::ConstraintViolation => DeleteFailureKind::ConstraintViolation,
                    EngineErrorKind::Locked | EngineErrorKind::Other => DeleteFailureKind::NotFound,
                },
                message: "row could not be deleted".to_string(),
                cause: Some(message),
            },
            other => other,
        }
    }

    pub(crate) fn rollback(message: impl Into<String>, source: DbError) -> Self {
        DbError::Transaction {
            message: message.into(),
            source: Box::new(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CreateFailureKind, DbError, EngineErrorKind, UpdateFailureKind};

    #[test]
    fn engine_constraint_errors_reclassify_per_surface() {
        let create = DbError::engine(EngineErrorKind::ConstraintViolation, "UNIQUE failed")
            .into_create_failure();
        match create {
            DbError::Create { kind, cause, .. } => {
                assert_eq!(kind, CreateFailureKind::ConstraintViolation);
                assert_eq!(cause.as_deref(), Some("UNIQUE failed"));
            }
            other => panic!("expected create failure, got {other:?}"),
        }

        let update = DbError::engine(EngineErrorKind::ConstraintViolation, "CHECK failed")
            .into_update_failure();
        match update {
            DbError::Update { kind, .. } => {
                assert_eq!(kind, UpdateFailureKind::ConstraintViolation)
            }
            other => panic!("expected update failure, got {other:?}"),
        }
    }

    #[test]
    fn retryability_tracks_failure_kind() {
        assert!(DbError::sync_transport("timeout").is_retryable());
        assert!(!DbError::sync_rejected("forbidden").is_retryable());
        assert!(!DbError::invalid_data("bad").is_retryable());
    }

    #[test]
    fn transaction_failure_carries_first_underlying_error() {
        let inner = DbError::invalid_data("bad value");
        let err = DbError::rollback("insert aborted", inner);
        let source = std::error::Error::source(&err).expect("source should be set");
        assert!(source.to_string().contains("bad value"));
    }
}
