//! State backend error types.

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced by [`StateBackend`](crate::StateBackend) operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying storage failure.
    #[error("state backend error: {0}")]
    Backend(#[source] BoxError),

    /// Storage failure annotated with the operation that hit it.
    #[error("state backend error ({context}): {source}")]
    BackendContext {
        context: &'static str,
        #[source]
        source: BoxError,
    },

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("state backend lock poisoned")]
    LockPoisoned,
}

impl StateError {
    pub fn backend(err: impl Into<BoxError>) -> Self {
        Self::Backend(err.into())
    }

    pub fn backend_context(context: &'static str, err: impl Into<BoxError>) -> Self {
        Self::BackendContext {
            context,
            source: err.into(),
        }
    }

    /// Whether retrying the same call may succeed (busy database, I/O).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(_) => true,
            Self::Backend(source) | Self::BackendContext { source, .. } => source
                .downcast_ref::<rusqlite::Error>()
                .is_some_and(is_busy),
            Self::LockPoisoned => false,
        }
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    )
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_displays_context() {
        let inner = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(1),
            Some("table not found".into()),
        );
        let err = StateError::backend_context("get_watermark", inner);
        let msg = err.to_string();
        assert!(msg.contains("get_watermark"), "got: {msg}");
    }

    #[test]
    fn busy_database_is_transient() {
        let inner = rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(5), None);
        assert!(StateError::backend(inner).is_transient());
    }

    #[test]
    fn constraint_violation_is_not_transient() {
        let inner = rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(19), None);
        assert!(!StateError::backend(inner).is_transient());
    }

    #[test]
    fn lock_poisoned_displays() {
        let err = StateError::LockPoisoned;
        assert_eq!(err.to_string(), "state backend lock poisoned");
        assert!(!err.is_transient());
    }

    #[test]
    fn io_error_wraps() {
        let inner = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = StateError::Io(inner);
        assert!(err.to_string().contains("i/o"));
    }
}
