//! Storage error types for the bronze, silver and gold layers.

use std::path::PathBuf;

/// Errors produced by [`BronzeLog`](crate::BronzeLog),
/// [`SilverStore`](crate::SilverStore) and [`GoldStore`](crate::GoldStore).
#[derive(Debug, thiserror::Error)]
pub enum LakeError {
    /// File-system failure on a bronze object or directory.
    #[error("i/o error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `SQLite` failure annotated with the operation that hit it.
    #[error("sqlite error ({context}): {source}")]
    Sqlite {
        context: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// A row or object could not be (de)serialized.
    #[error("serialization error ({context}): {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    /// Stored data that should be well-formed is not.
    #[error("corrupt data in {location}: {reason}")]
    Corrupt { location: String, reason: String },

    /// A bronze object with this position already exists.
    #[error("bronze object already exists: {}", path.display())]
    ObjectExists { path: PathBuf },

    /// The stored row carries the same event id under a different version.
    #[error(
        "event {event_id} for {entity}/{primary_key} already merged with a different version"
    )]
    EventMutated {
        entity: String,
        primary_key: String,
        event_id: String,
    },

    /// Internal mutex was poisoned by a panicked thread.
    #[error("lake store lock poisoned")]
    LockPoisoned,
}

impl LakeError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn sqlite(context: &'static str, source: rusqlite::Error) -> Self {
        Self::Sqlite { context, source }
    }

    pub(crate) fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Json {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn corrupt(location: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            location: location.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same call may succeed.
    ///
    /// I/O failures other than malformed data and permission problems are
    /// transient, as are busy or locked `SQLite` databases.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io { source, .. } => !matches!(
                source.kind(),
                std::io::ErrorKind::InvalidData | std::io::ErrorKind::PermissionDenied
            ),
            Self::Sqlite { source, .. } => matches!(
                source.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
            ),
            Self::Json { .. }
            | Self::Corrupt { .. }
            | Self::ObjectExists { .. }
            | Self::EventMutated { .. }
            | Self::LockPoisoned => false,
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, LakeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_transient_unless_permanent() {
        let busy = LakeError::io(
            "/tmp/x",
            std::io::Error::new(std::io::ErrorKind::Interrupted, "eintr"),
        );
        assert!(busy.is_transient());

        let denied = LakeError::io(
            "/tmp/x",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope"),
        );
        assert!(!denied.is_transient());
    }

    #[test]
    fn locked_database_is_transient() {
        let inner = rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(6), None);
        assert!(LakeError::sqlite("merge", inner).is_transient());
    }

    #[test]
    fn event_mutation_is_permanent() {
        let err = LakeError::EventMutated {
            entity: "orders".into(),
            primary_key: "O1".into(),
            event_id: "e1".into(),
        };
        assert!(!err.is_transient());
        assert!(err.to_string().contains("orders/O1"));
    }

    #[test]
    fn io_error_displays_path() {
        let err = LakeError::io(
            "/data/bronze",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.to_string().contains("/data/bronze"));
    }
}
