//! The tagged error enum used across the ingestion and storage pipeline.
//!
//! Per the REDESIGN FLAGS note in the specification, `StoreFull` is a pattern
//! match on this enum rather than a driver-code integer comparison.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TraceHubError {
    /// Malformed element or unexpected attribute value. Never fatal to the
    /// connection: the parser resynchronizes at the next well-formed element.
    #[error("parse error: {0}")]
    Parse(String),

    /// A dimension id read back from the store could not be coerced to a
    /// non-negative integer.
    #[error("corrupt store: {0}")]
    CorruptStore(String),

    /// The store reported its storage-full condition on a write.
    #[error("store is full")]
    StoreFull,

    /// The archive directory or archive database file could not be created.
    #[error("failed to create archive: {0}")]
    ArchiveCreationFailed(String),

    /// A GUI connection sent the wrong magic cookie or protocol version.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A socket-level failure, scoped to the owning connection.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Any other store failure not recognized as storage-full.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, TraceHubError>;

impl TraceHubError {
    /// True if this error (or the underlying SQLite error it wraps) is the
    /// engine's storage-full signal.
    pub fn is_store_full(&self) -> bool {
        match self {
            TraceHubError::StoreFull => true,
            TraceHubError::Store(rusqlite::Error::SqliteFailure(e, _)) => {
                matches!(e.code, rusqlite::ErrorCode::DiskFull)
            }
            _ => false,
        }
    }
}

/// Classify a raw `rusqlite::Error`, collapsing the storage-full code into
/// [`TraceHubError::StoreFull`] so callers can match on it directly instead of
/// re-inspecting the driver code at every call site.
pub fn classify_store_error(err: rusqlite::Error) -> TraceHubError {
    if let rusqlite::Error::SqliteFailure(code, _) = &err {
        if matches!(code.code, rusqlite::ErrorCode::DiskFull) {
            return TraceHubError::StoreFull;
        }
    }
    TraceHubError::Store(err)
}
