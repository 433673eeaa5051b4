//! Engine error taxonomy
//!
//! Component-level failures (conflict resolution, deduplication) are caught
//! where they occur and downgraded into result-object fields; only
//! transaction-level failures (lock, commit, corruption) propagate as
//! `Err`, because a partial commit is never acceptable.

use chronik_models::RecordError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed input (missing identity, unknown shape). Fatal before any
    /// mutation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A resolution strategy failed for one conflict. Callers catch this
    /// per-conflict and continue.
    #[error("conflict resolution failed: {0}")]
    ConflictResolution(String),

    /// Deduplication stage failure. Downgraded to a warning on the merge
    /// result by the engine.
    #[error("deduplication failed: {0}")]
    Deduplication(String),

    /// The subject's lock is held by another operation. No state changed;
    /// the attempt is retryable.
    #[error("could not acquire lock for subject {subject_id}: {reason}")]
    LockAcquisition { subject_id: String, reason: String },

    /// Persistence or integrity failure during commit. The persisted record
    /// is unchanged.
    #[error("commit failed: {0}")]
    Commit(String),

    /// The persisted record violates structural invariants. Raised rather
    /// than repaired.
    #[error("record corruption: {0}")]
    RecordCorruption(#[from] RecordError),

    /// Underlying store failure.
    #[error("store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unknown staging area: {0}")]
    UnknownStaging(uuid::Uuid),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the failure left persisted state untouched and may simply be
    /// retried by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::LockAcquisition { .. })
    }
}
