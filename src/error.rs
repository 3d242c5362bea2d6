//! Error types for raidvol
//!
//! Errors fall into three caller-visible classes: recoverable conditions
//! (stale headers, members not ready) that callers retry or ignore,
//! per-request I/O failures surfaced through completion status, and fatal
//! set-level conditions that take the whole set offline.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// All errors that can occur in raidvol
#[derive(Debug, Error)]
pub enum Error {
    /// The set has no active members and is not accepting I/O
    #[error("no medium: set has no active members")]
    NoMedium,

    /// A member dropped out of the set while a request was in flight
    #[error("set went offline while a request was in flight")]
    Offline,

    /// Fewer bytes transferred than requested despite no member error
    #[error("short transfer: {transferred} of {expected} bytes")]
    Underrun { expected: u64, transferred: u64 },

    /// Device-level I/O failure
    #[error("I/O error: {0}")]
    Io(String),

    /// Member header carries an older generation than the set
    #[error("stale member header: sequence {member} behind set sequence {set}")]
    StaleSequence { member: u64, set: u64 },

    /// Member header was written by an incompatible format version (fatal)
    #[error("header version mismatch: member has v{member}, set has v{set}")]
    HeaderVersionMismatch { member: u32, set: u32 },

    /// Two members claim the same logical index (fatal)
    #[error("logical index {0} is already occupied")]
    DuplicateIndex(usize),

    /// Member cannot join the set in its current condition
    #[error("member rejected: {0}")]
    Member(String),

    /// No attached member with the given identity
    #[error("unknown member {0}")]
    UnknownMember(Uuid),

    /// No registered set with the given identity
    #[error("unknown set {0}")]
    UnknownSet(Uuid),

    /// The set is in the Failed state and needs administrator intervention
    #[error("set has failed and requires administrator intervention")]
    SetFailed,

    /// Operation requires a started set
    #[error("set has not been started")]
    NotStarted,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error is expected to clear on retry with fresh inputs
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::StaleSequence { .. } | Error::Member(_))
    }
}
