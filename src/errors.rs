//! Crate-wide error taxonomy.
//!
//! Every failure that can cross a component boundary is one of these kinds.
//! Reply events carry the short `code()` string on the wire; callers map it
//! back with [`CoreError::from_code`] to recover the original kind.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced by the placement, dispatch, runtime and API layers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Malformed URL, missing required field, bad TQL text.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// No entity snapshot and no live state machine for the id.
    #[error("entity not found: {0}")]
    EntityNotFound(String),

    /// Create referenced a template entity that does not exist.
    #[error("template entity not found: {0}")]
    TemplateNotFound(String),

    /// The consistent-hash ring has no member that can own the id.
    #[error("host not found: {0}")]
    HostNotFound(String),

    /// A snapshot write carried a version older than the stored one.
    #[error("version conflict: {0}")]
    Conflict(String),

    /// A raft command was proposed on a follower.
    #[error("not the raft leader")]
    NotLeader,

    /// Broker or store unreachable; retryable at dispatch.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Holder deadline or raft apply timeout.
    #[error("deadline exceeded")]
    Timeout,

    /// Decode failure after retry, invariant violation, recovered panic.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Short code carried in reply events (`errCode` field).
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InvalidParam(_) => "InvalidParam",
            CoreError::EntityNotFound(_) => "EntityNotFound",
            CoreError::TemplateNotFound(_) => "TemplateNotFound",
            CoreError::HostNotFound(_) => "HostNotFound",
            CoreError::Conflict(_) => "Conflict",
            CoreError::NotLeader => "NotLeader",
            CoreError::Unavailable(_) => "Unavailable",
            CoreError::Timeout => "Timeout",
            CoreError::Internal(_) => "Internal",
        }
    }

    /// Rebuild the error kind from a wire code. Unknown codes collapse to
    /// `Internal` so a newer node never crashes an older caller.
    pub fn from_code(code: &str) -> Self {
        match code {
            "InvalidParam" => CoreError::InvalidParam(String::new()),
            "EntityNotFound" => CoreError::EntityNotFound(String::new()),
            "TemplateNotFound" => CoreError::TemplateNotFound(String::new()),
            "HostNotFound" => CoreError::HostNotFound(String::new()),
            "Conflict" => CoreError::Conflict(String::new()),
            "NotLeader" => CoreError::NotLeader,
            "Timeout" => CoreError::Timeout,
            "Unavailable" => CoreError::Unavailable(String::new()),
            other => CoreError::Internal(other.to_string()),
        }
    }

    /// True for kinds a dispatcher may retry after refreshing its view.
    pub fn retryable(&self) -> bool {
        matches!(self, CoreError::Unavailable(_) | CoreError::NotLeader)
    }
}
