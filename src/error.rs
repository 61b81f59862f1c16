//! Error types for dieah-sync

use thiserror::Error;

/// Result type alias for dieah-sync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in dieah-sync
#[derive(Error, Debug)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Agent already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Agent is not active: {0}")]
    AgentInactive(String),

    #[error("Resource busy: {memory_id} is locked by {holder}")]
    ResourceBusy { memory_id: String, holder: String },

    #[error("Timed out after {waited_ms}ms waiting for lock on {memory_id}")]
    Timeout { memory_id: String, waited_ms: u64 },

    #[error("Invalid lock token for {0}")]
    InvalidToken(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Conflict pending manual review: {0}")]
    ConflictPending(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of an [`Error`], stable across transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyRegistered,
    AgentInactive,
    ResourceBusy,
    Timeout,
    InvalidToken,
    StorageUnavailable,
    ConflictPending,
    InvalidInput,
    Config,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyRegistered => "already_registered",
            ErrorKind::AgentInactive => "agent_inactive",
            ErrorKind::ResourceBusy => "resource_busy",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InvalidToken => "invalid_token",
            ErrorKind::StorageUnavailable => "storage_unavailable",
            ErrorKind::ConflictPending => "conflict_pending",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Config => "config",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::StorageUnavailable(e.to_string())
    }
}

impl Error {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::StorageUnavailable(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn embedding(msg: impl Into<String>) -> Self {
        Self::Embedding(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn conflict_pending(msg: impl Into<String>) -> Self {
        Self::ConflictPending(msg.into())
    }

    /// The kind of this error, preserved through every layer
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyRegistered(_) => ErrorKind::AlreadyRegistered,
            Error::AgentInactive(_) => ErrorKind::AgentInactive,
            Error::ResourceBusy { .. } => ErrorKind::ResourceBusy,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::InvalidToken(_) => ErrorKind::InvalidToken,
            Error::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            Error::ConflictPending(_) => ErrorKind::ConflictPending,
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::Config(_) => ErrorKind::Config,
            Error::Embedding(_) | Error::Json(_) | Error::Io(_) => ErrorKind::Internal,
        }
    }

    /// Whether the failure came from the persistent store collaborator
    pub fn is_storage(&self) -> bool {
        self.kind() == ErrorKind::StorageUnavailable
    }
}
