//! Error types for chatkeep.

use std::path::PathBuf;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: &'static str, message: String },
}

/// Failure classes a storage backend can report.
///
/// The gateway decides per kind whether to fall back to local files or to
/// report failure to the caller (see `gateway::fallback_decision`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No usable remote credential anywhere in the precedence chain.
    CredentialMissing,
    /// Connectivity, auth or server failure talking to the remote store.
    BackendUnreachable,
    /// Remote store reachable but the database/collection does not exist.
    NotProvisioned,
    /// Local filesystem unreadable or unwritable.
    LocalIo,
    /// Stored data does not match the expected shape.
    MalformedRecord,
    /// The user identifier cannot be used as a storage key.
    InvalidUserId,
}

/// Storage backend errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("No remote credentials: {0}")]
    CredentialMissing(String),

    #[error("Remote store {backend} unreachable: {reason}")]
    Unreachable { backend: String, reason: String },

    #[error("Remote resource not provisioned: {0}")]
    NotProvisioned(String),

    #[error("Local storage I/O failed at {}: {source}", path.display())]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed record for {user_id}: {reason}")]
    Malformed { user_id: String, reason: String },

    #[error("Invalid user identifier {user_id:?}: {reason}")]
    InvalidUserId { user_id: String, reason: String },
}

impl StoreError {
    /// The failure class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CredentialMissing(_) => ErrorKind::CredentialMissing,
            Self::Unreachable { .. } => ErrorKind::BackendUnreachable,
            Self::NotProvisioned(_) => ErrorKind::NotProvisioned,
            Self::LocalIo { .. } => ErrorKind::LocalIo,
            Self::Malformed { .. } => ErrorKind::MalformedRecord,
            Self::InvalidUserId { .. } => ErrorKind::InvalidUserId,
        }
    }

    pub(crate) fn unreachable(backend: &str, reason: impl Into<String>) -> Self {
        Self::Unreachable {
            backend: backend.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn malformed(user_id: &str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            user_id: user_id.to_string(),
            reason: reason.into(),
        }
    }
}

/// Account flow errors (sign-up, log-in, external sign-in).
#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("Please fill in all fields")]
    MissingFields,

    #[error("Passwords do not match")]
    PasswordMismatch,

    #[error("Username {0} already exists")]
    UsernameTaken(String),

    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Account {0} could not be saved to any storage backend")]
    StorageUnavailable(String),
}
