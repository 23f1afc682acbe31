use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the overlay, the ACL engine, the sharing resolver and the store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no such file or directory: {0}")]
    NotFound(String),
    #[error("file exists: {0}")]
    AlreadyExists(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),
    #[error("no attribute {key} on {path}")]
    NoAttribute { path: String, key: String },
    #[error("revision conflict on document {id}: expected {expected}, found {found}")]
    Conflict { id: String, expected: u64, found: u64 },
    #[error("invalid acl: {0}")]
    Acl(#[from] AclError),
    #[error("friendship error: {0}")]
    Friendship(#[from] FriendshipError),
    #[error("unknown user: {0}")]
    UnknownUser(String),
    #[error("{op} failed on {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("batch write stopped after {} committed document(s), {} left unwritten: {source}", .committed.len(), .failed.len())]
    PartialWrite {
        committed: Vec<String>,
        failed: Vec<String>,
        #[source]
        source: Box<Error>,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store error: {0}")]
    Store(String),
}

impl Error {
    /// Wrap a backend failure, folding the common io kinds into the matching variant.
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        let shown = path.display().to_string();
        match source.kind() {
            io::ErrorKind::NotFound => Error::NotFound(shown),
            io::ErrorKind::AlreadyExists => Error::AlreadyExists(shown),
            io::ErrorKind::PermissionDenied => Error::PermissionDenied(shown),
            _ => match source.raw_os_error() {
                Some(libc::ENOTDIR) => Error::NotADirectory(shown),
                Some(libc::ENOTEMPTY) => Error::DirectoryNotEmpty(shown),
                _ => Error::Io { op, path, source },
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

/// Structural problems with an access control list.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AclError {
    #[error("missing required entries: {0}")]
    MissingEntries(String),
    #[error("incomplete acl and no mode to backfill it from")]
    NoModeToBackfill,
    #[error("malformed entry {0:?}")]
    MalformedAce(String),
    #[error("binary acl truncated ({0} bytes)")]
    TruncatedBinary(usize),
    #[error("unsupported acl version {0:#06x}")]
    UnsupportedVersion(u32),
    #[error("unknown entry kind {0:#x}")]
    UnknownKind(u16),
}

/// Illegal transitions of a relationship between two users.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FriendshipError {
    #[error("{0} is blocked")]
    BlockedUser(String),
    #[error("a request to {0} is already pending")]
    AlreadyPending(String),
    #[error("{login} is already related ({status})")]
    AlreadyRelated { login: String, status: String },
    #[error("no pending request for {0}")]
    NotPending(String),
    #[error("{0} is not blocked")]
    NotBlocked(String),
    #[error("no relationship with {0}")]
    NotRelated(String),
    #[error("{0} is an active follower and must be removed before blocking")]
    CannotBlockFollower(String),
}
