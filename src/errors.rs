//! errors — таксономия ошибок снапшоттера.
//!
//! Публичные операции возвращают `Result<T, Error>`. Низкоуровневые ошибки
//! (файловая система, внешние утилиты btrfs/zfs) приходят как `anyhow::Error`
//! с контекстом и оборачиваются в `Error::Internal`, цепочка причин сохраняется.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Referenced key/name/parent does not exist in the metadata store.
    #[error("not found: {0}")]
    NotFound(String),

    /// Key or name collision on create/commit.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Malformed request: bad field path, empty key, non-committed parent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The request is well-formed but the current state forbids it
    /// (commit of a view, remove of a snapshot with children, read-only transaction).
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Operation not available on this backend.
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Storage tool / syscall / codec failure. `{:#}` prints the whole chain.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidArgument,
    FailedPrecondition,
    Unsupported,
    Cancelled,
    DeadlineExceeded,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::FailedPrecondition(_) => ErrorKind::FailedPrecondition,
            Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    #[inline]
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    #[inline]
    pub fn is_already_exists(&self) -> bool {
        self.kind() == ErrorKind::AlreadyExists
    }

    /// Prefix the message with what the caller was doing, keeping the kind.
    pub fn context<C: std::fmt::Display>(self, what: C) -> Self {
        match self {
            Error::NotFound(m) => Error::NotFound(format!("{what}: {m}")),
            Error::AlreadyExists(m) => Error::AlreadyExists(format!("{what}: {m}")),
            Error::InvalidArgument(m) => Error::InvalidArgument(format!("{what}: {m}")),
            Error::FailedPrecondition(m) => Error::FailedPrecondition(format!("{what}: {m}")),
            Error::Unsupported(m) => Error::Unsupported(format!("{what}: {m}")),
            Error::Internal(e) => Error::Internal(e.context(what.to_string())),
            other => other,
        }
    }
}
