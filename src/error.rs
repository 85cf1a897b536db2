//! The error taxonomy (`spec.md` §7).
//!
//! Every fallible operation in this crate returns `Result<T>` where the
//! error carries a POSIX-style kind and, where known, the path that was
//! being resolved. Kinds are never silently swallowed: a resolution error
//! surfaces directly, and the one masking rule (a denied intermediate
//! directory hides `ENOENT` for its children) is applied explicitly in
//! `path::resolve`, not by accident here.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

/// A POSIX-style error kind, matching the scenarios enumerated in
/// `spec.md` §4 and §8.
#[derive(ThisError, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("no such file or directory")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("file exists")]
    AlreadyExists,
    #[error("directory not empty")]
    NotEmpty,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("too many levels of symbolic links")]
    SymlinkLoop,
    #[error("device or resource busy")]
    Busy,
    #[error("permission denied")]
    AccessDenied,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("bad file descriptor")]
    BadDescriptor,
    #[error("too many open files")]
    TooManyOpenFiles,
    #[error("no space left on device")]
    NoSpace,
    #[error("root key does not match the store")]
    KeyMismatch,
    #[error("authenticated decryption failed: stored record is corrupt")]
    Corruption,
}

/// An error carrying its kind and, if known, the offending path.
#[derive(Debug, Clone)]
pub struct Error {
    pub kind: ErrorKind,
    pub path: Option<PathBuf>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, path: None }
    }

    pub fn with_path(kind: ErrorKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: Some(path.into()),
        }
    }

    pub fn attach_path(mut self, path: impl Into<PathBuf>) -> Self {
        if self.path.is_none() {
            self.path = Some(path.into());
        }
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{}: {}", path.display(), self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

/// Shorthand used throughout the crate: `err(ErrorKind::NotFound)`.
pub fn err<T>(kind: ErrorKind) -> Result<T> {
    Err(Error::new(kind))
}
