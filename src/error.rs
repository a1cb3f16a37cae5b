use chrono::{DateTime, Utc};
use derive_more::{Display, From};

use crate::{request::OperationKind, revision_id::RevisionId};

pub type Result<T> = std::result::Result<T, Error>;

/// Everything an archive operation can fail with.
///
/// A [`Rejection`] is an ordinary outcome the caller can act on (somebody
/// else holds the lock, the label is taken, ...). A [`Fault`] means the
/// operation could not run at all; a corrupt archive is always a fault.
#[derive(Debug, Display, From)]
pub enum Error {
    #[from]
    #[display(fmt = "{}", _0)]
    Rejected(Rejection),
    #[from]
    #[display(fmt = "{}", _0)]
    Fault(Fault),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Rejected(rejection) => rejection.kind(),
            Error::Fault(Fault::Corrupt(_)) => ErrorKind::CorruptArchive,
            Error::Fault(Fault::IO(_)) => ErrorKind::Io,
            Error::Fault(Fault::Serde(_)) => ErrorKind::Json,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fault(_))
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Error::Rejected(rejection) => Some(rejection),
            Error::Fault(_) => None,
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Fault(Fault::IO(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Fault(Fault::Serde(err))
    }
}

impl From<CorruptArchive> for Error {
    fn from(err: CorruptArchive) -> Self {
        Error::Fault(Fault::Corrupt(err))
    }
}

/// Flat classification of failures, independent of the payload they carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyLocked,
    NotLockedByUser,
    LabelAlreadyExists,
    InvalidRevisionIdentifier,
    InvalidFieldAccess,
    ArchiveExists,
    LockingDisabled,
    CorruptArchive,
    Io,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum Rejection {
    #[display(fmt = "{} not found", _0)]
    NotFound(Missing),
    #[display(fmt = "revision {} is locked by {}", revision, locker)]
    AlreadyLocked { revision: RevisionId, locker: String },
    #[display(fmt = "revision {} is not locked by {}", revision, user)]
    NotLockedByUser { revision: RevisionId, user: String },
    #[display(fmt = "label {:?} already exists", _0)]
    LabelAlreadyExists(String),
    #[display(fmt = "invalid revision identifier {:?}: {}", text, reason)]
    InvalidRevisionIdentifier { text: String, reason: &'static str },
    #[display(fmt = "field `{}` {} {}", field, access, operation)]
    InvalidFieldAccess {
        operation: OperationKind,
        field: &'static str,
        access: FieldAccess,
    },
    #[display(fmt = "archive already exists at {}", _0)]
    ArchiveExists(String),
    #[display(fmt = "archive does not support locking")]
    LockingDisabled,
}

impl Rejection {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Rejection::NotFound(_) => ErrorKind::NotFound,
            Rejection::AlreadyLocked { .. } => ErrorKind::AlreadyLocked,
            Rejection::NotLockedByUser { .. } => ErrorKind::NotLockedByUser,
            Rejection::LabelAlreadyExists(_) => ErrorKind::LabelAlreadyExists,
            Rejection::InvalidRevisionIdentifier { .. } => ErrorKind::InvalidRevisionIdentifier,
            Rejection::InvalidFieldAccess { .. } => ErrorKind::InvalidFieldAccess,
            Rejection::ArchiveExists(_) => ErrorKind::ArchiveExists,
            Rejection::LockingDisabled => ErrorKind::LockingDisabled,
        }
    }
}

impl std::error::Error for Rejection {}

/// The thing a [`Rejection::NotFound`] could not find.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum Missing {
    #[display(fmt = "archive {}", _0)]
    Archive(String),
    #[display(fmt = "revision {}", _0)]
    Revision(RevisionId),
    #[display(fmt = "label {:?}", _0)]
    Label(String),
    #[display(fmt = "revision before {}", _0)]
    RevisionBefore(DateTime<Utc>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum FieldAccess {
    #[display(fmt = "is not applicable to")]
    NotApplicable,
    #[display(fmt = "is required by")]
    Required,
    #[display(fmt = "has an invalid value for")]
    Invalid,
}

#[derive(Debug, Display, From)]
pub enum Fault {
    #[from]
    #[display(fmt = "{}", _0)]
    Corrupt(CorruptArchive),
    #[from]
    #[display(fmt = "i/o error: {}", _0)]
    IO(std::io::Error),
    #[from]
    #[display(fmt = "json error: {}", _0)]
    Serde(serde_json::Error),
}

impl std::error::Error for Fault {}

/// The archive bytes do not describe a consistent archive.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
#[display(fmt = "corrupt archive: {} (at byte {})", msg, pos)]
pub struct CorruptArchive {
    pub msg: String,
    pub pos: u64,
}

impl CorruptArchive {
    pub fn new(msg: impl Into<String>, pos: u64) -> Self {
        CorruptArchive {
            msg: msg.into(),
            pos,
        }
    }
}

impl std::error::Error for CorruptArchive {}

pub(crate) fn not_found<T>(missing: Missing) -> Result<T> {
    Err(Rejection::NotFound(missing).into())
}

#[test]
fn test_kinds() {
    let rejected: Error = Rejection::LabelAlreadyExists("REL1".into()).into();
    assert_eq!(rejected.kind(), ErrorKind::LabelAlreadyExists);
    assert!(!rejected.is_fatal());

    let corrupt: Error = CorruptArchive::new("bad magic", 0).into();
    assert_eq!(corrupt.kind(), ErrorKind::CorruptArchive);
    assert!(corrupt.is_fatal());
    assert_eq!(
        corrupt.to_string(),
        "corrupt archive: bad magic (at byte 0)"
    );
}
