use std::fmt::Display;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Self-targeting, empty or malformed keys, or an illegal state transition.
    InvalidArgument(String),
    NotFound,
    /// Idempotent duplicate add. Nothing was written.
    AlreadyExists,
    /// The shared entity is locked until the given instant.
    Locked {
        until: DateTime<Utc>,
    },
    /// A concurrent transaction touched one of the documents that were read.
    Conflict,
    Unavailable(String),
    Serialize(String),
    Deserialize(String),
    Storage(String),
    TypeMismatch,
}

/// Stable message classes for presentation layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    Locked,
    Conflict,
    Unavailable,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::Locked => "locked",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Internal => "internal",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "That request is not valid.",
            ErrorKind::NotFound => "This person or item is no longer available.",
            ErrorKind::AlreadyExists => "Already done, nothing changed.",
            ErrorKind::Locked => "Locked until the daily reset.",
            ErrorKind::Conflict => "Something changed at the same time. Please try again.",
            ErrorKind::Unavailable => "Service is unavailable right now.",
            ErrorKind::Internal => "Something went wrong.",
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::NotFound => ErrorKind::NotFound,
            Error::AlreadyExists => ErrorKind::AlreadyExists,
            Error::Locked { .. } => ErrorKind::Locked,
            Error::Conflict => ErrorKind::Conflict,
            Error::Unavailable(_) => ErrorKind::Unavailable,
            Error::Serialize(_)
            | Error::Deserialize(_)
            | Error::Storage(_)
            | Error::TypeMismatch => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict)
    }

    /// Lock expiry carried by [`Error::Locked`].
    pub fn locked_until(&self) -> Option<DateTime<Utc>> {
        match self {
            Error::Locked { until } => Some(*until),
            _ => None,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::NotFound => write!(f, "Not found"),
            Error::AlreadyExists => write!(f, "Already exists"),
            Error::Locked { until } => write!(f, "Locked until {}", until.to_rfc3339()),
            Error::Conflict => write!(f, "Conflict"),
            Error::Unavailable(err) => write!(f, "Store unavailable: {}", err),
            Error::Serialize(err) => write!(f, "Serialization error: {}", err),
            Error::Deserialize(err) => write!(f, "Deserialization error: {}", err),
            Error::Storage(err) => write!(f, "Storage error: {}", err),
            Error::TypeMismatch => write!(f, "Type mismatch"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(any(feature = "sqlite", feature = "postgres"))]
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Error::Unavailable(err.to_string())
            }
            sqlx::Error::Database(db) => {
                // 23505 unique_violation, 40001 serialization_failure,
                // 40P01 deadlock_detected, 5/6/517 SQLITE_BUSY/LOCKED
                // and 1555/2067 SQLITE_CONSTRAINT_PRIMARYKEY/UNIQUE.
                let code = db.code();
                match code.as_deref() {
                    Some("23505" | "40001" | "40P01" | "5" | "6" | "517" | "1555" | "2067") => {
                        Error::Conflict
                    }
                    _ if db.is_unique_violation() => Error::Conflict,
                    _ => Error::Storage(err.to_string()),
                }
            }
            _ => Error::Storage(err.to_string()),
        }
    }
}
