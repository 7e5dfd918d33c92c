// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;

use thiserror::Error;

/// A specialized `Result` type for taskloom operations that return a
/// taskloom [`Error`][enum@Error] on failure.
pub type Result<T> = std::result::Result<T, Error>;

/// An error originating in taskloom.
///
/// This is an umbrella type for everything a public taskloom API can return:
/// programming errors (wrong state, unknown id) and the handful of resource
/// errors this crate's surface calls out. Every variant carries (or can be
/// asked for) an [`ErrorCode`] so callers that want an integer taxonomy can
/// match on that instead of the enum shape.
///
/// Specific enum variants may provide additional detail. Future versions may
/// add additional enum variants.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The caller did something the API does not allow in the current state
    /// (e.g. `destroy()` before a task is terminal, starting a task twice,
    /// mutating a `TaskDepManager` outside `Ready`).
    #[error("{0}")]
    Programming(String),

    /// The caller passed a value the API rejects outright, independent of
    /// any object's state (e.g. `publish_progress_init(0)`). Kept distinct
    /// from [`Self::Programming`] so [`Self::code`] can tell `EINVAL` apart
    /// from `EPERM`.
    #[error("{0}")]
    InvalidArgument(String),

    /// A lookup by id (task, vertex) found nothing.
    #[error("no such {what} with id {id}")]
    NotFound {
        /// What kind of thing was being looked up.
        what: &'static str,
        /// The id that was not found.
        id: u64,
    },

    /// The task's `run` body returned a non-zero error code. The task still
    /// reached `Done` normally and its listeners were notified with this
    /// code - this variant only exists so [`Task::join`][crate::task::Task::join]
    /// can surface the same code to a caller that skipped listeners.
    #[error("task body failed with code {0}")]
    TaskBody(ErrorCode),

    /// We are re-packaging an error from some downstream mechanism without
    /// adding further detail in the taskloom layer.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// The integer error code a caller that wants an OS-like taxonomy would see.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Programming(_) => ErrorCode::Perm,
            Self::InvalidArgument(_) => ErrorCode::Inval,
            Self::NotFound { .. } => ErrorCode::NoEnt,
            Self::TaskBody(code) => *code,
            Self::Other(_) => ErrorCode::Again,
        }
    }
}

/// Integer error codes from a standard OS-like taxonomy, so task `errcode`
/// values and manager rejection reasons can be compared without allocating
/// a string.
///
/// `0` ("no error") intentionally has no variant here; a task's `errcode`
/// is a plain `i32` that is `0` on success and carries one of these
/// otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorCode {
    /// Out of memory (`ENOMEM`). taskloom itself never returns this - it is
    /// reserved for task bodies that want to report allocation failure using
    /// the same vocabulary as the rest of the API.
    NoMem,
    /// Invalid argument (`EINVAL`).
    Inval,
    /// Operation not permitted in the current state (`EPERM`).
    Perm,
    /// No such entry (`ENOENT`).
    NoEnt,
    /// Resource busy, try again (`EAGAIN`/`EBUSY`).
    Again,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoMem => "ENOMEM",
            Self::Inval => "EINVAL",
            Self::Perm => "EPERM",
            Self::NoEnt => "ENOENT",
            Self::Again => "EAGAIN",
        };
        f.write_str(name)
    }
}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::NoEnt => Self::NotFound {
                what: "task",
                id: 0,
            },
            ErrorCode::Inval => Self::InvalidArgument(code.to_string()),
            other => Self::Programming(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_round_trips_through_display() {
        assert_eq!(ErrorCode::Perm.to_string(), "EPERM");
        assert_eq!(ErrorCode::Inval.to_string(), "EINVAL");
    }

    #[test]
    fn error_code_of_task_body_is_preserved() {
        let err = Error::TaskBody(ErrorCode::NoMem);
        assert_eq!(err.code(), ErrorCode::NoMem);
    }

    #[test]
    fn invalid_argument_is_distinct_from_a_state_violation() {
        let inval: Error = ErrorCode::Inval.into();
        assert_eq!(inval.code(), ErrorCode::Inval);

        let perm: Error = ErrorCode::Perm.into();
        assert_eq!(perm.code(), ErrorCode::Perm);
    }
}
