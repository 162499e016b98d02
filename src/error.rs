use serde::{Deserialize, Serialize};

use crate::raft::{NodeId, RoleName};

/// raftling errors. All except Internal are considered user-facing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    /// The operation was aborted and must be retried, typically because of a
    /// role change or shutdown.
    Abort,
    /// A group membership change is already in flight.
    ConcurrentChange,
    /// The requested log prefix has been compacted into a snapshot, and must
    /// be transferred as one.
    EntryInSnapshot,
    /// Invalid user input.
    InvalidInput(String),
    /// An internal error. Something went wrong in the node itself.
    Internal(String),
    /// An IO error.
    IO(String),
    /// The operation must be submitted to the leader. Carries the current
    /// role and the last known leader, if any.
    NotLeader { role: RoleName, leader: Option<NodeId> },
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Abort => write!(f, "operation aborted"),
            Error::ConcurrentChange => write!(f, "a group config change is in progress"),
            Error::EntryInSnapshot => write!(f, "log entry only available in snapshot"),
            Error::InvalidInput(message) => write!(f, "invalid input: {message}"),
            Error::Internal(message) => write!(f, "internal error: {message}"),
            Error::IO(message) => write!(f, "io error: {message}"),
            Error::NotLeader { role, leader: Some(leader) } => {
                write!(f, "not leader (currently {role}, leader is {leader})")
            }
            Error::NotLeader { role, leader: None } => {
                write!(f, "not leader (currently {role}, leader unknown)")
            }
        }
    }
}

/// Constructs an Error::Internal for the given format string.
#[macro_export]
macro_rules! errinternal {
    ($($args:tt)*) => {
        $crate::error::Error::Internal(format!($($args)*)).into()
    };
}

/// Constructs an Error::InvalidInput for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => {
        $crate::error::Error::InvalidInput(format!($($args)*)).into()
    };
}

/// A raftling Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::ParseLevelError> for Error {
    fn from(err: log::ParseLevelError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(err: crossbeam::channel::SendError<T>) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<crossbeam::channel::RecvError> for Error {
    fn from(err: crossbeam::channel::RecvError) -> Self {
        Error::Internal(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Internal(format!("lock poisoned: {err}"))
    }
}
