//! Error types for instance-lifecycle

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Result type alias for instance-lifecycle operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while probing or transitioning the instance
#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    InvalidState(String),

    #[error("Another action is in progress: {action}")]
    LockConflict { action: String },

    #[error("Control plane error: {0}")]
    Upstream(String),

    #[error("Timed out waiting for {operation} after {attempts} attempts")]
    Timeout { operation: String, attempts: u32 },

    #[error("Command failed: {command}\nstderr: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Instance {instance_id} entered '{actual}' while waiting for '{expected}'")]
    UnexpectedState {
        instance_id: String,
        expected: String,
        actual: String,
    },

    /// A destructive sequence stopped midway; `completed` says what did happen
    #[error("{completed}, but {source}")]
    Partial {
        completed: String,
        #[source]
        source: Box<Error>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Wrap an error with a description of the steps that already succeeded
    pub fn partial(completed: impl Into<String>, source: Error) -> Self {
        Error::Partial {
            completed: completed.into(),
            source: Box::new(source),
        }
    }

    /// Collapse the error into the kind callers map to a response
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidState(_) => ErrorKind::InvalidState,
            Error::LockConflict { .. } => ErrorKind::LockConflict,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::CommandFailed { .. } => ErrorKind::CommandFailed,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Configuration(_) | Error::Yaml(_) => ErrorKind::ConfigurationError,
            Error::Partial { source, .. } => source.kind(),
            Error::Upstream(_)
            | Error::UnexpectedState { .. }
            | Error::Io(_)
            | Error::Json(_)
            | Error::Http(_) => ErrorKind::UpstreamError,
        }
    }
}

/// Error taxonomy exposed to callers of the workflows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    InvalidState,
    LockConflict,
    UpstreamError,
    Timeout,
    CommandFailed,
    NotFound,
    ConfigurationError,
}

impl ErrorKind {
    /// HTTP status a web collaborator should answer with
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::InvalidState => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::LockConflict => 409,
            _ => 500,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
