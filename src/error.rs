use crate::agent::{AgentName, Slot};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{agent} is missing required input `{slot}`")]
    MissingInput { agent: AgentName, slot: Slot },

    #[error("{agent} failed: {cause}")]
    Stage { agent: AgentName, cause: StageCause },

    #[error("{0} is already running")]
    AlreadyRunning(String),

    #[error("{which} SQL execution failed: {message}")]
    Execution { which: QuerySide, message: String },

    #[error("Stage {0} already registered")]
    StageAlreadyRegistered(AgentName),

    #[error("Stage {0} not found")]
    StageNotFound(AgentName),

    #[error("Database error: {0}")]
    Database(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Database(err.to_string())
    }
}

/// Why a remote stage call did not produce a usable result.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StageCause {
    #[error("{0}")]
    Backend(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed output: {0}")]
    MalformedOutput(String),
}

/// Which statement of a comparison an execution error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuerySide {
    Generated,
    Gold,
}

impl fmt::Display for QuerySide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuerySide::Generated => write!(f, "generated"),
            QuerySide::Gold => write!(f, "gold"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    MissingInput,
    Stage,
    AlreadyRunning,
    Execution,
    Internal,
}

/// Caller-facing form of an [`Error`]: kind, failing stage and a message
/// suitable for a user-visible notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub stage: Option<AgentName>,
    pub message: String,
}

impl From<&Error> for ErrorReport {
    fn from(err: &Error) -> Self {
        let (kind, stage) = match err {
            Error::Configuration(_) => (ErrorKind::Configuration, None),
            Error::MissingInput { agent, .. } => (ErrorKind::MissingInput, Some(*agent)),
            Error::Stage { agent, .. } => (ErrorKind::Stage, Some(*agent)),
            Error::AlreadyRunning(_) => (ErrorKind::AlreadyRunning, None),
            Error::Execution { .. } => (ErrorKind::Execution, None),
            Error::StageAlreadyRegistered(agent) | Error::StageNotFound(agent) => {
                (ErrorKind::Internal, Some(*agent))
            }
            Error::Database(_) | Error::Other(_) => (ErrorKind::Internal, None),
        };
        // the engine's own text is what callers show for execution failures
        let message = match err {
            Error::Execution { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Self {
            kind,
            stage,
            message,
        }
    }
}

impl From<Error> for ErrorReport {
    fn from(err: Error) -> Self {
        ErrorReport::from(&err)
    }
}

impl ErrorReport {
    pub fn with_stage(mut self, stage: AgentName) -> Self {
        self.stage = Some(stage);
        self
    }
}
