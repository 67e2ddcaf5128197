use thiserror::Error;
use ulid::Ulid;

use crate::model::{Ms, StateId, UserId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("invalid range: end {end} is not after start {start}")]
    InvalidRange { start: Ms, end: Ms },
    #[error("start {start} is in the past (now {now})")]
    StartInPast { start: Ms, now: Ms },
    #[error("closed is not a plannable state")]
    ClosedKind,
    #[error("no following state to end at")]
    NoFollowingInterval,
    #[error("invalid rule: {0}")]
    InvalidRule(&'static str),
    #[error("unknown user: {0}")]
    UnknownUser(UserId),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("conflicts with existing states: {0:?}")]
    Conflict(Vec<StateId>),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("immutable: {0}")]
    Immutable(&'static str),
    #[error("no current state to close")]
    NothingToClose,
    #[error("no state is current")]
    NoCurrentState,
    #[error("user {0} may not do this")]
    Forbidden(UserId),
    #[error("planning is busy, try again")]
    Busy,
    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    /// Short label for logs and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::InvalidRange { .. }
            | EngineError::StartInPast { .. }
            | EngineError::ClosedKind
            | EngineError::NoFollowingInterval
            | EngineError::InvalidRule(_)
            | EngineError::UnknownUser(_)
            | EngineError::LimitExceeded(_) => "validation",
            EngineError::Conflict(_) => "conflict",
            EngineError::NotFound(_) | EngineError::NoCurrentState => "not_found",
            EngineError::Immutable(_) | EngineError::NothingToClose => "immutable",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::Busy => "busy",
            EngineError::Storage(_) => "storage",
        }
    }
}
