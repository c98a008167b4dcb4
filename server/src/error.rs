//! Error types surfaced by the frontend core

use crate::session::SessionId;
use relay_shared::ProtocolError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session does not exist, sid: {0}")]
    NotFound(SessionId),
    #[error("session {sid} has already bound with {uid}")]
    AlreadyBound { sid: SessionId, uid: String },
    #[error("session {sid} is not bound with {uid}")]
    NotBound { sid: SessionId, uid: String },
    #[error("single session is enabled, and uid {0} already has a bound session")]
    SingleSessionViolation(String),
    #[error("session {0} already exists")]
    Duplicate(SessionId),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("can not find server info for type: {0}")]
    NoServerAvailable(String),
    #[error("rpc to {server_id} failed: {reason}")]
    Rpc { server_id: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("invalid push scheduler id: {0}")]
    SchedulerNotFound(u32),
    #[error("push scheduler {name} failed to {action}: {reason}")]
    Lifecycle {
        name: &'static str,
        action: &'static str,
        reason: String,
    },
    #[error("multi push scheduler configured without a selector")]
    MissingSelector,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerialError {
    #[error("request {route} from session {sid} timed out")]
    RequestTimeout { sid: SessionId, route: String },
}

/// Failure reported by an application handler, or by the core on its behalf.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("no handler for route {0}")]
    UnknownRoute(String),
    #[error("{0}")]
    Rejected(String),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Serial(#[from] SerialError),
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("frontend loop is gone")]
    Closed,
}
