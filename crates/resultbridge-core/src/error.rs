//! Error types for resultbridge-core
//!
//! Two layers of errors cross the bridge:
//!
//! * [`EngineError`] is the native error descriptor produced by the engine
//!   (queue rejections, domain rejections, delivery failures). It is what a
//!   script callback ultimately receives, wrapped as an environment object.
//! * [`BridgeError`] is what the entry point returns synchronously to the
//!   caller. It never becomes a script exception; scripts see it as a value.
//!
//! A callback whose error cannot be cleared is not an error value at all: see
//! [`fatal_reentrancy_violation`].

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable error code shared by the engine and the scripting environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Unclassified engine failure (queue full, delivery failure, ...).
    Generic,
    /// The caller passed something the bridge cannot use.
    InvalidArgument,
    /// The engine binding is gone or the engine stopped accepting work.
    RuntimeClosed,
    /// The result does not belong to any command awaiting a reply.
    MsgNotConnected,
    /// The caller-side result wrapper no longer owns a result.
    ResultConsumed,
}

impl ErrorCode {
    /// Code as exposed to scripts.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generic => "generic",
            Self::InvalidArgument => "invalid_argument",
            Self::RuntimeClosed => "runtime_closed",
            Self::MsgNotConnected => "msg_not_connected",
            Self::ResultConsumed => "result_consumed",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Native error descriptor produced by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct EngineError {
    pub code: ErrorCode,
    pub message: String,
}

impl EngineError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Generic, message)
    }

    pub fn runtime_closed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RuntimeClosed, message)
    }
}

/// Discriminant of [`BridgeError`], handy for assertions and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    RuntimeClosed,
    ResultConsumed,
    SubmissionFailed,
    OperationRejected,
}

/// Failure of a `return_result` hand-off.
///
/// `RuntimeClosed`, `ResultConsumed` and `SubmissionFailed` are returned by
/// the entry point. `OperationRejected` only ever reaches a script callback,
/// because the caller has already returned by the time the domain
/// operation runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// No live engine binding backs the calling environment object.
    #[error("return_result() failed because the runtime is closed")]
    RuntimeClosed,

    /// The caller-side wrapper was already handed over.
    #[error("return_result() failed because the result was already returned")]
    ResultConsumed,

    /// The engine refused to queue the hand-off.
    #[error("engine rejected return_result submission: {0}")]
    SubmissionFailed(EngineError),

    /// The engine could not start the domain operation.
    #[error("engine could not start return_result: {0}")]
    OperationRejected(EngineError),
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RuntimeClosed => ErrorKind::RuntimeClosed,
            Self::ResultConsumed => ErrorKind::ResultConsumed,
            Self::SubmissionFailed(_) => ErrorKind::SubmissionFailed,
            Self::OperationRejected(_) => ErrorKind::OperationRejected,
        }
    }

    /// Engine-supplied cause, when the engine produced this failure.
    pub fn cause(&self) -> Option<&EngineError> {
        match self {
            Self::SubmissionFailed(cause) | Self::OperationRejected(cause) => Some(cause),
            Self::RuntimeClosed | Self::ResultConsumed => None,
        }
    }

    /// Native descriptor handed to scripts for this failure.
    ///
    /// Engine-caused failures surface their cause unchanged.
    pub fn to_engine_error(&self) -> EngineError {
        match self {
            Self::RuntimeClosed => EngineError::runtime_closed(self.to_string()),
            Self::ResultConsumed => EngineError::new(ErrorCode::ResultConsumed, self.to_string()),
            Self::SubmissionFailed(cause) | Self::OperationRejected(cause) => cause.clone(),
        }
    }
}

/// Abort on a script error that survived check-and-clear.
///
/// Must never occur in a correct embedding: the environment's pending-error
/// state would otherwise leak into every later call on any thread. Unwinding
/// drops the caller's interpreter guard, so the lock is still released.
#[cold]
#[track_caller]
pub fn fatal_reentrancy_violation(detail: &str) -> ! {
    tracing::error!(detail, "pending script error survived completion callback");
    panic!("FatalReentrancyViolation: {detail}");
}
