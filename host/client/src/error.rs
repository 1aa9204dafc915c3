use seclink_protocol::{ErrorPayload, ErrorType, ResponseKind};
use thiserror::Error;

use crate::PromiseCrashed;

/// Errors surfaced by a [`Session`](crate::Session).
///
/// Everything except [`ApiError::Remote`] and [`ApiError::WorkerCrashed`] is raised
/// synchronously, before any request reaches the worker.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("isolated execution is unavailable: {0}")]
    UnsupportedEnvironment(String),

    #[error("another operation is already in progress ({0})")]
    OperationInProgress(String),

    #[error("the session has already been destroyed")]
    AlreadyDestroyed,

    #[error("unknown procedure `{0}`")]
    UnknownProcedure(String),

    #[error("argument `{name}` not provided in call to `{procedure}`")]
    MissingArgument { procedure: String, name: String },

    #[error(
        "incorrect type provided for argument `{name}` in call to `{procedure}`: expected \
         {expected}, found {found}"
    )]
    ArgumentTypeMismatch {
        procedure: String,
        name: String,
        expected: String,
        found: String,
    },

    #[error("argument map for `{procedure}` covers {got} of {expected} arguments")]
    IncompleteArgMap {
        procedure: String,
        expected: usize,
        got: usize,
    },

    #[error("buffer for argument `{name}` in call to `{procedure}` is detached")]
    DetachedBuffer { procedure: String, name: String },

    #[error(transparent)]
    Remote(ErrorPayload),

    #[error("unexpected {0:?} response from worker")]
    UnexpectedResponse(Option<ResponseKind>),

    #[error("worker crashed: {0}")]
    WorkerCrashed(#[from] PromiseCrashed),
}

impl ApiError {
    /// The wire tag this error is reported under.
    pub fn error_type(&self) -> ErrorType {
        match self {
            ApiError::Remote(payload) => payload.error_type,
            _ => ErrorType::Api,
        }
    }

    pub fn remote(&self) -> Option<&ErrorPayload> {
        match self {
            ApiError::Remote(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            ApiError::Remote(payload) => payload.clone(),
            other => ErrorPayload::new(ErrorType::Api, other),
        }
    }
}
