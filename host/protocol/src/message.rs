use std::{collections::BTreeMap, fmt};

use seclink::{FunctionSpec, Value};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type ArgMap = BTreeMap<String, Value>;

pub type InnerApi = BTreeMap<String, FunctionSpec>;

// === Requests === //

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum Request {
    Init,
    Call {
        procedure: String,
        #[serde(default)]
        args: ArgMap,
    },
    Destroy,
}

impl Request {
    pub fn operation(&self) -> &'static str {
        match self {
            Request::Init => "init",
            Request::Call { .. } => "call",
            Request::Destroy => "destroy",
        }
    }
}

// === Errors === //

/// The layer an error originated from.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// Misuse of the request protocol.
    Dispatch,

    /// Argument or return values that do not match a routine's declared types.
    Wrapper,

    /// A failure raised by a native routine.
    #[serde(rename = "emscripten", alias = "native")]
    Native,

    /// A failure to create or release the native context.
    InnerApi,

    /// Misuse of the client API.
    Api,
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorType::Dispatch => "dispatch",
            ErrorType::Wrapper => "wrapper",
            ErrorType::Native => "emscripten",
            ErrorType::InnerApi => "inner_api",
            ErrorType::Api => "api",
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Error, Serialize, Deserialize)]
#[error("{error_type} error: {error_msg}")]
pub struct ErrorPayload {
    pub error_type: ErrorType,
    pub error_msg: String,
}

impl ErrorPayload {
    pub fn new(error_type: ErrorType, error_msg: impl fmt::Display) -> Self {
        Self {
            error_type,
            error_msg: error_msg.to_string(),
        }
    }
}

// === Responses === //

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireResponse", try_from = "WireResponse")]
pub enum Response {
    InitComplete {
        inner_api: InnerApi,
    },
    CallReturn {
        update_args: ArgMap,
        ret: Value,
    },
    DestroyComplete,
    Error {
        error: ErrorPayload,
        update_args: ArgMap,
    },
}

impl Response {
    pub fn error(error: ErrorPayload) -> Self {
        Response::Error {
            error,
            update_args: ArgMap::new(),
        }
    }

    pub fn kind(&self) -> Option<ResponseKind> {
        match self {
            Response::InitComplete { .. } => Some(ResponseKind::InitComplete),
            Response::CallReturn { .. } => Some(ResponseKind::CallReturn),
            Response::DestroyComplete => Some(ResponseKind::DestroyComplete),
            Response::Error { .. } => None,
        }
    }
}

#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    InitComplete,
    CallReturn,
    DestroyComplete,
}

/// The flat form responses take on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireResponse {
    pub error: Option<ErrorPayload>,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ResponseKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_args: Option<ArgMap>,

    #[serde(rename = "return", default, skip_serializing_if = "Option::is_none")]
    pub ret: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner_api: Option<InnerApi>,
}

#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum MalformedResponse {
    #[error("response carries neither an error nor a type")]
    MissingType,

    #[error("`{0:?}` response is missing its `{1}` field")]
    MissingField(ResponseKind, &'static str),
}

impl From<Response> for WireResponse {
    fn from(res: Response) -> Self {
        match res {
            Response::InitComplete { inner_api } => WireResponse {
                kind: Some(ResponseKind::InitComplete),
                inner_api: Some(inner_api),
                ..Default::default()
            },
            Response::CallReturn { update_args, ret } => WireResponse {
                kind: Some(ResponseKind::CallReturn),
                update_args: Some(update_args),
                ret: Some(ret),
                ..Default::default()
            },
            Response::DestroyComplete => WireResponse {
                kind: Some(ResponseKind::DestroyComplete),
                ..Default::default()
            },
            Response::Error { error, update_args } => WireResponse {
                error: Some(error),
                update_args: Some(update_args),
                ..Default::default()
            },
        }
    }
}

impl TryFrom<WireResponse> for Response {
    type Error = MalformedResponse;

    fn try_from(wire: WireResponse) -> Result<Self, MalformedResponse> {
        if let Some(error) = wire.error {
            return Ok(Response::Error {
                error,
                update_args: wire.update_args.unwrap_or_default(),
            });
        }

        let kind = wire.kind.ok_or(MalformedResponse::MissingType)?;

        Ok(match kind {
            ResponseKind::InitComplete => Response::InitComplete {
                inner_api: wire
                    .inner_api
                    .ok_or(MalformedResponse::MissingField(kind, "inner_api"))?,
            },
            ResponseKind::CallReturn => Response::CallReturn {
                update_args: wire.update_args.unwrap_or_default(),
                // `"return": null` reads back as `None`.
                ret: wire.ret.unwrap_or(Value::Null),
            },
            ResponseKind::DestroyComplete => Response::DestroyComplete,
        })
    }
}

// === Tests === //
