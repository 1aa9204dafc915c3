use thiserror::Error;

use crate::NativeFault;

// === Spec Errors === //

#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum SpecFault {
    #[error("direction flag of `{0}` must be `i` or `o`")]
    BadDirection(String),

    #[error("array marker is not terminated")]
    UnterminatedArray,

    #[error("unrecognized element type `{0}`")]
    UnknownElement(String),

    #[error("output strings are not supported; use an `o[8]` buffer instead")]
    OutString,

    #[error("context arguments are input-only")]
    OutContext,

    #[error("invalid return type code `{0}`")]
    UnknownReturn(String),

    #[error("argument name `{0}` is declared more than once")]
    DuplicateName(String),
}

#[derive(Debug, Clone, Error, Eq, PartialEq)]
#[error("invalid type spec for function `{function}`{}: {fault}", arg_suffix(.arg))]
pub struct SpecError {
    pub function: String,
    pub arg: Option<usize>,
    pub fault: SpecFault,
}

fn arg_suffix(arg: &Option<usize>) -> String {
    match arg {
        Some(index) => format!(" (argument {})", index + 1),
        None => String::new(),
    }
}

// === Marshal Errors === //

#[derive(Debug, Error)]
pub enum MarshalError {
    #[error(
        "not all arguments provided in call to `{function}`: expected {expected}, received {got}"
    )]
    Arity {
        function: String,
        expected: usize,
        got: usize,
    },

    #[error(
        "incorrect type provided for argument {} (`{name}`) in call to `{function}`: expected {expected}, received {found}",
        .index + 1
    )]
    TypeMismatch {
        function: String,
        index: usize,
        name: String,
        expected: String,
        found: String,
    },

    #[error(
        "unexpected return type from `{function}`: expected return code `{expected}`, received {found}"
    )]
    ReturnTypeMismatch {
        function: String,
        expected: String,
        found: String,
    },

    #[error("native routine `{function}` failed: {fault}")]
    Native {
        function: String,
        #[source]
        fault: NativeFault,
    },

    #[error("scratch region failure in call to `{function}`: {reason:#}")]
    Scratch {
        function: String,
        reason: anyhow::Error,
    },
}

impl MarshalError {
    /// Whether the error originated in the native routine rather than in marshaling.
    pub fn is_native(&self) -> bool {
        matches!(self, MarshalError::Native { .. })
    }
}
