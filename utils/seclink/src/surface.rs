use derive_where::derive_where;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::{CallMemory, Value};

// === Native Values === //

/// An argument as a native routine receives it. Buffers and output scalars arrive as
/// addresses into the call's [`CallMemory`].
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum NativeArg<'a> {
    Int(i64),
    Float(f64),
    Ptr(u32),
    Str(&'a str),
}

impl<'a> NativeArg<'a> {
    pub fn as_int(&self) -> Option<i64> {
        match *self {
            NativeArg::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match *self {
            NativeArg::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_ptr(&self) -> Option<u32> {
        match *self {
            NativeArg::Ptr(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&'a str> {
        match *self {
            NativeArg::Str(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NativeValue {
    Void,
    Int(i64),
    Float(f64),
    Ptr(u32),
    Str(String),
}

impl NativeValue {
    pub fn kind_name(&self) -> &'static str {
        match self {
            NativeValue::Void => "nothing",
            NativeValue::Int(_) => "an integer",
            NativeValue::Float(_) => "a float",
            NativeValue::Ptr(_) => "a pointer",
            NativeValue::Str(_) => "a string",
        }
    }
}

/// A failure raised by a native routine.
#[derive(Debug, Clone, Error, Eq, PartialEq)]
#[error("{message}")]
pub struct NativeFault {
    pub message: String,
}

impl NativeFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for NativeFault {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

pub type NativeFn = Box<
    dyn Send + FnMut(&mut CallMemory<'_>, &[NativeArg<'_>]) -> Result<NativeValue, NativeFault>,
>;

// === Surface === //

/// A registered routine with its unparsed descriptors. Descriptors are validated when the
/// dispatcher builds its wrappers.
#[derive_where(Debug)]
pub struct NativeRoutine {
    pub name: String,
    pub args: Vec<(String, String)>,
    pub ret: String,
    #[derive_where(skip)]
    pub func: NativeFn,
}

/// The routines that create and tear down the native context. Both are internal: they are
/// never announced and cannot be called by name.
#[derive(Debug, Clone)]
pub struct ContextHooks {
    pub create: String,
    pub create_args: Vec<Value>,
    pub destroy: String,
}

/// The table of native routines exposed through a dispatcher.
#[derive(Debug, Default)]
pub struct NativeSurface {
    routines: FxHashMap<String, NativeRoutine>,
    context: Option<ContextHooks>,
}

impl NativeSurface {
    pub fn builder() -> Self {
        Self::default()
    }

    /// Registers a routine. A later registration under the same name replaces the earlier one.
    pub fn routine(
        mut self,
        name: &str,
        args: &[(&str, &str)],
        ret: &str,
        func: impl 'static
        + Send
        + FnMut(&mut CallMemory<'_>, &[NativeArg<'_>]) -> Result<NativeValue, NativeFault>,
    ) -> Self {
        self.routines.insert(
            name.to_string(),
            NativeRoutine {
                name: name.to_string(),
                args: args
                    .iter()
                    .map(|(name, desc)| (name.to_string(), desc.to_string()))
                    .collect(),
                ret: ret.to_string(),
                func: Box::new(func),
            },
        );

        self
    }

    /// Declares which registered routines create and destroy the native context. The create
    /// routine must return a pointer; the destroy routine receives it through its `ic`
    /// argument.
    pub fn context(mut self, create: &str, create_args: Vec<Value>, destroy: &str) -> Self {
        self.context = Some(ContextHooks {
            create: create.to_string(),
            create_args,
            destroy: destroy.to_string(),
        });

        self
    }

    pub fn context_hooks(&self) -> Option<&ContextHooks> {
        self.context.as_ref()
    }

    pub fn is_internal(&self, name: &str) -> bool {
        self.context
            .as_ref()
            .is_some_and(|hooks| hooks.create == name || hooks.destroy == name)
    }

    pub fn get(&self, name: &str) -> Option<&NativeRoutine> {
        self.routines.get(name)
    }

    pub fn routines(&self) -> impl Iterator<Item = &NativeRoutine> + '_ {
        self.routines.values()
    }

    pub fn len(&self) -> usize {
        self.routines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routines.is_empty()
    }

    pub fn into_parts(self) -> (Vec<NativeRoutine>, Option<ContextHooks>) {
        (self.routines.into_values().collect(), self.context)
    }
}
