use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Width;

// === Number === //

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Number {
    Int(i64),
    Float(#[serde(serialize_with = "finite::number")] f64),
}

impl Number {
    pub fn as_i64(self) -> i64 {
        match self {
            Number::Int(v) => v,
            Number::Float(v) => v as i64,
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Number::Int(v) => v as f64,
            Number::Float(v) => v,
        }
    }
}

macro_rules! number_from {
    ($($variant:ident: $($ty:ty),*;)*) => {$($(
        impl From<$ty> for Number {
            fn from(value: $ty) -> Self {
                Number::$variant(value.into())
            }
        }
    )*)*};
}

number_from! {
    Int: i8, u8, i16, u16, i32, u32, i64;
    Float: f32, f64;
}

// === Buffer === //

macro_rules! define_buffer {
    ($($(#[$field:meta])* $variant:ident($elem:ty) => $width:ident, $tag:literal;)*) => {
        /// A typed element vector. The element type decides which array widths it can back.
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        pub enum Buffer {
            $(
                #[serde(rename = $tag)]
                $variant($(#[$field])* Vec<$elem>),
            )*
        }

        impl Buffer {
            pub fn elem_width(&self) -> Width {
                match self {
                    $(Buffer::$variant(_) => Width::$width,)*
                }
            }

            pub fn len(&self) -> usize {
                match self {
                    $(Buffer::$variant(v) => v.len(),)*
                }
            }

            pub fn is_empty(&self) -> bool {
                self.len() == 0
            }

            pub fn type_name(&self) -> &'static str {
                match self {
                    $(Buffer::$variant(_) => $tag,)*
                }
            }

            pub fn as_bytes(&self) -> &[u8] {
                match self {
                    $(Buffer::$variant(v) => bytemuck::cast_slice(v),)*
                }
            }

            pub fn as_bytes_mut(&mut self) -> &mut [u8] {
                match self {
                    $(Buffer::$variant(v) => bytemuck::cast_slice_mut(v),)*
                }
            }

            /// The address of the backing storage, used to observe that a transfer moved the
            /// allocation rather than copying it.
            pub fn storage_addr(&self) -> usize {
                match self {
                    $(Buffer::$variant(v) => v.as_ptr() as usize,)*
                }
            }
        }

        $(
            impl From<Vec<$elem>> for Buffer {
                fn from(value: Vec<$elem>) -> Self {
                    Buffer::$variant(value)
                }
            }
        )*
    };
}

define_buffer! {
    I8(i8) => I8, "i8";
    U8(u8) => I8, "u8";
    I16(i16) => I16, "i16";
    U16(u16) => I16, "u16";
    I32(i32) => I32, "i32";
    U32(u32) => I32, "u32";
    I64(i64) => I64, "i64";
    U64(u64) => I64, "u64";
    #[serde(serialize_with = "finite::elements")]
    F32(f32) => F32, "f32";
    #[serde(serialize_with = "finite::elements")]
    F64(f64) => F64, "f64";
}

// === Value === //

/// An argument or return value as it crosses the marshaling layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Number(Number),
    Str(String),

    /// A single-element container used as an output cell.
    Cell(#[serde(with = "cell_repr")] Option<Number>),

    Buffer(Buffer),
}

impl Value {
    pub fn int(value: i64) -> Self {
        Value::Number(Number::Int(value))
    }

    pub fn float(value: f64) -> Self {
        Value::Number(Number::Float(value))
    }

    pub fn cell(value: impl Into<Number>) -> Self {
        Value::Cell(Some(value.into()))
    }

    pub fn shape(&self) -> Shape {
        match self {
            Value::Null => Shape::Null,
            Value::Number(_) => Shape::Number,
            Value::Str(_) => Shape::Str,
            Value::Cell(v) => Shape::Cell { empty: v.is_none() },
            Value::Buffer(b) => Shape::Buffer(b.elem_width()),
        }
    }

    pub fn as_number(&self) -> Option<Number> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_buffer(&self) -> Option<&Buffer> {
        match self {
            Value::Buffer(b) => Some(b),
            _ => None,
        }
    }

    pub fn into_buffer(self) -> Option<Buffer> {
        match self {
            Value::Buffer(b) => Some(b),
            _ => None,
        }
    }

    /// Whether the value is a container whose contents a call may update.
    pub fn is_updatable(&self) -> bool {
        matches!(self, Value::Cell(_) | Value::Buffer(_))
    }
}

impl From<Buffer> for Value {
    fn from(value: Buffer) -> Self {
        Value::Buffer(value)
    }
}

impl From<Number> for Value {
    fn from(value: Number) -> Self {
        Value::Number(value)
    }
}

/// NaN and the infinities have no JSON form. Serializing one fails rather than writing `null`.
mod finite {
    use serde::{Serialize, Serializer, ser::Error as _};

    pub fn number<S: Serializer>(value: &f64, ser: S) -> Result<S::Ok, S::Error> {
        if !value.is_finite() {
            return Err(S::Error::custom(format!("cannot encode non-finite float {value}")));
        }

        value.serialize(ser)
    }

    #[allow(clippy::ptr_arg)]
    pub fn elements<S, F>(values: &Vec<F>, ser: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        F: Copy + Into<f64> + Serialize,
    {
        if let Some(value) = values.iter().map(|&v| v.into()).find(|v: &f64| !v.is_finite()) {
            return Err(S::Error::custom(format!(
                "cannot encode non-finite float {value} in a buffer"
            )));
        }

        values.serialize(ser)
    }
}

mod cell_repr {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::Number;

    pub fn serialize<S: Serializer>(value: &Option<Number>, ser: S) -> Result<S::Ok, S::Error> {
        [*value].serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Number>, D::Error> {
        let [value] = <[Option<Number>; 1]>::deserialize(de)?;
        Ok(value)
    }
}

// === Shape === //

/// The runtime shape of a value, checked against an [`ArgKind`](crate::ArgKind).
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
pub enum Shape {
    Null,
    Number,
    Str,
    Cell { empty: bool },
    Buffer(Width),
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Null => f.write_str("null"),
            Shape::Number => f.write_str("a number"),
            Shape::Str => f.write_str("a string"),
            Shape::Cell { empty: true } => f.write_str("a cell holding null"),
            Shape::Cell { empty: false } => f.write_str("a cell holding a number"),
            Shape::Buffer(width) => write!(f, "a buffer of {width} elements"),
        }
    }
}
