use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Shape, SpecError, SpecFault};

// === Width === //

/// The width of a scalar argument or of a buffer element.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
pub enum Width {
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    /// A 4-byte address. Never valid as a buffer element.
    Ptr,
}

impl Width {
    pub const fn size(self) -> u32 {
        match self {
            Width::I8 => 1,
            Width::I16 => 2,
            Width::I32 | Width::F32 | Width::Ptr => 4,
            Width::I64 | Width::F64 => 8,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, Width::F32 | Width::F64)
    }

    pub const fn code(self) -> &'static str {
        match self {
            Width::I8 => "8",
            Width::I16 => "16",
            Width::I32 => "32",
            Width::I64 => "64",
            Width::F32 => "f",
            Width::F64 => "d",
            Width::Ptr => "p",
        }
    }

    /// Parses an element code, which is every width except pointers.
    pub fn from_elem_code(code: &str) -> Option<Self> {
        Some(match code {
            "8" => Width::I8,
            "16" => Width::I16,
            "32" => Width::I32,
            "64" => Width::I64,
            "f" => Width::F32,
            "d" => Width::F64,
            _ => return None,
        })
    }
}

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Width::I8 => f.write_str("8-bit"),
            Width::I16 => f.write_str("16-bit"),
            Width::I32 => f.write_str("32-bit"),
            Width::I64 => f.write_str("64-bit"),
            Width::F32 => f.write_str("f32"),
            Width::F64 => f.write_str("f64"),
            Width::Ptr => f.write_str("pointer"),
        }
    }
}

// === ArgKind === //

#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
pub enum Direction {
    In,
    Out,
}

/// A parsed argument descriptor.
///
/// Descriptors are written as a direction (`i` or `o`) followed by a body: an element code
/// (`8`, `16`, `32`, `64`, `f`, `d`), a pointer (`p`), an array of elements (`[8]`), a string
/// (`s`, input only) or the native context (`c`, input only).
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ArgKind {
    /// A scalar or pointer passed by value.
    FixedIn(Width),

    /// A scalar or pointer the native routine writes through a pointer into the fixed region.
    FixedOut(Width),

    /// A buffer copied into the variable region.
    VarIn(Width),

    /// A buffer copied into the variable region and back out after the call.
    VarOut(Width),

    /// A string passed through unchanged.
    StrIn,

    /// A pointer input filled in by the dispatcher with the native context handle.
    Context,
}

impl ArgKind {
    pub fn parse(desc: &str) -> Result<Self, SpecFault> {
        let (dir, body) = match desc.as_bytes().first() {
            Some(b'i') => (Direction::In, &desc[1..]),
            Some(b'o') => (Direction::Out, &desc[1..]),
            _ => return Err(SpecFault::BadDirection(desc.to_string())),
        };

        if let Some(inner) = body.strip_prefix('[') {
            let Some(inner) = inner.strip_suffix(']') else {
                return Err(SpecFault::UnterminatedArray);
            };

            let elem = Width::from_elem_code(inner)
                .ok_or_else(|| SpecFault::UnknownElement(inner.to_string()))?;

            return Ok(match dir {
                Direction::In => ArgKind::VarIn(elem),
                Direction::Out => ArgKind::VarOut(elem),
            });
        }

        let width = match body {
            "s" => {
                return match dir {
                    Direction::In => Ok(ArgKind::StrIn),
                    Direction::Out => Err(SpecFault::OutString),
                };
            }
            "c" => {
                return match dir {
                    Direction::In => Ok(ArgKind::Context),
                    Direction::Out => Err(SpecFault::OutContext),
                };
            }
            "p" => Width::Ptr,
            code => Width::from_elem_code(code)
                .ok_or_else(|| SpecFault::UnknownElement(code.to_string()))?,
        };

        Ok(match dir {
            Direction::In => ArgKind::FixedIn(width),
            Direction::Out => ArgKind::FixedOut(width),
        })
    }

    pub fn direction(self) -> Direction {
        match self {
            ArgKind::FixedOut(_) | ArgKind::VarOut(_) => Direction::Out,
            ArgKind::FixedIn(_) | ArgKind::VarIn(_) | ArgKind::StrIn | ArgKind::Context => {
                Direction::In
            }
        }
    }

    pub fn width(self) -> Option<Width> {
        match self {
            ArgKind::FixedIn(w) | ArgKind::FixedOut(w) | ArgKind::VarIn(w) | ArgKind::VarOut(w) => {
                Some(w)
            }
            ArgKind::Context => Some(Width::Ptr),
            ArgKind::StrIn => None,
        }
    }

    pub fn is_array(self) -> bool {
        matches!(self, ArgKind::VarIn(_) | ArgKind::VarOut(_))
    }

    pub fn is_pointer(self) -> bool {
        matches!(
            self,
            ArgKind::FixedIn(Width::Ptr) | ArgKind::FixedOut(Width::Ptr) | ArgKind::Context
        )
    }

    pub fn is_string(self) -> bool {
        matches!(self, ArgKind::StrIn)
    }

    /// Whether the caller has to provide a value. Context arguments are filled by the
    /// dispatcher.
    pub fn is_caller_supplied(self) -> bool {
        !matches!(self, ArgKind::Context)
    }

    /// Whether a value of the given shape can be marshaled for this argument.
    pub fn accepts(self, shape: Shape) -> bool {
        match self {
            ArgKind::FixedIn(Width::Ptr) | ArgKind::Context => {
                matches!(shape, Shape::Null | Shape::Number)
            }
            ArgKind::FixedIn(_) => matches!(shape, Shape::Number),
            ArgKind::FixedOut(Width::Ptr) => {
                matches!(shape, Shape::Null | Shape::Number | Shape::Cell { .. })
            }
            ArgKind::FixedOut(_) => {
                matches!(shape, Shape::Number | Shape::Cell { empty: false })
            }
            ArgKind::VarIn(elem) | ArgKind::VarOut(elem) => shape == Shape::Buffer(elem),
            ArgKind::StrIn => shape == Shape::Str,
        }
    }

    /// A human-readable description of the values [`accepts`](Self::accepts) lets through.
    pub fn expectation(self) -> String {
        match self {
            ArgKind::FixedIn(Width::Ptr) | ArgKind::Context => "a number or null".to_string(),
            ArgKind::FixedIn(_) => "a number".to_string(),
            ArgKind::FixedOut(Width::Ptr) => {
                "a number, null, or a single-element cell".to_string()
            }
            ArgKind::FixedOut(_) => "a number or a single-element cell holding a number".to_string(),
            ArgKind::VarIn(elem) | ArgKind::VarOut(elem) => {
                format!("a buffer of {elem} elements")
            }
            ArgKind::StrIn => "a string".to_string(),
        }
    }
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgKind::FixedIn(w) => write!(f, "i{}", w.code()),
            ArgKind::FixedOut(w) => write!(f, "o{}", w.code()),
            ArgKind::VarIn(w) => write!(f, "i[{}]", w.code()),
            ArgKind::VarOut(w) => write!(f, "o[{}]", w.code()),
            ArgKind::StrIn => f.write_str("is"),
            ArgKind::Context => f.write_str("ic"),
        }
    }
}

impl From<ArgKind> for String {
    fn from(kind: ArgKind) -> Self {
        kind.to_string()
    }
}

impl TryFrom<String> for ArgKind {
    type Error = SpecFault;

    fn try_from(desc: String) -> Result<Self, Self::Error> {
        ArgKind::parse(&desc)
    }
}

// === ReturnType === //

#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ReturnType {
    Void,
    Scalar(Width),
    Str,
}

impl ReturnType {
    pub fn parse(code: &str) -> Result<Self, SpecFault> {
        match code {
            "v" => Ok(ReturnType::Void),
            "s" => Ok(ReturnType::Str),
            "p" => Ok(ReturnType::Scalar(Width::Ptr)),
            code => Width::from_elem_code(code)
                .map(ReturnType::Scalar)
                .ok_or_else(|| SpecFault::UnknownReturn(code.to_string())),
        }
    }
}

impl fmt::Display for ReturnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReturnType::Void => f.write_str("v"),
            ReturnType::Scalar(w) => f.write_str(w.code()),
            ReturnType::Str => f.write_str("s"),
        }
    }
}

impl From<ReturnType> for String {
    fn from(ret: ReturnType) -> Self {
        ret.to_string()
    }
}

impl TryFrom<String> for ReturnType {
    type Error = SpecFault;

    fn try_from(code: String) -> Result<Self, Self::Error> {
        ReturnType::parse(&code)
    }
}

// === FunctionSpec === //

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ArgSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ArgKind,
}

/// The full calling shape of one native routine.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub args: Vec<ArgSpec>,
    #[serde(rename = "return")]
    pub ret: ReturnType,
}

impl FunctionSpec {
    pub fn parse<N, D>(function: &str, args: &[(N, D)], ret: &str) -> Result<Self, SpecError>
    where
        N: AsRef<str>,
        D: AsRef<str>,
    {
        let fail = |arg: Option<usize>, fault: SpecFault| SpecError {
            function: function.to_string(),
            arg,
            fault,
        };

        let mut parsed = Vec::<ArgSpec>::with_capacity(args.len());

        for (index, (name, desc)) in args.iter().enumerate() {
            let name = name.as_ref();

            if parsed.iter().any(|other| other.name == name) {
                return Err(fail(Some(index), SpecFault::DuplicateName(name.to_string())));
            }

            let kind = ArgKind::parse(desc.as_ref()).map_err(|fault| fail(Some(index), fault))?;

            parsed.push(ArgSpec {
                name: name.to_string(),
                kind,
            });
        }

        let ret = ReturnType::parse(ret).map_err(|fault| fail(None, fault))?;

        Ok(Self { args: parsed, ret })
    }

    pub fn arg(&self, name: &str) -> Option<&ArgSpec> {
        self.args.iter().find(|arg| arg.name == name)
    }

    /// Arguments the caller is responsible for, in declaration order.
    pub fn caller_args(&self) -> impl Iterator<Item = &ArgSpec> + '_ {
        self.args.iter().filter(|arg| arg.kind.is_caller_supplied())
    }
}

// === Tests === //

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_descriptor_form() {
        let cases = [
            ("i8", ArgKind::FixedIn(Width::I8)),
            ("o16", ArgKind::FixedOut(Width::I16)),
            ("i32", ArgKind::FixedIn(Width::I32)),
            ("o64", ArgKind::FixedOut(Width::I64)),
            ("if", ArgKind::FixedIn(Width::F32)),
            ("od", ArgKind::FixedOut(Width::F64)),
            ("ip", ArgKind::FixedIn(Width::Ptr)),
            ("op", ArgKind::FixedOut(Width::Ptr)),
            ("i[8]", ArgKind::VarIn(Width::I8)),
            ("o[d]", ArgKind::VarOut(Width::F64)),
            ("is", ArgKind::StrIn),
            ("ic", ArgKind::Context),
        ];

        for (desc, expected) in cases {
            let kind = ArgKind::parse(desc).unwrap();
            assert_eq!(kind, expected, "{desc}");
            assert_eq!(kind.to_string(), desc);
        }
    }

    #[test]
    fn binding_flags() {
        let out_array = ArgKind::parse("o[32]").unwrap();
        assert_eq!(out_array.direction(), Direction::Out);
        assert!(out_array.is_array());
        assert!(!out_array.is_pointer());
        assert_eq!(out_array.width(), Some(Width::I32));

        let ptr = ArgKind::parse("ip").unwrap();
        assert!(ptr.is_pointer());
        assert!(!ptr.is_array());

        assert!(ArgKind::parse("is").unwrap().is_string());
        assert!(!ArgKind::parse("ic").unwrap().is_caller_supplied());
    }

    #[test]
    fn rejects_malformed_descriptors() {
        assert_eq!(
            ArgKind::parse("x8"),
            Err(SpecFault::BadDirection("x8".to_string()))
        );
        assert_eq!(ArgKind::parse(""), Err(SpecFault::BadDirection(String::new())));
        assert_eq!(ArgKind::parse("i[8"), Err(SpecFault::UnterminatedArray));
        assert_eq!(
            ArgKind::parse("i[p]"),
            Err(SpecFault::UnknownElement("p".to_string()))
        );
        assert_eq!(
            ArgKind::parse("o[s]"),
            Err(SpecFault::UnknownElement("s".to_string()))
        );
        assert_eq!(
            ArgKind::parse("i12"),
            Err(SpecFault::UnknownElement("12".to_string()))
        );
        assert_eq!(ArgKind::parse("os"), Err(SpecFault::OutString));
        assert_eq!(ArgKind::parse("oc"), Err(SpecFault::OutContext));
    }

    #[test]
    fn return_codes() {
        for code in ["8", "16", "32", "64", "f", "d", "s", "p", "v"] {
            assert_eq!(ReturnType::parse(code).unwrap().to_string(), code);
        }

        assert_eq!(
            ReturnType::parse("[8]"),
            Err(SpecFault::UnknownReturn("[8]".to_string()))
        );
    }

    #[test]
    fn function_errors_name_the_argument() {
        let err = FunctionSpec::parse("sign", &[("ctx", "ip"), ("sig", "os")], "32").unwrap_err();
        assert_eq!(err.function, "sign");
        assert_eq!(err.arg, Some(1));
        assert_eq!(err.fault, SpecFault::OutString);
        assert!(err.to_string().contains("argument 2"), "{err}");

        let err = FunctionSpec::parse("sign", &[("ctx", "ip")], "q").unwrap_err();
        assert_eq!(err.arg, None);

        let err = FunctionSpec::parse("sign", &[("a", "i8"), ("a", "i8")], "v").unwrap_err();
        assert_eq!(err.fault, SpecFault::DuplicateName("a".to_string()));
    }

    #[test]
    fn announced_form_round_trips_through_json() {
        let spec = FunctionSpec::parse(
            "pubkey_create",
            &[("ctx", "ic"), ("pubkey", "o[8]"), ("len", "o32"), ("seckey", "i[8]")],
            "32",
        )
        .unwrap();

        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["args"][1]["type"], "o[8]");
        assert_eq!(json["return"], "32");

        let back: FunctionSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back, spec);
        assert_eq!(
            spec.caller_args().map(|a| a.name.as_str()).collect::<Vec<_>>(),
            ["pubkey", "len", "seckey"]
        );
    }
}
