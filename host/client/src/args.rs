use std::{
    cell::{Cell, Ref, RefCell},
    collections::BTreeMap,
    rc::Rc,
};

use rustc_hash::FxHashMap;
use seclink::{Buffer, Number, Shape, Width};

// === SharedBuffer === //

/// A caller-owned buffer that can be lent to the worker.
///
/// Clones alias the same storage. While a call holds the buffer every alias observes it as
/// detached; when the call settles the storage is attached again and every alias sees the
/// routine's output.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Rc<RefCell<Option<Buffer>>>);

impl SharedBuffer {
    pub fn new(buffer: impl Into<Buffer>) -> Self {
        Self(Rc::new(RefCell::new(Some(buffer.into()))))
    }

    pub fn is_detached(&self) -> bool {
        self.0.borrow().is_none()
    }

    pub fn elem_width(&self) -> Option<Width> {
        self.0.borrow().as_ref().map(Buffer::elem_width)
    }

    pub fn get(&self) -> Option<Ref<'_, Buffer>> {
        Ref::filter_map(self.0.borrow(), Option::as_ref).ok()
    }

    /// A copy of the current contents, or `None` while detached.
    pub fn snapshot(&self) -> Option<Buffer> {
        self.0.borrow().clone()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn detach(&self) -> Option<Buffer> {
        self.0.borrow_mut().take()
    }

    pub(crate) fn attach(&self, buffer: Buffer) {
        *self.0.borrow_mut() = Some(buffer);
    }
}

// === OutCell === //

/// A single-element container receiving a fixed-width output.
#[derive(Debug, Clone)]
pub struct OutCell(Rc<Cell<Option<Number>>>);

impl Default for OutCell {
    fn default() -> Self {
        Self::with(0)
    }
}

impl OutCell {
    /// A cell holding zero, accepted by every fixed-width output.
    pub fn new() -> Self {
        Self::default()
    }

    /// A cell holding null. Only pointer outputs (`op`) accept it.
    pub fn empty() -> Self {
        Self(Rc::new(Cell::new(None)))
    }

    pub fn with(value: impl Into<Number>) -> Self {
        Self(Rc::new(Cell::new(Some(value.into()))))
    }

    pub fn get(&self) -> Option<Number> {
        self.0.get()
    }

    pub(crate) fn set(&self, value: Option<Number>) {
        self.0.set(value);
    }
}

// === ArgValue === //

/// An argument as the caller supplies it.
#[derive(Debug, Clone)]
pub enum ArgValue {
    Null,
    Number(Number),
    Str(String),
    Cell(OutCell),
    Buffer(SharedBuffer),
}

impl ArgValue {
    /// The shape the worker will see, or `None` for a detached buffer.
    pub fn shape(&self) -> Option<Shape> {
        Some(match self {
            ArgValue::Null => Shape::Null,
            ArgValue::Number(_) => Shape::Number,
            ArgValue::Str(_) => Shape::Str,
            ArgValue::Cell(cell) => Shape::Cell {
                empty: cell.get().is_none(),
            },
            ArgValue::Buffer(buffer) => Shape::Buffer(buffer.elem_width()?),
        })
    }
}

macro_rules! arg_from_number {
    ($($ty:ty),*) => {$(
        impl From<$ty> for ArgValue {
            fn from(value: $ty) -> Self {
                ArgValue::Number(value.into())
            }
        }
    )*};
}

arg_from_number!(i8, u8, i16, u16, i32, u32, i64, f32, f64, Number);

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        ArgValue::Str(value.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        ArgValue::Str(value)
    }
}

impl From<OutCell> for ArgValue {
    fn from(value: OutCell) -> Self {
        ArgValue::Cell(value)
    }
}

impl From<&OutCell> for ArgValue {
    fn from(value: &OutCell) -> Self {
        ArgValue::Cell(value.clone())
    }
}

impl From<SharedBuffer> for ArgValue {
    fn from(value: SharedBuffer) -> Self {
        ArgValue::Buffer(value)
    }
}

impl From<&SharedBuffer> for ArgValue {
    fn from(value: &SharedBuffer) -> Self {
        ArgValue::Buffer(value.clone())
    }
}

impl<T: Into<ArgValue>> From<Option<T>> for ArgValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(ArgValue::Null, Into::into)
    }
}

// === CallArgs === //

/// Named arguments for a call. Keys are caller-chosen and matched to the routine's argument
/// names directly or through an [`ArgMap`].
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    values: BTreeMap<String, ArgValue>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<ArgValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<ArgValue>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&ArgValue> {
        self.values.get(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>, V: Into<ArgValue>> FromIterator<(K, V)> for CallArgs {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

// === ArgMap === //

/// Routes a routine's argument names to keys in [`CallArgs`].
#[derive(Debug, Clone)]
pub enum ArgMap {
    /// Routine argument name to caller key. Names without an entry are looked up as-is.
    Renamed(FxHashMap<String, String>),

    /// Caller keys in the order of the routine's caller-supplied arguments.
    Positional(Vec<String>),
}

impl ArgMap {
    pub fn renamed<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        ArgMap::Renamed(
            pairs
                .into_iter()
                .map(|(name, key)| (name.to_string(), key.to_string()))
                .collect(),
        )
    }

    pub fn positional<'a>(keys: impl IntoIterator<Item = &'a str>) -> Self {
        ArgMap::Positional(keys.into_iter().map(str::to_string).collect())
    }

    /// The caller key for the `index`-th caller-supplied argument named `name`.
    pub(crate) fn key<'a>(&'a self, index: usize, name: &'a str) -> Option<&'a str> {
        match self {
            ArgMap::Renamed(map) => Some(map.get(name).map_or(name, String::as_str)),
            ArgMap::Positional(keys) => keys.get(index).map(String::as_str),
        }
    }
}
