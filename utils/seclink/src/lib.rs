//! Declarative marshaling of calls into native routines.
//!
//! Routines are registered on a [`NativeSurface`] together with a compact descriptor per argument.
//! Each registration is turned into a [`Wrapper`], which checks the caller's [`Value`]s, copies
//! them into a scratch region laid out by a [`LayoutPlan`], runs the routine against that region
//! and copies the outputs back.

mod error;
pub use self::error::*;

mod layout;
pub use self::layout::*;

mod scratch;
pub use self::scratch::*;

mod spec;
pub use self::spec::*;

mod surface;
pub use self::surface::*;

mod value;
pub use self::value::*;

mod wrapper;
pub use self::wrapper::*;

mod utils;
pub use self::utils::align_up;

mod tests;
