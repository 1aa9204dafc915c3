//! Message structures exchanged between a client session and the worker hosting the native
//! routines.
//!
//! A session speaks three operations. `init` asks the worker to build its wrappers and acquire
//! the native context, and is answered with the announced API. `call` runs one routine and is
//! answered with the routine's return value and the updated contents of every buffer and cell
//! argument. `destroy` releases the native context. Failures of any of these are answered with
//! an [`ErrorPayload`] tagged with the layer that raised it.
//!
//! Messages usually travel through in-process channels. The [`codec`] module frames them for
//! byte streams.

pub mod codec;

mod message;
pub use self::message::*;
