//! The isolated side of a session: a [`Dispatcher`] owning the native surface, served either over
//! in-process channels by [`run_worker`] or over a framed byte stream by [`serve_stream`].

mod dispatcher;
pub use self::dispatcher::*;

mod serve;
pub use self::serve::*;
