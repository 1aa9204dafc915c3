//! The caller's side of a session: a [`Session`] owns a worker running a native surface and
//! exposes one [`Procedure`] per routine it announces.
//!
//! ```no_run
//! # async fn demo() -> Result<(), seclink_client::ApiError> {
//! use seclink_client::{CallArgs, OutCell, Session, SessionConfig, SharedBuffer, demo_surface};
//!
//! let session = Session::initialize(SessionConfig::default(), demo_surface()).await?;
//!
//! let output = SharedBuffer::new(vec![0u8; 32]);
//! let len = OutCell::with(0);
//!
//! let args = CallArgs::new()
//!     .with("input", SharedBuffer::new(vec![7u8; 32]))
//!     .with("output", &output)
//!     .with("len", &len);
//!
//! session.call("demo_copy", &args)?.await?;
//! session.destroy()?.await?;
//! # Ok(())
//! # }
//! ```

mod args;
pub use self::args::*;

mod demo;
pub use self::demo::*;

mod error;
pub use self::error::*;

mod ledger;
pub use self::ledger::*;

mod promise;
pub use self::promise::*;

mod session;
pub use self::session::*;

mod spawn;
pub use self::spawn::*;

mod tests;
