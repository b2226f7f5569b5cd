//! Run registered cleanup actions exactly once, concurrently, when a process
//! shuts down.
//!
//! A [`Closer`] collects actions from anywhere in the program. Closing it,
//! either explicitly or on delivery of a watched [`Signal`], spawns every
//! action on its own task. Failures are logged and never propagated, and
//! [`Closer::wait`] resolves once all of them have finished.
//!
//! The free functions ([`add`], [`close_all`], [`wait`], ...) delegate to a
//! process-wide default closer, see [`global`].

mod closer;
mod error;
mod global;
mod signal;


pub use closer::{Closer, State};
pub use error::{CloserError, Result};
pub use global::{add, add_blocking, add_named, close_all, global, install, trigger, wait};
pub use signal::{Signal, SignalParseError};

#[cfg(any(test, feature = "test-util"))]
pub use global::reset;
