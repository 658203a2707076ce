#![doc = include_str!("../README.md")]

//! # Tempest
//!
//! A single-threaded, callback-driven reactor for non-blocking I/O.
//!
//! ## Features
//! - Readiness dispatch over registered file descriptors (mio-backed)
//! - Deadline-ordered one-shot timers with O(1) cancellation
//! - Cross-thread deferred callbacks that wake a blocked poll
//! - Buffered streams with delimiter-, length-, and close-triggered reads
//! - Drift-free periodic callbacks
//!
//! ## Example
//! ```no_run
//! use std::time::Duration;
//! use tempest::EventLoop;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let io_loop = EventLoop::new()?;
//!
//!     let lp = io_loop.clone();
//!     io_loop.call_later(Duration::from_millis(100), move || {
//!         println!("tick");
//!         lp.stop();
//!     })?;
//!
//!     io_loop.start()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//! The crate is built from three components:
//!
//! - `EventLoop`: the reactor. One thread runs it; handlers, timer
//!   callbacks, and deferred callbacks all execute cooperatively on that
//!   thread. `add_callback` is the one thread-safe entry point.
//! - `IOStream`: a buffered wrapper around one connected non-blocking
//!   socket, registered with a loop. Framing is the caller's business; the
//!   stream only answers "give me bytes through this delimiter / this many
//!   bytes / everything until close".
//! - `PeriodicCallback`: a repeating timer layered on the loop's one-shot
//!   timeout primitive, rescheduling against its anchor so callback latency
//!   never accumulates as drift.
//!
//! ## Configuration
//! Loop settings can be configured via:
//! - Environment variables (prefixed with `TEMPEST_`)
//! - Configuration file (`config.toml`)
//! - `LoopConfig` passed to `EventLoop::with_config`

pub use crate::config::LoopConfig;
pub use crate::error::{LoopError, StreamError};
pub use crate::reactor::{EventLoop, EventSet, TimerHandle};
pub use crate::stream::{IOStream, StreamSocket};
pub use crate::timer::PeriodicCallback;

mod buffer;
mod config;
mod error;
mod reactor;
mod stream;
mod timer;
