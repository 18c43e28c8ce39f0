//! # Gateway Event Loop
//!
//! A single-threaded readiness loop: callbacks for readable/writable
//! descriptors, one-shot and repeating timers, and POSIX signals, all invoked
//! on the thread that calls [`EventLoop::run`].
//!
//! Two interchangeable backends implement the [`EventLoop`] trait:
//!
//! * [`PollLoop`] - one blocking `poll(2)` per turn, callbacks run inline
//! * [`TaskLoop`] - every watch is a local task on a current-thread tokio
//!   runtime, suspended on descriptor readiness
//!
//! Both are level-triggered: a descriptor that still has unread data after its
//! callback returns is reported again on a later turn.
//!
//! ## Contract
//!
//! * A panicking callback is caught and logged. The loop keeps running and the
//!   watch stays registered.
//! * Once [`EventLoop::remove_watch`] returns, the removed callback is never
//!   invoked again, even if the removal happens from inside that callback.
//! * Adding a watch for a `(fd, direction)` pair that is already watched
//!   replaces the previous callback.
//! * A repeating timer never overlaps itself; the next deadline is computed
//!   after the callback returns.
//! * [`EventLoop::stop`] before [`EventLoop::run`] makes the next `run` return
//!   immediately, and `run` returns on its own once nothing is registered.
//!   A stop requested from a callback keeps the remaining ready descriptors
//!   of that turn for the next `run`.
//!
//! ```rust
//! use gateway_event_loop::{create, Backend};
//! use std::time::Duration;
//!
//! let event_loop = create(Backend::Poll).unwrap();
//! let handle = std::rc::Rc::downgrade(&event_loop);
//! event_loop.add_timer(Duration::from_millis(1), false, Box::new(move |_| {
//!     if let Some(event_loop) = handle.upgrade() {
//!         event_loop.stop();
//!     }
//! }));
//! event_loop.run().unwrap();
//! ```

pub mod error;
pub mod poll;
mod sys;
pub mod task;
mod timer;

pub use error::{LoopError, Result};
pub use poll::PollLoop;
pub use task::TaskLoop;

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::str::FromStr;
use std::time::Duration;
use tracing::error;

/// Callback for descriptor readiness. Receives the watched descriptor.
pub type IoCallback = Box<dyn FnMut(RawFd)>;

/// Callback for timer expiry. Receives the id returned by `add_timer`.
pub type TimerCallback = Box<dyn FnMut(TimerId)>;

/// Callback for signal delivery. Receives the signal number.
pub type SignalCallback = Box<dyn FnMut(i32)>;

/// Readiness direction of a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    Read,
    Write,
}

/// Handle of a registered timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// Smallest interval a repeating timer is rescheduled with.
pub const MIN_REPEAT_INTERVAL: Duration = Duration::from_millis(1);

/// Readiness, timer and signal multiplexer.
///
/// All methods take `&self` so callbacks can hold a (weak) handle to the loop
/// and register or remove watches while they run.
pub trait EventLoop {
    /// Invokes `callback` whenever `fd` is readable, has hung up, or has a
    /// pending error.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::InvalidDescriptor`] for negative descriptors and
    /// [`LoopError::Register`] if the backend cannot watch the descriptor.
    fn add_read_watch(&self, fd: RawFd, callback: IoCallback) -> Result<()>;

    /// Invokes `callback` whenever `fd` is writable.
    fn add_write_watch(&self, fd: RawFd, callback: IoCallback) -> Result<()>;

    /// Removes the watch for `fd` in `direction`. Returns whether one existed.
    fn remove_watch(&self, fd: RawFd, direction: Direction) -> bool;

    /// Schedules `callback` after `delay`, and every `delay` afterwards when
    /// `repeating`.
    fn add_timer(&self, delay: Duration, repeating: bool, callback: TimerCallback) -> TimerId;

    /// Cancels a timer. Returns whether it was still pending.
    fn cancel_timer(&self, id: TimerId) -> bool;

    /// Invokes `callback` on the loop thread after `signal` is delivered to the
    /// process. Multiple deliveries between two turns are coalesced.
    fn add_signal_watch(&self, signal: i32, callback: SignalCallback) -> Result<()>;

    fn remove_signal_watch(&self, signal: i32) -> bool;

    /// Dispatches events until [`EventLoop::stop`] is called or nothing is
    /// registered anymore.
    fn run(&self) -> Result<()>;

    fn stop(&self);

    fn backend(&self) -> Backend;
}

/// Selects an [`EventLoop`] implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Poll,
    Task,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Poll => f.write_str("poll"),
            Backend::Task => f.write_str("task"),
        }
    }
}

impl FromStr for Backend {
    type Err = LoopError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "poll" => Ok(Backend::Poll),
            "task" => Ok(Backend::Task),
            other => Err(LoopError::UnknownBackend(other.to_string())),
        }
    }
}

/// Creates an event loop for the requested backend.
///
/// # Arguments
///
/// * `backend` - Which implementation to instantiate
///
/// # Returns
///
/// A shared handle to the loop. Callbacks should capture
/// `Rc::downgrade(&handle)` rather than a strong clone.
pub fn create(backend: Backend) -> Result<Rc<dyn EventLoop>> {
    match backend {
        Backend::Poll => Ok(Rc::new(PollLoop::new())),
        Backend::Task => Ok(Rc::new(TaskLoop::new()?)),
    }
}

/// Runs a callback, turning a panic into a logged error.
///
/// Returns `false` if the callback panicked.
pub(crate) fn invoke_guarded<F: FnOnce()>(what: &str, f: F) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            error!(callback = what, panic = %panic_message(payload.as_ref()), "💥 Event loop callback panicked");
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parsing() {
        assert_eq!("poll".parse::<Backend>().unwrap(), Backend::Poll);
        assert_eq!("TASK".parse::<Backend>().unwrap(), Backend::Task);
        assert!("epoll".parse::<Backend>().is_err());
        assert_eq!(Backend::Task.to_string(), "task");
    }

    #[test]
    fn test_invoke_guarded_catches_panics() {
        assert!(invoke_guarded("ok", || {}));
        assert!(!invoke_guarded("boom", || panic!("boom")));
    }
}
