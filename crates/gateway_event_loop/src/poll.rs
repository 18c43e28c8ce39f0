//! `poll(2)` backend.
//!
//! Each turn builds a `pollfd` set from the registered watches, blocks until a
//! descriptor is ready or the earliest timer is due, then runs the due timers
//! and the ready callbacks inline. Signals are forwarded by `signal-hook` into
//! one socket pair per signal whose read end is part of the `pollfd` set.

use crate::error::{LoopError, Result};
use crate::sys;
use crate::timer::TimerQueue;
use crate::{
    invoke_guarded, Backend, Direction, EventLoop, IoCallback, SignalCallback, TimerCallback, TimerId,
};
use signal_hook::SigId;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

struct IoWatch {
    generation: u64,
    /// `None` while the callback is running.
    callback: Option<IoCallback>,
}

struct SignalWatch {
    generation: u64,
    reader: UnixStream,
    registration: SigId,
    callback: Option<SignalCallback>,
}

#[derive(Default)]
struct State {
    watches: BTreeMap<(RawFd, Direction), IoWatch>,
    signals: BTreeMap<i32, SignalWatch>,
    timers: TimerQueue,
    next_generation: u64,
}

impl State {
    fn generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn is_idle(&self) -> bool {
        self.watches.is_empty() && self.signals.is_empty() && self.timers.is_empty()
    }
}

/// What one `pollfd` entry stands for, captured when the set is built.
enum Slot {
    Io {
        read: Option<u64>,
        write: Option<u64>,
    },
    Signal {
        signal: i32,
        generation: u64,
    },
}

/// Synchronous readiness loop on top of `poll(2)`.
pub struct PollLoop {
    state: RefCell<State>,
    stopped: Cell<bool>,
    running: Cell<bool>,
}

impl PollLoop {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(State::default()),
            stopped: Cell::new(false),
            running: Cell::new(false),
        }
    }

    fn add_watch(&self, fd: RawFd, direction: Direction, callback: IoCallback) -> Result<()> {
        if fd < 0 {
            return Err(LoopError::InvalidDescriptor(fd));
        }
        let mut state = self.state.borrow_mut();
        let generation = state.generation();
        state.watches.insert(
            (fd, direction),
            IoWatch {
                generation,
                callback: Some(callback),
            },
        );
        Ok(())
    }

    fn build_poll_set(&self) -> (Vec<libc::pollfd>, Vec<(RawFd, Slot)>) {
        let state = self.state.borrow();
        let mut fds: Vec<libc::pollfd> = Vec::with_capacity(state.watches.len() + state.signals.len());
        let mut slots: Vec<(RawFd, Slot)> = Vec::with_capacity(fds.capacity());

        for (&(fd, direction), watch) in &state.watches {
            let merged = match slots.last_mut() {
                Some((last_fd, Slot::Io { read, write })) if *last_fd == fd => {
                    match direction {
                        Direction::Read => *read = Some(watch.generation),
                        Direction::Write => *write = Some(watch.generation),
                    }
                    true
                }
                _ => false,
            };
            if merged {
                if let Some(entry) = fds.last_mut() {
                    entry.events |= sys::interest(direction);
                }
                continue;
            }
            let (read, write) = match direction {
                Direction::Read => (Some(watch.generation), None),
                Direction::Write => (None, Some(watch.generation)),
            };
            fds.push(libc::pollfd {
                fd,
                events: sys::interest(direction),
                revents: 0,
            });
            slots.push((fd, Slot::Io { read, write }));
        }

        for (&signal, watch) in &state.signals {
            fds.push(libc::pollfd {
                fd: watch.reader.as_raw_fd(),
                events: sys::READ_EVENTS,
                revents: 0,
            });
            slots.push((
                watch.reader.as_raw_fd(),
                Slot::Signal {
                    signal,
                    generation: watch.generation,
                },
            ));
        }

        (fds, slots)
    }

    fn fire_timers(&self) {
        let due = self.state.borrow_mut().timers.due(Instant::now());
        for id in due {
            let Some((mut callback, repeating)) = self.state.borrow_mut().timers.begin_fire(id) else {
                continue;
            };
            invoke_guarded("timer", || callback(id));
            if repeating {
                self.state
                    .borrow_mut()
                    .timers
                    .finish_fire(id, callback, Instant::now());
            }
        }
    }

    fn dispatch_io(&self, fd: RawFd, direction: Direction, generation: u64) {
        let callback = match self.state.borrow_mut().watches.get_mut(&(fd, direction)) {
            Some(watch) if watch.generation == generation => watch.callback.take(),
            _ => None,
        };
        let Some(mut callback) = callback else {
            return;
        };

        invoke_guarded("io", || callback(fd));

        if let Some(watch) = self.state.borrow_mut().watches.get_mut(&(fd, direction)) {
            if watch.generation == generation && watch.callback.is_none() {
                watch.callback = Some(callback);
            }
        }
    }

    fn dispatch_signal(&self, signal: i32, generation: u64) {
        let callback = match self.state.borrow_mut().signals.get_mut(&signal) {
            Some(watch) if watch.generation == generation => {
                drain(&watch.reader);
                watch.callback.take()
            }
            _ => None,
        };
        let Some(mut callback) = callback else {
            return;
        };

        invoke_guarded("signal", || callback(signal));

        if let Some(watch) = self.state.borrow_mut().signals.get_mut(&signal) {
            if watch.generation == generation && watch.callback.is_none() {
                watch.callback = Some(callback);
            }
        }
    }

    fn turn(&self) -> Result<()> {
        let (mut fds, slots) = self.build_poll_set();
        let timeout = self.state.borrow_mut().timers.next_timeout(Instant::now());

        match sys::poll(&mut fds, timeout_ms(timeout)) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(LoopError::Poll(e)),
        }

        self.fire_timers();

        for (entry, (fd, slot)) in fds.iter().zip(slots) {
            // A stop request ends the turn; remaining readiness is seen again
            // by the next run.
            if self.stopped.get() {
                break;
            }
            if entry.revents == 0 {
                continue;
            }
            match slot {
                Slot::Io { read, write } => {
                    if sys::is_invalid(entry.revents) {
                        warn!(fd, "🚫 Descriptor is not open; dropping its watches");
                        self.remove_watch(fd, Direction::Read);
                        self.remove_watch(fd, Direction::Write);
                        continue;
                    }
                    if let Some(generation) = read.filter(|_| sys::wakes(entry.revents, Direction::Read)) {
                        self.dispatch_io(fd, Direction::Read, generation);
                    }
                    if let Some(generation) = write.filter(|_| sys::wakes(entry.revents, Direction::Write)) {
                        self.dispatch_io(fd, Direction::Write, generation);
                    }
                }
                Slot::Signal { signal, generation } => self.dispatch_signal(signal, generation),
            }
        }
        Ok(())
    }
}

impl Default for PollLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PollLoop {
    fn drop(&mut self) {
        for watch in self.state.get_mut().signals.values() {
            signal_hook::low_level::unregister(watch.registration);
        }
    }
}

impl EventLoop for PollLoop {
    fn add_read_watch(&self, fd: RawFd, callback: IoCallback) -> Result<()> {
        self.add_watch(fd, Direction::Read, callback)
    }

    fn add_write_watch(&self, fd: RawFd, callback: IoCallback) -> Result<()> {
        self.add_watch(fd, Direction::Write, callback)
    }

    fn remove_watch(&self, fd: RawFd, direction: Direction) -> bool {
        self.state.borrow_mut().watches.remove(&(fd, direction)).is_some()
    }

    fn add_timer(&self, delay: Duration, repeating: bool, callback: TimerCallback) -> TimerId {
        self.state
            .borrow_mut()
            .timers
            .insert(Instant::now(), delay, repeating, callback)
    }

    fn cancel_timer(&self, id: TimerId) -> bool {
        self.state.borrow_mut().timers.cancel(id)
    }

    fn add_signal_watch(&self, signal: i32, callback: SignalCallback) -> Result<()> {
        let signal_error = |source| LoopError::Signal { signal, source };
        let (reader, writer) = UnixStream::pair().map_err(signal_error)?;
        reader.set_nonblocking(true).map_err(signal_error)?;
        writer.set_nonblocking(true).map_err(signal_error)?;
        let registration = signal_hook::low_level::pipe::register(signal, writer).map_err(signal_error)?;

        let mut state = self.state.borrow_mut();
        let generation = state.generation();
        let previous = state.signals.insert(
            signal,
            SignalWatch {
                generation,
                reader,
                registration,
                callback: Some(callback),
            },
        );
        if let Some(previous) = previous {
            signal_hook::low_level::unregister(previous.registration);
        }
        debug!(signal, "📡 Signal watch registered");
        Ok(())
    }

    fn remove_signal_watch(&self, signal: i32) -> bool {
        match self.state.borrow_mut().signals.remove(&signal) {
            Some(watch) => {
                signal_hook::low_level::unregister(watch.registration);
                true
            }
            None => false,
        }
    }

    fn run(&self) -> Result<()> {
        if self.running.replace(true) {
            return Err(LoopError::AlreadyRunning);
        }
        let result = loop {
            if self.stopped.replace(false) || self.state.borrow().is_idle() {
                break Ok(());
            }
            if let Err(e) = self.turn() {
                break Err(e);
            }
        };
        self.running.set(false);
        result
    }

    fn stop(&self) {
        self.stopped.set(true);
    }

    fn backend(&self) -> Backend {
        Backend::Poll
    }
}

fn drain(reader: &UnixStream) {
    let mut buf = [0u8; 64];
    let mut reader = reader;
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(duration) => {
            let millis = duration.as_nanos().div_ceil(1_000_000);
            libc::c_int::try_from(millis).unwrap_or(libc::c_int::MAX)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::rc::Rc;

    #[test]
    fn test_timeout_rounds_up() {
        assert_eq!(timeout_ms(None), -1);
        assert_eq!(timeout_ms(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_ms(Some(Duration::from_micros(1))), 1);
        assert_eq!(timeout_ms(Some(Duration::from_millis(1500))), 1500);
    }

    #[test]
    fn test_read_and_write_watch_share_one_pollfd() {
        let event_loop = PollLoop::new();
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        event_loop.add_read_watch(fd, Box::new(|_| {})).unwrap();
        event_loop.add_write_watch(fd, Box::new(|_| {})).unwrap();

        let (fds, slots) = event_loop.build_poll_set();
        assert_eq!(fds.len(), 1);
        assert_eq!(fds[0].events, sys::READ_EVENTS | sys::WRITE_EVENTS);
        assert!(matches!(slots[0].1, Slot::Io { read: Some(_), write: Some(_) }));
    }

    #[test]
    fn test_removed_in_same_turn_is_not_invoked() {
        let event_loop = Rc::new(PollLoop::new());
        let (mut a1, b1) = UnixStream::pair().unwrap();
        let (mut a2, b2) = UnixStream::pair().unwrap();
        a1.write_all(b"x").unwrap();
        a2.write_all(b"x").unwrap();

        let second_calls = Rc::new(Cell::new(0));
        let fd1 = b1.as_raw_fd();
        let fd2 = b2.as_raw_fd();
        let (first_fd, other_fd) = if fd1 < fd2 { (fd1, fd2) } else { (fd2, fd1) };

        let handle = Rc::downgrade(&event_loop);
        event_loop
            .add_read_watch(
                first_fd,
                Box::new(move |_| {
                    if let Some(event_loop) = handle.upgrade() {
                        event_loop.remove_watch(other_fd, Direction::Read);
                        event_loop.stop();
                    }
                }),
            )
            .unwrap();
        let counter = second_calls.clone();
        event_loop
            .add_read_watch(other_fd, Box::new(move |_| counter.set(counter.get() + 1)))
            .unwrap();

        event_loop.run().unwrap();
        assert_eq!(second_calls.get(), 0);
    }
}
