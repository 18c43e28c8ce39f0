//! Cooperative-task backend.
//!
//! Every watch, timer and signal becomes a `spawn_local` task on a
//! current-thread tokio runtime. A watch task is suspended on `AsyncFd`
//! readiness of a duplicated descriptor, runs its callback, then re-probes the
//! descriptor with a zero-timeout `poll(2)`: readiness is only cleared when the
//! descriptor is really drained, which keeps the contract level-triggered.
//!
//! Tasks hold a `Weak` handle to the loop and a registration id. Before and
//! after each callback they check that their id is still the current one for
//! their key, so removed or replaced watches never fire again.

use crate::error::{LoopError, Result};
use crate::sys;
use crate::{
    invoke_guarded, Backend, Direction, EventLoop, IoCallback, SignalCallback, TimerCallback, TimerId,
    MIN_REPEAT_INTERVAL,
};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::fd::{OwnedFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::runtime::{Builder, Runtime};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tokio::task::LocalSet;
use tracing::{debug, warn};

/// Registration of one task: its id and the notifier that cancels it.
struct Registration {
    id: u64,
    cancel: Rc<Notify>,
}

impl Registration {
    fn cancel(self) {
        self.cancel.notify_one();
    }
}

#[derive(Default)]
struct Registry {
    watches: HashMap<(RawFd, Direction), Registration>,
    timers: HashMap<TimerId, Registration>,
    signals: HashMap<i32, Registration>,
    next_id: u64,
}

impl Registry {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn is_idle(&self) -> bool {
        self.watches.is_empty() && self.timers.is_empty() && self.signals.is_empty()
    }
}

struct Inner {
    // Declared before `runtime` so tasks are dropped while the runtime is alive.
    local: LocalSet,
    runtime: Runtime,
    registry: RefCell<Registry>,
    stopped: Cell<bool>,
    running: Cell<bool>,
    wake: Notify,
}

impl Inner {
    fn watch_is_current(&self, key: (RawFd, Direction), id: u64) -> bool {
        self.registry.borrow().watches.get(&key).is_some_and(|r| r.id == id)
    }

    fn timer_is_current(&self, timer: TimerId, id: u64) -> bool {
        self.registry.borrow().timers.get(&timer).is_some_and(|r| r.id == id)
    }

    fn signal_is_current(&self, signal: i32, id: u64) -> bool {
        self.registry.borrow().signals.get(&signal).is_some_and(|r| r.id == id)
    }

    /// Wakes `run` so it can notice a stop request or an empty registry.
    fn poke(&self) {
        self.wake.notify_one();
    }
}

/// Readiness loop driven by tokio local tasks.
pub struct TaskLoop {
    inner: Rc<Inner>,
}

impl TaskLoop {
    /// Builds the current-thread runtime backing this loop.
    ///
    /// # Errors
    ///
    /// [`LoopError::Runtime`] if the runtime cannot be created.
    pub fn new() -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(LoopError::Runtime)?;
        Ok(Self {
            inner: Rc::new(Inner {
                local: LocalSet::new(),
                runtime,
                registry: RefCell::new(Registry::default()),
                stopped: Cell::new(false),
                running: Cell::new(false),
                wake: Notify::new(),
            }),
        })
    }

    fn add_watch(&self, fd: RawFd, direction: Direction, callback: IoCallback) -> Result<()> {
        if fd < 0 {
            return Err(LoopError::InvalidDescriptor(fd));
        }
        let register_error = |source| LoopError::Register { fd, source };
        let owned = sys::duplicate(fd).map_err(register_error)?;
        let interest = match direction {
            Direction::Read => Interest::READABLE,
            Direction::Write => Interest::WRITABLE,
        };
        let async_fd = {
            let _guard = self.inner.runtime.enter();
            AsyncFd::with_interest(owned, interest).map_err(register_error)?
        };

        let cancel = Rc::new(Notify::new());
        let id = {
            let mut registry = self.inner.registry.borrow_mut();
            let id = registry.next_id();
            let previous = registry.watches.insert(
                (fd, direction),
                Registration {
                    id,
                    cancel: cancel.clone(),
                },
            );
            if let Some(previous) = previous {
                previous.cancel();
            }
            id
        };

        self.inner.local.spawn_local(watch_task(
            Rc::downgrade(&self.inner),
            fd,
            direction,
            id,
            async_fd,
            interest,
            callback,
            cancel,
        ));
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn watch_task(
    inner: Weak<Inner>,
    fd: RawFd,
    direction: Direction,
    id: u64,
    async_fd: AsyncFd<OwnedFd>,
    interest: Interest,
    mut callback: IoCallback,
    cancel: Rc<Notify>,
) {
    let key = (fd, direction);
    loop {
        let mut guard = tokio::select! {
            biased;
            _ = cancel.notified() => return,
            ready = async_fd.ready(interest) => match ready {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(fd, error = %e, "🚫 Readiness wait failed; dropping watch");
                    return;
                }
            },
        };

        let Some(current) = inner.upgrade() else { return };
        if !current.watch_is_current(key, id) {
            return;
        }
        if current.stopped.get() {
            // Readiness is kept for the next run.
            drop(current);
            drop(guard);
            tokio::task::yield_now().await;
            continue;
        }
        invoke_guarded("io", || callback(fd));
        if !current.watch_is_current(key, id) {
            return;
        }
        drop(current);

        if sys::is_ready(fd, direction) {
            guard.retain_ready();
        } else {
            guard.clear_ready();
        }
        drop(guard);
        tokio::task::yield_now().await;
    }
}

async fn timer_task(
    inner: Weak<Inner>,
    timer: TimerId,
    id: u64,
    delay: Duration,
    repeating: bool,
    mut callback: TimerCallback,
    cancel: Rc<Notify>,
) {
    let interval = delay.max(MIN_REPEAT_INTERVAL);
    let mut wait = delay;
    loop {
        tokio::select! {
            biased;
            _ = cancel.notified() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        let Some(current) = inner.upgrade() else { return };
        if !current.timer_is_current(timer, id) {
            return;
        }
        if !repeating {
            current.registry.borrow_mut().timers.remove(&timer);
            invoke_guarded("timer", || callback(timer));
            current.poke();
            return;
        }
        invoke_guarded("timer", || callback(timer));
        if !current.timer_is_current(timer, id) {
            return;
        }
        wait = interval;
    }
}

async fn signal_task(
    inner: Weak<Inner>,
    signum: i32,
    id: u64,
    mut stream: tokio::signal::unix::Signal,
    mut callback: SignalCallback,
    cancel: Rc<Notify>,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.notified() => return,
            received = stream.recv() => if received.is_none() { return },
        }

        let Some(current) = inner.upgrade() else { return };
        if !current.signal_is_current(signum, id) {
            return;
        }
        invoke_guarded("signal", || callback(signum));
    }
}

impl EventLoop for TaskLoop {
    fn add_read_watch(&self, fd: RawFd, callback: IoCallback) -> Result<()> {
        self.add_watch(fd, Direction::Read, callback)
    }

    fn add_write_watch(&self, fd: RawFd, callback: IoCallback) -> Result<()> {
        self.add_watch(fd, Direction::Write, callback)
    }

    fn remove_watch(&self, fd: RawFd, direction: Direction) -> bool {
        let removed = self.inner.registry.borrow_mut().watches.remove(&(fd, direction));
        match removed {
            Some(registration) => {
                registration.cancel();
                self.inner.poke();
                true
            }
            None => false,
        }
    }

    fn add_timer(&self, delay: Duration, repeating: bool, callback: TimerCallback) -> TimerId {
        let cancel = Rc::new(Notify::new());
        let (timer, id) = {
            let mut registry = self.inner.registry.borrow_mut();
            let id = registry.next_id();
            let timer = TimerId::new(id);
            registry.timers.insert(
                timer,
                Registration {
                    id,
                    cancel: cancel.clone(),
                },
            );
            (timer, id)
        };
        self.inner.local.spawn_local(timer_task(
            Rc::downgrade(&self.inner),
            timer,
            id,
            delay,
            repeating,
            callback,
            cancel,
        ));
        timer
    }

    fn cancel_timer(&self, id: TimerId) -> bool {
        let removed = self.inner.registry.borrow_mut().timers.remove(&id);
        match removed {
            Some(registration) => {
                registration.cancel();
                self.inner.poke();
                true
            }
            None => false,
        }
    }

    fn add_signal_watch(&self, signum: i32, callback: SignalCallback) -> Result<()> {
        let stream = {
            let _guard = self.inner.runtime.enter();
            signal(SignalKind::from_raw(signum)).map_err(|source| LoopError::Signal { signal: signum, source })?
        };

        let cancel = Rc::new(Notify::new());
        let id = {
            let mut registry = self.inner.registry.borrow_mut();
            let id = registry.next_id();
            let previous = registry.signals.insert(
                signum,
                Registration {
                    id,
                    cancel: cancel.clone(),
                },
            );
            if let Some(previous) = previous {
                previous.cancel();
            }
            id
        };
        self.inner.local.spawn_local(signal_task(
            Rc::downgrade(&self.inner),
            signum,
            id,
            stream,
            callback,
            cancel,
        ));
        debug!(signal = signum, "📡 Signal watch registered");
        Ok(())
    }

    fn remove_signal_watch(&self, signum: i32) -> bool {
        let removed = self.inner.registry.borrow_mut().signals.remove(&signum);
        match removed {
            Some(registration) => {
                registration.cancel();
                self.inner.poke();
                true
            }
            None => false,
        }
    }

    fn run(&self) -> Result<()> {
        if self.inner.running.replace(true) {
            return Err(LoopError::AlreadyRunning);
        }
        let inner = &self.inner;
        inner.runtime.block_on(inner.local.run_until(async {
            loop {
                if inner.stopped.replace(false) || inner.registry.borrow().is_idle() {
                    break;
                }
                inner.wake.notified().await;
            }
        }));
        inner.running.set(false);
        Ok(())
    }

    fn stop(&self) {
        self.inner.stopped.set(true);
        self.inner.poke();
    }

    fn backend(&self) -> Backend {
        Backend::Task
    }
}
