//! Behaviour every [`EventLoop`] backend must share.
//!
//! Each scenario is written once against `Rc<dyn EventLoop>` and instantiated
//! for both backends by `contract_tests!`.

use gateway_event_loop::{create, Backend, Direction, EventLoop};
use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

fn new_loop(backend: Backend) -> Rc<dyn EventLoop> {
    create(backend).expect("event loop")
}

fn stopper(event_loop: &Rc<dyn EventLoop>) -> Weak<dyn EventLoop> {
    Rc::downgrade(event_loop)
}

/// Stops the loop after `after` even if the scenario under test misbehaves.
fn safety_net(event_loop: &Rc<dyn EventLoop>, after: Duration) {
    let handle = stopper(event_loop);
    event_loop.add_timer(
        after,
        false,
        Box::new(move |_| {
            if let Some(event_loop) = handle.upgrade() {
                event_loop.stop();
            }
        }),
    );
}

fn nonblocking_pair() -> (UnixStream, UnixStream) {
    let (a, b) = UnixStream::pair().unwrap();
    a.set_nonblocking(true).unwrap();
    b.set_nonblocking(true).unwrap();
    (a, b)
}

fn run_empty_loop_returns(backend: Backend) {
    let event_loop = new_loop(backend);
    let started = Instant::now();
    event_loop.run().unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
}

fn stop_before_run_returns_immediately(backend: Backend) {
    let event_loop = new_loop(backend);
    event_loop.add_timer(Duration::from_secs(30), false, Box::new(|_| {}));
    event_loop.stop();
    let started = Instant::now();
    event_loop.run().unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
}

fn one_shot_timer_fires_once_after_deadline(backend: Backend) {
    let event_loop = new_loop(backend);
    let fired = Rc::new(Cell::new(0));
    let started = Instant::now();
    let counter = fired.clone();
    event_loop.add_timer(Duration::from_millis(20), false, Box::new(move |_| counter.set(counter.get() + 1)));

    event_loop.run().unwrap();
    assert_eq!(fired.get(), 1);
    assert!(started.elapsed() >= Duration::from_millis(20));
}

fn repeating_timer_fires_until_cancelled(backend: Backend) {
    let event_loop = new_loop(backend);
    let fired = Rc::new(Cell::new(0));
    let handle = stopper(&event_loop);
    let counter = fired.clone();
    event_loop.add_timer(
        Duration::from_millis(2),
        true,
        Box::new(move |id| {
            counter.set(counter.get() + 1);
            if counter.get() == 3 {
                if let Some(event_loop) = handle.upgrade() {
                    assert!(event_loop.cancel_timer(id));
                    event_loop.stop();
                }
            }
        }),
    );
    safety_net(&event_loop, Duration::from_secs(5));

    event_loop.run().unwrap();
    assert_eq!(fired.get(), 3);
}

fn cancelled_timer_never_fires(backend: Backend) {
    let event_loop = new_loop(backend);
    let fired = Rc::new(Cell::new(false));
    let flag = fired.clone();
    let id = event_loop.add_timer(Duration::from_millis(5), false, Box::new(move |_| flag.set(true)));
    assert!(event_loop.cancel_timer(id));
    assert!(!event_loop.cancel_timer(id));
    event_loop.add_timer(Duration::from_millis(20), false, Box::new(|_| {}));

    event_loop.run().unwrap();
    assert!(!fired.get());
}

fn read_watch_is_level_triggered(backend: Backend) {
    let event_loop = new_loop(backend);
    let (mut writer, reader) = nonblocking_pair();
    writer.write_all(b"abc").unwrap();

    let seen = Rc::new(RefCell::new(Vec::new()));
    let handle = stopper(&event_loop);
    let sink = seen.clone();
    let mut reader = reader;
    let fd = reader.as_raw_fd();
    event_loop
        .add_read_watch(
            fd,
            Box::new(move |_| {
                // One byte per callback: the rest must be reported again.
                let mut byte = [0u8; 1];
                if let Ok(1) = reader.read(&mut byte) {
                    sink.borrow_mut().push(byte[0]);
                }
                if sink.borrow().len() == 3 {
                    if let Some(event_loop) = handle.upgrade() {
                        event_loop.remove_watch(fd, Direction::Read);
                        event_loop.stop();
                    }
                }
            }),
        )
        .unwrap();
    safety_net(&event_loop, Duration::from_secs(5));

    event_loop.run().unwrap();
    assert_eq!(*seen.borrow(), b"abc".to_vec());
}

fn write_watch_fires_on_writable_socket(backend: Backend) {
    let event_loop = new_loop(backend);
    let (writer, _reader) = nonblocking_pair();
    let fd = writer.as_raw_fd();
    let fired = Rc::new(Cell::new(false));
    let flag = fired.clone();
    let handle = stopper(&event_loop);
    event_loop
        .add_write_watch(
            fd,
            Box::new(move |fd| {
                flag.set(true);
                if let Some(event_loop) = handle.upgrade() {
                    event_loop.remove_watch(fd, Direction::Write);
                    event_loop.stop();
                }
            }),
        )
        .unwrap();
    safety_net(&event_loop, Duration::from_secs(5));

    event_loop.run().unwrap();
    assert!(fired.get());
}

fn removed_watch_is_never_invoked_again(backend: Backend) {
    let event_loop = new_loop(backend);
    let (mut writer, reader) = nonblocking_pair();
    writer.write_all(b"data that is never read").unwrap();
    let fd = reader.as_raw_fd();

    let calls = Rc::new(Cell::new(0));
    let counter = calls.clone();
    let handle = stopper(&event_loop);
    event_loop
        .add_read_watch(
            fd,
            Box::new(move |fd| {
                counter.set(counter.get() + 1);
                if let Some(event_loop) = handle.upgrade() {
                    assert!(event_loop.remove_watch(fd, Direction::Read));
                }
            }),
        )
        .unwrap();
    event_loop.add_timer(Duration::from_millis(50), false, Box::new(|_| {}));

    event_loop.run().unwrap();
    assert_eq!(calls.get(), 1);
    drop(reader);
}

fn re_adding_a_watch_replaces_it(backend: Backend) {
    let event_loop = new_loop(backend);
    let (mut writer, reader) = nonblocking_pair();
    writer.write_all(b"x").unwrap();
    let fd = reader.as_raw_fd();

    let old_calls = Rc::new(Cell::new(0));
    let counter = old_calls.clone();
    event_loop
        .add_read_watch(fd, Box::new(move |_| counter.set(counter.get() + 1)))
        .unwrap();

    let new_calls = Rc::new(Cell::new(0));
    let counter = new_calls.clone();
    let handle = stopper(&event_loop);
    event_loop
        .add_read_watch(
            fd,
            Box::new(move |fd| {
                counter.set(counter.get() + 1);
                if let Some(event_loop) = handle.upgrade() {
                    event_loop.remove_watch(fd, Direction::Read);
                    event_loop.stop();
                }
            }),
        )
        .unwrap();
    safety_net(&event_loop, Duration::from_secs(5));

    event_loop.run().unwrap();
    assert_eq!(old_calls.get(), 0);
    assert_eq!(new_calls.get(), 1);
    drop(reader);
}

fn panicking_callback_keeps_loop_and_watch(backend: Backend) {
    let event_loop = new_loop(backend);
    let (mut writer, reader) = nonblocking_pair();
    writer.write_all(b"x").unwrap();
    let fd = reader.as_raw_fd();

    let calls = Rc::new(Cell::new(0));
    let counter = calls.clone();
    let handle = stopper(&event_loop);
    event_loop
        .add_read_watch(
            fd,
            Box::new(move |fd| {
                counter.set(counter.get() + 1);
                if counter.get() == 1 {
                    panic!("handler failure");
                }
                if let Some(event_loop) = handle.upgrade() {
                    event_loop.remove_watch(fd, Direction::Read);
                    event_loop.stop();
                }
            }),
        )
        .unwrap();
    safety_net(&event_loop, Duration::from_secs(5));

    event_loop.run().unwrap();
    assert_eq!(calls.get(), 2);
    drop(reader);
}

fn peer_hangup_wakes_read_watch(backend: Backend) {
    let event_loop = new_loop(backend);
    let (writer, mut reader) = nonblocking_pair();
    drop(writer);
    let fd = reader.as_raw_fd();

    let saw_eof = Rc::new(Cell::new(false));
    let flag = saw_eof.clone();
    let handle = stopper(&event_loop);
    event_loop
        .add_read_watch(
            fd,
            Box::new(move |fd| {
                let mut buf = [0u8; 8];
                if let Ok(0) = reader.read(&mut buf) {
                    flag.set(true);
                }
                if let Some(event_loop) = handle.upgrade() {
                    event_loop.remove_watch(fd, Direction::Read);
                    event_loop.stop();
                }
            }),
        )
        .unwrap();
    safety_net(&event_loop, Duration::from_secs(5));

    event_loop.run().unwrap();
    assert!(saw_eof.get());
}

fn signal_is_delivered_on_loop_thread(backend: Backend, signum: i32) {
    let event_loop = new_loop(backend);
    let received = Rc::new(Cell::new(0));
    let counter = received.clone();
    let handle = stopper(&event_loop);
    event_loop
        .add_signal_watch(
            signum,
            Box::new(move |signal| {
                assert_eq!(signal, signum);
                counter.set(counter.get() + 1);
                if let Some(event_loop) = handle.upgrade() {
                    event_loop.remove_signal_watch(signal);
                    event_loop.stop();
                }
            }),
        )
        .unwrap();
    event_loop.add_timer(
        Duration::from_millis(10),
        false,
        Box::new(move |_| unsafe {
            libc::raise(signum);
        }),
    );
    safety_net(&event_loop, Duration::from_secs(5));

    event_loop.run().unwrap();
    assert_eq!(received.get(), 1);
}

fn stop_inside_callback_ends_dispatch(backend: Backend) {
    let event_loop = new_loop(backend);
    let (mut first_writer, first) = nonblocking_pair();
    let (mut second_writer, second) = nonblocking_pair();
    first_writer.write_all(b"x").unwrap();
    second_writer.write_all(b"y").unwrap();

    let calls = Rc::new(Cell::new(0));
    for reader in [&first, &second] {
        let handle = stopper(&event_loop);
        let counter = calls.clone();
        event_loop
            .add_read_watch(
                reader.as_raw_fd(),
                Box::new(move |_| {
                    counter.set(counter.get() + 1);
                    if let Some(event_loop) = handle.upgrade() {
                        event_loop.stop();
                    }
                }),
            )
            .unwrap();
    }
    // Both descriptors are ready before the loop starts.
    std::thread::sleep(Duration::from_millis(10));

    event_loop.run().unwrap();
    assert_eq!(calls.get(), 1);
    event_loop.remove_watch(first.as_raw_fd(), Direction::Read);
    event_loop.remove_watch(second.as_raw_fd(), Direction::Read);
}

fn invalid_descriptor_is_rejected(backend: Backend) {
    let event_loop = new_loop(backend);
    assert!(event_loop.add_read_watch(-1, Box::new(|_| {})).is_err());
    assert!(!event_loop.remove_watch(-1, Direction::Read));
}

macro_rules! contract_tests {
    ($module:ident, $backend:expr, $signal:expr) => {
        mod $module {
            use super::*;

            #[test]
            fn run_with_nothing_registered_returns() {
                run_empty_loop_returns($backend);
            }

            #[test]
            fn stop_before_run() {
                stop_before_run_returns_immediately($backend);
            }

            #[test]
            fn one_shot_timer() {
                one_shot_timer_fires_once_after_deadline($backend);
            }

            #[test]
            fn repeating_timer() {
                repeating_timer_fires_until_cancelled($backend);
            }

            #[test]
            fn cancelled_timer() {
                cancelled_timer_never_fires($backend);
            }

            #[test]
            fn level_triggered_reads() {
                read_watch_is_level_triggered($backend);
            }

            #[test]
            fn write_watch() {
                write_watch_fires_on_writable_socket($backend);
            }

            #[test]
            fn remove_from_inside_callback() {
                removed_watch_is_never_invoked_again($backend);
            }

            #[test]
            fn re_add_replaces() {
                re_adding_a_watch_replaces_it($backend);
            }

            #[test]
            fn panic_is_contained() {
                panicking_callback_keeps_loop_and_watch($backend);
            }

            #[test]
            fn hangup_wakes_reader() {
                peer_hangup_wakes_read_watch($backend);
            }

            #[test]
            fn signal_delivery() {
                signal_is_delivered_on_loop_thread($backend, $signal);
            }

            #[test]
            fn stop_from_callback() {
                stop_inside_callback_ends_dispatch($backend);
            }

            #[test]
            fn invalid_descriptor() {
                invalid_descriptor_is_rejected($backend);
            }
        }
    };
}

contract_tests!(poll_backend, Backend::Poll, libc::SIGUSR2);
contract_tests!(task_backend, Backend::Task, libc::SIGWINCH);
