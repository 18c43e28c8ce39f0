//! Cross-thread shutdown requests.
//!
//! Signals only reach the loop of the process they are delivered to. When a
//! Gateway or BusinessWorker runs on a thread owned by someone else (tests, an
//! embedding application), a [`ShutdownTrigger`] is the way to ask it to drain.
//! The matching [`ShutdownListener`] is a descriptor the loop watches.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

/// Creates a connected trigger/listener pair.
///
/// # Returns
///
/// The sending half, which may be cloned and moved to other threads, and the
/// receiving half to hand to `watch_shutdown`.
pub fn shutdown_channel() -> io::Result<(ShutdownTrigger, ShutdownListener)> {
    let (writer, reader) = UnixStream::pair()?;
    writer.set_nonblocking(true)?;
    reader.set_nonblocking(true)?;
    Ok((
        ShutdownTrigger {
            writer: Arc::new(writer),
        },
        ShutdownListener { reader },
    ))
}

/// Sending half of a shutdown channel.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    writer: Arc<UnixStream>,
}

impl ShutdownTrigger {
    /// Requests shutdown. Repeated requests are harmless.
    pub fn trigger(&self) {
        // A full pipe already holds a pending request.
        let _ = (&*self.writer).write(&[1]);
    }
}

/// Receiving half of a shutdown channel, readable once a request is pending.
#[derive(Debug)]
pub struct ShutdownListener {
    reader: UnixStream,
}

impl ShutdownListener {
    pub fn fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    /// Consumes pending requests. Returns `true` if at least one was pending
    /// or the trigger side is gone.
    pub fn drain(&mut self) -> bool {
        let mut buf = [0u8; 64];
        let mut requested = false;
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) => return true,
                Ok(_) => requested = true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return requested,
            }
        }
    }
}
