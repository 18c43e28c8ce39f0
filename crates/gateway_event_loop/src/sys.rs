//! Thin wrappers over the `poll(2)` and descriptor syscalls the backends share.

use crate::Direction;
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd, RawFd};

pub(crate) const READ_EVENTS: libc::c_short = libc::POLLIN | libc::POLLPRI;
pub(crate) const WRITE_EVENTS: libc::c_short = libc::POLLOUT;
const FAILURE_EVENTS: libc::c_short = libc::POLLHUP | libc::POLLERR;

pub(crate) fn interest(direction: Direction) -> libc::c_short {
    match direction {
        Direction::Read => READ_EVENTS,
        Direction::Write => WRITE_EVENTS,
    }
}

/// Whether `revents` should wake a watch in `direction`. Hangups and errors
/// wake both directions so the owner gets a chance to observe them.
pub(crate) fn wakes(revents: libc::c_short, direction: Direction) -> bool {
    revents & (interest(direction) | FAILURE_EVENTS) != 0
}

pub(crate) fn is_invalid(revents: libc::c_short) -> bool {
    revents & libc::POLLNVAL != 0
}

/// Blocks in `poll(2)` for at most `timeout_ms` (`-1` waits forever).
pub(crate) fn poll(fds: &mut [libc::pollfd], timeout_ms: libc::c_int) -> io::Result<usize> {
    let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// Zero-timeout readiness probe for a single descriptor.
pub(crate) fn is_ready(fd: RawFd, direction: Direction) -> bool {
    let mut fds = [libc::pollfd {
        fd,
        events: interest(direction),
        revents: 0,
    }];
    loop {
        match poll(&mut fds, 0) {
            Ok(0) => return false,
            Ok(_) => return wakes(fds[0].revents, direction) && !is_invalid(fds[0].revents),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return false,
        }
    }
}

/// Duplicates `fd` (close-on-exec) so a backend can own a registration
/// independently of the caller's descriptor.
pub(crate) fn duplicate(fd: RawFd) -> io::Result<OwnedFd> {
    if fd < 0 {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    // SAFETY: watch registration requires the caller to keep `fd` open, and the
    // borrow only lives for the dup call.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    borrowed.try_clone_to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_is_ready_tracks_buffered_data() {
        let (mut a, b) = UnixStream::pair().unwrap();
        assert!(!is_ready(b.as_raw_fd(), Direction::Read));
        assert!(is_ready(b.as_raw_fd(), Direction::Write));
        a.write_all(b"x").unwrap();
        assert!(is_ready(b.as_raw_fd(), Direction::Read));
    }

    #[test]
    fn test_duplicate_rejects_negative() {
        assert!(duplicate(-1).is_err());
        let (a, _b) = UnixStream::pair().unwrap();
        let dup = duplicate(a.as_raw_fd()).unwrap();
        assert_ne!(dup.as_raw_fd(), a.as_raw_fd());
    }
}
