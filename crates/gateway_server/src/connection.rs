//! Non-blocking TCP connection with its reassembly buffer.
//!
//! Used for client sockets on the Gateway and for worker links on both sides.

use gateway_protocol::{ConnectionId, FrameBuffer};
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

/// Largest single read, regardless of what the probe asks for.
pub const MAX_READ_CHUNK: usize = 64 * 1024;

/// Result of one read attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Fill {
    /// This many bytes were appended to the buffer.
    Data(usize),
    /// Nothing to read right now.
    WouldBlock,
    /// The peer closed its side.
    Eof,
}

/// One accepted or connected TCP stream.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    stream: TcpStream,
    peer: SocketAddr,
    buffer: FrameBuffer,
}

impl Connection {
    /// Wraps a stream and switches it to non-blocking mode.
    ///
    /// # Arguments
    ///
    /// * `id` - Identifier allocated by the owner's [`gateway_protocol::IdSequence`]
    /// * `stream` - The accepted or connected socket
    /// * `peer` - Remote address, kept for envelopes and logs
    /// * `preread` - Read bound before the probe has seen any bytes
    pub fn new(id: ConnectionId, stream: TcpStream, peer: SocketAddr, preread: usize) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            id,
            stream,
            peer,
            buffer: FrameBuffer::new(preread),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Peer address in the IPv4 form carried by envelope headers.
    pub fn peer_v4(&self) -> SocketAddrV4 {
        to_v4(self.peer)
    }

    pub fn buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut FrameBuffer {
        &mut self.buffer
    }

    /// Reads at most `buffer.remaining()` bytes into the reassembly buffer.
    pub fn fill(&mut self, scratch: &mut [u8]) -> io::Result<Fill> {
        let want = self.buffer.remaining().min(scratch.len()).min(MAX_READ_CHUNK);
        loop {
            match self.stream.read(&mut scratch[..want]) {
                Ok(0) => return Ok(Fill::Eof),
                Ok(n) => {
                    self.buffer.extend(&scratch[..n]);
                    return Ok(Fill::Data(n));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Fill::WouldBlock),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes all of `data`.
    ///
    /// Tries a non-blocking write first. If the kernel buffer is full, the
    /// socket is switched to blocking mode for the rest of the data, bounded by
    /// `timeout`, and switched back afterwards.
    pub fn send(&mut self, data: &[u8], timeout: Duration) -> io::Result<()> {
        let mut written = 0;
        while written < data.len() {
            match self.stream.write(&data[written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        if written == data.len() {
            return Ok(());
        }

        self.stream.set_nonblocking(false)?;
        let result = self.send_blocking(&data[written..], timeout);
        let restored = self
            .stream
            .set_write_timeout(None)
            .and_then(|_| self.stream.set_nonblocking(true));
        result.and(restored)
    }

    fn send_blocking(&mut self, mut data: &[u8], timeout: Duration) -> io::Result<()> {
        let deadline = Instant::now() + timeout;
        while !data.is_empty() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(io::ErrorKind::TimedOut.into());
            }
            self.stream.set_write_timeout(Some(left))?;
            match self.stream.write(data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => data = &data[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Err(io::ErrorKind::TimedOut.into())
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Shuts both directions down so the peer sees the close immediately.
    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Maps a socket address to IPv4; addresses that cannot be mapped become
/// `0.0.0.0` with the original port.
pub fn to_v4(addr: SocketAddr) -> SocketAddrV4 {
    match addr {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(v6) => {
            let ip = v6.ip().to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED);
            SocketAddrV4::new(ip, v6.port())
        }
    }
}

/// Inverse of [`to_v4`] for replies addressed by envelope headers.
pub fn from_v4(addr: SocketAddrV4) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(*addr.ip()), addr.port())
}
