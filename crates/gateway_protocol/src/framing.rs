//! Stream reassembly.
//!
//! A [`FrameBuffer`] accumulates the bytes read from one connection and asks a
//! [`FrameProbe`] after every append whether a complete frame is present. The
//! probe never sees sockets and the buffer never interprets payloads, so the
//! same machinery frames client traffic (with an application probe) and
//! worker links (with [`crate::EnvelopeProbe`]).

use bytes::{Bytes, BytesMut};

/// Answer of a [`FrameProbe`] about the bytes accumulated so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// At least this many more bytes are needed before completeness can be
    /// decided. Also the upper bound for the next socket read.
    NeedMore(usize),
    /// The first `n` buffered bytes form one complete frame.
    Complete(usize),
    /// The buffered bytes can never form a valid frame.
    Malformed,
}

/// Decides frame boundaries for one application protocol.
pub trait FrameProbe {
    fn probe(&self, buffer: &[u8]) -> Probe;
}

impl<F> FrameProbe for F
where
    F: Fn(&[u8]) -> Probe,
{
    fn probe(&self, buffer: &[u8]) -> Probe {
        self(buffer)
    }
}

/// Result of feeding bytes into a [`FrameBuffer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feed {
    NeedMore(usize),
    Complete(Bytes),
    Malformed,
}

/// Per-connection accumulation buffer.
///
/// `remaining()` is the number of bytes the next read should ask for, so a
/// reader never pulls bytes that belong to the following frame when the probe
/// can tell where the frame ends.
#[derive(Debug)]
pub struct FrameBuffer {
    buffer: BytesMut,
    remaining: usize,
    preread: usize,
}

impl FrameBuffer {
    /// Creates an empty buffer that asks for `preread` bytes before the first
    /// probe.
    pub fn new(preread: usize) -> Self {
        let preread = preread.max(1);
        Self {
            buffer: BytesMut::new(),
            remaining: preread,
            preread,
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Bytes received but not yet handed out as a frame.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Appends `bytes` and probes for the next frame.
    pub fn feed(&mut self, bytes: &[u8], probe: &dyn FrameProbe) -> Feed {
        self.extend(bytes);
        self.next_frame(probe)
    }

    /// Probes the buffered bytes and splits off one frame if complete.
    ///
    /// Bytes after the frame boundary stay buffered; callers keep calling
    /// this until it stops returning [`Feed::Complete`].
    pub fn next_frame(&mut self, probe: &dyn FrameProbe) -> Feed {
        if self.buffer.is_empty() {
            self.remaining = self.preread;
            return Feed::NeedMore(self.remaining);
        }

        match probe.probe(&self.buffer) {
            Probe::NeedMore(n) => {
                self.remaining = n.max(1);
                Feed::NeedMore(self.remaining)
            }
            Probe::Complete(len) => {
                let len = if len == 0 || len > self.buffer.len() {
                    self.buffer.len()
                } else {
                    len
                };
                let frame = self.buffer.split_to(len).freeze();
                self.remaining = self.preread;
                Feed::Complete(frame)
            }
            Probe::Malformed => Feed::Malformed,
        }
    }

    /// Drops everything buffered and starts over at the preread length.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.remaining = self.preread;
    }
}

/// Every read is one complete frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unframed;

impl FrameProbe for Unframed {
    fn probe(&self, buffer: &[u8]) -> Probe {
        Probe::Complete(buffer.len())
    }
}

/// Four-byte big-endian body length followed by the body.
///
/// Declared lengths above `max_body` are malformed; the check happens on the
/// header alone, before anything is reserved for the body.
#[derive(Debug, Clone, Copy)]
pub struct LengthPrefixed {
    pub max_body: usize,
}

impl LengthPrefixed {
    pub const HEADER_LEN: usize = 4;

    pub fn new(max_body: usize) -> Self {
        Self { max_body }
    }
}

impl FrameProbe for LengthPrefixed {
    fn probe(&self, buffer: &[u8]) -> Probe {
        if buffer.len() < Self::HEADER_LEN {
            return Probe::NeedMore(Self::HEADER_LEN - buffer.len());
        }
        let declared = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
        if declared > self.max_body {
            return Probe::Malformed;
        }
        let total = Self::HEADER_LEN + declared;
        if buffer.len() < total {
            Probe::NeedMore(total - buffer.len())
        } else {
            Probe::Complete(total)
        }
    }
}

/// Newline-terminated frames (the terminator is part of the frame).
#[derive(Debug, Clone, Copy)]
pub struct LineDelimited {
    pub max_line: usize,
}

impl LineDelimited {
    pub fn new(max_line: usize) -> Self {
        Self { max_line }
    }
}

impl FrameProbe for LineDelimited {
    fn probe(&self, buffer: &[u8]) -> Probe {
        match buffer.iter().position(|&b| b == b'\n') {
            Some(end) if end < self.max_line => Probe::Complete(end + 1),
            Some(_) => Probe::Malformed,
            None if buffer.len() >= self.max_line => Probe::Malformed,
            None => Probe::NeedMore(self.max_line - buffer.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn length_prefixed(body: &[u8]) -> Vec<u8> {
        let mut frame = (body.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(body);
        frame
    }

    #[test]
    fn test_unframed_completes_immediately() {
        let mut buffer = FrameBuffer::new(4);
        assert_eq!(
            buffer.feed(b"hello", &Unframed),
            Feed::Complete(Bytes::from_static(b"hello"))
        );
        assert!(buffer.is_empty());
        assert_eq!(buffer.remaining(), 4);
    }

    #[test]
    fn test_closure_probe_that_always_completes() {
        let always = |_: &[u8]| Probe::Complete(0);
        let mut buffer = FrameBuffer::new(8);
        assert_eq!(
            buffer.feed(b"hello", &always),
            Feed::Complete(Bytes::from_static(b"hello"))
        );
    }

    #[test]
    fn test_length_prefixed_waits_for_header_then_body() {
        let probe = LengthPrefixed::new(1024);
        let frame = length_prefixed(b"abc");
        let mut buffer = FrameBuffer::new(4);

        assert_eq!(buffer.feed(&frame[..2], &probe), Feed::NeedMore(2));
        assert_eq!(buffer.remaining(), 2);
        assert_eq!(buffer.feed(&frame[2..4], &probe), Feed::NeedMore(3));
        assert_eq!(buffer.feed(&frame[4..], &probe), Feed::Complete(Bytes::from(frame)));
    }

    #[test]
    fn test_empty_feed_does_not_advance_state() {
        let probe = LengthPrefixed::new(1024);
        let mut buffer = FrameBuffer::new(4);
        assert_eq!(buffer.feed(&[0, 0], &probe), Feed::NeedMore(2));
        assert_eq!(buffer.feed(&[], &probe), Feed::NeedMore(2));
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_absurd_declared_length_is_malformed() {
        let probe = LengthPrefixed::new(1024 * 1024);
        let mut buffer = FrameBuffer::new(4);
        let header = 1_000_000_000u32.to_be_bytes();
        assert_eq!(buffer.feed(&header, &probe), Feed::Malformed);
        assert!(buffer.pending().len() == 4);
    }

    #[test]
    fn test_leftover_bytes_stay_buffered() {
        let probe = LengthPrefixed::new(1024);
        let mut stream = length_prefixed(b"one");
        stream.extend(length_prefixed(b"two"));

        let mut buffer = FrameBuffer::new(4);
        assert_eq!(
            buffer.feed(&stream, &probe),
            Feed::Complete(Bytes::from(length_prefixed(b"one")))
        );
        assert_eq!(
            buffer.next_frame(&probe),
            Feed::Complete(Bytes::from(length_prefixed(b"two")))
        );
        assert_eq!(buffer.next_frame(&probe), Feed::NeedMore(4));
    }

    #[test]
    fn test_line_delimited() {
        let probe = LineDelimited::new(16);
        let mut buffer = FrameBuffer::new(16);
        assert_eq!(buffer.feed(b"hel", &probe), Feed::NeedMore(13));
        assert_eq!(
            buffer.feed(b"lo\nwor", &probe),
            Feed::Complete(Bytes::from_static(b"hello\n"))
        );
        assert_eq!(buffer.pending(), b"wor");
        assert_eq!(buffer.feed(&[b'x'; 13], &probe), Feed::Malformed);
    }

    #[test]
    fn test_reset_clears_buffer() {
        let mut buffer = FrameBuffer::new(4);
        buffer.extend(b"partial");
        buffer.reset();
        assert!(buffer.is_empty());
        assert_eq!(buffer.remaining(), 4);
    }
}
