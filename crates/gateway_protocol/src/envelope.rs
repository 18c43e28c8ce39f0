//! The Gateway Protocol envelope.
//!
//! Wire format (big-endian):
//! ```text
//! ┌─────────────┬──────┬─────────┐
//! │ body_len    │ u32  │ 4 bytes │
//! ├─────────────┼──────┼─────────┤
//! │ command     │ u8   │ 1 byte  │
//! ├─────────────┼──────┼─────────┤
//! │ local_ip    │ u32  │ 4 bytes │
//! ├─────────────┼──────┼─────────┤
//! │ local_port  │ u16  │ 2 bytes │
//! ├─────────────┼──────┼─────────┤
//! │ socket_id   │ u32  │ 4 bytes │
//! ├─────────────┼──────┼─────────┤
//! │ client_ip   │ u32  │ 4 bytes │
//! ├─────────────┼──────┼─────────┤
//! │ client_port │ u16  │ 2 bytes │
//! ├─────────────┼──────┼─────────┤
//! │ uid         │ u32  │ 4 bytes │
//! ├─────────────┼──────┼─────────┤
//! │ body        │ [u8] │ N bytes │
//! └─────────────┴──────┴─────────┘
//! Total header: 25 bytes
//! ```
//!
//! There is no outer length prefix: [`EnvelopeProbe`] reads `body_len` from the
//! header itself once `HEAD_LEN` bytes have arrived.

use crate::command::Command;
use crate::error::{ProtocolError, Result};
use crate::framing::{FrameProbe, Probe};
use crate::types::{ConnectionId, Uid};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, SocketAddrV4};

/// Size of the envelope header in bytes (excluding body).
pub const HEAD_LEN: usize = 25;

/// Default upper bound for a declared body length (10 MiB).
pub const DEFAULT_MAX_BODY: usize = 10 * 1024 * 1024;

/// One Gateway Protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub command: Command,
    /// Target (worker → gateway) or source (gateway → worker) client socket.
    pub socket_id: ConnectionId,
    pub uid: Uid,
    /// Lan address of the Gateway that owns `socket_id`; workers route
    /// replies back through it.
    pub local: SocketAddrV4,
    /// Remote address of the client, informational.
    pub client: SocketAddrV4,
    pub body: Bytes,
}

const UNSPECIFIED: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);

impl Envelope {
    pub fn new(command: Command, socket_id: ConnectionId) -> Self {
        Self {
            command,
            socket_id,
            uid: Uid::ANONYMOUS,
            local: UNSPECIFIED,
            client: UNSPECIFIED,
            body: Bytes::new(),
        }
    }

    pub fn with_uid(mut self, uid: Uid) -> Self {
        self.uid = uid;
        self
    }

    pub fn with_local(mut self, local: SocketAddrV4) -> Self {
        self.local = local;
        self
    }

    pub fn with_client(mut self, client: SocketAddrV4) -> Self {
        self.client = client;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn encoded_len(&self) -> usize {
        HEAD_LEN + self.body.len()
    }

    /// Serializes the envelope into a fresh buffer.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::BodyTooLarge`] if the body length does not fit the
    /// 32-bit length field.
    pub fn encode(&self) -> Result<Bytes> {
        let mut dst = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut dst)?;
        Ok(dst.freeze())
    }

    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<()> {
        let body_len = u32::try_from(self.body.len()).map_err(|_| ProtocolError::BodyTooLarge {
            declared: self.body.len(),
            max: u32::MAX as usize,
        })?;

        dst.reserve(self.encoded_len());
        dst.put_u32(body_len);
        dst.put_u8(self.command.code());
        dst.put_u32(u32::from(*self.local.ip()));
        dst.put_u16(self.local.port());
        dst.put_u32(self.socket_id.get());
        dst.put_u32(u32::from(*self.client.ip()));
        dst.put_u16(self.client.port());
        dst.put_u32(self.uid.get());
        dst.extend_from_slice(&self.body);
        Ok(())
    }

    /// Reads the declared body length without validating anything else.
    pub fn peek_body_len(buffer: &[u8]) -> Option<usize> {
        let header: [u8; 4] = buffer.get(..4)?.try_into().ok()?;
        Some(u32::from_be_bytes(header) as usize)
    }

    /// Parses one envelope from the front of `buffer`.
    ///
    /// The body is a zero-copy slice of `buffer`. Trailing bytes after the
    /// declared body are ignored.
    pub fn decode(buffer: Bytes) -> Result<Self> {
        if buffer.len() < HEAD_LEN {
            return Err(ProtocolError::Truncated {
                needed: HEAD_LEN,
                available: buffer.len(),
            });
        }

        let mut header = &buffer[..HEAD_LEN];
        let body_len = header.get_u32() as usize;
        let total = HEAD_LEN.saturating_add(body_len);
        if buffer.len() < total {
            return Err(ProtocolError::Truncated {
                needed: total,
                available: buffer.len(),
            });
        }

        let command = Command::try_from(header.get_u8())?;
        let local_ip = Ipv4Addr::from(header.get_u32());
        let local_port = header.get_u16();
        let socket_id = ConnectionId::new(header.get_u32());
        let client_ip = Ipv4Addr::from(header.get_u32());
        let client_port = header.get_u16();
        let uid = Uid::new(header.get_u32());

        Ok(Self {
            command,
            socket_id,
            uid,
            local: SocketAddrV4::new(local_ip, local_port),
            client: SocketAddrV4::new(client_ip, client_port),
            body: buffer.slice(HEAD_LEN..total),
        })
    }
}

/// [`FrameProbe`] for envelope streams on worker links.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeProbe {
    max_body: usize,
}

impl EnvelopeProbe {
    pub fn new(max_body: usize) -> Self {
        Self { max_body }
    }

    pub fn max_body(&self) -> usize {
        self.max_body
    }
}

impl Default for EnvelopeProbe {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BODY)
    }
}

impl FrameProbe for EnvelopeProbe {
    fn probe(&self, buffer: &[u8]) -> Probe {
        let Some(body_len) = Envelope::peek_body_len(buffer).filter(|_| buffer.len() >= HEAD_LEN) else {
            return Probe::NeedMore(HEAD_LEN - buffer.len());
        };
        if body_len > self.max_body {
            return Probe::Malformed;
        }
        let total = HEAD_LEN + body_len;
        if buffer.len() < total {
            Probe::NeedMore(total - buffer.len())
        } else {
            Probe::Complete(total)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{Feed, FrameBuffer};

    fn sample() -> Envelope {
        Envelope::new(Command::OnMessage, ConnectionId::new(12))
            .with_uid(Uid::new(99))
            .with_local(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 40001))
            .with_client(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 20), 53122))
            .with_body("payload")
    }

    #[test]
    fn test_header_layout() {
        let bytes = sample().encode().unwrap();
        assert_eq!(bytes.len(), HEAD_LEN + 7);
        assert_eq!(&bytes[0..4], &7u32.to_be_bytes());
        assert_eq!(bytes[4], Command::OnMessage.code());
        assert_eq!(&bytes[5..9], &[10, 0, 0, 1]);
        assert_eq!(&bytes[9..11], &40001u16.to_be_bytes());
        assert_eq!(&bytes[11..15], &12u32.to_be_bytes());
        assert_eq!(&bytes[15..19], &[192, 168, 1, 20]);
        assert_eq!(&bytes[19..21], &53122u16.to_be_bytes());
        assert_eq!(&bytes[21..25], &99u32.to_be_bytes());
        assert_eq!(&bytes[25..], b"payload");
    }

    #[test]
    fn test_round_trip() {
        let envelope = sample();
        assert_eq!(Envelope::decode(envelope.encode().unwrap()).unwrap(), envelope);
    }

    #[test]
    fn test_empty_body() {
        let envelope = Envelope::new(Command::Kick, ConnectionId::new(3));
        let bytes = envelope.encode().unwrap();
        assert_eq!(bytes.len(), HEAD_LEN);
        assert_eq!(Envelope::decode(bytes).unwrap(), envelope);
    }

    #[test]
    fn test_short_buffer_is_truncated_not_malformed() {
        let bytes = sample().encode().unwrap();
        let err = Envelope::decode(bytes.slice(..10)).unwrap_err();
        assert_eq!(err, ProtocolError::Truncated { needed: HEAD_LEN, available: 10 });

        let err = Envelope::decode(bytes.slice(..HEAD_LEN + 2)).unwrap_err();
        assert_eq!(err, ProtocolError::Truncated { needed: HEAD_LEN + 7, available: HEAD_LEN + 2 });
    }

    #[test]
    fn test_unknown_command_is_reported() {
        let mut raw = BytesMut::from(&sample().encode().unwrap()[..]);
        raw[4] = 42;
        assert_eq!(
            Envelope::decode(raw.freeze()).unwrap_err(),
            ProtocolError::UnknownCommand(42)
        );
    }

    #[test]
    fn test_body_is_zero_copy_slice() {
        let bytes = sample().encode().unwrap();
        let envelope = Envelope::decode(bytes.clone()).unwrap();
        assert_eq!(envelope.body.as_ptr(), bytes[HEAD_LEN..].as_ptr());
    }

    #[test]
    fn test_probe_progression() {
        let probe = EnvelopeProbe::default();
        let bytes = sample().encode().unwrap();
        assert_eq!(probe.probe(&[]), Probe::NeedMore(HEAD_LEN));
        assert_eq!(probe.probe(&bytes[..5]), Probe::NeedMore(HEAD_LEN - 5));
        assert_eq!(probe.probe(&bytes[..HEAD_LEN]), Probe::NeedMore(7));
        assert_eq!(probe.probe(&bytes), Probe::Complete(HEAD_LEN + 7));
    }

    #[test]
    fn test_probe_rejects_oversized_body() {
        let probe = EnvelopeProbe::new(1024);
        let mut header = vec![0u8; HEAD_LEN];
        header[..4].copy_from_slice(&1_000_000_000u32.to_be_bytes());
        header[4] = Command::SendToOne.code();
        assert_eq!(probe.probe(&header), Probe::Malformed);
    }

    #[test]
    fn test_frame_buffer_reassembles_envelopes() {
        let probe = EnvelopeProbe::default();
        let first = sample();
        let second = Envelope::new(Command::SendToAll, ConnectionId::NONE).with_body("all");

        let mut stream = BytesMut::new();
        first.encode_into(&mut stream).unwrap();
        second.encode_into(&mut stream).unwrap();

        let mut buffer = FrameBuffer::new(HEAD_LEN);
        let mut decoded = Vec::new();
        for chunk in stream.chunks(3) {
            buffer.extend(chunk);
            while let Feed::Complete(frame) = buffer.next_frame(&probe) {
                decoded.push(Envelope::decode(frame).unwrap());
            }
        }
        assert_eq!(decoded, vec![first, second]);
    }
}
