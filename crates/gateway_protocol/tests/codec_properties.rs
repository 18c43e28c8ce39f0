//! Property tests for the envelope codec and stream reassembly.

use bytes::BytesMut;
use gateway_protocol::{
    Command, ConnectionId, Envelope, EnvelopeProbe, Feed, FrameBuffer, LengthPrefixed, Uid, HEAD_LEN,
};
use proptest::prelude::*;
use std::net::{Ipv4Addr, SocketAddrV4};

fn command() -> impl Strategy<Value = Command> {
    proptest::sample::select(Command::ALL.to_vec())
}

fn envelope() -> impl Strategy<Value = Envelope> {
    (
        command(),
        any::<u32>(),
        any::<u32>(),
        any::<(u32, u16)>(),
        any::<(u32, u16)>(),
        proptest::collection::vec(any::<u8>(), 0..512),
    )
        .prop_map(|(command, socket, uid, local, client, body)| {
            Envelope::new(command, ConnectionId::new(socket))
                .with_uid(Uid::new(uid))
                .with_local(SocketAddrV4::new(Ipv4Addr::from(local.0), local.1))
                .with_client(SocketAddrV4::new(Ipv4Addr::from(client.0), client.1))
                .with_body(body)
        })
}

/// Splits `len` into consecutive chunk boundaries drawn from `cuts`.
fn chunk_bounds(len: usize, cuts: &[usize]) -> Vec<(usize, usize)> {
    let mut points: Vec<usize> = cuts.iter().map(|c| c % (len + 1)).collect();
    points.push(0);
    points.push(len);
    points.sort_unstable();
    points.dedup();
    points.windows(2).map(|w| (w[0], w[1])).collect()
}

proptest! {
    #[test]
    fn decode_inverts_encode(envelope in envelope()) {
        let bytes = envelope.encode().unwrap();
        prop_assert_eq!(bytes.len(), HEAD_LEN + envelope.body.len());
        prop_assert_eq!(Envelope::decode(bytes).unwrap(), envelope);
    }

    #[test]
    fn reassembly_is_independent_of_chunking(
        envelopes in proptest::collection::vec(envelope(), 1..6),
        cuts in proptest::collection::vec(any::<usize>(), 0..20),
    ) {
        let mut stream = BytesMut::new();
        for envelope in &envelopes {
            envelope.encode_into(&mut stream).unwrap();
        }

        let probe = EnvelopeProbe::default();
        let mut buffer = FrameBuffer::new(HEAD_LEN);
        let mut decoded = Vec::new();
        for (start, end) in chunk_bounds(stream.len(), &cuts) {
            buffer.extend(&stream[start..end]);
            loop {
                match buffer.next_frame(&probe) {
                    Feed::Complete(frame) => decoded.push(Envelope::decode(frame).unwrap()),
                    Feed::NeedMore(n) => {
                        prop_assert!(n >= 1);
                        break;
                    }
                    Feed::Malformed => prop_assert!(false, "valid stream reported malformed"),
                }
            }
        }

        prop_assert_eq!(decoded, envelopes);
        prop_assert!(buffer.is_empty());
    }

    #[test]
    fn declared_length_over_limit_is_malformed(declared in (1024u32 + 1)..=u32::MAX) {
        let mut buffer = FrameBuffer::new(4);
        let probe = LengthPrefixed::new(1024);
        prop_assert_eq!(buffer.feed(&declared.to_be_bytes(), &probe), Feed::Malformed);

        let mut header = vec![0u8; HEAD_LEN];
        header[..4].copy_from_slice(&declared.to_be_bytes());
        let mut buffer = FrameBuffer::new(HEAD_LEN);
        prop_assert_eq!(buffer.feed(&header, &EnvelopeProbe::new(1024)), Feed::Malformed);
    }
}
