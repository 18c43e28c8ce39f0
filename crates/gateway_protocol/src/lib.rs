//! # Gateway Protocol
//!
//! Wire-level building blocks shared by the Gateway and the BusinessWorker
//! processes:
//!
//! * **Envelope codec** - the fixed 25-byte header plus body that carries every
//!   inter-process command ([`Envelope`], [`Command`], [`HEAD_LEN`])
//! * **Stream framing** - a per-connection [`FrameBuffer`] that reassembles
//!   complete frames from a byte stream, driven by a pluggable [`FrameProbe`]
//! * **Identifiers** - [`ConnectionId`] and [`Uid`] newtypes so socket ids and
//!   user ids can never be mixed up
//!
//! ## Message Flow
//!
//! 1. A client frame is completed by the client-side probe
//! 2. The Gateway wraps it into an `ON_CONNECTION` / `ON_MESSAGE` envelope
//! 3. The BusinessWorker reassembles envelopes with [`EnvelopeProbe`]
//! 4. Replies travel back as `SEND_TO_ONE`, `SEND_TO_ALL`, `KICK` or
//!    `CONNECT_SUCCESS` envelopes
//!
//! ```rust
//! use gateway_protocol::{Command, ConnectionId, Envelope, Uid};
//!
//! let envelope = Envelope::new(Command::SendToOne, ConnectionId::new(7))
//!     .with_uid(Uid::new(42))
//!     .with_body("hello");
//! let bytes = envelope.encode().unwrap();
//! assert_eq!(Envelope::decode(bytes).unwrap(), envelope);
//! ```

pub mod command;
pub mod envelope;
pub mod error;
pub mod framing;
pub mod types;

pub use command::Command;
pub use envelope::{Envelope, EnvelopeProbe, DEFAULT_MAX_BODY, HEAD_LEN};
pub use error::{ProtocolError, Result};
pub use framing::{Feed, FrameBuffer, FrameProbe, LengthPrefixed, LineDelimited, Probe, Unframed};
pub use types::{ConnectionId, IdSequence, Uid};

/// Largest payload a single UDP datagram can carry on Linux.
pub const MAX_UDP_PACKET_SIZE: usize = 65507;
