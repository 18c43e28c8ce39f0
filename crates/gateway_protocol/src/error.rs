//! Error types for envelope encoding and decoding.

use thiserror::Error;

/// Failures produced while encoding or decoding Gateway Protocol envelopes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The buffer does not yet hold a complete envelope. Never a protocol
    /// violation on its own: the caller should wait for more bytes.
    #[error("Truncated envelope: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// The command byte is not one of the known commands. Receivers log and
    /// drop these so newer peers can add commands.
    #[error("Unknown gateway command code: {0}")]
    UnknownCommand(u8),

    /// The declared body length exceeds what this side accepts.
    #[error("Envelope body of {declared} bytes exceeds the {max} byte limit")]
    BodyTooLarge { declared: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
