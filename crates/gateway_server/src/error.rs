//! Error types for the Gateway, the BusinessWorker and the address store.

use gateway_event_loop::LoopError;
use gateway_protocol::{ConnectionId, ProtocolError, Uid};
use std::io;
use thiserror::Error;

/// Errors raised while running a Gateway or a BusinessWorker.
///
/// Network failures that concern a single peer are handled where they happen
/// and never surface here; these variants are for setup failures and for
/// business handlers reporting a fault.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Binding, connecting or configuring a socket failed.
    #[error("Network error: {0}")]
    Network(String),

    /// Invariant or business-level failure.
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Loop(#[from] LoopError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures of the shared key-value store and its lock.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store I/O failed for key {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },

    #[error("Stored value for key {key} is not valid: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Timed out acquiring the registry lock after {0:?}")]
    LockTimeout(std::time::Duration),

    #[error("Registry lock failed: {0}")]
    Lock(String),
}

/// Why a CONNECT_SUCCESS could not bind a uid to a socket.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum BindError {
    #[error("Socket {socket} is already bound to uid {uid}")]
    AlreadyBound { socket: ConnectionId, uid: Uid },

    #[error("Socket {0} is not a live client connection")]
    NotLive(ConnectionId),

    #[error("Uid 0 is reserved for unauthenticated sockets")]
    Anonymous,
}

pub type Result<T> = std::result::Result<T, GatewayError>;
