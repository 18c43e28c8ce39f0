//! Error types for event loop setup and dispatch.

use std::io;
use std::os::fd::RawFd;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoopError {
    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(RawFd),

    #[error("Failed to watch descriptor {fd}: {source}")]
    Register {
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    #[error("Signal {signal} cannot be watched: {source}")]
    Signal {
        signal: i32,
        #[source]
        source: io::Error,
    },

    #[error("Event loop is already running")]
    AlreadyRunning,

    #[error("Polling failed: {0}")]
    Poll(#[source] io::Error),

    #[error("Runtime setup failed: {0}")]
    Runtime(#[source] io::Error),

    #[error("Unknown event loop backend: {0}")]
    UnknownBackend(String),
}

pub type Result<T> = std::result::Result<T, LoopError>;
