//! # Gateway Server
//!
//! The two process roles of the framework and everything they share:
//!
//! * [`Gateway`] - terminates client TCP/UDP traffic, frames it, and relays
//!   it to BusinessWorkers over lan links; executes the commands workers send
//!   back (`SEND_TO_ONE`, `SEND_TO_ALL`, `KICK`, `CONNECT_SUCCESS`)
//! * [`BusinessWorker`] - links to every registered Gateway and runs a
//!   [`BusinessHandler`] for client events
//! * [`AddressRegistry`] - the shared list of Gateway lan addresses and uid
//!   locations on top of a [`Store`]
//!
//! Both roles run on a single-threaded [`gateway_event_loop::EventLoop`]; a
//! process holds one role per loop.
//!
//! ## Architecture
//!
//! ```text
//! client ──frame──▶ Gateway ──ON_MESSAGE──▶ BusinessWorker
//!        ◀─bytes──         ◀─SEND_TO_ONE──
//! ```
//!
//! ## Shutdown
//!
//! SIGINT, SIGTERM and SIGHUP drain a Gateway: the client listener closes at
//! once, buffered frames are finished, and after the grace period whatever is
//! left is closed. A [`ShutdownTrigger`] does the same from another thread.

pub mod config;
pub mod connection;
pub mod error;
pub mod gateway;
pub mod net;
pub mod registry;
pub mod shutdown;
pub mod stats;
pub mod store;
pub mod worker;

pub use config::{Framing, GatewayConfig, RegistryConfig, StoreKind, Transport, WorkerConfig};
pub use error::{BindError, GatewayError, Result, StoreError};
pub use gateway::{Gateway, Status};
pub use registry::ConnectionRegistry;
pub use shutdown::{shutdown_channel, ShutdownListener, ShutdownTrigger};
pub use stats::{Counter, Stats, StatsSnapshot};
pub use store::{AddressRegistry, FileStore, LocalLock, LockFile, MemoryStore, RegistryLock, Store, UidLocation};
pub use worker::{BusinessHandler, BusinessWorker, WorkerContext};

/// Opens the address registry described by `config`.
pub fn open_registry(config: &RegistryConfig) -> Result<AddressRegistry> {
    match config.kind {
        StoreKind::Memory => Ok(AddressRegistry::in_memory()),
        StoreKind::File => Ok(AddressRegistry::in_directory(&config.directory, config.lock_timeout())?),
    }
}
