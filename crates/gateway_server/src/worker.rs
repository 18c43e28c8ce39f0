//! The BusinessWorker process: application logic behind the Gateways.
//!
//! A worker keeps one TCP link to every Gateway listed in the
//! [`AddressRegistry`], re-reading the list on a timer. Envelopes arriving on
//! a link are handed to a [`BusinessHandler`] together with a
//! [`WorkerContext`] through which the handler answers.

use crate::config::WorkerConfig;
use crate::connection::{Connection, Fill, MAX_READ_CHUNK};
use crate::error::{GatewayError, Result};
use crate::shutdown::ShutdownListener;
use crate::stats::{Counter, Stats, StatsSnapshot};
use crate::store::{AddressRegistry, UidLocation};
use bytes::Bytes;
use gateway_event_loop::{Direction, EventLoop, TimerId};
use gateway_protocol::{
    Command, ConnectionId, Envelope, EnvelopeProbe, Feed, IdSequence, ProtocolError, Uid, HEAD_LEN,
};
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4, TcpStream};
use std::rc::{Rc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Application callbacks of a BusinessWorker.
///
/// Errors are logged with the offending body and counted; they never close the
/// link or stop the worker.
pub trait BusinessHandler {
    /// First frame of a socket that has no uid yet. Typically authenticates
    /// and calls [`WorkerContext::connect_success`].
    fn on_connection(&mut self, ctx: &mut WorkerContext<'_>, body: &[u8]) -> Result<()>;

    /// Frame from an authenticated socket, or a UDP datagram.
    fn on_message(&mut self, ctx: &mut WorkerContext<'_>, body: &[u8]) -> Result<()>;

    /// An authenticated socket went away. `ctx.uid()` tells which user.
    fn on_close(&mut self, _ctx: &mut WorkerContext<'_>) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct Link {
    address: String,
    connection: Connection,
}

#[derive(Debug, Default)]
struct Links {
    links: HashMap<ConnectionId, Link>,
    by_address: HashMap<String, ConnectionId>,
    ids: IdSequence,
}

impl Links {
    fn allocate_id(&mut self) -> ConnectionId {
        let links = &self.links;
        self.ids.next(|id| links.contains_key(&id))
    }

    fn insert(&mut self, address: String, connection: Connection) {
        let id = connection.id();
        self.by_address.insert(address.clone(), id);
        self.links.insert(id, Link { address, connection });
    }

    fn remove(&mut self, id: ConnectionId) -> Option<Link> {
        let link = self.links.remove(&id)?;
        if self.by_address.get(&link.address) == Some(&id) {
            self.by_address.remove(&link.address);
        }
        Some(link)
    }
}

/// What a handler can do while processing one envelope.
pub struct WorkerContext<'a> {
    links: &'a RefCell<Links>,
    addresses: &'a AddressRegistry,
    send_timeout: Duration,
    link: ConnectionId,
    socket_id: ConnectionId,
    uid: Uid,
    gateway: SocketAddrV4,
    client: SocketAddrV4,
    failed: Vec<ConnectionId>,
}

impl<'a> WorkerContext<'a> {
    /// Socket id of the client on its Gateway. [`ConnectionId::NONE`] for UDP.
    pub fn socket_id(&self) -> ConnectionId {
        self.socket_id
    }

    /// Uid of the client, [`Uid::ANONYMOUS`] until authenticated.
    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn client(&self) -> SocketAddrV4 {
        self.client
    }

    /// Lan address of the Gateway the client is connected to.
    pub fn gateway(&self) -> SocketAddrV4 {
        self.gateway
    }

    /// Sends `body` back to the client this envelope came from.
    pub fn reply(&mut self, body: impl Into<Bytes>) -> Result<()> {
        let envelope = Envelope::new(Command::SendToOne, self.socket_id)
            .with_uid(self.uid)
            .with_client(self.client)
            .with_body(body);
        self.send(self.link, &envelope)
    }

    /// Binds `uid` to the client on its Gateway and records where the uid
    /// lives.
    ///
    /// # Errors
    ///
    /// Fails if the link is gone or the location cannot be stored.
    pub fn connect_success(&mut self, uid: Uid) -> Result<()> {
        if uid.is_anonymous() {
            return Err(GatewayError::Internal("uid 0 cannot be bound".to_string()));
        }
        let envelope = Envelope::new(Command::ConnectSuccess, self.socket_id).with_uid(uid);
        self.send(self.link, &envelope)?;
        let location = UidLocation {
            gateway: self.gateway.to_string(),
            socket_id: self.socket_id.get(),
        };
        self.addresses.set_uid_location(uid, &location)?;
        self.uid = uid;
        Ok(())
    }

    /// Closes the client, optionally sending `final_message` first. The
    /// Gateway does not report an `ON_CLOSE` for kicked clients.
    pub fn kick(&mut self, final_message: Option<Bytes>) -> Result<()> {
        if !self.uid.is_anonymous() {
            self.addresses.delete_uid_location(self.uid)?;
        }
        let mut envelope = Envelope::new(Command::Kick, self.socket_id).with_uid(self.uid);
        if let Some(message) = final_message {
            envelope = envelope.with_body(message);
        }
        self.send(self.link, &envelope)
    }

    /// Sends `body` to every authenticated client on every linked Gateway.
    ///
    /// Best effort: a failing link is dropped and the rest still receive it.
    /// Returns how many Gateways were reached.
    pub fn broadcast(&mut self, body: impl Into<Bytes>) -> Result<usize> {
        let envelope = Envelope::new(Command::SendToAll, ConnectionId::NONE).with_body(body);
        let bytes = envelope.encode()?;
        let mut reached = 0;
        let mut links = self.links.borrow_mut();
        for (id, link) in links.links.iter_mut() {
            match link.connection.send(&bytes, self.send_timeout) {
                Ok(()) => reached += 1,
                Err(e) => {
                    warn!(link = %id, gateway = %link.address, "⚠️ Broadcast to Gateway failed: {}", e);
                    self.failed.push(*id);
                }
            }
        }
        Ok(reached)
    }

    /// Sends `body` to the client bound to `uid`, wherever it is connected.
    ///
    /// Returns `false` if the uid has no known location or its Gateway is not
    /// linked.
    pub fn send_to_uid(&mut self, uid: Uid, body: impl Into<Bytes>) -> Result<bool> {
        let Some(location) = self.addresses.uid_location(uid)? else {
            return Ok(false);
        };
        let Some(link) = self.links.borrow().by_address.get(&location.gateway).copied() else {
            debug!(%uid, gateway = %location.gateway, "No link to the Gateway holding uid");
            return Ok(false);
        };
        let envelope = Envelope::new(Command::SendToOne, ConnectionId::new(location.socket_id))
            .with_uid(uid)
            .with_body(body);
        self.send(link, &envelope)?;
        Ok(true)
    }

    fn send(&mut self, link: ConnectionId, envelope: &Envelope) -> Result<()> {
        let bytes = envelope.encode()?;
        let mut links = self.links.borrow_mut();
        let Some(target) = links.links.get_mut(&link) else {
            return Err(GatewayError::Network(format!("link {link} is closed")));
        };
        target.connection.send(&bytes, self.send_timeout).map_err(|e| {
            self.failed.push(link);
            GatewayError::Network(format!("send to {} failed: {e}", target.address))
        })
    }
}

#[derive(Debug, Default)]
struct Control {
    running: bool,
    refresh: Option<TimerId>,
    shutdown: Option<ShutdownListener>,
    signals: Vec<i32>,
}

/// Back-end process dispatching Gateway envelopes to a [`BusinessHandler`].
pub struct BusinessWorker<H> {
    this: Weak<BusinessWorker<H>>,
    config: WorkerConfig,
    event_loop: Rc<dyn EventLoop>,
    addresses: AddressRegistry,
    probe: EnvelopeProbe,
    links: RefCell<Links>,
    handler: RefCell<H>,
    stats: Stats,
    scratch: RefCell<Vec<u8>>,
    control: RefCell<Control>,
}

impl<H: BusinessHandler + 'static> BusinessWorker<H> {
    pub fn new(
        config: WorkerConfig,
        event_loop: Rc<dyn EventLoop>,
        addresses: AddressRegistry,
        handler: H,
    ) -> Rc<Self> {
        let probe = EnvelopeProbe::new(config.max_body);
        Rc::new_cyclic(|this| BusinessWorker {
            this: this.clone(),
            config,
            event_loop,
            addresses,
            probe,
            links: RefCell::new(Links::default()),
            handler: RefCell::new(handler),
            stats: Stats::new(),
            scratch: RefCell::new(vec![0u8; MAX_READ_CHUNK]),
            control: RefCell::new(Control::default()),
        })
    }

    /// Connects to the registered Gateways and starts the refresh timer.
    pub fn start(&self) -> Result<()> {
        self.control.borrow_mut().running = true;
        self.refresh();
        let interval = self.config.refresh_interval();
        if !interval.is_zero() {
            let timer = self
                .event_loop
                .add_timer(interval, true, self.callback(|worker| worker.refresh()));
            self.control.borrow_mut().refresh = Some(timer);
        }
        info!("🚀 BusinessWorker started with {} Gateway link(s)", self.link_count());
        Ok(())
    }

    /// Stops on SIGINT, SIGTERM and SIGHUP; reports status on SIGUSR1.
    pub fn install_signal_handlers(&self) -> Result<()> {
        for signal in [libc::SIGINT, libc::SIGTERM, libc::SIGHUP] {
            self.event_loop.add_signal_watch(
                signal,
                self.callback(move |worker| {
                    info!("🛑 Received signal {signal}, stopping");
                    worker.stop();
                }),
            )?;
            self.control.borrow_mut().signals.push(signal);
        }
        self.event_loop.add_signal_watch(
            libc::SIGUSR1,
            self.callback(|worker| {
                worker.report();
            }),
        )?;
        self.control.borrow_mut().signals.push(libc::SIGUSR1);
        Ok(())
    }

    /// Stops once `listener` reports a request.
    pub fn watch_shutdown(&self, listener: ShutdownListener) -> Result<()> {
        self.event_loop
            .add_read_watch(listener.fd(), self.callback(|worker| worker.on_shutdown_request()))?;
        self.control.borrow_mut().shutdown = Some(listener);
        Ok(())
    }

    pub fn run(&self) -> Result<()> {
        self.event_loop.run()?;
        Ok(())
    }

    pub fn link_count(&self) -> usize {
        self.links.borrow().links.len()
    }

    /// Registered addresses this worker currently has a link to.
    pub fn linked_gateways(&self) -> Vec<String> {
        self.links.borrow().by_address.keys().cloned().collect()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Runs `f` with the handler, e.g. to inspect application state.
    pub fn with_handler<R>(&self, f: impl FnOnce(&mut H) -> R) -> R {
        f(&mut self.handler.borrow_mut())
    }

    pub fn report(&self) -> StatsSnapshot {
        let snapshot = self.stats.snapshot();
        info!(
            start_time = snapshot.start_time,
            total_request = snapshot.total_request,
            packet_err = snapshot.packet_err,
            throw_exception = snapshot.throw_exception,
            send_fail = snapshot.send_fail,
            links = self.link_count(),
            "📊 BusinessWorker status"
        );
        snapshot
    }

    /// Closes every link and stops the loop.
    pub fn stop(&self) {
        let (refresh, shutdown, signals) = {
            let mut control = self.control.borrow_mut();
            if !control.running {
                return;
            }
            control.running = false;
            (
                control.refresh.take(),
                control.shutdown.take(),
                std::mem::take(&mut control.signals),
            )
        };
        if let Some(timer) = refresh {
            self.event_loop.cancel_timer(timer);
        }
        if let Some(listener) = &shutdown {
            self.event_loop.remove_watch(listener.fd(), Direction::Read);
        }
        for signal in signals {
            self.event_loop.remove_signal_watch(signal);
        }
        let ids: Vec<ConnectionId> = self.links.borrow().links.keys().copied().collect();
        for id in ids {
            self.close_link(id);
        }
        self.event_loop.stop();
        info!("👋 BusinessWorker stopped");
    }

    fn callback<A: 'static>(&self, f: impl Fn(&BusinessWorker<H>) + 'static) -> Box<dyn FnMut(A)> {
        let this = self.this.clone();
        Box::new(move |_| {
            if let Some(worker) = this.upgrade() {
                f(&worker);
            }
        })
    }

    fn on_shutdown_request(&self) {
        let requested = self
            .control
            .borrow_mut()
            .shutdown
            .as_mut()
            .map(ShutdownListener::drain)
            .unwrap_or(false);
        if requested {
            info!("🛑 Shutdown requested, stopping");
            self.stop();
        }
    }

    /// Links every registered Gateway that is not linked yet.
    fn refresh(&self) {
        if !self.control.borrow().running {
            return;
        }
        let addresses = match self.addresses.addresses() {
            Ok(addresses) => addresses,
            Err(e) => {
                warn!("⚠️ Failed to read Gateway addresses: {}", e);
                return;
            }
        };
        for address in addresses {
            if self.links.borrow().by_address.contains_key(&address) {
                continue;
            }
            if let Err(e) = self.connect(&address) {
                warn!(gateway = %address, "⚠️ Failed to link Gateway: {}", e);
            }
        }
    }

    fn connect(&self, address: &str) -> Result<()> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| GatewayError::Network(format!("bad Gateway address '{address}': {e}")))?;
        let stream = TcpStream::connect_timeout(&addr, self.config.connect_timeout())
            .map_err(|e| GatewayError::Network(format!("connect to {address} failed: {e}")))?;
        let id = self.links.borrow_mut().allocate_id();
        let connection = Connection::new(id, stream, addr, HEAD_LEN)?;
        let fd = connection.fd();
        self.links.borrow_mut().insert(address.to_string(), connection);
        if let Err(e) = self
            .event_loop
            .add_read_watch(fd, self.callback(move |worker| worker.on_link_readable(id)))
        {
            self.close_link(id);
            return Err(e.into());
        }
        info!(link = %id, gateway = %address, "🔗 Linked to Gateway");
        Ok(())
    }

    fn close_link(&self, id: ConnectionId) {
        let Some(link) = self.links.borrow_mut().remove(id) else {
            return;
        };
        self.event_loop.remove_watch(link.connection.fd(), Direction::Read);
        link.connection.shutdown();
        info!(link = %id, gateway = %link.address, "🔌 Gateway link closed");
    }

    fn on_link_readable(&self, id: ConnectionId) {
        loop {
            let filled = {
                let mut scratch = self.scratch.borrow_mut();
                let mut links = self.links.borrow_mut();
                let Some(link) = links.links.get_mut(&id) else {
                    return;
                };
                link.connection.fill(&mut scratch)
            };
            match filled {
                Ok(Fill::Data(_)) => {
                    if !self.process_envelopes(id) {
                        return;
                    }
                }
                Ok(Fill::WouldBlock) => return,
                Ok(Fill::Eof) => {
                    self.close_link(id);
                    return;
                }
                Err(e) => {
                    debug!(link = %id, "Gateway link read failed: {}", e);
                    self.close_link(id);
                    return;
                }
            }
        }
    }

    // Returns false once the link has been closed.
    fn process_envelopes(&self, id: ConnectionId) -> bool {
        loop {
            let fed = {
                let mut links = self.links.borrow_mut();
                let Some(link) = links.links.get_mut(&id) else {
                    return false;
                };
                link.connection.buffer_mut().next_frame(&self.probe)
            };
            match fed {
                Feed::NeedMore(_) => return true,
                Feed::Malformed => {
                    self.stats.incr(Counter::PacketErr);
                    warn!(link = %id, max = self.probe.max_body(), "🚫 Oversized envelope, closing Gateway link");
                    self.close_link(id);
                    return false;
                }
                Feed::Complete(frame) => match Envelope::decode(frame) {
                    Ok(envelope) => self.dispatch(id, envelope),
                    Err(ProtocolError::UnknownCommand(code)) => {
                        warn!(link = %id, code, "Dropping envelope with unknown command");
                    }
                    Err(e) => {
                        self.stats.incr(Counter::PacketErr);
                        warn!(link = %id, "🚫 Undecodable envelope, closing Gateway link: {}", e);
                        self.close_link(id);
                        return false;
                    }
                },
            }
            if !self.links.borrow().links.contains_key(&id) {
                return false;
            }
        }
    }

    /// Hands one client event to the handler.
    fn dispatch(&self, link: ConnectionId, envelope: Envelope) {
        let command = envelope.command;
        if !command.is_worker_bound() {
            warn!(%command, link = %link, "Dropping Gateway-bound command received by a worker");
            return;
        }
        self.stats.incr(Counter::TotalRequest);

        let mut ctx = WorkerContext {
            links: &self.links,
            addresses: &self.addresses,
            send_timeout: self.config.send_timeout(),
            link,
            socket_id: envelope.socket_id,
            uid: envelope.uid,
            gateway: envelope.local,
            client: envelope.client,
            failed: Vec::new(),
        };
        let result = {
            let mut handler = self.handler.borrow_mut();
            match command {
                Command::OnConnection => handler.on_connection(&mut ctx, &envelope.body),
                Command::OnMessage => handler.on_message(&mut ctx, &envelope.body),
                Command::OnClose => handler.on_close(&mut ctx),
                Command::SendToOne | Command::SendToAll | Command::Kick | Command::ConnectSuccess => Ok(()),
            }
        };
        let failed = std::mem::take(&mut ctx.failed);
        drop(ctx);

        if command == Command::OnClose {
            self.forget_uid(&envelope);
        }
        if let Err(e) = result {
            self.stats.incr(Counter::ThrowException);
            error!(
                %command,
                socket = %envelope.socket_id,
                uid = %envelope.uid,
                body = ?envelope.body,
                "💥 Business handler failed: {}",
                e
            );
        }
        for id in failed {
            self.stats.incr(Counter::SendFail);
            self.close_link(id);
        }
    }

    // The uid may have moved to another socket since; only a location that
    // still points at the closed socket is removed.
    fn forget_uid(&self, envelope: &Envelope) {
        if envelope.uid.is_anonymous() {
            return;
        }
        let closed = UidLocation {
            gateway: envelope.local.to_string(),
            socket_id: envelope.socket_id.get(),
        };
        match self.addresses.uid_location(envelope.uid) {
            Ok(Some(location)) if location == closed => {
                if let Err(e) = self.addresses.delete_uid_location(envelope.uid) {
                    warn!(uid = %envelope.uid, "⚠️ Failed to delete uid location: {}", e);
                }
            }
            Ok(_) => {}
            Err(e) => warn!(uid = %envelope.uid, "⚠️ Failed to read uid location: {}", e),
        }
    }
}

impl<H> std::fmt::Debug for BusinessWorker<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusinessWorker")
            .field("links", &self.links.borrow().links.len())
            .finish_non_exhaustive()
    }
}
