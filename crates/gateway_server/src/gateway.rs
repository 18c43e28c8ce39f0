//! The Gateway process: terminates clients and relays their frames to workers.
//!
//! Client sockets are framed with the configured probe and every complete
//! frame becomes an `ON_CONNECTION` (no uid yet) or `ON_MESSAGE` envelope sent
//! to a randomly selected worker link. Envelopes coming back on worker links,
//! or as datagrams on the lan UDP socket, address client sockets by socket id.
//!
//! All state lives on the loop thread. Callbacks registered with the
//! [`EventLoop`] hold a weak handle, so dropping the last [`Gateway`] handle
//! turns every outstanding callback into a no-op.

use crate::config::{GatewayConfig, Transport};
use crate::connection::{from_v4, to_v4, Connection, Fill, MAX_READ_CHUNK};
use crate::error::{GatewayError, Result};
use crate::net::{bind_tcp, bind_udp};
use crate::registry::ConnectionRegistry;
use crate::shutdown::ShutdownListener;
use crate::stats::{Counter, Stats, StatsSnapshot};
use crate::store::AddressRegistry;
use bytes::Bytes;
use gateway_event_loop::{Direction, EventLoop, TimerId};
use gateway_protocol::{
    Command, ConnectionId, Envelope, EnvelopeProbe, Feed, FrameBuffer, FrameProbe, ProtocolError,
    Uid, HEAD_LEN, MAX_UDP_PACKET_SIZE,
};
use std::cell::RefCell;
use std::io;
use std::net::{SocketAddr, SocketAddrV4, TcpListener, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lifecycle of a Gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Running,
    /// No longer accepting clients; finishing what is buffered.
    Draining,
    Stopped,
}

#[derive(Debug)]
enum ClientListener {
    Tcp(TcpListener),
    Udp(UdpSocket),
}

impl ClientListener {
    fn fd(&self) -> RawFd {
        match self {
            ClientListener::Tcp(listener) => listener.as_raw_fd(),
            ClientListener::Udp(socket) => socket.as_raw_fd(),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            ClientListener::Tcp(listener) => listener.local_addr(),
            ClientListener::Udp(socket) => socket.local_addr(),
        }
    }
}

#[derive(Debug)]
struct State {
    client_listener: Option<ClientListener>,
    lan_listener: Option<TcpListener>,
    lan_udp: Option<UdpSocket>,
    registry: ConnectionRegistry<Connection>,
    status: Status,
    heartbeat: Option<TimerId>,
    grace: Option<TimerId>,
    shutdown: Option<ShutdownListener>,
    signals: Vec<i32>,
}

/// Front-end process holding client connections and worker links.
pub struct Gateway {
    this: Weak<Gateway>,
    config: GatewayConfig,
    event_loop: Rc<dyn EventLoop>,
    client_probe: Box<dyn FrameProbe>,
    envelope_probe: EnvelopeProbe,
    client_addr: SocketAddr,
    lan_addr: SocketAddrV4,
    ping_data: Bytes,
    addresses: AddressRegistry,
    stats: Stats,
    scratch: RefCell<Vec<u8>>,
    state: RefCell<State>,
}

impl Gateway {
    /// Binds the client listener and the lan sockets.
    ///
    /// Nothing is registered with the loop or the address registry until
    /// [`Gateway::start`] is called.
    ///
    /// # Arguments
    ///
    /// * `config` - Validated gateway settings
    /// * `event_loop` - Loop the Gateway's callbacks run on
    /// * `addresses` - Shared registry workers discover Gateways through
    ///
    /// # Returns
    ///
    /// The Gateway, or the first bind/configuration failure.
    pub fn bind(
        config: GatewayConfig,
        event_loop: Rc<dyn EventLoop>,
        addresses: AddressRegistry,
    ) -> Result<Rc<Gateway>> {
        config.validate()?;

        let client_listener = match config.transport {
            Transport::Tcp => ClientListener::Tcp(bind_tcp(config.listen_addr()?)?),
            Transport::Udp => ClientListener::Udp(bind_udp(config.listen_addr()?)?),
        };
        let client_addr = client_listener.local_addr()?;

        let lan_listener = bind_tcp(SocketAddr::V4(config.lan_addr()?))?;
        let lan_addr = to_v4(lan_listener.local_addr()?);
        // The UDP side shares the effective port of the TCP side.
        let lan_udp = bind_udp(SocketAddr::V4(lan_addr))?;

        let ping_data = load_ping_data(&config.ping_data)?;
        let client_probe = config.client_probe();
        let envelope_probe = EnvelopeProbe::new(config.max_body);

        Ok(Rc::new_cyclic(|this| Gateway {
            this: this.clone(),
            config,
            event_loop,
            client_probe,
            envelope_probe,
            client_addr,
            lan_addr,
            ping_data,
            addresses,
            stats: Stats::new(),
            scratch: RefCell::new(vec![0u8; MAX_READ_CHUNK.max(MAX_UDP_PACKET_SIZE)]),
            state: RefCell::new(State {
                client_listener: Some(client_listener),
                lan_listener: Some(lan_listener),
                lan_udp: Some(lan_udp),
                registry: ConnectionRegistry::new(),
                status: Status::Running,
                heartbeat: None,
                grace: None,
                shutdown: None,
                signals: Vec::new(),
            }),
        }))
    }

    /// Registers watches, the heartbeat, and the lan address.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.state.borrow_mut();
            if let Some(listener) = &state.client_listener {
                let fd = listener.fd();
                match listener {
                    ClientListener::Tcp(_) => self
                        .event_loop
                        .add_read_watch(fd, self.callback(|gateway| gateway.accept_client()))?,
                    ClientListener::Udp(_) => self
                        .event_loop
                        .add_read_watch(fd, self.callback(|gateway| gateway.receive_client_datagram()))?,
                }
            }
            if let Some(listener) = &state.lan_listener {
                self.event_loop
                    .add_read_watch(listener.as_raw_fd(), self.callback(|gateway| gateway.accept_link()))?;
            }
            if let Some(socket) = &state.lan_udp {
                self.event_loop
                    .add_read_watch(socket.as_raw_fd(), self.callback(|gateway| gateway.receive_lan_datagram()))?;
            }
            if self.config.ping_interval > 0 {
                let interval = Duration::from_secs(self.config.ping_interval);
                state.heartbeat = Some(self.event_loop.add_timer(
                    interval,
                    true,
                    self.callback(|gateway| gateway.broadcast_heartbeat()),
                ));
            }
        }

        self.addresses.register(&self.lan_addr.to_string())?;
        info!(
            "🚀 Gateway started: clients on {} ({:?}), workers on {}",
            self.client_addr, self.config.transport, self.lan_addr
        );
        Ok(())
    }

    /// Drains on SIGINT, SIGTERM and SIGHUP; reports status on SIGUSR1.
    pub fn install_signal_handlers(&self) -> Result<()> {
        for signal in [libc::SIGINT, libc::SIGTERM, libc::SIGHUP] {
            self.event_loop.add_signal_watch(
                signal,
                self.callback(move |gateway| {
                    info!("🛑 Received signal {signal}, draining");
                    gateway.drain();
                }),
            )?;
            self.state.borrow_mut().signals.push(signal);
        }
        self.event_loop
            .add_signal_watch(libc::SIGUSR1, self.callback(|gateway| {
                gateway.report();
            }))?;
        self.state.borrow_mut().signals.push(libc::SIGUSR1);
        Ok(())
    }

    /// Drains once `listener` reports a request.
    pub fn watch_shutdown(&self, listener: ShutdownListener) -> Result<()> {
        self.event_loop
            .add_read_watch(listener.fd(), self.callback(|gateway| gateway.on_shutdown_request()))?;
        self.state.borrow_mut().shutdown = Some(listener);
        Ok(())
    }

    /// Runs the event loop until the Gateway stops.
    pub fn run(&self) -> Result<()> {
        self.event_loop.run()?;
        Ok(())
    }

    /// Client-facing address, with the OS-assigned port if `0` was configured.
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Effective lan address, as registered for workers.
    pub fn lan_addr(&self) -> SocketAddrV4 {
        self.lan_addr
    }

    pub fn status(&self) -> Status {
        self.state.borrow().status
    }

    pub fn client_count(&self) -> usize {
        self.state.borrow().registry.client_count()
    }

    pub fn link_count(&self) -> usize {
        self.state.borrow().registry.link_count()
    }

    pub fn uid_of(&self, socket: ConnectionId) -> Option<Uid> {
        self.state.borrow().registry.uid_of(socket)
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Logs the counters as one structured event and returns them.
    pub fn report(&self) -> StatsSnapshot {
        let snapshot = self.stats.snapshot();
        let (clients, links) = {
            let state = self.state.borrow();
            (state.registry.client_count(), state.registry.link_count())
        };
        info!(
            start_time = snapshot.start_time,
            total_request = snapshot.total_request,
            packet_err = snapshot.packet_err,
            throw_exception = snapshot.throw_exception,
            thunder_herd = snapshot.thunder_herd,
            client_close = snapshot.client_close,
            send_fail = snapshot.send_fail,
            routing_miss = snapshot.routing_miss,
            routing_fail = snapshot.routing_fail,
            clients,
            links,
            "📊 Gateway status"
        );
        snapshot
    }

    /// Stops accepting clients and finishes once buffered work is done or the
    /// grace period runs out.
    pub fn drain(&self) {
        let listener = {
            let mut state = self.state.borrow_mut();
            if state.status != Status::Running {
                return;
            }
            state.status = Status::Draining;
            state.client_listener.take()
        };
        if let Some(listener) = listener {
            self.event_loop.remove_watch(listener.fd(), Direction::Read);
        }
        self.unregister_address();

        let grace = self.event_loop.add_timer(
            self.config.drain_grace(),
            false,
            self.callback(|gateway| {
                warn!("⏰ Drain grace period elapsed, closing remaining connections");
                gateway.finish();
            }),
        );
        self.state.borrow_mut().grace = Some(grace);
        info!("🛑 Gateway draining, {} client(s) left", self.client_count());
        self.check_drained();
    }

    // Builds a loop callback that upgrades the weak self handle first. The
    // argument type is whatever the loop passes (descriptor, timer, signal).
    fn callback<A: 'static>(&self, f: impl Fn(&Gateway) + 'static) -> Box<dyn FnMut(A)> {
        let this = self.this.clone();
        Box::new(move |_| {
            if let Some(gateway) = this.upgrade() {
                f(&gateway);
            }
        })
    }

    fn on_shutdown_request(&self) {
        let requested = {
            let mut state = self.state.borrow_mut();
            match state.shutdown.as_mut() {
                Some(listener) => listener.drain(),
                None => false,
            }
        };
        if requested {
            if let Some(listener) = self.state.borrow_mut().shutdown.take() {
                self.event_loop.remove_watch(listener.fd(), Direction::Read);
            }
            info!("🛑 Shutdown requested, draining");
            self.drain();
        }
    }

    fn accept_client(&self) {
        let accepted = {
            let state = self.state.borrow();
            match &state.client_listener {
                Some(ClientListener::Tcp(listener)) => listener.accept(),
                _ => return,
            }
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.stats.incr(Counter::ThunderHerd);
                return;
            }
            Err(e) => {
                warn!("⚠️ Failed to accept client: {}", e);
                return;
            }
        };

        let id = self.state.borrow_mut().registry.allocate_id();
        let connection = match Connection::new(id, stream, peer, self.config.preread()) {
            Ok(connection) => connection,
            Err(e) => {
                warn!("⚠️ Failed to set up client {}: {}", peer, e);
                return;
            }
        };
        let fd = connection.fd();
        self.state.borrow_mut().registry.insert_client(id, connection);

        if let Err(e) = self
            .event_loop
            .add_read_watch(fd, self.callback(move |gateway| gateway.on_client_readable(id)))
        {
            error!(socket = %id, "Failed to watch client: {}", e);
            self.close_client(id, false);
            return;
        }
        debug!(socket = %id, %peer, "🔗 Client connected");
        self.count_request();
    }

    fn on_client_readable(&self, id: ConnectionId) {
        loop {
            let filled = {
                let mut scratch = self.scratch.borrow_mut();
                let mut state = self.state.borrow_mut();
                let Some(connection) = state.registry.client_mut(id) else {
                    return;
                };
                connection.fill(&mut scratch)
            };
            match filled {
                Ok(Fill::Data(_)) => {
                    if !self.process_client_frames(id) {
                        break;
                    }
                }
                Ok(Fill::WouldBlock) => break,
                Ok(Fill::Eof) => {
                    self.stats.incr(Counter::ClientClose);
                    self.log_abnormal_close(id);
                    self.close_client(id, true);
                    break;
                }
                Err(e) => {
                    debug!(socket = %id, "Client read failed: {}", e);
                    self.close_client(id, true);
                    break;
                }
            }
        }
        self.check_drained();
    }

    fn log_abnormal_close(&self, id: ConnectionId) {
        let state = self.state.borrow();
        if let Some(connection) = state.registry.client(id) {
            if !connection.buffer().is_empty() {
                warn!(
                    socket = %id,
                    peer = %connection.peer(),
                    pending = ?connection.buffer().pending(),
                    "Client closed with a partial frame buffered"
                );
            }
        }
    }

    // Returns false once the connection has been closed.
    fn process_client_frames(&self, id: ConnectionId) -> bool {
        loop {
            let fed = {
                let mut state = self.state.borrow_mut();
                let Some(connection) = state.registry.client_mut(id) else {
                    return false;
                };
                match connection.buffer_mut().next_frame(self.client_probe.as_ref()) {
                    Feed::Malformed => {
                        self.stats.incr(Counter::PacketErr);
                        warn!(
                            socket = %id,
                            peer = %connection.peer(),
                            buffered = connection.buffer().len(),
                            pending = ?connection.buffer().pending(),
                            "🚫 Rejected malformed client frame"
                        );
                        Err(self.packet_err_reply(connection.buffer().pending()))
                    }
                    other => Ok(other),
                }
            };
            match fed {
                Err(reply) => {
                    if let Some(Some(Err(e))) = reply.map(|reply| self.write_client(id, &reply)) {
                        debug!(socket = %id, "packet_err reply failed: {}", e);
                    }
                    self.close_client(id, true);
                    return false;
                }
                Ok(Feed::NeedMore(_)) | Ok(Feed::Malformed) => return true,
                Ok(Feed::Complete(frame)) => {
                    if let Err(e) = self.on_client_frame(id, frame.clone()) {
                        self.stats.incr(Counter::ThrowException);
                        error!(socket = %id, frame = ?frame, "💥 Failed to handle client frame: {}", e);
                    }
                    if !self.config.persistent_connection {
                        self.close_client(id, true);
                        return false;
                    }
                }
            }
        }
    }

    /// `packet_err:` followed by the rejected bytes, if such replies are enabled.
    fn packet_err_reply(&self, rejected: &[u8]) -> Option<Vec<u8>> {
        self.config.reply_packet_err.then(|| {
            let mut reply = b"packet_err:".to_vec();
            reply.extend_from_slice(rejected);
            reply
        })
    }

    /// Wraps a complete client frame and forwards it to a worker.
    fn on_client_frame(&self, id: ConnectionId, frame: Bytes) -> Result<()> {
        let (uid, client) = {
            let state = self.state.borrow();
            let connection = state
                .registry
                .client(id)
                .ok_or_else(|| GatewayError::Internal(format!("frame for unknown socket {id}")))?;
            (state.registry.uid_of(id), connection.peer_v4())
        };
        let command = match uid {
            Some(_) => Command::OnMessage,
            None => Command::OnConnection,
        };
        let envelope = Envelope::new(command, id)
            .with_uid(uid.unwrap_or(Uid::ANONYMOUS))
            .with_local(self.lan_addr)
            .with_client(client)
            .with_body(frame);
        self.forward_to_worker(&envelope)
    }

    /// Sends an envelope on a randomly selected worker link.
    ///
    /// Without a live link the envelope is dropped and counted; this never
    /// waits for a worker to appear.
    fn forward_to_worker(&self, envelope: &Envelope) -> Result<()> {
        let bytes = envelope.encode()?;
        let sent = {
            let mut state = self.state.borrow_mut();
            let Some(link) = state.registry.select_link() else {
                self.stats.incr(Counter::RoutingFail);
                warn!(socket = %envelope.socket_id, command = %envelope.command, "No worker link available, frame dropped");
                return Ok(());
            };
            let Some(connection) = state.registry.link_mut(link) else {
                return Ok(());
            };
            connection
                .send(&bytes, self.config.send_timeout())
                .map_err(|e| (link, e))
        };
        if let Err((link, e)) = sent {
            self.stats.incr(Counter::SendFail);
            warn!(link = %link, "⚠️ Failed to send to worker link: {}", e);
            self.close_link(link);
        }
        Ok(())
    }

    /// Closes a client socket. With `notify`, a bound client produces an
    /// `ON_CLOSE` for the workers.
    fn close_client(&self, id: ConnectionId, notify: bool) {
        let Some((connection, uid)) = self.state.borrow_mut().registry.remove_client(id) else {
            return;
        };
        self.event_loop.remove_watch(connection.fd(), Direction::Read);
        connection.shutdown();
        let client = connection.peer_v4();
        drop(connection);
        debug!(socket = %id, uid = ?uid, "Client closed");

        if let (true, Some(uid)) = (notify, uid) {
            let envelope = Envelope::new(Command::OnClose, id)
                .with_uid(uid)
                .with_local(self.lan_addr)
                .with_client(client);
            if let Err(e) = self.forward_to_worker(&envelope) {
                self.stats.incr(Counter::ThrowException);
                error!(socket = %id, %uid, "💥 Failed to report close: {}", e);
            }
        }
    }

    /// Writes to a live client. `None` means the socket is not live.
    fn write_client(&self, id: ConnectionId, data: &[u8]) -> Option<io::Result<()>> {
        let mut state = self.state.borrow_mut();
        let connection = state.registry.client_mut(id)?;
        Some(connection.send(data, self.config.send_timeout()))
    }

    fn send_to_client(&self, id: ConnectionId, data: &[u8]) {
        match self.write_client(id, data) {
            None => {
                self.stats.incr(Counter::RoutingMiss);
            }
            Some(Ok(())) => {}
            Some(Err(e)) => {
                self.stats.incr(Counter::SendFail);
                debug!(socket = %id, "Client write failed: {}", e);
                self.close_client(id, true);
            }
        }
    }

    fn send_datagram(&self, client: SocketAddrV4, data: &[u8]) {
        let sent = {
            let state = self.state.borrow();
            match &state.client_listener {
                Some(ClientListener::Udp(socket)) => Some(socket.send_to(data, from_v4(client))),
                _ => None,
            }
        };
        match sent {
            None => {
                self.stats.incr(Counter::RoutingMiss);
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                self.stats.incr(Counter::SendFail);
                debug!(%client, "Datagram reply failed: {}", e);
            }
        }
    }

    /// Executes one worker command.
    fn on_worker_envelope(&self, envelope: Envelope) {
        let id = envelope.socket_id;
        match envelope.command {
            Command::SendToOne => {
                if id.is_none() {
                    if envelope.client.port() != 0 {
                        self.send_datagram(envelope.client, &envelope.body);
                    } else {
                        self.stats.incr(Counter::RoutingMiss);
                    }
                } else {
                    self.send_to_client(id, &envelope.body);
                }
            }
            Command::Kick => {
                if !envelope.body.is_empty() {
                    match self.write_client(id, &envelope.body) {
                        None => {
                            self.stats.incr(Counter::RoutingMiss);
                            return;
                        }
                        Some(Err(e)) => {
                            self.stats.incr(Counter::SendFail);
                            debug!(socket = %id, "Final message before kick failed: {}", e);
                        }
                        Some(Ok(())) => {}
                    }
                }
                if !self.state.borrow().registry.has_client(id) {
                    self.stats.incr(Counter::RoutingMiss);
                    return;
                }
                debug!(socket = %id, "👢 Kicking client");
                self.close_client(id, false);
            }
            Command::SendToAll => {
                let targets = self.state.borrow().registry.bound_sockets();
                for socket in targets {
                    self.send_to_client(socket, &envelope.body);
                }
            }
            Command::ConnectSuccess => {
                let bound = self.state.borrow_mut().registry.bind(id, envelope.uid);
                match bound {
                    Ok(None) => debug!(socket = %id, uid = %envelope.uid, "🔑 Client authenticated"),
                    Ok(Some(previous)) => info!(
                        socket = %id,
                        uid = %envelope.uid,
                        previous = %previous,
                        "🔑 Uid moved to a new socket"
                    ),
                    Err(e) => warn!(uid = %envelope.uid, "⚠️ CONNECT_SUCCESS rejected: {}", e),
                }
            }
            Command::OnConnection | Command::OnMessage | Command::OnClose => {
                warn!(command = %envelope.command, socket = %id, "Dropping worker-bound command received by the Gateway");
            }
        }
        self.check_drained();
    }

    fn accept_link(&self) {
        let accepted = {
            let state = self.state.borrow();
            match &state.lan_listener {
                Some(listener) => listener.accept(),
                None => return,
            }
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!("⚠️ Failed to accept worker link: {}", e);
                return;
            }
        };
        let id = self.state.borrow_mut().registry.allocate_id();
        let connection = match Connection::new(id, stream, peer, HEAD_LEN) {
            Ok(connection) => connection,
            Err(e) => {
                warn!("⚠️ Failed to set up worker link {}: {}", peer, e);
                return;
            }
        };
        let fd = connection.fd();
        self.state.borrow_mut().registry.insert_link(id, connection);
        if let Err(e) = self
            .event_loop
            .add_read_watch(fd, self.callback(move |gateway| gateway.on_link_readable(id)))
        {
            error!(link = %id, "Failed to watch worker link: {}", e);
            self.close_link(id);
            return;
        }
        info!(link = %id, %peer, "🔗 Worker linked");
    }

    fn on_link_readable(&self, id: ConnectionId) {
        loop {
            let filled = {
                let mut scratch = self.scratch.borrow_mut();
                let mut state = self.state.borrow_mut();
                let Some(connection) = state.registry.link_mut(id) else {
                    return;
                };
                connection.fill(&mut scratch)
            };
            match filled {
                Ok(Fill::Data(_)) => {
                    if !self.process_link_envelopes(id) {
                        return;
                    }
                }
                Ok(Fill::WouldBlock) => return,
                Ok(Fill::Eof) => {
                    let pending = {
                        let mut state = self.state.borrow_mut();
                        state.registry.link_mut(id).map(|link| link.buffer().len()).unwrap_or(0)
                    };
                    if pending > 0 {
                        warn!(link = %id, pending, "Worker link closed mid-envelope");
                    }
                    self.close_link(id);
                    return;
                }
                Err(e) => {
                    debug!(link = %id, "Worker link read failed: {}", e);
                    self.close_link(id);
                    return;
                }
            }
        }
    }

    // Returns false once the link has been closed.
    fn process_link_envelopes(&self, id: ConnectionId) -> bool {
        loop {
            let fed = {
                let mut state = self.state.borrow_mut();
                let Some(link) = state.registry.link_mut(id) else {
                    return false;
                };
                link.buffer_mut().next_frame(&self.envelope_probe)
            };
            match fed {
                Feed::NeedMore(_) => return true,
                Feed::Malformed => {
                    self.stats.incr(Counter::PacketErr);
                    let declared = {
                        let mut state = self.state.borrow_mut();
                        state
                            .registry
                            .link_mut(id)
                            .and_then(|link| Envelope::peek_body_len(link.buffer().pending()))
                    };
                    warn!(
                        link = %id,
                        declared = ?declared,
                        max = self.envelope_probe.max_body(),
                        "🚫 Oversized envelope, closing worker link"
                    );
                    self.close_link(id);
                    return false;
                }
                Feed::Complete(frame) => match Envelope::decode(frame) {
                    Ok(envelope) => self.on_worker_envelope(envelope),
                    Err(ProtocolError::UnknownCommand(code)) => {
                        warn!(link = %id, code, "Dropping envelope with unknown command");
                    }
                    Err(e) => {
                        self.stats.incr(Counter::PacketErr);
                        warn!(link = %id, "🚫 Undecodable envelope, closing worker link: {}", e);
                        self.close_link(id);
                        return false;
                    }
                },
            }
        }
    }

    fn close_link(&self, id: ConnectionId) {
        let Some(link) = self.state.borrow_mut().registry.remove_link(id) else {
            return;
        };
        self.event_loop.remove_watch(link.fd(), Direction::Read);
        link.shutdown();
        info!(link = %id, peer = %link.peer(), "🔌 Worker link closed");
    }

    fn receive_client_datagram(&self) {
        let received = {
            let mut scratch = self.scratch.borrow_mut();
            let state = self.state.borrow();
            let Some(ClientListener::Udp(socket)) = &state.client_listener else {
                return;
            };
            socket
                .recv_from(&mut scratch[..MAX_UDP_PACKET_SIZE])
                .map(|(n, peer)| (Bytes::copy_from_slice(&scratch[..n]), peer))
        };
        let (datagram, peer) = match received {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.stats.incr(Counter::ThunderHerd);
                return;
            }
            Err(e) => {
                debug!("Client datagram receive failed: {}", e);
                return;
            }
        };
        self.count_request();

        let mut buffer = FrameBuffer::new(datagram.len());
        match buffer.feed(&datagram, self.client_probe.as_ref()) {
            Feed::Complete(frame) => {
                let envelope = Envelope::new(Command::OnMessage, ConnectionId::NONE)
                    .with_local(self.lan_addr)
                    .with_client(to_v4(peer))
                    .with_body(frame);
                if let Err(e) = self.forward_to_worker(&envelope) {
                    self.stats.incr(Counter::ThrowException);
                    error!(%peer, datagram = ?datagram, "💥 Failed to handle client datagram: {}", e);
                }
            }
            Feed::NeedMore(_) | Feed::Malformed => {
                self.stats.incr(Counter::PacketErr);
                warn!(%peer, datagram = ?datagram, "🚫 Rejected client datagram");
                if let Some(reply) = self.packet_err_reply(&datagram) {
                    self.send_datagram(to_v4(peer), &reply);
                }
            }
        }
    }

    fn receive_lan_datagram(&self) {
        let received = {
            let mut scratch = self.scratch.borrow_mut();
            let state = self.state.borrow();
            let Some(socket) = &state.lan_udp else {
                return;
            };
            socket
                .recv_from(&mut scratch[..MAX_UDP_PACKET_SIZE])
                .map(|(n, peer)| (Bytes::copy_from_slice(&scratch[..n]), peer))
        };
        let (datagram, peer) = match received {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                debug!("Lan datagram receive failed: {}", e);
                return;
            }
        };
        match Envelope::decode(datagram) {
            Ok(envelope) => self.on_worker_envelope(envelope),
            Err(ProtocolError::UnknownCommand(code)) => {
                warn!(%peer, code, "Dropping lan datagram with unknown command");
            }
            Err(e) => {
                self.stats.incr(Counter::PacketErr);
                warn!(%peer, "🚫 Undecodable lan datagram: {}", e);
            }
        }
    }

    /// Sends the heartbeat payload to every authenticated client.
    fn broadcast_heartbeat(&self) {
        let targets = self.state.borrow().registry.bound_sockets();
        for socket in targets {
            self.send_to_client(socket, &self.ping_data);
        }
    }

    fn count_request(&self) {
        let total = self.stats.incr(Counter::TotalRequest);
        if self.config.max_requests > 0 && total >= self.config.max_requests {
            info!("Reached max_requests ({}), draining", self.config.max_requests);
            self.drain();
        }
    }

    fn check_drained(&self) {
        let done = {
            let state = self.state.borrow();
            state.status == Status::Draining
                && (state.registry.client_count() == 0
                    || (self.config.persistent_connection
                        && state.registry.clients().all(|c| c.buffer().is_empty())))
        };
        if done {
            self.finish();
        }
    }

    /// Closes everything, cleans the shared store up and stops the loop.
    fn finish(&self) {
        let (uids, closed) = {
            let mut state = self.state.borrow_mut();
            if state.status == Status::Stopped {
                return;
            }
            state.status = Status::Stopped;

            for timer in [state.heartbeat.take(), state.grace.take()].into_iter().flatten() {
                self.event_loop.cancel_timer(timer);
            }
            for signal in std::mem::take(&mut state.signals) {
                self.event_loop.remove_signal_watch(signal);
            }

            let uids = state.registry.bound_uids();
            let mut closed = 0usize;
            for id in state.registry.client_ids() {
                if let Some((connection, _)) = state.registry.remove_client(id) {
                    self.event_loop.remove_watch(connection.fd(), Direction::Read);
                    connection.shutdown();
                    closed += 1;
                }
            }
            for id in state.registry.link_ids() {
                if let Some(link) = state.registry.remove_link(id) {
                    self.event_loop.remove_watch(link.fd(), Direction::Read);
                    link.shutdown();
                }
            }

            let client_listener = state.client_listener.take();
            let lan_listener = state.lan_listener.take();
            let lan_udp = state.lan_udp.take();
            let shutdown = state.shutdown.take();
            let descriptors = [
                client_listener.as_ref().map(ClientListener::fd),
                lan_listener.as_ref().map(AsRawFd::as_raw_fd),
                lan_udp.as_ref().map(AsRawFd::as_raw_fd),
                shutdown.as_ref().map(ShutdownListener::fd),
            ];
            // Watches go before the sockets are dropped at the end of scope.
            for fd in descriptors.into_iter().flatten() {
                self.event_loop.remove_watch(fd, Direction::Read);
            }
            (uids, closed)
        };

        for uid in uids {
            if let Err(e) = self.addresses.delete_uid_location(uid) {
                warn!(%uid, "⚠️ Failed to delete uid location: {}", e);
            }
        }
        self.unregister_address();
        self.event_loop.stop();
        info!("👋 Gateway stopped, {} client(s) force-closed", closed);
    }

    fn unregister_address(&self) {
        if let Err(e) = self.addresses.unregister(&self.lan_addr.to_string()) {
            warn!("⚠️ Failed to unregister {}: {}", self.lan_addr, e);
        }
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("client_addr", &self.client_addr)
            .field("lan_addr", &self.lan_addr)
            .field("status", &self.state.borrow().status)
            .finish_non_exhaustive()
    }
}

/// Heartbeat payload: the contents of `value` if it names a file, else the
/// literal text.
fn load_ping_data(value: &str) -> Result<Bytes> {
    if !value.is_empty() && Path::new(value).is_file() {
        let data = std::fs::read(value)
            .map_err(|e| GatewayError::Config(format!("ping_data file '{value}': {e}")))?;
        return Ok(Bytes::from(data));
    }
    Ok(Bytes::copy_from_slice(value.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_event_loop::{create, Backend};
    use std::io::Write;

    fn test_config() -> GatewayConfig {
        GatewayConfig {
            listen: "127.0.0.1:0".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_bind_picks_ports_and_registers_on_start() {
        let event_loop = create(Backend::Poll).unwrap();
        let addresses = AddressRegistry::in_memory();
        let gateway = Gateway::bind(test_config(), event_loop, addresses.clone()).unwrap();

        assert_ne!(gateway.client_addr().port(), 0);
        assert_ne!(gateway.lan_addr().port(), 0);
        assert!(addresses.addresses().unwrap().is_empty());

        gateway.start().unwrap();
        assert!(addresses.addresses().unwrap().contains(&gateway.lan_addr().to_string()));
        assert_eq!(gateway.status(), Status::Running);
    }

    #[test]
    fn test_drain_without_clients_stops_immediately() {
        let event_loop = create(Backend::Poll).unwrap();
        let addresses = AddressRegistry::in_memory();
        let gateway = Gateway::bind(test_config(), event_loop.clone(), addresses.clone()).unwrap();
        gateway.start().unwrap();

        gateway.drain();
        assert_eq!(gateway.status(), Status::Stopped);
        assert!(addresses.addresses().unwrap().is_empty());
        // stop() was requested, so run returns at once.
        event_loop.run().unwrap();
    }

    #[test]
    fn test_ping_data_from_file_or_literal() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{\"type\":\"ping\"}").unwrap();
        let path = file.path().to_string_lossy().to_string();

        assert_eq!(load_ping_data(&path).unwrap(), Bytes::from_static(b"{\"type\":\"ping\"}"));
        assert_eq!(load_ping_data("ping\n").unwrap(), Bytes::from_static(b"ping\n"));
        assert!(load_ping_data("").unwrap().is_empty());
    }

    #[test]
    fn test_invalid_config_is_rejected_before_binding() {
        let event_loop = create(Backend::Poll).unwrap();
        let config = GatewayConfig {
            listen: "nowhere".to_string(),
            ..test_config()
        };
        let result = Gateway::bind(config, event_loop, AddressRegistry::in_memory());
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }
}
