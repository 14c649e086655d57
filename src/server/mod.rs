mod connection_id;

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::net;
use std::time;

use rand::Rng;

use super::arq;
use super::epoch;
use super::frame;
use super::peer;
use super::socket;
use super::Channel;
use super::Config;
use super::ErrorKind;

pub use connection_id::ConnectionId;
use connection_id::ConnectionIdHasher;

/// Represents a server event.
#[derive(Debug)]
pub enum Event {
    /// Produced when a new client has completed the handshake.
    Connect(ConnectionId),
    /// Produced when a message has been received from a client.
    Receive(ConnectionId, Box<[u8]>, Channel),
    /// Produced exactly once per connection, when it terminates for any reason.
    Disconnect(ConnectionId),
    /// Produced when an error is detected on a connection. Fatal errors are followed by
    /// [`Event::Disconnect`].
    Error(ConnectionId, ErrorKind, String),
}

struct Connection {
    peer: peer::Peer,
    addr: net::SocketAddr,
}

struct PeerContext<'a> {
    id: ConnectionId,
    addr: net::SocketAddr,
    socket_tx: &'a socket::SocketTx,
    events: &'a mut VecDeque<Event>,
    to_remove: &'a mut HashSet<ConnectionId>,
    // Events for a session are only reported once it has authenticated
    connected: bool,
}

impl<'a> peer::HostContext for PeerContext<'a> {
    fn send_raw(&mut self, datagram: &[u8]) {
        if let Err(err) = self.socket_tx.send(datagram, &self.addr) {
            log::debug!("[{}] send to {} failed: {}", self.id, self.addr, err);
        }
    }

    fn on_connect(&mut self) {
        log::info!("[{}] connected from {}", self.id, self.addr);
        self.connected = true;
        self.events.push_back(Event::Connect(self.id));
    }

    fn on_receive(&mut self, message: &[u8], channel: Channel) {
        if self.connected {
            self.events
                .push_back(Event::Receive(self.id, message.into(), channel));
        }
    }

    fn on_disconnect(&mut self) {
        self.to_remove.insert(self.id);

        if self.connected {
            log::info!("[{}] disconnected", self.id);
            self.events.push_back(Event::Disconnect(self.id));
        }
    }

    fn on_error(&mut self, kind: ErrorKind, reason: String) {
        if self.connected {
            self.events.push_back(Event::Error(self.id, kind, reason));
        } else {
            log::debug!("[{}] rejected {}: {}", self.id, self.addr, reason);
        }
    }
}

struct ServerCore {
    // Saved configuration
    config: Config,
    // Source of integer timestamps
    epoch: epoch::Epoch,
    // Socket send handle
    socket_tx: socket::SocketTx,
    // Maps remote addresses to connection ids
    id_hasher: ConnectionIdHasher,
    // Authenticated connections
    connections: HashMap<ConnectionId, Connection>,
    // Connections closed during the current pass
    to_remove: HashSet<ConnectionId>,
    // Queue of pending events
    events: VecDeque<Event>,
}

/// A server which accepts any number of client connections on a single UDP socket.
pub struct Server {
    // Everything except the receive handle
    core: ServerCore,
    // Socket receive handle
    socket_rx: socket::SocketRx,
}

impl ServerCore {
    fn handle_datagram(&mut self, datagram: &[u8], addr: net::SocketAddr, now_ms: u64) {
        let id = self.id_hasher.compute(&addr);

        match self.connections.get_mut(&id) {
            Some(connection) => {
                if connection.addr != addr {
                    log::warn!(
                        "[{}] dropping datagram from {}, expected {}",
                        id,
                        addr,
                        connection.addr
                    );
                    return;
                }

                let mut ctx = PeerContext {
                    id,
                    addr,
                    socket_tx: &self.socket_tx,
                    events: &mut self.events,
                    to_remove: &mut self.to_remove,
                    connected: true,
                };

                connection.peer.raw_input(datagram, now_ms, &mut ctx);
            }
            None => {
                self.accept(id, addr, datagram, now_ms);
            }
        }
    }

    /// Creates a session for an unknown endpoint and feeds it the datagram straight away, so that
    /// a complete handshake authenticates on the first packet. The session only enters the
    /// connection table if it authenticates.
    fn accept(&mut self, id: ConnectionId, addr: net::SocketAddr, datagram: &[u8], now_ms: u64) {
        // Only a reliable datagram carrying at least one segment can hold a handshake
        let admissible = match frame::Envelope::read(datagram) {
            Some(envelope) => {
                envelope.channel == Channel::Reliable && envelope.payload.len() >= arq::OVERHEAD
            }
            None => false,
        };

        if !admissible {
            log::debug!(
                "[{}] ignoring {} byte datagram from unknown host {}",
                id,
                datagram.len(),
                addr
            );
            return;
        }

        let cookie = rand::thread_rng().gen_range(1..=u32::MAX);

        let mut peer = peer::Peer::new(&self.config, cookie, now_ms);

        let mut ctx = PeerContext {
            id,
            addr,
            socket_tx: &self.socket_tx,
            events: &mut self.events,
            to_remove: &mut self.to_remove,
            connected: false,
        };

        peer.raw_input(datagram, now_ms, &mut ctx);
        peer.tick_incoming(now_ms, &mut ctx);

        if peer.state() == peer::State::Authenticated {
            log::debug!("[{}] issued cookie {:08X}", id, peer.cookie());

            peer.send_handshake(&mut ctx);

            self.connections.insert(id, Connection { peer, addr });
        } else {
            log::debug!(
                "[{}] ignoring {} byte datagram from unknown host {}",
                id,
                datagram.len(),
                addr
            );
        }
    }

    fn tick_connections(&mut self, now_ms: u64) {
        for (&id, connection) in self.connections.iter_mut() {
            let mut ctx = PeerContext {
                id,
                addr: connection.addr,
                socket_tx: &self.socket_tx,
                events: &mut self.events,
                to_remove: &mut self.to_remove,
                connected: true,
            };

            connection.peer.tick_incoming(now_ms, &mut ctx);
        }
    }

    fn remove_closed(&mut self) {
        for id in self.to_remove.drain() {
            if let Some(connection) = self.connections.remove(&id) {
                log::debug!(
                    "[{}] removed with {} reliable segments outstanding",
                    id,
                    connection.peer.wait_snd()
                );
            }
        }
    }

    fn tick_outgoing(&mut self) {
        let now_ms = self.epoch.time_now_ms();

        for (&id, connection) in self.connections.iter_mut() {
            let mut ctx = PeerContext {
                id,
                addr: connection.addr,
                socket_tx: &self.socket_tx,
                events: &mut self.events,
                to_remove: &mut self.to_remove,
                connected: true,
            };

            connection.peer.tick_outgoing(now_ms, &mut ctx);
        }
    }

    fn with_connection<F, R>(&mut self, id: ConnectionId, f: F) -> Option<R>
    where
        F: FnOnce(&mut peer::Peer, &mut PeerContext<'_>) -> R,
    {
        let connection = self.connections.get_mut(&id)?;

        let mut ctx = PeerContext {
            id,
            addr: connection.addr,
            socket_tx: &self.socket_tx,
            events: &mut self.events,
            to_remove: &mut self.to_remove,
            connected: true,
        };

        Some(f(&mut connection.peer, &mut ctx))
    }

    /// Returns the number of milliseconds until any connection has outgoing work to do.
    fn next_update_delay_ms(&self) -> Option<u64> {
        let now_ms = self.epoch.time_now_ms();

        self.connections
            .values()
            .map(|connection| connection.peer.next_update_delay_ms(now_ms))
            .min()
    }
}

impl Server {
    /// Equivalent to calling [`Server::bind_with_config`] with default configuration.
    pub fn bind(port: u16) -> std::io::Result<Self> {
        Self::bind_with_config(port, Default::default())
    }

    /// Binds a UDP socket to the given port, and returns a new server object. The socket is bound
    /// to `[::]` if [`Config::dual_mode`] is set, and to `0.0.0.0` otherwise. Use port 0 to bind
    /// an ephemeral port.
    ///
    /// Errors encountered during socket initialization are forwarded to the caller.
    pub fn bind_with_config(port: u16, config: Config) -> std::io::Result<Self> {
        config.validate();

        let bind_address: net::SocketAddr = if config.dual_mode {
            (net::Ipv6Addr::UNSPECIFIED, port).into()
        } else {
            (net::Ipv4Addr::UNSPECIFIED, port).into()
        };

        let (socket_tx, socket_rx) = socket::new(bind_address, &config)?;

        log::info!("listening on {}", socket_rx.local_addr());

        let core = ServerCore {
            config,
            epoch: epoch::Epoch::new(),
            socket_tx,
            id_hasher: Default::default(),
            connections: HashMap::new(),
            to_remove: HashSet::new(),
            events: VecDeque::new(),
        };

        Ok(Self { core, socket_rx })
    }

    /// Reads all available datagrams, routes each to its connection, and then applies liveness
    /// policy and delivers messages on every connection. Connections which closed during the
    /// pass are removed afterwards.
    pub fn tick_incoming(&mut self) {
        let now_ms = self.core.epoch.time_now_ms();

        loop {
            match self.socket_rx.try_read_frame() {
                Ok(Some((datagram, addr))) => {
                    self.core.handle_datagram(datagram, addr, now_ms);
                }
                Ok(None) => break,
                Err(err) => {
                    // Unconnected sockets may surface stale ICMP errors; the next read proceeds
                    log::warn!("failed to receive datagram: {}", err);
                    break;
                }
            }
        }

        self.core.tick_connections(now_ms);

        self.core.remove_closed();
    }

    /// Sends any acknowledgements, data, or retransmissions which have come due.
    pub fn tick_outgoing(&mut self) {
        self.core.tick_outgoing();
    }

    /// Equivalent to calling [`Server::tick_incoming`] followed by [`Server::tick_outgoing`].
    pub fn tick(&mut self) {
        self.tick_incoming();
        self.tick_outgoing();
    }

    /// Blocks until a datagram arrives, a connection has work to do, or `timeout` elapses, and
    /// then ticks.
    pub fn wait_tick(&mut self, timeout: time::Duration) {
        self.wait_tick_inner(Some(timeout));
    }

    fn wait_tick_inner(&mut self, timeout: Option<time::Duration>) {
        let delay = self
            .core
            .next_update_delay_ms()
            .map(time::Duration::from_millis);

        let wait_timeout = match (timeout, delay) {
            (Some(timeout), Some(delay)) => Some(timeout.min(delay)),
            (timeout, delay) => timeout.or(delay),
        };

        if let Err(err) = self.socket_rx.wait(wait_timeout) {
            log::warn!("failed to wait on socket: {}", err);
        }

        self.tick();
    }

    /// Returns the next pending event, if any. Events are produced by ticks and by calls to
    /// [`Server::send`] and [`Server::disconnect`].
    pub fn poll_event(&mut self) -> Option<Event> {
        self.core.events.pop_front()
    }

    /// If any events are ready to be processed, returns the next event immediately. Otherwise,
    /// ticks until an event can be returned.
    pub fn wait_event(&mut self) -> Event {
        loop {
            if let Some(event) = self.core.events.pop_front() {
                return event;
            }

            self.wait_tick_inner(None);
        }
    }

    /// If any events are ready to be processed, returns the next event immediately. Otherwise,
    /// ticks until an event can be returned, for a maximum duration of `timeout`.
    ///
    /// Returns `None` if no events were available within `timeout`.
    pub fn wait_event_timeout(&mut self, timeout: time::Duration) -> Option<Event> {
        if self.core.events.is_empty() {
            let deadline = time::Instant::now() + timeout;

            loop {
                let now = time::Instant::now();

                if now >= deadline {
                    // No time left
                    break;
                }

                self.wait_tick(deadline - now);

                if !self.core.events.is_empty() {
                    // Found what we're looking for
                    break;
                }
            }
        }

        self.core.events.pop_front()
    }

    /// Sends a message to the given client. Empty or oversized messages are rejected with
    /// [`ErrorKind::InvalidSend`] and leave the connection intact. Sending to a connection which
    /// no longer exists has no effect.
    pub fn send(&mut self, id: ConnectionId, data: &[u8], channel: Channel) -> Result<(), ErrorKind> {
        match self
            .core
            .with_connection(id, |peer, ctx| peer.send_data(data, channel, ctx))
        {
            Some(result) => result,
            None => {
                log::warn!("[{}] ignoring send to unknown connection", id);
                Ok(())
            }
        }
    }

    /// Disconnects the given client gracefully. Has no effect if the connection no longer exists.
    pub fn disconnect(&mut self, id: ConnectionId) {
        let found = self
            .core
            .with_connection(id, |peer, ctx| peer.disconnect(ctx));

        if found.is_none() {
            log::warn!("[{}] ignoring disconnect of unknown connection", id);
        }

        self.core.remove_closed();
    }

    /// Returns the remote address of the given client, if connected.
    pub fn connection_address(&self, id: ConnectionId) -> Option<net::SocketAddr> {
        self.core.connections.get(&id).map(|connection| connection.addr)
    }

    /// Returns the number of connected clients.
    pub fn connection_count(&self) -> usize {
        self.core.connections.len()
    }

    /// Returns the local address of the internal UDP socket.
    pub fn local_addr(&self) -> net::SocketAddr {
        self.socket_rx.local_addr()
    }

    pub fn reliable_max_message_size(&self) -> usize {
        self.core.config.reliable_max_message_size()
    }

    pub fn unreliable_max_message_size(&self) -> usize {
        self.core.config.unreliable_max_message_size()
    }
}
