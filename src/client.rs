use std::collections::VecDeque;
use std::io;
use std::net;
use std::net::ToSocketAddrs;
use std::time;

use super::epoch;
use super::peer;
use super::peer::HostContext;
use super::socket;
use super::Channel;
use super::Config;
use super::ErrorKind;

/// Represents a client event.
#[derive(Debug)]
pub enum Event {
    /// Produced when the server has accepted the connection.
    Connect,
    /// Produced when a message has been received.
    Receive(Box<[u8]>, Channel),
    /// Produced exactly once per connection attempt, when the connection terminates for any
    /// reason.
    Disconnect,
    /// Produced when an error is detected. Fatal errors are followed by [`Event::Disconnect`].
    Error(ErrorKind, String),
}

struct PeerContext<'a> {
    socket_tx: &'a socket::ConnectedSocketTx,
    events: &'a mut VecDeque<Event>,
    // First send failure since the context was created
    socket_error: Option<io::Error>,
}

impl<'a> HostContext for PeerContext<'a> {
    fn send_raw(&mut self, datagram: &[u8]) {
        if let Err(err) = self.socket_tx.send(datagram) {
            log::debug!("send failed: {}", err);
            self.socket_error.get_or_insert(err);
        }
    }

    fn on_connect(&mut self) {
        log::info!("connected");
        self.events.push_back(Event::Connect);
    }

    fn on_receive(&mut self, message: &[u8], channel: Channel) {
        self.events.push_back(Event::Receive(message.into(), channel));
    }

    fn on_disconnect(&mut self) {
        self.events.push_back(Event::Disconnect);
    }

    fn on_error(&mut self, kind: ErrorKind, reason: String) {
        self.events.push_back(Event::Error(kind, reason));
    }
}

struct Session {
    peer: peer::Peer,
    socket_tx: socket::ConnectedSocketTx,
    socket_rx: socket::ConnectedSocketRx,
}

/// A client connection. A client may connect to one server at a time, and may connect again once
/// disconnected.
pub struct Client {
    // Saved configuration
    config: Config,
    // Source of integer timestamps
    epoch: epoch::Epoch,
    // Present while connecting or connected
    session: Option<Session>,
    // Queue of pending events
    events: VecDeque<Event>,
}

fn resolve(host: &str, port: u16) -> Result<net::SocketAddr, String> {
    match (host, port).to_socket_addrs() {
        Ok(mut addrs) => addrs
            .next()
            .ok_or_else(|| format!("no addresses found for {}", host)),
        Err(err) => Err(format!("failed to resolve {}: {}", host, err)),
    }
}

fn socket_error_kind(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected => ErrorKind::ConnectionClosed,
        _ => ErrorKind::Unexpected,
    }
}

impl Client {
    /// Equivalent to calling [`Client::with_config`] with default configuration.
    pub fn new() -> Self {
        Self::with_config(Default::default())
    }

    /// Creates a client object. No socket is opened until [`Client::connect`] is called.
    pub fn with_config(config: Config) -> Self {
        config.validate();

        Self {
            config,
            epoch: epoch::Epoch::new(),
            session: None,
            events: VecDeque::new(),
        }
    }

    /// Runs `f` against the current session with a host context, then converts any socket
    /// failure into a disconnect and releases the session if it has closed.
    fn drive<F, R>(&mut self, f: F) -> Option<R>
    where
        F: FnOnce(&mut peer::Peer, &mut socket::ConnectedSocketRx, &mut PeerContext<'_>, u64) -> R,
    {
        let session = self.session.as_mut()?;

        let now_ms = self.epoch.time_now_ms();

        let Session {
            peer,
            socket_tx,
            socket_rx,
        } = session;

        let result = {
            let mut ctx = PeerContext {
                socket_tx,
                events: &mut self.events,
                socket_error: None,
            };

            let result = f(peer, socket_rx, &mut ctx, now_ms);

            if let Some(err) = ctx.socket_error.take() {
                let reason = format!("socket failed: {}", err);
                log::error!("{}", reason);
                ctx.on_error(socket_error_kind(&err), reason);
                peer.disconnect(&mut ctx);
            }

            result
        };

        if peer.state() == peer::State::Disconnected {
            log::info!("closing socket {}", socket_rx.local_addr());
            self.session = None;
        }

        Some(result)
    }

    /// Resolves `host`, opens a socket, and sends a handshake to the server. The outcome is
    /// reported through [`Event::Connect`] or [`Event::Error`] followed by [`Event::Disconnect`].
    ///
    /// Errors encountered during socket initialization are forwarded to the caller.
    pub fn connect(&mut self, host: &str, port: u16) -> io::Result<()> {
        if self.session.is_some() {
            log::warn!("already connected, ignoring connect to {}:{}", host, port);
            return Ok(());
        }

        let server_addr = match resolve(host, port) {
            Ok(addr) => addr,
            Err(reason) => {
                log::error!("{}", reason);
                self.events
                    .push_back(Event::Error(ErrorKind::DnsResolve, reason));
                self.events.push_back(Event::Disconnect);
                return Ok(());
            }
        };

        let (socket_tx, socket_rx) = socket::new_connected(server_addr, &self.config)?;

        log::info!(
            "connecting to {} from {}",
            server_addr,
            socket_rx.local_addr()
        );

        // The cookie is adopted from the server's handshake
        let peer = peer::Peer::new(&self.config, 0, self.epoch.time_now_ms());

        self.session = Some(Session {
            peer,
            socket_tx,
            socket_rx,
        });

        self.drive(|peer, _, ctx, _| peer.send_handshake(ctx));

        Ok(())
    }

    /// Sends a message to the server. Empty or oversized messages are rejected with
    /// [`ErrorKind::InvalidSend`] and leave the connection intact.
    pub fn send(&mut self, data: &[u8], channel: Channel) -> Result<(), ErrorKind> {
        match self.drive(|peer, _, ctx, _| peer.send_data(data, channel, ctx)) {
            Some(result) => result,
            None => {
                log::warn!("cannot send while disconnected");
                Err(ErrorKind::ConnectionClosed)
            }
        }
    }

    /// Disconnects gracefully. Has no effect if not connected.
    pub fn disconnect(&mut self) {
        self.drive(|peer, _, ctx, _| peer.disconnect(ctx));
    }

    /// Reads all available datagrams and processes them.
    pub fn tick_incoming(&mut self) {
        self.drive(|peer, socket_rx, ctx, now_ms| {
            loop {
                match socket_rx.try_read_frame() {
                    Ok(Some(datagram)) => peer.raw_input(datagram, now_ms, ctx),
                    Ok(None) => break,
                    Err(err) => {
                        // Typically the server port is closed
                        ctx.socket_error.get_or_insert(err);
                        break;
                    }
                }
            }

            peer.tick_incoming(now_ms, ctx);
        });
    }

    /// Sends any acknowledgements, data, or retransmissions which have come due.
    pub fn tick_outgoing(&mut self) {
        self.drive(|peer, _, ctx, now_ms| peer.tick_outgoing(now_ms, ctx));
    }

    /// Equivalent to calling [`Client::tick_incoming`] followed by [`Client::tick_outgoing`].
    pub fn tick(&mut self) {
        self.tick_incoming();
        self.tick_outgoing();
    }

    /// Blocks until a datagram arrives, the connection has work to do, or `timeout` elapses, and
    /// then ticks. Returns immediately if not connected.
    pub fn wait_tick(&mut self, timeout: time::Duration) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        let now_ms = self.epoch.time_now_ms();
        let delay = time::Duration::from_millis(session.peer.next_update_delay_ms(now_ms));

        if let Err(err) = session.socket_rx.wait(Some(delay.min(timeout))) {
            log::warn!("failed to wait on socket: {}", err);
        }

        self.tick();
    }

    /// Returns the next pending event, if any. Events are produced by ticks and by calls to
    /// [`Client::connect`], [`Client::send`], and [`Client::disconnect`].
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// If any events are ready to be processed, returns the next event immediately. Otherwise,
    /// ticks until an event can be returned, for a maximum duration of `timeout`.
    ///
    /// Returns `None` if no events were available within `timeout`.
    pub fn wait_event_timeout(&mut self, timeout: time::Duration) -> Option<Event> {
        if self.events.is_empty() {
            let deadline = time::Instant::now() + timeout;

            while self.session.is_some() {
                let now = time::Instant::now();

                if now >= deadline {
                    // No time left
                    break;
                }

                self.wait_tick(deadline - now);

                if !self.events.is_empty() {
                    // Found what we're looking for
                    break;
                }
            }
        }

        self.events.pop_front()
    }

    /// Returns true from a call to [`Client::connect`] until the connection terminates.
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Returns the local address of the internal UDP socket, if connected.
    pub fn local_addr(&self) -> Option<net::SocketAddr> {
        self.session
            .as_ref()
            .map(|session| session.socket_rx.local_addr())
    }

    /// Returns the server address for this connection, if connected.
    pub fn server_addr(&self) -> Option<net::SocketAddr> {
        self.session
            .as_ref()
            .map(|session| session.socket_rx.peer_addr())
    }

    /// Largest message accepted by [`Client::send`] on the reliable channel.
    pub fn reliable_max_message_size(&self) -> usize {
        match self.session.as_ref() {
            Some(session) => session.peer.reliable_max_message_size(),
            None => self.config.reliable_max_message_size(),
        }
    }

    /// Largest message accepted by [`Client::send`] on the unreliable channel.
    pub fn unreliable_max_message_size(&self) -> usize {
        match self.session.as_ref() {
            Some(session) => session.peer.unreliable_max_message_size(),
            None => self.config.unreliable_max_message_size(),
        }
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_error_kinds() {
        let closed = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(socket_error_kind(&closed), ErrorKind::ConnectionClosed);

        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(socket_error_kind(&reset), ErrorKind::ConnectionClosed);

        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(socket_error_kind(&denied), ErrorKind::Unexpected);
    }
}
