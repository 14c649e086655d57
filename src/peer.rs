use super::arq;
use super::frame;
use super::Channel;
use super::Config;
use super::ErrorKind;

use frame::{Envelope, MessageKind};

const PING_INTERVAL_MS: u64 = 1000;

// Combined segment count across all four ARQ queues at which a session is considered choked
const QUEUE_DISCONNECT_THRESHOLD: usize = 10_000;

pub trait HostContext {
    // Called to send a datagram to the remote host
    fn send_raw(&mut self, datagram: &[u8]);

    // Called when the remote handshake has been accepted
    fn on_connect(&mut self);

    // Called when a message has been received from the remote host
    fn on_receive(&mut self, message: &[u8], channel: Channel);

    // Called exactly once, when the session terminates for any reason
    fn on_disconnect(&mut self);

    // Called when an error is detected, possibly followed by on_disconnect
    fn on_error(&mut self, kind: ErrorKind, reason: String);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    Connected,
    Authenticated,
    Disconnected,
}

/// Wraps engine output in a reliable-channel envelope.
struct RawOutput<'a, C> {
    ctx: &'a mut C,
    cookie: u32,
    buffer: &'a mut [u8],
}

impl<'a, C> arq::Output for RawOutput<'a, C>
where
    C: HostContext,
{
    fn output(&mut self, bytes: &[u8]) {
        let datagram = Envelope::write(Channel::Reliable, self.cookie, bytes, self.buffer);
        self.ctx.send_raw(datagram);
    }
}

/// Largest application message accepted on the reliable channel.
pub fn reliable_max_message_size(mtu: usize, rcv_wnd: u32) -> usize {
    let per_fragment =
        mtu - frame::ENVELOPE_SIZE - arq::OVERHEAD - frame::MESSAGE_HEADER_SIZE;
    let fragments = (rcv_wnd as usize).min(arq::FRG_MAX) - 1;

    (per_fragment * fragments).saturating_sub(1)
}

/// Largest application message accepted on the unreliable channel.
pub fn unreliable_max_message_size(mtu: usize) -> usize {
    mtu - frame::ENVELOPE_SIZE
}

/// A single session: one ARQ engine plus the handshake, channel multiplexing, and liveness policy
/// wrapped around it. All I/O and notifications go through a [`HostContext`] supplied per call.
pub struct Peer {
    arq: arq::Arq,
    cookie: u32,
    state: State,
    timeout_ms: u64,
    last_receive_time_ms: u64,
    last_ping_time_ms: u64,
    reliable_max: usize,
    unreliable_max: usize,
    // Holds one complete reliable message (kind byte + payload) on receive
    recv_message_buffer: Box<[u8]>,
    // Holds one complete reliable message (kind byte + payload) on send
    send_message_buffer: Box<[u8]>,
    // Holds one outgoing datagram
    raw_buffer: Box<[u8]>,
}

impl Peer {
    /// Creates a session in the `Connected` state. A cookie of zero means the cookie will be
    /// adopted from the remote handshake.
    pub fn new(config: &Config, cookie: u32, now_ms: u64) -> Self {
        let mut arq = arq::Arq::new(0);

        arq.set_nodelay(
            config.no_delay as u32,
            config.interval_ms,
            config.fast_resend,
            !config.congestion_window,
        );
        arq.set_window_size(config.send_window_size, config.receive_window_size);
        // Leave room for the envelope
        arq.set_mtu(config.mtu - frame::ENVELOPE_SIZE);
        arq.set_dead_link(config.max_retransmits);

        let reliable_max = reliable_max_message_size(config.mtu, arq.rcv_wnd());
        let unreliable_max = unreliable_max_message_size(config.mtu);

        let message_buffer_size = frame::MESSAGE_HEADER_SIZE + reliable_max;

        log::debug!(
            "session {:08X}: conv {}, mtu {}, mss {}, rcv_wnd {}",
            cookie,
            arq.conv(),
            arq.mtu(),
            arq.mss(),
            arq.rcv_wnd()
        );

        Self {
            arq,
            cookie,
            state: State::Connected,
            timeout_ms: config.timeout_ms,
            last_receive_time_ms: now_ms,
            last_ping_time_ms: now_ms,
            reliable_max,
            unreliable_max,
            recv_message_buffer: vec![0; message_buffer_size].into_boxed_slice(),
            send_message_buffer: vec![0; message_buffer_size].into_boxed_slice(),
            raw_buffer: vec![0; config.mtu].into_boxed_slice(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn cookie(&self) -> u32 {
        self.cookie
    }

    pub fn reliable_max_message_size(&self) -> usize {
        self.reliable_max
    }

    pub fn unreliable_max_message_size(&self) -> usize {
        self.unreliable_max
    }

    /// Number of reliable segments queued or awaiting acknowledgement.
    pub fn wait_snd(&self) -> usize {
        self.arq.wait_snd()
    }

    /// Returns the number of milliseconds until [`Peer::tick_outgoing`] has work to do.
    pub fn next_update_delay_ms(&self, now_ms: u64) -> u64 {
        let now = now_ms as u32;
        u64::from(self.arq.check(now).wrapping_sub(now))
    }

    /// Processes one raw datagram received from the remote host.
    pub fn raw_input<C>(&mut self, datagram: &[u8], now_ms: u64, ctx: &mut C)
    where
        C: HostContext,
    {
        let Some(envelope) = Envelope::read(datagram) else {
            log::warn!("dropping malformed datagram of {} bytes", datagram.len());
            return;
        };

        if self.state == State::Authenticated && envelope.cookie != self.cookie {
            log::warn!(
                "dropping datagram with cookie {:08X}, expected {:08X}",
                envelope.cookie,
                self.cookie
            );
            return;
        }

        match envelope.channel {
            Channel::Reliable => {
                if let Err(err) = self.arq.input(envelope.payload) {
                    log::warn!("failed to process reliable datagram: {}", err);
                }
            }
            Channel::Unreliable => {
                if self.state == State::Authenticated {
                    ctx.on_receive(envelope.payload, Channel::Unreliable);
                    self.last_receive_time_ms = now_ms;
                } else {
                    log::warn!("dropping unreliable message received before authentication");
                }
            }
        }
    }

    fn fail<C>(&mut self, kind: ErrorKind, reason: String, ctx: &mut C)
    where
        C: HostContext,
    {
        log::error!("{}: {}", kind, reason);
        ctx.on_error(kind, reason);
        self.disconnect(ctx);
    }

    fn handle_timeout<C>(&mut self, now_ms: u64, ctx: &mut C)
    where
        C: HostContext,
    {
        if now_ms >= self.last_receive_time_ms + self.timeout_ms {
            let reason = format!(
                "nothing received for {}ms, disconnecting",
                self.timeout_ms
            );
            self.fail(ErrorKind::Timeout, reason, ctx);
        }
    }

    fn handle_dead_link<C>(&mut self, ctx: &mut C)
    where
        C: HostContext,
    {
        if self.arq.is_dead() {
            let reason = format!(
                "a segment was transmitted {} times without acknowledgement (rto {}ms), disconnecting",
                self.arq.dead_link(),
                self.arq.rx_rto()
            );
            self.fail(ErrorKind::Timeout, reason, ctx);
        }
    }

    fn handle_ping<C>(&mut self, now_ms: u64, ctx: &mut C)
    where
        C: HostContext,
    {
        if now_ms >= self.last_ping_time_ms + PING_INTERVAL_MS {
            self.last_ping_time_ms = now_ms;
            let _ = self.send_reliable(MessageKind::Ping, &[], ctx);
        }
    }

    fn handle_choked<C>(&mut self, ctx: &mut C)
    where
        C: HostContext,
    {
        let total = self.arq.total_queued();

        if total >= QUEUE_DISCONNECT_THRESHOLD {
            let reason = format!(
                "{} segments queued, the remote is not keeping up, disconnecting",
                total
            );
            // Release memory now, the session is going away
            self.arq.clear_send_queue();
            self.fail(ErrorKind::Congestion, reason, ctx);
        }
    }

    /// Reads the next reliable message into `recv_message_buffer`, returning its kind and total
    /// length (including the kind byte).
    fn receive_next_reliable<C>(&mut self, now_ms: u64, ctx: &mut C) -> Option<(MessageKind, usize)>
    where
        C: HostContext,
    {
        let size = self.arq.peek_size().ok()?;

        if size > self.recv_message_buffer.len() {
            let reason = format!(
                "reliable message of {} bytes exceeds the maximum of {} bytes",
                size,
                self.recv_message_buffer.len()
            );
            self.fail(ErrorKind::InvalidReceive, reason, ctx);
            return None;
        }

        let len = match self.arq.receive(&mut self.recv_message_buffer) {
            Ok(len) => len,
            Err(err) => {
                let reason = format!("failed to receive reliable message: {}", err);
                self.fail(ErrorKind::InvalidReceive, reason, ctx);
                return None;
            }
        };

        self.last_receive_time_ms = now_ms;

        if len == 0 {
            let reason = "received an empty reliable message".to_string();
            self.fail(ErrorKind::InvalidReceive, reason, ctx);
            return None;
        }

        match MessageKind::from_u8(self.recv_message_buffer[0]) {
            Some(kind) => Some((kind, len)),
            None => {
                let reason = format!(
                    "received a reliable message of unknown kind {}",
                    self.recv_message_buffer[0]
                );
                self.fail(ErrorKind::InvalidReceive, reason, ctx);
                None
            }
        }
    }

    fn handle_handshake<C>(&mut self, len: usize, ctx: &mut C)
    where
        C: HostContext,
    {
        if self.state != State::Connected {
            let reason = "received a handshake after authentication".to_string();
            self.fail(ErrorKind::InvalidReceive, reason, ctx);
            return;
        }

        let Some(remote_cookie) =
            frame::read_handshake(&self.recv_message_buffer[frame::MESSAGE_HEADER_SIZE..len])
        else {
            let reason = format!(
                "handshake payload must be {} bytes, received {}",
                frame::HANDSHAKE_PAYLOAD_SIZE,
                len - frame::MESSAGE_HEADER_SIZE
            );
            self.fail(ErrorKind::InvalidReceive, reason, ctx);
            return;
        };

        if self.cookie == 0 {
            if remote_cookie == 0 {
                let reason = "handshake does not carry a cookie".to_string();
                self.fail(ErrorKind::InvalidReceive, reason, ctx);
                return;
            }

            self.cookie = remote_cookie;
        }

        log::info!("handshake accepted, cookie {:08X}", self.cookie);

        self.state = State::Authenticated;

        ctx.on_connect();
    }

    fn handle_reliable<C>(&mut self, kind: MessageKind, len: usize, ctx: &mut C)
    where
        C: HostContext,
    {
        match kind {
            MessageKind::Handshake => {
                self.handle_handshake(len, ctx);
            }
            MessageKind::Data => {
                if self.state != State::Authenticated {
                    let reason = "received data before authentication".to_string();
                    self.fail(ErrorKind::InvalidReceive, reason, ctx);
                } else if len == frame::MESSAGE_HEADER_SIZE {
                    let reason = "received an empty data message".to_string();
                    self.fail(ErrorKind::InvalidReceive, reason, ctx);
                } else {
                    let payload = &self.recv_message_buffer[frame::MESSAGE_HEADER_SIZE..len];
                    ctx.on_receive(payload, Channel::Reliable);
                }
            }
            MessageKind::Ping => {}
            MessageKind::Disconnect => {
                log::info!("received disconnect");
                self.disconnect(ctx);
            }
        }
    }

    /// Applies liveness policy and dispatches every complete reliable message.
    pub fn tick_incoming<C>(&mut self, now_ms: u64, ctx: &mut C)
    where
        C: HostContext,
    {
        if self.state == State::Disconnected {
            return;
        }

        self.handle_timeout(now_ms, ctx);

        if self.state == State::Disconnected {
            return;
        }

        self.handle_dead_link(ctx);

        if self.state == State::Authenticated {
            self.handle_ping(now_ms, ctx);
        }

        if self.state == State::Disconnected {
            return;
        }

        self.handle_choked(ctx);

        while self.state != State::Disconnected {
            match self.receive_next_reliable(now_ms, ctx) {
                Some((kind, len)) => self.handle_reliable(kind, len, ctx),
                None => break,
            }
        }
    }

    /// Lets the engine flush acks, new data and retransmissions that have come due.
    pub fn tick_outgoing<C>(&mut self, now_ms: u64, ctx: &mut C)
    where
        C: HostContext,
    {
        match self.state {
            State::Connected | State::Authenticated => {
                let mut output = RawOutput {
                    ctx,
                    cookie: self.cookie,
                    buffer: &mut self.raw_buffer[..],
                };
                self.arq.update(now_ms as u32, &mut output);
            }
            State::Disconnected => {}
        }
    }

    fn flush<C>(&mut self, ctx: &mut C)
    where
        C: HostContext,
    {
        let mut output = RawOutput {
            ctx,
            cookie: self.cookie,
            buffer: &mut self.raw_buffer[..],
        };
        self.arq.flush(&mut output);
    }

    fn send_reliable<C>(&mut self, kind: MessageKind, payload: &[u8], ctx: &mut C) -> Result<(), ErrorKind>
    where
        C: HostContext,
    {
        let len = frame::MESSAGE_HEADER_SIZE + payload.len();

        self.send_message_buffer[0] = kind.to_u8();
        self.send_message_buffer[frame::MESSAGE_HEADER_SIZE..len].copy_from_slice(payload);

        if let Err(err) = self.arq.send(&self.send_message_buffer[..len]) {
            let reason = format!("failed to send reliable message of {} bytes: {}", len, err);
            log::error!("{}", reason);
            ctx.on_error(ErrorKind::InvalidSend, reason);
            return Err(ErrorKind::InvalidSend);
        }

        Ok(())
    }

    fn send_unreliable<C>(&mut self, payload: &[u8], ctx: &mut C)
    where
        C: HostContext,
    {
        let datagram = Envelope::write(Channel::Unreliable, self.cookie, payload, &mut self.raw_buffer);
        ctx.send_raw(datagram);
    }

    /// Sends an application message. Empty and oversized messages are rejected without affecting
    /// the connection.
    pub fn send_data<C>(&mut self, data: &[u8], channel: Channel, ctx: &mut C) -> Result<(), ErrorKind>
    where
        C: HostContext,
    {
        if self.state == State::Disconnected {
            log::warn!("dropping message sent on a closed connection");
            return Err(ErrorKind::ConnectionClosed);
        }

        if data.is_empty() {
            let reason = "refusing to send an empty message".to_string();
            log::error!("{}", reason);
            ctx.on_error(ErrorKind::InvalidSend, reason);
            return Err(ErrorKind::InvalidSend);
        }

        let max = match channel {
            Channel::Reliable => self.reliable_max,
            Channel::Unreliable => self.unreliable_max,
        };

        if data.len() > max {
            let reason = format!(
                "{:?} message of {} bytes exceeds the maximum of {} bytes",
                channel,
                data.len(),
                max
            );
            log::error!("{}", reason);
            ctx.on_error(ErrorKind::InvalidSend, reason);
            return Err(ErrorKind::InvalidSend);
        }

        match channel {
            Channel::Reliable => self.send_reliable(MessageKind::Data, data, ctx),
            Channel::Unreliable => {
                self.send_unreliable(data, ctx);
                Ok(())
            }
        }
    }

    /// Queues a reliable handshake carrying this session's cookie.
    pub fn send_handshake<C>(&mut self, ctx: &mut C)
    where
        C: HostContext,
    {
        let cookie = self.cookie.to_le_bytes();
        let _ = self.send_reliable(MessageKind::Handshake, &cookie, ctx);
    }

    /// Sends a disconnect message on a best-effort basis and closes the session. Has no effect if
    /// the session is already closed.
    pub fn disconnect<C>(&mut self, ctx: &mut C)
    where
        C: HostContext,
    {
        if self.state == State::Disconnected {
            return;
        }

        let _ = self.send_reliable(MessageKind::Disconnect, &[], ctx);
        self.flush(ctx);

        self.state = State::Disconnected;

        log::info!("disconnected");

        ctx.on_disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const SERVER_COOKIE: u32 = 0x5EC0_0C1E;

    #[derive(Debug, PartialEq)]
    enum HostEvent {
        Connect,
        Receive(Vec<u8>, Channel),
        Disconnect,
        Error(ErrorKind),
    }

    #[derive(Default)]
    struct MockHost {
        datagrams: Vec<Vec<u8>>,
        events: Vec<HostEvent>,
    }

    impl HostContext for MockHost {
        fn send_raw(&mut self, datagram: &[u8]) {
            self.datagrams.push(datagram.to_vec());
        }

        fn on_connect(&mut self) {
            self.events.push(HostEvent::Connect);
        }

        fn on_receive(&mut self, message: &[u8], channel: Channel) {
            self.events.push(HostEvent::Receive(message.to_vec(), channel));
        }

        fn on_disconnect(&mut self) {
            self.events.push(HostEvent::Disconnect);
        }

        fn on_error(&mut self, kind: ErrorKind, _reason: String) {
            self.events.push(HostEvent::Error(kind));
        }
    }

    impl MockHost {
        fn received(&self) -> Vec<(Vec<u8>, Channel)> {
            self.events
                .iter()
                .filter_map(|event| match event {
                    HostEvent::Receive(bytes, channel) => Some((bytes.clone(), *channel)),
                    _ => None,
                })
                .collect()
        }

        fn count(&self, target: &HostEvent) -> usize {
            self.events.iter().filter(|event| *event == target).count()
        }

        fn errors(&self) -> Vec<ErrorKind> {
            self.events
                .iter()
                .filter_map(|event| match event {
                    HostEvent::Error(kind) => Some(*kind),
                    _ => None,
                })
                .collect()
        }
    }

    #[derive(Clone, Copy)]
    enum Side {
        Client,
        Server,
    }

    /// A client and server session joined by a simulated link with loss and delay.
    struct Link {
        rng: StdRng,
        loss: f64,
        delay_max_ms: u64,
        now_ms: u64,
        client: Peer,
        client_host: MockHost,
        server: Peer,
        server_host: MockHost,
        server_replied: bool,
        // (delivery time, destination, datagram)
        in_flight: Vec<(u64, Side, Vec<u8>)>,
        deliver: bool,
    }

    impl Link {
        fn new(config: &Config, loss: f64, delay_max_ms: u64, seed: u64) -> Self {
            let mut client = Peer::new(config, 0, 0);
            let mut client_host = MockHost::default();

            client.send_handshake(&mut client_host);

            Self {
                rng: StdRng::seed_from_u64(seed),
                loss,
                delay_max_ms,
                now_ms: 0,
                client,
                client_host,
                server: Peer::new(config, SERVER_COOKIE, 0),
                server_host: MockHost::default(),
                server_replied: false,
                in_flight: Vec::new(),
                deliver: true,
            }
        }

        fn lossless() -> Self {
            Self::new(&Config::default(), 0.0, 0, 0)
        }

        fn step(&mut self) {
            self.now_ms += 10;
            let now = self.now_ms;

            let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.in_flight)
                .into_iter()
                .partition(|(at, _, _)| *at <= now);
            self.in_flight = pending;

            for (_, side, datagram) in due {
                match side {
                    Side::Client => self.client.raw_input(&datagram, now, &mut self.client_host),
                    Side::Server => self.server.raw_input(&datagram, now, &mut self.server_host),
                }
            }

            self.client.tick_incoming(now, &mut self.client_host);
            self.server.tick_incoming(now, &mut self.server_host);

            // The server answers with its own handshake once the client is accepted
            if !self.server_replied && self.server.state() == State::Authenticated {
                self.server_replied = true;
                self.server.send_handshake(&mut self.server_host);
            }

            self.client.tick_outgoing(now, &mut self.client_host);
            self.server.tick_outgoing(now, &mut self.server_host);

            self.transmit();
        }

        fn transmit(&mut self) {
            let now = self.now_ms;

            for (datagrams, side) in [
                (std::mem::take(&mut self.client_host.datagrams), Side::Server),
                (std::mem::take(&mut self.server_host.datagrams), Side::Client),
            ] {
                for datagram in datagrams {
                    if !self.deliver || self.rng.gen_bool(self.loss) {
                        continue;
                    }
                    let delay = self.rng.gen_range(0..=self.delay_max_ms);
                    self.in_flight.push((now + delay, side, datagram));
                }
            }
        }

        fn run(&mut self, duration_ms: u64) {
            let end = self.now_ms + duration_ms;
            while self.now_ms < end {
                self.step();
            }
        }

        fn establish(&mut self) {
            self.run(100);
            assert_eq!(self.client.state(), State::Authenticated);
            assert_eq!(self.server.state(), State::Authenticated);
        }
    }

    #[test]
    fn handshake() {
        let mut link = Link::lossless();

        link.establish();

        // The client adopts the server's cookie
        assert_eq!(link.client.cookie(), SERVER_COOKIE);
        assert_eq!(link.server.cookie(), SERVER_COOKIE);

        assert_eq!(link.client_host.events, vec![HostEvent::Connect]);
        assert_eq!(link.server_host.events, vec![HostEvent::Connect]);
    }

    #[test]
    fn ordered_delivery_under_loss() {
        let mut link = Link::new(&Config::default(), 0.3, 50, 1234);

        for message in [b"A", b"B", b"C"] {
            link.client
                .send_data(message, Channel::Reliable, &mut link.client_host)
                .unwrap();
        }

        link.run(8_000);

        assert_eq!(
            link.server_host.received(),
            vec![
                (b"A".to_vec(), Channel::Reliable),
                (b"B".to_vec(), Channel::Reliable),
                (b"C".to_vec(), Channel::Reliable),
            ]
        );
        assert!(link.server_host.errors().is_empty());
        assert!(link.client_host.errors().is_empty());
    }

    #[test]
    fn bulk_transfer_under_loss() {
        let mut link = Link::new(&Config::default(), 0.1, 30, 99);
        link.establish();

        let mut rng = StdRng::seed_from_u64(7);
        let messages = (0..200)
            .map(|_| {
                let len = rng.gen_range(1..4000);
                (0..len).map(|_| rng.gen::<u8>()).collect::<Vec<u8>>()
            })
            .collect::<Vec<_>>();

        for message in messages.iter() {
            link.client
                .send_data(message, Channel::Reliable, &mut link.client_host)
                .unwrap();
        }

        link.run(20_000);

        let received = link
            .server_host
            .received()
            .into_iter()
            .map(|(bytes, _)| bytes)
            .collect::<Vec<_>>();

        assert_eq!(received, messages);
    }

    #[test]
    fn largest_reliable_message() {
        let mut link = Link::lossless();
        link.establish();

        let max = link.client.reliable_max_message_size();
        assert_eq!(max, (1200 - 5 - 24 - 1) * 127 - 1);

        let message = (0..max).map(|i| (i % 253) as u8).collect::<Vec<_>>();

        link.client
            .send_data(&message, Channel::Reliable, &mut link.client_host)
            .unwrap();

        link.run(1_000);

        assert_eq!(link.server_host.received(), vec![(message, Channel::Reliable)]);
    }

    #[test]
    fn unreliable_delivery() {
        let mut link = Link::lossless();
        link.establish();

        link.server
            .send_data(b"fast", Channel::Unreliable, &mut link.server_host)
            .unwrap();

        link.run(20);

        assert_eq!(
            link.client_host.received(),
            vec![(b"fast".to_vec(), Channel::Unreliable)]
        );
    }

    #[test]
    fn unreliable_dropped_before_handshake() {
        let config = Config::default();

        let mut server = Peer::new(&config, SERVER_COOKIE, 0);
        let mut host = MockHost::default();

        let mut buffer = [0u8; 64];
        let datagram = Envelope::write(Channel::Unreliable, 0, b"early", &mut buffer);

        server.raw_input(datagram, 0, &mut host);
        server.tick_incoming(0, &mut host);

        assert!(host.events.is_empty());
        assert_eq!(server.state(), State::Connected);
    }

    #[test]
    fn reliable_data_before_handshake() {
        let config = Config::default();

        // A remote that skips its handshake
        let mut rogue = Peer::new(&config, 0, 0);
        let mut rogue_host = MockHost::default();

        rogue
            .send_data(b"early", Channel::Reliable, &mut rogue_host)
            .unwrap();
        rogue.tick_outgoing(0, &mut rogue_host);

        let mut server = Peer::new(&config, SERVER_COOKIE, 0);
        let mut host = MockHost::default();

        for datagram in rogue_host.datagrams.iter() {
            server.raw_input(datagram, 0, &mut host);
        }
        server.tick_incoming(0, &mut host);

        assert!(host.received().is_empty());
        assert_eq!(host.errors(), vec![ErrorKind::InvalidReceive]);
        assert_eq!(server.state(), State::Disconnected);
    }

    #[test]
    fn stale_cookie_dropped() {
        let mut link = Link::lossless();
        link.establish();

        let mut buffer = [0u8; 64];

        let datagram = Envelope::write(Channel::Unreliable, SERVER_COOKIE ^ 1, b"spoof", &mut buffer);
        link.server.raw_input(datagram, link.now_ms, &mut link.server_host);

        let datagram = Envelope::write(Channel::Unreliable, SERVER_COOKIE, b"real", &mut buffer);
        link.server.raw_input(datagram, link.now_ms, &mut link.server_host);

        assert_eq!(
            link.server_host.received(),
            vec![(b"real".to_vec(), Channel::Unreliable)]
        );
        assert_eq!(link.server.state(), State::Authenticated);
    }

    #[test]
    fn idempotent_disconnect() {
        let mut link = Link::lossless();
        link.establish();

        link.client.disconnect(&mut link.client_host);
        link.client.disconnect(&mut link.client_host);

        assert_eq!(link.client.state(), State::Disconnected);
        assert_eq!(link.client_host.count(&HostEvent::Disconnect), 1);

        // The remote learns of the disconnect
        link.run(50);

        assert_eq!(link.server.state(), State::Disconnected);
        assert_eq!(link.server_host.count(&HostEvent::Disconnect), 1);
        assert!(link.server_host.errors().is_empty());
    }

    #[test]
    fn congestion() {
        let mut link = Link::lossless();
        link.establish();

        for _ in 0..QUEUE_DISCONNECT_THRESHOLD {
            link.client
                .send_data(b"x", Channel::Reliable, &mut link.client_host)
                .unwrap();
        }

        link.client.tick_incoming(link.now_ms, &mut link.client_host);

        assert_eq!(link.client_host.errors(), vec![ErrorKind::Congestion]);
        assert_eq!(link.client_host.count(&HostEvent::Disconnect), 1);
        assert_eq!(link.client.state(), State::Disconnected);
    }

    #[test]
    fn timeout() {
        let mut link = Link::lossless();
        link.establish();

        // Sever the link
        link.deliver = false;
        link.run(9_000);

        assert_eq!(link.client.state(), State::Authenticated);

        link.run(2_000);

        assert_eq!(link.client.state(), State::Disconnected);
        assert_eq!(link.client_host.errors(), vec![ErrorKind::Timeout]);
        assert_eq!(link.server_host.errors(), vec![ErrorKind::Timeout]);
    }

    #[test]
    fn dead_link() {
        let config = Config {
            max_retransmits: 3,
            ..Default::default()
        };

        let mut link = Link::new(&config, 0.0, 0, 0);
        link.establish();

        link.deliver = false;

        link.client
            .send_data(b"lost", Channel::Reliable, &mut link.client_host)
            .unwrap();

        link.run(2_000);

        assert_eq!(link.client.state(), State::Disconnected);
        assert_eq!(link.client_host.errors(), vec![ErrorKind::Timeout]);
    }

    #[test]
    fn invalid_sends() {
        let mut link = Link::lossless();
        link.establish();

        let reliable_max = link.client.reliable_max_message_size();
        let unreliable_max = link.client.unreliable_max_message_size();

        assert_eq!(unreliable_max, 1195);

        let host = &mut link.client_host;

        assert_eq!(
            link.client.send_data(&[], Channel::Reliable, host),
            Err(ErrorKind::InvalidSend)
        );
        assert_eq!(
            link.client
                .send_data(&vec![0; reliable_max + 1], Channel::Reliable, host),
            Err(ErrorKind::InvalidSend)
        );
        assert_eq!(
            link.client
                .send_data(&vec![0; unreliable_max + 1], Channel::Unreliable, host),
            Err(ErrorKind::InvalidSend)
        );
        assert!(link
            .client
            .send_data(&vec![0; unreliable_max], Channel::Unreliable, host)
            .is_ok());

        // Rejected sends are reported but do not close the connection
        assert_eq!(host.errors(), vec![ErrorKind::InvalidSend; 3]);
        assert_eq!(host.count(&HostEvent::Disconnect), 0);
        assert_eq!(link.client.state(), State::Authenticated);
    }

    #[test]
    fn max_message_sizes() {
        assert_eq!(reliable_max_message_size(1200, 128), 1170 * 127 - 1);
        // The fragment limit caps large receive windows
        assert_eq!(reliable_max_message_size(1200, 1024), 1170 * 254 - 1);
        assert_eq!(unreliable_max_message_size(1200), 1195);
    }

    #[test]
    fn smallest_mtu() {
        let config = Config {
            mtu: 55,
            ..Default::default()
        };
        config.validate();

        let mut link = Link::new(&config, 0.0, 0, 0);
        link.establish();

        // 25 payload bytes per fragment
        let message = (0..200).map(|i| i as u8).collect::<Vec<u8>>();

        link.client
            .send_data(&message, Channel::Reliable, &mut link.client_host)
            .unwrap();
        link.client
            .send_data(&[9; 50], Channel::Unreliable, &mut link.client_host)
            .unwrap();
        assert_eq!(link.client_host.datagrams.last().map(|datagram| datagram.len()), Some(55));

        link.run(500);

        assert_eq!(
            link.server_host.received(),
            vec![(vec![9; 50], Channel::Unreliable), (message, Channel::Reliable)]
        );
    }
}
