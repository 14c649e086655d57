use std::io;
use std::net;
use std::sync::Arc;
use std::time;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use super::Config;

const SOCKET_POLLING_KEY: usize = 0;

pub struct SocketTx {
    // Reference to non-blocking server socket
    socket: Arc<net::UdpSocket>,
}

pub struct SocketRx {
    // Reference to non-blocking server socket
    socket: Arc<net::UdpSocket>,
    // Cached from socket initialization
    local_addr: net::SocketAddr,
    // Polling objects
    poller: polling::Poller,
    poller_events: polling::Events,
    // Always-allocated receive buffer
    recv_buffer: Box<[u8]>,
}

pub struct ConnectedSocketTx {
    // Reference to non-blocking client socket
    socket: Arc<net::UdpSocket>,
}

pub struct ConnectedSocketRx {
    // Reference to non-blocking client socket
    socket: Arc<net::UdpSocket>,
    // Cached from socket initialization
    local_addr: net::SocketAddr,
    peer_addr: net::SocketAddr,
    // Polling objects
    poller: polling::Poller,
    poller_events: polling::Events,
    // Always-allocated receive buffer
    recv_buffer: Box<[u8]>,
}

fn would_block_to_ok<T>(result: io::Result<T>, default: T) -> io::Result<T> {
    match result {
        Ok(value) => Ok(value),
        // A full send buffer or an empty receive buffer are not errors
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(default),
        Err(err) => Err(err),
    }
}

#[cfg(unix)]
fn setsockopt_int(fd: i32, level: i32, optname: i32, value: i32) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            optname,
            &value as *const i32 as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(unix)]
fn getsockopt_int(fd: i32, level: i32, optname: i32) -> io::Result<i32> {
    let mut value: i32 = 0;
    let mut len = std::mem::size_of::<i32>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            level,
            optname,
            &mut value as *mut i32 as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(value)
    }
}

/// Requests the configured kernel buffer sizes. Failure is logged and otherwise ignored; the
/// operating system default still works, only with less headroom under load.
#[cfg(unix)]
fn configure_buffers(socket: &net::UdpSocket, config: &Config) {
    let fd = socket.as_raw_fd();

    for (name, optname, size) in [
        ("SO_RCVBUF", libc::SO_RCVBUF, config.recv_buffer_size),
        ("SO_SNDBUF", libc::SO_SNDBUF, config.send_buffer_size),
    ] {
        let size = i32::try_from(size).unwrap_or(i32::MAX);

        match setsockopt_int(fd, libc::SOL_SOCKET, optname, size) {
            Ok(()) => {
                let actual = getsockopt_int(fd, libc::SOL_SOCKET, optname).unwrap_or(0);
                log::debug!("{}={} (actual={})", name, size, actual);
            }
            Err(err) => {
                log::warn!("failed to set {} to {}: {}", name, size, err);
            }
        }
    }
}

#[cfg(not(unix))]
fn configure_buffers(_socket: &net::UdpSocket, _config: &Config) {
    log::debug!("socket buffer sizes left at operating system defaults");
}

impl SocketTx {
    pub fn send(&self, frame: &[u8], addr: &net::SocketAddr) -> io::Result<()> {
        would_block_to_ok(self.socket.send_to(frame, addr).map(|_| ()), ())
    }
}

impl SocketRx {
    /// If a frame can be read from the socket, returns the frame. Returns Ok(None) otherwise.
    pub fn try_read_frame(&mut self) -> io::Result<Option<(&[u8], net::SocketAddr)>> {
        match self.socket.recv_from(&mut self.recv_buffer) {
            Ok((frame_len, sender_addr)) => {
                let frame_bytes = &self.recv_buffer[..frame_len];
                Ok(Some((frame_bytes, sender_addr)))
            }
            Err(err) => would_block_to_ok(Err(err), None),
        }
    }

    /// Blocks for a duration of up to `timeout` until the socket is readable. Returns Ok(false) if
    /// the timeout elapsed or polling awoke spuriously.
    pub fn wait(&mut self, timeout: Option<time::Duration>) -> io::Result<bool> {
        // Wait for a readable event (must be done prior to each wait() call)
        self.poller
            .modify(&*self.socket, polling::Event::readable(SOCKET_POLLING_KEY))?;

        self.poller_events.clear();

        let n = self.poller.wait(&mut self.poller_events, timeout)?;

        Ok(n > 0)
    }

    pub fn local_addr(&self) -> net::SocketAddr {
        self.local_addr
    }
}

impl Drop for SocketRx {
    fn drop(&mut self) {
        let _ = self.poller.delete(&*self.socket);
    }
}

/// Binds a non-blocking socket for a server.
pub fn new(bind_address: net::SocketAddr, config: &Config) -> io::Result<(SocketTx, SocketRx)> {
    let socket = net::UdpSocket::bind(bind_address)?;
    socket.set_nonblocking(true)?;

    configure_buffers(&socket, config);

    let local_addr = socket.local_addr()?;

    let poller = polling::Poller::new()?;

    unsafe {
        poller.add(&socket, polling::Event::readable(SOCKET_POLLING_KEY))?;
    }

    let socket_rc = Arc::new(socket);

    let tx = SocketTx {
        socket: Arc::clone(&socket_rc),
    };

    let rx = SocketRx {
        socket: socket_rc,
        local_addr,
        poller,
        poller_events: polling::Events::new(),
        recv_buffer: vec![0; config.mtu].into_boxed_slice(),
    };

    Ok((tx, rx))
}

impl ConnectedSocketTx {
    pub fn send(&self, frame: &[u8]) -> io::Result<()> {
        would_block_to_ok(self.socket.send(frame).map(|_| ()), ())
    }
}

impl ConnectedSocketRx {
    /// If a frame can be read from the socket, returns the frame. Returns Ok(None) otherwise.
    pub fn try_read_frame(&mut self) -> io::Result<Option<&[u8]>> {
        match self.socket.recv(&mut self.recv_buffer) {
            Ok(frame_len) => {
                let frame_bytes = &self.recv_buffer[..frame_len];
                Ok(Some(frame_bytes))
            }
            Err(err) => would_block_to_ok(Err(err), None),
        }
    }

    /// Blocks for a duration of up to `timeout` until the socket is readable. Returns Ok(false) if
    /// the timeout elapsed or polling awoke spuriously.
    pub fn wait(&mut self, timeout: Option<time::Duration>) -> io::Result<bool> {
        self.poller
            .modify(&*self.socket, polling::Event::readable(SOCKET_POLLING_KEY))?;

        self.poller_events.clear();

        let n = self.poller.wait(&mut self.poller_events, timeout)?;

        Ok(n > 0)
    }

    pub fn local_addr(&self) -> net::SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> net::SocketAddr {
        self.peer_addr
    }
}

impl Drop for ConnectedSocketRx {
    fn drop(&mut self) {
        let _ = self.poller.delete(&*self.socket);
    }
}

/// Binds a non-blocking socket to an ephemeral port of the same address family as
/// `connect_address`, and connects it.
pub fn new_connected(
    connect_address: net::SocketAddr,
    config: &Config,
) -> io::Result<(ConnectedSocketTx, ConnectedSocketRx)> {
    let bind_address: net::SocketAddr = match connect_address {
        net::SocketAddr::V4(_) => (net::Ipv4Addr::UNSPECIFIED, 0).into(),
        net::SocketAddr::V6(_) => (net::Ipv6Addr::UNSPECIFIED, 0).into(),
    };

    let socket = net::UdpSocket::bind(bind_address)?;
    socket.set_nonblocking(true)?;
    socket.connect(connect_address)?;

    configure_buffers(&socket, config);

    let local_addr = socket.local_addr()?;
    let peer_addr = socket.peer_addr()?;

    let poller = polling::Poller::new()?;

    unsafe {
        poller.add(&socket, polling::Event::readable(SOCKET_POLLING_KEY))?;
    }

    let socket_rc = Arc::new(socket);

    let tx = ConnectedSocketTx {
        socket: Arc::clone(&socket_rc),
    };

    let rx = ConnectedSocketRx {
        socket: socket_rc,
        local_addr,
        peer_addr,
        poller,
        poller_events: polling::Events::new(),
        recv_buffer: vec![0; config.mtu].into_boxed_slice(),
    };

    Ok((tx, rx))
}
