/*

kcpnet provides connection-oriented messaging over UDP with two channels: a reliable, ordered
channel driven by a KCP-compatible ARQ engine, and an unreliable channel which bypasses the engine
entirely.

# Datagrams

Every datagram begins with a five byte envelope:

  [channel: u8][cookie: u32 LE][payload ...]

Channel 1 carries one or more concatenated ARQ segments. Channel 2 carries a single application
message verbatim. Unreliable messages are never fragmented; those which do not fit in one datagram
are rejected at the sender.

# ARQ segments

Each segment has a 24 byte little-endian header followed by its payload:

  conv: u32, cmd: u8, frg: u8, wnd: u16, ts: u32, sn: u32, una: u32, len: u32

Commands are 81 (push), 82 (ack), 83 (window probe) and 84 (window response). A message larger
than one segment is split into fragments whose frg field counts down to zero. The receiver
reassembles a message only once every fragment has arrived in order.

The engine runs on a caller-provided millisecond clock. Each flush emits, in order: pending acks,
a window probe if the remote window has been closed for long enough, a window response if one was
requested, new data admitted by min(send window, remote window, congestion window), and finally
retransmissions (first transmissions, RTO expiry, and fast retransmit). A segment transmitted
max_retransmits times without acknowledgement marks the link as dead.

# Reliable messages

Messages delivered through the reliable channel begin with a one byte kind:

  0 Handshake   [cookie: u32 LE]
  1 Data        [application bytes, non-empty]
  2 Ping        []
  3 Disconnect  []

# Handshake

The client starts with cookie 0 and sends a handshake carrying 0. The server creates a session
with a random non-zero cookie for the sender's address, accepts the client handshake, and replies
with a handshake carrying its cookie. The client adopts that cookie. Once authenticated, datagrams
whose cookie differs from the session cookie are dropped.

Neither side delivers data, reliable or unreliable, before the remote handshake has been accepted.

# Liveness

Authenticated sessions send a reliable ping every second. A session is closed with a timeout error
if nothing has been received for timeout_ms, or if the engine reports a dead link. A session whose
combined ARQ queues hold 10,000 or more segments is closed with a congestion error.

*/

mod arq;
pub mod client;
mod config;
mod epoch;
mod frame;
mod peer;
pub mod server;
mod socket;

use thiserror::Error;

pub use config::Config;

/// Selects the delivery guarantee of a message.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Channel {
    /// Delivered exactly once, in order, unless the connection fails.
    Reliable,
    /// Delivered at most once, in any order.
    Unreliable,
}

impl Channel {
    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Reliable),
            2 => Some(Self::Unreliable),
            _ => None,
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Self::Reliable => 1,
            Self::Unreliable => 2,
        }
    }
}

/// Classifies an error reported by a connection.
#[derive(Clone, Copy, Debug, Error, Eq, Hash, PartialEq)]
pub enum ErrorKind {
    /// The server host name could not be resolved.
    #[error("failed to resolve host name")]
    DnsResolve,
    /// Nothing was received in time, or the remote stopped acknowledging data.
    #[error("connection timed out")]
    Timeout,
    /// The remote could not keep up and too much data was queued.
    #[error("connection congested")]
    Congestion,
    /// A malformed or oversized message was received.
    #[error("invalid message received")]
    InvalidReceive,
    /// A message could not be sent because it was empty or too large.
    #[error("invalid message sent")]
    InvalidSend,
    /// The underlying socket was closed, typically because the remote port is unreachable.
    #[error("connection closed")]
    ConnectionClosed,
    /// The underlying socket failed for another reason.
    #[error("unexpected error")]
    Unexpected,
}

pub type Client = client::Client;
pub type ClientEvent = client::Event;
pub type Server = server::Server;
pub type ServerEvent = server::Event;
pub use server::ConnectionId;
