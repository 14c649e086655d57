use super::arq;
use super::frame;
use super::peer;

// The engine's own minimum, plus the envelope
const MTU_MIN: usize = arq::MTU_MIN + frame::ENVELOPE_SIZE;

// Largest UDP payload over IPv4
const MTU_MAX: usize = 65_507;

const BUFFER_SIZE_DEFAULT: usize = 1024 * 1024 * 7;

const INTERVAL_DEFAULT_MS: u32 = 10;

const TIMEOUT_DEFAULT_MS: u64 = 10_000;

/// Configuration shared by [`Client`](crate::Client) and [`Server`](crate::Server) objects.
#[derive(Clone, Debug)]
pub struct Config {
    /// If true, servers bind to `[::]` and accept both IPv6 and IPv4-mapped traffic. Otherwise
    /// servers bind to `0.0.0.0`.
    ///
    /// Default value: true
    pub dual_mode: bool,

    /// Requested size of the socket receive buffer, in bytes. The operating system may grant
    /// less.
    ///
    /// Default value: 7 MiB
    pub recv_buffer_size: usize,

    /// Requested size of the socket send buffer, in bytes. The operating system may grant less.
    ///
    /// Default value: 7 MiB
    pub send_buffer_size: usize,

    /// Maximum size of a datagram, including all protocol overhead.
    ///
    /// Minimum value: 55 \
    /// Maximum value: 65,507 \
    /// Default value: 1,200
    pub mtu: usize,

    /// Enables no-delay mode: a lower minimum RTO and a gentler retransmission backoff.
    ///
    /// Default value: true
    pub no_delay: bool,

    /// Internal flush interval, in milliseconds. Clamped to [10, 5,000].
    ///
    /// Default value: 10
    pub interval_ms: u32,

    /// Number of skipped acknowledgements after which a segment is resent early. Zero disables
    /// fast retransmission.
    ///
    /// Default value: 0
    pub fast_resend: u32,

    /// Enables the congestion window. Leaving it disabled trades fairness for latency.
    ///
    /// Default value: false
    pub congestion_window: bool,

    /// Send window, in segments.
    ///
    /// Minimum value: 1 \
    /// Default value: 32
    pub send_window_size: u32,

    /// Receive window, in segments. Values below 128 are raised to 128.
    ///
    /// Minimum value: 1 \
    /// Default value: 128
    pub receive_window_size: u32,

    /// A connection is closed if nothing has been received for this long, in milliseconds.
    ///
    /// Minimum value: 1 \
    /// Default value: 10,000
    pub timeout_ms: u64,

    /// A connection is closed if any segment is transmitted this many times without being
    /// acknowledged.
    ///
    /// Minimum value: 1 \
    /// Default value: 20
    pub max_retransmits: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dual_mode: true,
            recv_buffer_size: BUFFER_SIZE_DEFAULT,
            send_buffer_size: BUFFER_SIZE_DEFAULT,
            mtu: arq::MTU_DEF,
            no_delay: true,
            interval_ms: INTERVAL_DEFAULT_MS,
            fast_resend: 0,
            congestion_window: false,
            send_window_size: arq::WND_SND,
            receive_window_size: arq::WND_RCV,
            timeout_ms: TIMEOUT_DEFAULT_MS,
            max_retransmits: arq::DEADLINK,
        }
    }
}

impl Config {
    /// Largest message that may be sent on the reliable channel with this configuration.
    pub fn reliable_max_message_size(&self) -> usize {
        peer::reliable_max_message_size(self.mtu, self.receive_window_size.max(arq::WND_RCV))
    }

    /// Largest message that may be sent on the unreliable channel with this configuration.
    pub fn unreliable_max_message_size(&self) -> usize {
        peer::unreliable_max_message_size(self.mtu)
    }

    pub(crate) fn validate(&self) {
        assert!(
            self.mtu >= MTU_MIN,
            "invalid configuration: mtu < {}",
            MTU_MIN
        );
        assert!(
            self.mtu <= MTU_MAX,
            "invalid configuration: mtu > {}",
            MTU_MAX
        );
        assert!(
            self.send_window_size > 0,
            "invalid configuration: send_window_size == 0"
        );
        assert!(
            self.receive_window_size > 0,
            "invalid configuration: receive_window_size == 0"
        );
        assert!(self.timeout_ms > 0, "invalid configuration: timeout_ms == 0");
        assert!(
            self.max_retransmits > 0,
            "invalid configuration: max_retransmits == 0"
        );
    }
}
